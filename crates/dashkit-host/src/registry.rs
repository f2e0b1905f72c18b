//! Module registry
//!
//! Tracks the active load context of every widget module together with
//! contexts that could not be collapsed yet.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::error::LoadError;
use crate::loader::{CollapseOutcome, LoadContext};

/// Counts module handles that are still mapped in the process.
#[derive(Debug, Clone, Default)]
pub struct ResidencyTracker {
    resident: Arc<AtomicUsize>,
}

impl ResidencyTracker {
    pub(crate) fn acquire(&self) -> ResidencyGuard {
        self.resident.fetch_add(1, Ordering::SeqCst);
        ResidencyGuard {
            resident: Arc::clone(&self.resident),
        }
    }

    /// Number of resident contexts
    pub fn count(&self) -> usize {
        self.resident.load(Ordering::SeqCst)
    }
}

/// Decrements the resident count when the owning module is released.
#[derive(Debug)]
pub(crate) struct ResidencyGuard {
    resident: Arc<AtomicUsize>,
}

impl Drop for ResidencyGuard {
    fn drop(&mut self) {
        self.resident.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of unloading the registry
#[derive(Debug, Default)]
pub struct UnloadReport {
    /// Contexts that collapsed
    pub collapsed: usize,
    /// Contexts whose module failed to close
    pub close_failures: Vec<LoadError>,
    /// Contexts still referenced from outside the registry
    pub pinned: Vec<String>,
}

impl UnloadReport {
    pub fn is_clean(&self) -> bool {
        self.close_failures.is_empty() && self.pinned.is_empty()
    }
}

/// Path-keyed registry of active load contexts
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    contexts: HashMap<PathBuf, LoadContext>,
    order: Vec<PathBuf>,
    leaked: Vec<LoadContext>,
    residency: ResidencyTracker,
}

impl ModuleRegistry {
    pub fn new(residency: ResidencyTracker) -> Self {
        Self {
            residency,
            ..Default::default()
        }
    }

    /// Register a context under its original path. A context previously
    /// registered for the same path is unloaded.
    pub fn insert(&mut self, context: LoadContext) {
        let path = context.original_path().to_path_buf();
        if let Some(previous) = self.contexts.insert(path.clone(), context) {
            warn!("Replacing load context for {:?}", path);
            let mut report = UnloadReport::default();
            self.release(previous, &mut report);
        } else {
            self.order.push(path);
        }
    }

    pub fn get(&self, path: &Path) -> Option<&LoadContext> {
        self.contexts.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.contexts.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Registered paths in load order
    pub fn paths(&self) -> &[PathBuf] {
        &self.order
    }

    /// Active contexts in load order
    pub fn contexts(&self) -> impl Iterator<Item = &LoadContext> {
        self.order.iter().filter_map(|p| self.contexts.get(p))
    }

    /// Unload every active context and retry previously leaked ones.
    pub fn unload_all(&mut self) -> UnloadReport {
        let mut report = self.reclaim();

        let order = std::mem::take(&mut self.order);
        for path in order {
            if let Some(context) = self.contexts.remove(&path) {
                self.release(context, &mut report);
            }
        }

        if report.collapsed > 0 || !report.pinned.is_empty() {
            info!(
                "Unloaded {} context(s), {} still pinned",
                report.collapsed,
                report.pinned.len()
            );
        }
        report
    }

    /// Retry collapsing leaked contexts.
    pub fn reclaim(&mut self) -> UnloadReport {
        let mut report = UnloadReport::default();
        for context in std::mem::take(&mut self.leaked) {
            self.release(context, &mut report);
        }
        report
    }

    fn release(&mut self, context: LoadContext, report: &mut UnloadReport) {
        let name = context.name().to_string();
        match context.collapse() {
            CollapseOutcome::Collapsed => {
                debug!("Context {} collapsed", name);
                report.collapsed += 1;
            }
            CollapseOutcome::CloseFailed(e) => {
                warn!("Context {} failed to close: {}", name, e);
                report.close_failures.push(e);
            }
            CollapseOutcome::Pinned(context) => {
                warn!(
                    "Context {} still has {} external reference(s), deferring unload",
                    name,
                    context.external_references()
                );
                report.pinned.push(name);
                self.leaked.push(context);
            }
        }
    }

    /// Names of contexts awaiting collapse
    pub fn leaked_names(&self) -> Vec<String> {
        self.leaked.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn leaked_count(&self) -> usize {
        self.leaked.len()
    }

    /// Module handles still mapped, including ones held only by instances
    pub fn resident_count(&self) -> usize {
        self.residency.count()
    }

    /// Shadow directories that still back an active or leaked context
    pub fn protected_staging_dirs(&self) -> HashSet<PathBuf> {
        self.contexts
            .values()
            .chain(self.leaked.iter())
            .filter_map(|c| c.shadow_dir().map(Path::to_path_buf))
            .collect()
    }
}
