//! Shadow copier
//!
//! Module files are never loaded in place. Each generation copies them into
//! `<staging_root>/<uuid>/` first, so the originals stay unlocked and can be
//! replaced while the copies are mapped. Old generation directories are
//! removed at the start of the next reload.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HostConfig;
use crate::error::{ReloadError, StagingError};

/// One module copied into a shadow directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedModule {
    /// File in the widget directory
    pub original: PathBuf,
    /// Copy inside the shadow directory
    pub staged: PathBuf,
    /// Copied companion manifest, if the module had one
    pub manifest: Option<PathBuf>,
}

impl StagedModule {
    /// Context name derived from the original file name
    pub fn name(&self) -> String {
        self.original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Result of staging one generation
#[derive(Debug, Default)]
pub struct StagedGeneration {
    /// Shadow directory, `None` when nothing needed staging
    pub dir: Option<PathBuf>,
    /// Staged modules in file-name order
    pub modules: Vec<StagedModule>,
    /// Files that were skipped
    pub errors: Vec<StagingError>,
}

impl StagedGeneration {
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Outcome of a stale shadow directory sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
    pub skipped_protected: usize,
}

/// Copies module files into per-generation shadow directories
#[derive(Debug, Clone)]
pub struct ShadowCopier {
    staging_root: PathBuf,
    config: HostConfig,
}

impl ShadowCopier {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            staging_root: config.staging_root.clone(),
            config: config.clone(),
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Recognized module files of `source_dir`, sorted by file name
    pub fn scan(&self, source_dir: &Path) -> Result<Vec<PathBuf>, ReloadError> {
        let entries = fs::read_dir(source_dir).map_err(|source| ReloadError::Scan {
            path: source_dir.to_path_buf(),
            source,
        })?;

        let mut modules: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.config.is_module_file(path))
            .collect();
        modules.sort();
        Ok(modules)
    }

    /// Stage every recognized module of `source_dir` into a new shadow directory.
    ///
    /// A missing `source_dir` yields an empty generation. Individual copy
    /// failures are recorded and the file is skipped.
    pub fn stage(&self, source_dir: &Path) -> Result<StagedGeneration, ReloadError> {
        if !source_dir.is_dir() {
            debug!("Widget directory {:?} does not exist, nothing to stage", source_dir);
            return Ok(StagedGeneration::default());
        }

        let candidates = self.scan(source_dir)?;
        if candidates.is_empty() {
            return Ok(StagedGeneration::default());
        }

        let dir = self.staging_root.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&dir).map_err(|source| ReloadError::Staging {
            path: dir.clone(),
            source,
        })?;

        let mut generation = StagedGeneration {
            dir: Some(dir.clone()),
            ..Default::default()
        };

        for original in candidates {
            match self.stage_file(&original, &dir) {
                Ok(staged) => {
                    debug!("Staged {:?} -> {:?}", original, staged.staged);
                    generation.modules.push(staged);
                }
                Err(e) => {
                    warn!("Skipping module: {}", e);
                    generation.errors.push(e);
                }
            }
        }

        info!(
            "Staged {} module(s) into {:?} ({} skipped)",
            generation.modules.len(),
            dir,
            generation.errors.len()
        );
        Ok(generation)
    }

    fn stage_file(&self, original: &Path, dir: &Path) -> Result<StagedModule, StagingError> {
        let fail = |source: std::io::Error| StagingError {
            path: original.to_path_buf(),
            source,
        };

        let file_name = original.file_name().ok_or_else(|| {
            fail(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "module path has no file name",
            ))
        })?;
        let staged = dir.join(file_name);
        fs::copy(original, &staged).map_err(fail)?;

        let manifest_src = self.config.manifest_for(original);
        let manifest = if manifest_src.is_file() {
            let manifest_name = manifest_src.file_name().unwrap_or(file_name);
            let manifest_dst = dir.join(manifest_name);
            fs::copy(&manifest_src, &manifest_dst).map_err(fail)?;
            Some(manifest_dst)
        } else {
            None
        };

        Ok(StagedModule {
            original: original.to_path_buf(),
            staged,
            manifest,
        })
    }

    /// Delete every generation directory under the staging root except `protected`.
    ///
    /// Best effort: failures are logged and counted, never returned.
    pub fn cleanup_stale(&self, protected: &HashSet<PathBuf>) -> CleanupReport {
        let mut report = CleanupReport::default();

        let entries = match fs::read_dir(&self.staging_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
            Err(e) => {
                warn!("Failed to scan staging root {:?}: {}", self.staging_root, e);
                return report;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            report.scanned += 1;

            if protected.contains(&path) {
                report.skipped_protected += 1;
                continue;
            }

            match fs::remove_dir_all(&path) {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to delete stale shadow directory {:?}: {}", path, e);
                }
            }
        }

        if report.scanned > 0 {
            debug!(
                scanned = report.scanned,
                deleted = report.deleted,
                failed = report.failed,
                skipped_protected = report.skipped_protected,
                "shadow cleanup completed"
            );
        }
        report
    }
}
