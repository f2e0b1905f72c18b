//! Isolated module loader
//!
//! Every staged module file gets its own [`LoadContext`]. A context owns the
//! loaded module through a reference-counted [`ModuleHandle`]; widget
//! instances keep a clone of that handle, so a context can only collapse
//! (and its code be unmapped) once every instance built from it is gone.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dashkit_kernel::abi::{ABI_VERSION, ABI_VERSION_SYMBOL, AbiVersionFn, REGISTER_SYMBOL, RegisterFn};
use dashkit_kernel::{WidgetFactory, WidgetRegistrar};
use libloading::Library;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{LoadError, panic_message};
use crate::registry::{ResidencyGuard, ResidencyTracker};
use crate::shadow::StagedModule;

/// Opens staged module files.
///
/// [`DylibBackend`] is the production implementation; hosts embedding
/// modules some other way supply their own.
pub trait ModuleBackend: Send + Sync {
    fn open(&self, module: &StagedModule) -> Result<Box<dyn LoadedModule>, LoadError>;
}

/// A module opened by a [`ModuleBackend`].
pub trait LoadedModule: Send + Sync {
    /// Run the module's self-registration entry point.
    fn register(&self, registrar: &mut dyn WidgetRegistrar) -> Result<(), LoadError>;

    /// Release the module. Nothing produced by it may be used afterwards.
    fn close(self: Box<Self>) -> Result<(), LoadError>;
}

/// Backend loading shared libraries with `libloading`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibBackend;

impl ModuleBackend for DylibBackend {
    fn open(&self, module: &StagedModule) -> Result<Box<dyn LoadedModule>, LoadError> {
        let path = &module.staged;

        // SAFETY: opening a library runs its initializers; widget modules are
        // trusted by contract.
        let library = unsafe { Library::new(path) }.map_err(|e| LoadError::Open {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let actual = {
            // SAFETY: signature fixed by the module ABI.
            let version = unsafe { library.get::<AbiVersionFn>(ABI_VERSION_SYMBOL) }.map_err(
                |_| LoadError::MissingSymbol {
                    path: path.clone(),
                    symbol: String::from_utf8_lossy(ABI_VERSION_SYMBOL).into_owned(),
                },
            )?;
            // SAFETY: the symbol takes no arguments and only returns a constant.
            unsafe { version() }
        };

        if actual != ABI_VERSION {
            return Err(LoadError::AbiMismatch {
                path: path.clone(),
                expected: ABI_VERSION,
                actual,
            });
        }

        // SAFETY: only checks presence; called later through `register`.
        if unsafe { library.get::<RegisterFn>(REGISTER_SYMBOL) }.is_err() {
            return Err(LoadError::MissingSymbol {
                path: path.clone(),
                symbol: String::from_utf8_lossy(REGISTER_SYMBOL).into_owned(),
            });
        }

        Ok(Box::new(DylibModule {
            path: path.clone(),
            library,
        }))
    }
}

struct DylibModule {
    path: PathBuf,
    library: Library,
}

impl LoadedModule for DylibModule {
    fn register(&self, registrar: &mut dyn WidgetRegistrar) -> Result<(), LoadError> {
        // SAFETY: signature fixed by the module ABI; version checked on open.
        let register = unsafe { self.library.get::<RegisterFn>(REGISTER_SYMBOL) }.map_err(|_| {
            LoadError::MissingSymbol {
                path: self.path.clone(),
                symbol: String::from_utf8_lossy(REGISTER_SYMBOL).into_owned(),
            }
        })?;
        // SAFETY: see above.
        unsafe { register(registrar) };
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), LoadError> {
        let DylibModule { path, library } = *self;
        library.close().map_err(|e| LoadError::Close {
            path,
            reason: e.to_string(),
        })
    }
}

/// One entry of a module's registration table
#[derive(Clone)]
pub struct Registration {
    type_id: String,
    factory: WidgetFactory,
}

impl Registration {
    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn factory(&self) -> &WidgetFactory {
        &self.factory
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("type_id", &self.type_id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistrationTable {
    entries: Vec<Registration>,
    duplicate: Option<String>,
}

impl WidgetRegistrar for RegistrationTable {
    fn register(&mut self, type_id: &str, factory: WidgetFactory) {
        if self.entries.iter().any(|r| r.type_id == type_id) {
            self.duplicate.get_or_insert_with(|| type_id.to_string());
            return;
        }
        self.entries.push(Registration {
            type_id: type_id.to_string(),
            factory,
        });
    }
}

/// Shared ownership of a loaded module and its registration table.
///
/// Registrations are declared before the module so their factories (code
/// living in the module) are dropped first.
pub struct ModuleHandle {
    name: String,
    path: PathBuf,
    registrations: Vec<Registration>,
    module: Option<Box<dyn LoadedModule>>,
    _residency: ResidencyGuard,
}

impl ModuleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    fn close(mut self) -> Result<(), LoadError> {
        self.registrations.clear();
        match self.module.take() {
            Some(module) => module.close(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("registrations", &self.registrations)
            .finish_non_exhaustive()
    }
}

/// Outcome of collapsing a context
#[derive(Debug)]
pub(crate) enum CollapseOutcome {
    Collapsed,
    CloseFailed(LoadError),
    Pinned(LoadContext),
}

/// Isolated unit of loaded code
#[derive(Debug)]
pub struct LoadContext {
    name: String,
    original: PathBuf,
    staged: PathBuf,
    manifest: Option<PathBuf>,
    content_hash: String,
    collapsible: bool,
    loaded_at: Instant,
    module: Arc<ModuleHandle>,
}

impl LoadContext {
    /// Name derived from the source file name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File in the widget directory this context was loaded from
    pub fn original_path(&self) -> &Path {
        &self.original
    }

    /// Shadow copy actually loaded
    pub fn staged_path(&self) -> &Path {
        &self.staged
    }

    /// Shadow directory of the generation this context belongs to
    pub fn shadow_dir(&self) -> Option<&Path> {
        self.staged.parent()
    }

    pub fn manifest_path(&self) -> Option<&Path> {
        self.manifest.as_deref()
    }

    /// SHA-256 of the staged file
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn is_collapsible(&self) -> bool {
        self.collapsible
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    pub fn registrations(&self) -> &[Registration] {
        self.module.registrations()
    }

    pub fn module(&self) -> &Arc<ModuleHandle> {
        &self.module
    }

    /// References to the module held outside this context
    pub fn external_references(&self) -> usize {
        Arc::strong_count(&self.module) - 1
    }

    /// Close the module if this context holds the last reference to it.
    pub(crate) fn collapse(self) -> CollapseOutcome {
        if !self.collapsible {
            return CollapseOutcome::Pinned(self);
        }

        match Arc::try_unwrap(self.module) {
            Ok(handle) => {
                debug!("Collapsing load context {}", self.name);
                match handle.close() {
                    Ok(()) => CollapseOutcome::Collapsed,
                    Err(e) => CollapseOutcome::CloseFailed(e),
                }
            }
            Err(module) => CollapseOutcome::Pinned(LoadContext { module, ..self }),
        }
    }
}

/// Loads staged modules into isolated contexts
pub struct IsolatedLoader {
    backend: Arc<dyn ModuleBackend>,
    residency: ResidencyTracker,
}

impl IsolatedLoader {
    pub fn new(backend: Arc<dyn ModuleBackend>, residency: ResidencyTracker) -> Self {
        Self { backend, residency }
    }

    /// Calculate file hash
    fn calculate_hash(path: &Path) -> Result<String, LoadError> {
        let contents = std::fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&contents);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Load one staged module into a new collapsible context and run its
    /// self-registration.
    pub fn load(&self, module: &StagedModule) -> Result<LoadContext, LoadError> {
        let name = module.name();
        let content_hash = Self::calculate_hash(&module.staged)?;

        let loaded = self.backend.open(module)?;

        let mut table = RegistrationTable::default();
        let registered = catch_unwind(AssertUnwindSafe(|| loaded.register(&mut table)))
            .unwrap_or_else(|payload| {
                Err(LoadError::Registration {
                    path: module.staged.clone(),
                    reason: panic_message(payload.as_ref()),
                })
            });

        let failure = match (registered, table.duplicate.take()) {
            (Err(e), _) => Some(e),
            (Ok(()), Some(type_id)) => Some(LoadError::DuplicateRegistration {
                path: module.original.clone(),
                type_id,
            }),
            (Ok(()), None) => None,
        };
        if let Some(e) = failure {
            drop(table);
            if let Err(close_err) = loaded.close() {
                warn!("Failed to close rejected module {}: {}", name, close_err);
            }
            return Err(e);
        }

        info!(
            "Loaded module {} ({} widget type(s))",
            name,
            table.entries.len()
        );

        let handle = ModuleHandle {
            name: name.clone(),
            path: module.staged.clone(),
            registrations: table.entries,
            module: Some(loaded),
            _residency: self.residency.acquire(),
        };

        Ok(LoadContext {
            name,
            original: module.original.clone(),
            staged: module.staged.clone(),
            manifest: module.manifest.clone(),
            content_hash,
            collapsible: true,
            loaded_at: Instant::now(),
            module: Arc::new(handle),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dashkit_kernel::{EventBus, Renderable, ViewHandle, Widget, WidgetResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct StaticView(pub String);

    impl Renderable for StaticView {
        fn render(&self) -> String {
            self.0.clone()
        }
    }

    pub(crate) struct NamedWidget(pub String);

    impl Widget for NamedWidget {
        fn name(&self) -> &str {
            &self.0
        }

        fn view(&self) -> ViewHandle {
            Arc::new(StaticView(self.0.clone()))
        }
    }

    /// Backend reading `widget <type_id>` / `dup <type_id>` / `panic` lines
    /// from the staged file.
    #[derive(Default)]
    pub(crate) struct LineBackend {
        pub(crate) closed: Arc<AtomicUsize>,
    }

    struct LineModule {
        lines: Vec<String>,
        closed: Arc<AtomicUsize>,
    }

    impl ModuleBackend for LineBackend {
        fn open(&self, module: &StagedModule) -> Result<Box<dyn LoadedModule>, LoadError> {
            let text = std::fs::read_to_string(&module.staged).map_err(|source| LoadError::Io {
                path: module.staged.clone(),
                source,
            })?;
            if text.trim() == "garbage" {
                return Err(LoadError::Open {
                    path: module.staged.clone(),
                    reason: "not a module".to_string(),
                });
            }
            Ok(Box::new(LineModule {
                lines: text.lines().map(str::to_string).collect(),
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    impl LoadedModule for LineModule {
        fn register(&self, registrar: &mut dyn WidgetRegistrar) -> Result<(), LoadError> {
            for line in &self.lines {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some("widget"), Some(id)) => {
                        let name = id.to_string();
                        registrar.register(
                            id,
                            Arc::new(move |_bus: &EventBus| -> WidgetResult<Box<dyn Widget>> {
                                Ok(Box::new(NamedWidget(name.clone())))
                            }),
                        );
                    }
                    (Some("panic"), _) => panic!("registration blew up"),
                    _ => {}
                }
            }
            Ok(())
        }

        fn close(self: Box<Self>) -> Result<(), LoadError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn stage_text(dir: &Path, name: &str, text: &str) -> StagedModule {
        let staged = dir.join(name);
        std::fs::write(&staged, text).unwrap();
        StagedModule {
            original: PathBuf::from("/widgets").join(name),
            staged,
            manifest: None,
        }
    }

    fn loader(backend: LineBackend) -> (IsolatedLoader, ResidencyTracker) {
        let residency = ResidencyTracker::default();
        (
            IsolatedLoader::new(Arc::new(backend), residency.clone()),
            residency,
        )
    }

    #[test]
    fn test_load_runs_self_registration() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, residency) = loader(LineBackend::default());
        let staged = stage_text(dir.path(), "a.so", "widget demo.text\nwidget demo.chart\n");

        let ctx = loader.load(&staged).unwrap();

        assert_eq!(ctx.name(), "a.so");
        assert_eq!(ctx.original_path(), Path::new("/widgets/a.so"));
        assert_eq!(ctx.staged_path(), staged.staged.as_path());
        assert_eq!(ctx.shadow_dir(), Some(dir.path()));
        assert!(ctx.is_collapsible());
        assert_eq!(ctx.content_hash().len(), 64);
        let ids: Vec<&str> = ctx.registrations().iter().map(Registration::type_id).collect();
        assert_eq!(ids, vec!["demo.text", "demo.chart"]);
        assert_eq!(residency.count(), 1);
    }

    #[test]
    fn test_open_failure_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, residency) = loader(LineBackend::default());
        let staged = stage_text(dir.path(), "bad.so", "garbage");

        assert!(matches!(loader.load(&staged), Err(LoadError::Open { .. })));
        assert_eq!(residency.count(), 0);
    }

    #[test]
    fn test_duplicate_registration_rejects_and_closes_module() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LineBackend::default();
        let closed = Arc::clone(&backend.closed);
        let (loader, residency) = loader(backend);
        let staged = stage_text(dir.path(), "dup.so", "widget demo.text\nwidget demo.text\n");

        let err = loader.load(&staged).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateRegistration { ref type_id, .. } if type_id == "demo.text"));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(residency.count(), 0);
    }

    #[test]
    fn test_registration_panic_is_caught() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LineBackend::default();
        let closed = Arc::clone(&backend.closed);
        let (loader, _) = loader(backend);
        let staged = stage_text(dir.path(), "boom.so", "widget demo.text\npanic\n");

        let err = loader.load(&staged).unwrap_err();
        assert!(matches!(err, LoadError::Registration { ref reason, .. } if reason.contains("blew up")));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_collapse_waits_for_external_references() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LineBackend::default();
        let closed = Arc::clone(&backend.closed);
        let (loader, residency) = loader(backend);
        let ctx = loader.load(&stage_text(dir.path(), "a.so", "widget demo.text")).unwrap();

        let pin = Arc::clone(ctx.module());
        assert_eq!(ctx.external_references(), 1);

        let ctx = match ctx.collapse() {
            CollapseOutcome::Pinned(ctx) => ctx,
            other => panic!("expected pinned context, got {other:?}"),
        };
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        assert_eq!(residency.count(), 1);

        drop(pin);
        assert!(matches!(ctx.collapse(), CollapseOutcome::Collapsed));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(residency.count(), 0);
    }

    #[test]
    fn test_dylib_backend_rejects_non_library() {
        let dir = tempfile::tempdir().unwrap();
        let staged = stage_text(dir.path(), "fake.so", "this is not an ELF file");

        let err = DylibBackend.open(&staged).err().unwrap();
        assert!(matches!(err, LoadError::Open { .. }));
    }
}
