//! Widget manager
//!
//! Coordinates the reload state machine: tear the current generation down,
//! stage the widget directory, load every module into its own context,
//! instantiate widgets on the UI thread and publish the new set.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashkit_kernel::EventBus;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::dispatcher::UiDispatcher;
use crate::error::{DispatchError, HostError, ReloadError, panic_message};
use crate::instantiator::{PluginInstance, PluginInstantiator};
use crate::loader::{DylibBackend, IsolatedLoader, ModuleBackend};
use crate::phase::{PhaseCell, ReloadPhase};
use crate::registry::{ModuleRegistry, ResidencyTracker, UnloadReport};
use crate::report::ReloadReport;
use crate::shadow::{ShadowCopier, StagedGeneration};
use crate::watcher::ChangeWatcher;

/// Events emitted by the manager
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// A new widget set was published
    WidgetsChanged {
        generation: u64,
        widget_count: usize,
        report: Arc<ReloadReport>,
    },
    /// A reload cycle failed and an empty set was published
    ReloadFailed { generation: u64, error: String },
}

/// The widget set published by one reload cycle
#[derive(Debug)]
pub struct Generation {
    id: u64,
    shadow_dir: Option<PathBuf>,
    instances: Vec<PluginInstance>,
}

impl Generation {
    pub fn empty(id: u64) -> Self {
        Self {
            id,
            shadow_dir: None,
            instances: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Shadow directory the generation was loaded from
    pub fn shadow_dir(&self) -> Option<&Path> {
        self.shadow_dir.as_deref()
    }

    pub fn instances(&self) -> &[PluginInstance] {
        &self.instances
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginInstance> {
        self.instances.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Find a widget by display name
    pub fn find(&self, name: &str) -> Option<&PluginInstance> {
        self.instances.iter().find(|i| i.name() == name)
    }
}

type Listener = Arc<dyn Fn(&Generation, &ReloadReport) + Send + Sync>;

struct ManagerInner {
    config: HostConfig,
    widgets_dir: PathBuf,
    bus: EventBus,
    dispatcher: UiDispatcher,
    shadow: ShadowCopier,
    loader: IsolatedLoader,
    residency: ResidencyTracker,
    // Declared before the registry: instances are dropped before the
    // contexts that provide their code.
    current: RwLock<Arc<Generation>>,
    registry: Mutex<ModuleRegistry>,
    next_generation: AtomicU64,
    phase: PhaseCell,
    reload_lock: Mutex<()>,
    pending: AtomicBool,
    worker_active: AtomicBool,
    shut_down: AtomicBool,
    idle: Notify,
    events: broadcast::Sender<ManagerEvent>,
    listeners: Mutex<Vec<Listener>>,
    watcher: Mutex<Option<ChangeWatcher>>,
    runtime: Mutex<Option<Handle>>,
}

/// Hot-reloading widget manager
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct WidgetManager {
    inner: Arc<ManagerInner>,
}

impl WidgetManager {
    /// Create a manager loading shared libraries. The widget directory is
    /// created if it does not exist.
    pub fn new(config: HostConfig, bus: EventBus, dispatcher: UiDispatcher) -> Result<Self, HostError> {
        Self::with_backend(config, bus, dispatcher, Arc::new(DylibBackend))
    }

    /// Create a manager with a custom module backend
    pub fn with_backend(
        config: HostConfig,
        bus: EventBus,
        dispatcher: UiDispatcher,
        backend: Arc<dyn ModuleBackend>,
    ) -> Result<Self, HostError> {
        let widgets_dir = std::path::absolute(&config.widgets_dir).map_err(|source| HostError::WidgetsDir {
            path: config.widgets_dir.clone(),
            source,
        })?;
        std::fs::create_dir_all(&widgets_dir).map_err(|source| HostError::WidgetsDir {
            path: widgets_dir.clone(),
            source,
        })?;

        let residency = ResidencyTracker::default();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        info!("Widget manager watching {:?}", widgets_dir);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                shadow: ShadowCopier::new(&config),
                loader: IsolatedLoader::new(backend, residency.clone()),
                registry: Mutex::new(ModuleRegistry::new(residency.clone())),
                residency,
                current: RwLock::new(Arc::new(Generation::empty(0))),
                next_generation: AtomicU64::new(1),
                phase: PhaseCell::default(),
                reload_lock: Mutex::new(()),
                pending: AtomicBool::new(false),
                worker_active: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                idle: Notify::new(),
                events,
                listeners: Mutex::new(Vec::new()),
                watcher: Mutex::new(None),
                runtime: Mutex::new(None),
                config,
                widgets_dir,
                bus,
                dispatcher,
            }),
        })
    }

    /// Load the initial widget set and start watching the widget directory
    /// (unless disabled in the configuration).
    pub async fn start(&self) -> Result<Arc<ReloadReport>, HostError> {
        *self.inner.runtime.lock() = Some(Handle::current());

        let report = self.reload().await?;

        if self.inner.config.watch {
            let mut watcher = ChangeWatcher::new(&self.inner.widgets_dir, self.inner.config.clone());
            let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
            watcher.start(&Handle::current(), move |event| {
                if let Some(inner) = weak.upgrade() {
                    info!("Widget change detected: {:?} {:?}", event.kind, event.path);
                    inner.request_reload();
                }
            })?;
            *self.inner.watcher.lock() = Some(watcher);
        }

        Ok(report)
    }

    /// Run a full reload cycle on the blocking pool and wait for it.
    pub async fn reload(&self) -> Result<Arc<ReloadReport>, ReloadError> {
        if self.is_shut_down() {
            return Err(ReloadError::ShutDown);
        }
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.run_reload())
            .await
            .map_err(|e| ReloadError::Join(e.to_string()))
    }

    /// Run a full reload cycle on the calling thread.
    pub fn reload_blocking(&self) -> Result<Arc<ReloadReport>, ReloadError> {
        if self.inner.dispatcher.is_current() {
            return Err(ReloadError::OnUiThread);
        }
        if self.is_shut_down() {
            return Err(ReloadError::ShutDown);
        }
        Ok(self.inner.run_reload())
    }

    /// Schedule a reload on a background task and return immediately.
    /// Requests made while a reload is running are coalesced into one more
    /// cycle.
    pub fn request_reload(&self) {
        self.inner.request_reload();
    }

    /// Wait until no scheduled reload is pending or running.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.inner.worker_active.load(Ordering::SeqCst) && !self.inner.pending.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Current widget set
    pub fn widgets(&self) -> Arc<Generation> {
        Arc::clone(&self.inner.current.read())
    }

    /// Run `f` against the current widget set without retaining it.
    pub fn with_widgets<R>(&self, f: impl FnOnce(&Generation) -> R) -> R {
        f(&self.inner.current.read())
    }

    pub fn widget_names(&self) -> Vec<String> {
        self.with_widgets(Generation::names)
    }

    /// Subscribe to manager events
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Register a listener invoked on the UI thread after every publish.
    pub fn on_widgets_changed<F>(&self, listener: F)
    where
        F: Fn(&Generation, &ReloadReport) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().push(Arc::new(listener));
    }

    pub fn phase(&self) -> ReloadPhase {
        self.inner.phase.get()
    }

    /// Loaded module handles still mapped, including leaked ones
    pub fn resident_contexts(&self) -> usize {
        self.inner.residency.count()
    }

    /// Names of modules loaded in the active generation
    pub fn loaded_modules(&self) -> Vec<String> {
        self.inner
            .registry
            .lock()
            .contexts()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Contexts that could not be unloaded yet
    pub fn leaked_contexts(&self) -> Vec<String> {
        self.inner.registry.lock().leaked_names()
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn dispatcher(&self) -> &UiDispatcher {
        &self.inner.dispatcher
    }

    /// Absolute path of the watched widget directory
    pub fn widgets_dir(&self) -> &Path {
        &self.inner.widgets_dir
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop watching, dispose every widget, unload all contexts and clean the
    /// staging root.
    pub async fn shutdown(&self) -> Result<UnloadReport, ReloadError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.shutdown())
            .await
            .map_err(|e| ReloadError::Join(e.to_string()))
    }

    /// Blocking variant of [`WidgetManager::shutdown`]
    pub fn shutdown_blocking(&self) -> UnloadReport {
        self.inner.shutdown()
    }
}

impl std::fmt::Debug for WidgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetManager")
            .field("widgets_dir", &self.inner.widgets_dir)
            .field("phase", &self.phase())
            .field("widgets", &self.widget_names())
            .finish()
    }
}

impl ManagerInner {
    fn request_reload(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        self.pending.store(true, Ordering::SeqCst);
        if self.worker_active.swap(true, Ordering::SeqCst) {
            debug!("Reload already scheduled, coalescing request");
            return;
        }

        let runtime = self.runtime.lock().clone().or_else(|| Handle::try_current().ok());
        match runtime {
            Some(runtime) => {
                let inner = Arc::clone(self);
                runtime.spawn_blocking(move || inner.drain_pending());
            }
            None => {
                warn!("No tokio runtime available, dropping reload request");
                self.pending.store(false, Ordering::SeqCst);
                self.worker_active.store(false, Ordering::SeqCst);
                self.idle.notify_waiters();
            }
        }
    }

    fn drain_pending(self: &Arc<Self>) {
        loop {
            while self.pending.swap(false, Ordering::SeqCst) {
                if self.shut_down.load(Ordering::SeqCst) {
                    break;
                }
                self.run_reload();
            }
            self.worker_active.store(false, Ordering::SeqCst);

            if !self.pending.load(Ordering::SeqCst) || self.shut_down.load(Ordering::SeqCst) {
                break;
            }
            if self.worker_active.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        self.idle.notify_waiters();
    }

    fn run_reload(self: &Arc<Self>) -> Arc<ReloadReport> {
        let _guard = self.reload_lock.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            let mut report = ReloadReport::new(self.current.read().id());
            report.fatal = Some(ReloadError::ShutDown);
            return Arc::new(report);
        }
        let started = Instant::now();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let mut report = ReloadReport::new(generation);

        info!(generation, "Reloading widgets from {:?}", self.widgets_dir);

        let built = catch_unwind(AssertUnwindSafe(|| {
            self.phase.set(ReloadPhase::TearingDown);
            self.tear_down(&mut report);
            self.build_generation(generation, &mut report)
        }));

        let next = match built {
            Ok(Ok(next)) => next,
            Ok(Err(e)) => self.abort(generation, e, &mut report),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.abort(generation, ReloadError::Panicked(message), &mut report)
            }
        };

        self.phase.set(ReloadPhase::Publishing);
        report.widgets = next.names();
        report.duration = started.elapsed();
        let report = Arc::new(report);

        if let Err(e) = self.publish(next, Arc::clone(&report)) {
            error!(generation, "Failed to publish widgets: {}", e);
        }
        self.phase.set(ReloadPhase::Idle);

        info!(
            generation,
            widgets = report.widgets.len(),
            errors = report.error_count(),
            leaked = report.leaked_contexts.len(),
            "Reload finished in {:?}",
            report.duration
        );
        report
    }

    fn tear_down(&self, report: &mut ReloadReport) {
        let previous = {
            let mut current = self.current.write();
            let id = current.id();
            std::mem::replace(&mut *current, Arc::new(Generation::empty(id)))
        };
        if !previous.is_empty() {
            debug!("Disposing {} widget(s) of generation {}", previous.len(), previous.id());
        }
        self.dispose_on_ui(previous);

        let mut registry = self.registry.lock();
        let unload = registry.unload_all();
        report.unloaded_contexts = unload.collapsed;
        report.leaked_contexts = unload.pinned;
        report.load_errors.extend(unload.close_failures);

        report.resident_contexts = registry.resident_count();
        if report.resident_contexts > self.config.max_resident_contexts {
            report.residency_exceeded = true;
            warn!(
                "{} contexts still resident after teardown (max {}): {:?}",
                report.resident_contexts,
                self.config.max_resident_contexts,
                registry.leaked_names()
            );
        }
        if !report.leaked_contexts.is_empty() {
            warn!("Contexts still referenced after teardown: {:?}", report.leaked_contexts);
        }

        let protected = registry.protected_staging_dirs();
        drop(registry);
        report.cleanup = self.shadow.cleanup_stale(&protected);
    }

    fn dispose_on_ui(&self, generation: Arc<Generation>) {
        if let Err(e) = self.dispatcher.invoke(move || drop(generation)) {
            warn!("Failed to dispose widgets on the UI thread: {}", e);
        }
    }

    fn build_generation(
        self: &Arc<Self>,
        generation: u64,
        report: &mut ReloadReport,
    ) -> Result<Generation, ReloadError> {
        self.phase.set(ReloadPhase::Staging);
        let StagedGeneration { dir, modules, errors } = self.shadow.stage(&self.widgets_dir)?;
        report.staged_modules = modules.len();
        report.staging_errors = errors;

        if modules.is_empty() {
            debug!("No widget modules in {:?}", self.widgets_dir);
            return Ok(Generation {
                id: generation,
                shadow_dir: dir,
                instances: Vec::new(),
            });
        }

        self.phase.set(ReloadPhase::Loading);
        {
            let mut registry = self.registry.lock();
            for module in &modules {
                match self.loader.load(module) {
                    Ok(context) => {
                        report.loaded_modules.push(context.name().to_string());
                        registry.insert(context);
                    }
                    Err(e) => {
                        warn!("Skipping module {}: {}", module.name(), e);
                        report.load_errors.push(e);
                    }
                }
            }
        }

        self.phase.set(ReloadPhase::Instantiating);
        let inner = Arc::clone(self);
        let outcome = self.dispatcher.invoke(move || {
            let registry = inner.registry.lock();
            PluginInstantiator::new(&inner.bus).instantiate(registry.contexts(), generation)
        })?;
        report.instantiation_errors = outcome.errors;

        Ok(Generation {
            id: generation,
            shadow_dir: dir,
            instances: outcome.instances,
        })
    }

    fn abort(&self, generation: u64, error: ReloadError, report: &mut ReloadReport) -> Generation {
        error!(generation, "Reload failed: {}", error);

        let unload = self.registry.lock().unload_all();
        report.unloaded_contexts += unload.collapsed;
        for name in unload.pinned {
            if !report.leaked_contexts.contains(&name) {
                report.leaked_contexts.push(name);
            }
        }
        report.load_errors.extend(unload.close_failures);
        report.loaded_modules.clear();
        report.fatal = Some(error);

        Generation::empty(generation)
    }

    fn publish(self: &Arc<Self>, next: Generation, report: Arc<ReloadReport>) -> Result<(), DispatchError> {
        let inner = Arc::clone(self);
        let next = Arc::new(next);
        self.dispatcher.invoke(move || {
            *inner.current.write() = Arc::clone(&next);

            if let Some(error) = &report.fatal {
                let _ = inner.events.send(ManagerEvent::ReloadFailed {
                    generation: report.generation,
                    error: error.to_string(),
                });
            }
            let _ = inner.events.send(ManagerEvent::WidgetsChanged {
                generation: report.generation,
                widget_count: next.len(),
                report: Arc::clone(&report),
            });

            let listeners: Vec<Listener> = inner.listeners.lock().clone();
            for listener in listeners {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(next.as_ref(), report.as_ref()))) {
                    warn!("Widgets-changed listener panicked: {}", panic_message(payload.as_ref()));
                }
            }
        })
    }

    fn shutdown(&self) -> UnloadReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return UnloadReport::default();
        }
        info!("Shutting down widget manager");

        if let Some(mut watcher) = self.watcher.lock().take() {
            watcher.stop();
        }

        let _guard = self.reload_lock.lock();
        let previous = {
            let mut current = self.current.write();
            let id = current.id();
            std::mem::replace(&mut *current, Arc::new(Generation::empty(id)))
        };
        self.dispose_on_ui(previous);

        let mut registry = self.registry.lock();
        let report = registry.unload_all();
        if !report.pinned.is_empty() {
            warn!("Contexts still referenced at shutdown: {:?}", report.pinned);
        }
        let protected = registry.protected_staging_dirs();
        drop(registry);

        self.shadow.cleanup_stale(&protected);
        if protected.is_empty() {
            // Only succeeds when empty; other hosts may share the root.
            let _ = std::fs::remove_dir(self.shadow.staging_root());
        }

        self.idle.notify_waiters();
        report
    }
}
