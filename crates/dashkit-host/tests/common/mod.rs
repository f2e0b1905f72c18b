//! Shared fixtures for reload-cycle tests
//!
//! `ScriptBackend` treats every staged module file as a small script, one
//! directive per line:
//!
//! ```text
//! widget <type_id> <name>     register a widget subscribed to data.submitted
//! slow-widget <type_id> <name> <millis>
//!                             same, but each delivery takes <millis>
//! fail-construct <type_id>    register a type whose constructor returns an error
//! panic-construct <type_id>   register a type whose constructor panics
//! corrupt                     refuse to open
//! ```

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashkit_host::{
    EventBus, HostConfig, LoadError, LoadedModule, ModuleBackend, StagedModule,
    UiDispatcher, Widget, WidgetManager, topics,
};
use dashkit_kernel::{
    Renderable, Subscription, ViewHandle, WidgetError, WidgetRegistrar, WidgetResult,
};
use parking_lot::Mutex;
use tempfile::TempDir;

#[derive(Default)]
pub struct Counters {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub deliveries_started: AtomicUsize,
    /// A module was closed while a slow handler was running.
    pub closed_mid_delivery: AtomicBool,
}

impl Counters {
    pub fn open_modules(&self) -> usize {
        self.opened.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct ScriptBackend {
    pub counters: Arc<Counters>,
}

struct ScriptModule {
    directives: Vec<Vec<String>>,
    counters: Arc<Counters>,
}

impl ModuleBackend for ScriptBackend {
    fn open(&self, module: &StagedModule) -> Result<Box<dyn LoadedModule>, LoadError> {
        let text = std::fs::read_to_string(&module.staged).map_err(|source| LoadError::Io {
            path: module.staged.clone(),
            source,
        })?;
        let directives: Vec<Vec<String>> = text
            .lines()
            .map(|l| l.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|d| !d.is_empty())
            .collect();

        if directives.iter().any(|d| d[0] == "corrupt") {
            return Err(LoadError::Open {
                path: module.staged.clone(),
                reason: "bad image format".to_string(),
            });
        }

        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptModule {
            directives,
            counters: Arc::clone(&self.counters),
        }))
    }
}

impl LoadedModule for ScriptModule {
    fn register(&self, registrar: &mut dyn WidgetRegistrar) -> Result<(), LoadError> {
        for directive in &self.directives {
            let words: Vec<&str> = directive.iter().map(String::as_str).collect();
            match words.as_slice() {
                ["widget", type_id, name] => {
                    let name = name.to_string();
                    registrar.register(
                        type_id,
                        Arc::new(move |bus: &EventBus| -> WidgetResult<Box<dyn Widget>> {
                            Ok(Box::new(EchoWidget::new(&name, bus)))
                        }),
                    );
                }
                ["slow-widget", type_id, name, millis] => {
                    let name = name.to_string();
                    let delay = Duration::from_millis(millis.parse().unwrap_or(100));
                    let counters = Arc::clone(&self.counters);
                    registrar.register(
                        type_id,
                        Arc::new(move |bus: &EventBus| -> WidgetResult<Box<dyn Widget>> {
                            Ok(Box::new(EchoWidget::slow(&name, bus, delay, Arc::clone(&counters))))
                        }),
                    );
                }
                ["fail-construct", type_id] => {
                    let id = type_id.to_string();
                    registrar.register(
                        type_id,
                        Arc::new(move |_bus: &EventBus| -> WidgetResult<Box<dyn Widget>> {
                            Err(WidgetError::ConstructionFailed(format!("{id} refused to start")))
                        }),
                    );
                }
                ["panic-construct", type_id] => {
                    registrar.register(
                        type_id,
                        Arc::new(|_bus: &EventBus| -> WidgetResult<Box<dyn Widget>> {
                            panic!("constructor crashed")
                        }),
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), LoadError> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct EchoView {
    name: String,
    last: Arc<Mutex<Option<String>>>,
}

impl Renderable for EchoView {
    fn render(&self) -> String {
        match self.last.lock().as_deref() {
            Some(text) => format!("{}: {}", self.name, text),
            None => format!("{}: -", self.name),
        }
    }
}

pub struct EchoWidget {
    name: String,
    last: Arc<Mutex<Option<String>>>,
    _subscription: Subscription,
}

impl EchoWidget {
    fn new(name: &str, bus: &EventBus) -> Self {
        let last = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&last);
        let subscription = bus.subscribe(topics::DATA_SUBMITTED, move |payload| {
            *sink.lock() = Some(payload.to_string());
        });
        Self {
            name: name.to_string(),
            last,
            _subscription: subscription,
        }
    }

    fn slow(name: &str, bus: &EventBus, delay: Duration, counters: Arc<Counters>) -> Self {
        let last = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&last);
        let subscription = bus.subscribe(topics::DATA_SUBMITTED, move |payload| {
            let closed_before = counters.closed.load(Ordering::SeqCst);
            counters.deliveries_started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(delay);
            if counters.closed.load(Ordering::SeqCst) != closed_before {
                counters.closed_mid_delivery.store(true, Ordering::SeqCst);
            }
            *sink.lock() = Some(payload.to_string());
        });
        Self {
            name: name.to_string(),
            last,
            _subscription: subscription,
        }
    }
}

impl Widget for EchoWidget {
    fn name(&self) -> &str {
        &self.name
    }

    fn view(&self) -> ViewHandle {
        Arc::new(EchoView {
            name: self.name.clone(),
            last: Arc::clone(&self.last),
        })
    }
}

pub struct Host {
    pub manager: WidgetManager,
    pub counters: Arc<Counters>,
    pub bus: EventBus,
    pub widgets: TempDir,
    pub staging: TempDir,
}

impl Host {
    pub fn new(watch: bool) -> Self {
        Self::with_config(watch, |config| config)
    }

    pub fn with_config(watch: bool, adjust: impl FnOnce(HostConfig) -> HostConfig) -> Self {
        let widgets = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let config = adjust(
            HostConfig::default()
                .with_widgets_dir(widgets.path())
                .with_staging_root(staging.path().join("shadow"))
                .with_watch(watch),
        );

        let backend = ScriptBackend::default();
        let counters = Arc::clone(&backend.counters);
        let bus = EventBus::new();
        let dispatcher = UiDispatcher::spawn("dashkit-test-ui").unwrap();
        let manager =
            WidgetManager::with_backend(config, bus.clone(), dispatcher, Arc::new(backend)).unwrap();

        Self {
            manager,
            counters,
            bus,
            widgets,
            staging,
        }
    }

    pub fn write_module(&self, file: &str, script: &str) -> PathBuf {
        let path = self.widgets.path().join(file);
        std::fs::write(&path, script).unwrap();
        path
    }

    pub fn remove_module(&self, file: &str) {
        std::fs::remove_file(self.widgets.path().join(file)).unwrap();
    }

    pub fn shadow_root(&self) -> PathBuf {
        self.staging.path().join("shadow")
    }

    pub fn shadow_dirs(&self) -> usize {
        match std::fs::read_dir(self.shadow_root()) {
            Ok(entries) => entries.flatten().filter(|e| e.path().is_dir()).count(),
            Err(_) => 0,
        }
    }

    pub fn submit(&self, text: &str) -> usize {
        let bus = self.bus.clone();
        let text = text.to_string();
        self.manager
            .dispatcher()
            .invoke(move || bus.publish(topics::DATA_SUBMITTED, &text))
            .unwrap()
    }

    pub fn render_all(&self) -> Vec<String> {
        self.manager
            .with_widgets(|generation| generation.iter().map(|w| w.view().render()).collect())
    }
}

pub fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

/// Poll the published widget set until `accept` holds.
pub async fn wait_for_widgets(manager: &WidgetManager, accept: impl Fn(&[String]) -> bool) -> Vec<String> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let current = sorted(manager.widget_names());
            if accept(&current) {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("widget set did not reach the expected state in time")
}

pub fn is_dir_empty_or_missing(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}
