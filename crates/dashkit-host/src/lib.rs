//! dashkit host
//!
//! Hot-reloading widget manager:
//! - Shadow copies module files so the originals stay replaceable
//! - Loads every module into its own unloadable context
//! - Instantiates widgets on a single-threaded UI dispatcher
//! - Watches the widget directory and reloads the whole set on change
//! - Tears generations down deterministically and reports leaked contexts

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod instantiator;
pub mod loader;
pub mod manager;
pub mod phase;
pub mod registry;
pub mod report;
pub mod shadow;
pub mod watcher;

pub use config::HostConfig;
pub use dispatcher::{UiDispatcher, is_ui_thread};
pub use error::{
    DispatchError, HostError, InstantiationError, LoadError, ReloadError, StagingError, WatchError,
};
pub use instantiator::{InstantiationOutcome, PluginInstance, PluginInstantiator};
pub use loader::{
    DylibBackend, IsolatedLoader, LoadContext, LoadedModule, ModuleBackend, ModuleHandle,
    Registration,
};
pub use manager::{Generation, ManagerEvent, WidgetManager};
pub use phase::ReloadPhase;
pub use registry::{ModuleRegistry, ResidencyTracker, UnloadReport};
pub use report::ReloadReport;
pub use shadow::{CleanupReport, ShadowCopier, StagedGeneration, StagedModule};
pub use watcher::{ChangeWatcher, WatchEvent, WatchEventKind};

pub use dashkit_kernel::{EventBus, Widget, topics};
