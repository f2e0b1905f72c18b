//! Widget instantiation
//!
//! Turns the registration tables of loaded contexts into live widgets. Must
//! run on the UI thread.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashkit_kernel::{EventBus, Renderable, ViewHandle, Widget};
use tracing::{debug, warn};

use crate::dispatcher::is_ui_thread;
use crate::error::{InstantiationError, panic_message};
use crate::loader::{LoadContext, ModuleHandle};

/// A live widget together with the module that provides its code.
///
/// `widget` is declared before `module` so the widget is dropped while its
/// code is still mapped.
pub struct PluginInstance {
    widget: Box<dyn Widget>,
    type_id: String,
    source: PathBuf,
    generation: u64,
    module: Arc<ModuleHandle>,
}

impl PluginInstance {
    /// Display name reported by the widget
    pub fn name(&self) -> &str {
        self.widget.name()
    }

    /// Renderable view of the widget.
    ///
    /// The returned handle pins the providing module: while it is alive the
    /// module's context cannot collapse and is reported as leaked instead.
    pub fn view(&self) -> ViewHandle {
        Arc::new(PinnedView {
            view: self.widget.view(),
            _module: Arc::clone(&self.module),
        })
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// Module file the widget type came from
    pub fn source_path(&self) -> &Path {
        &self.source
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.name())
            .field("type_id", &self.type_id)
            .field("source", &self.source)
            .field("generation", &self.generation)
            .finish()
    }
}

/// View handle that keeps its module loaded.
///
/// `view` is declared before `_module` so the module's view is dropped while
/// its code is still mapped.
struct PinnedView {
    view: ViewHandle,
    _module: Arc<ModuleHandle>,
}

impl Renderable for PinnedView {
    fn render(&self) -> String {
        self.view.render()
    }
}

/// Widgets created in one pass plus per-type failures
#[derive(Debug, Default)]
pub struct InstantiationOutcome {
    pub instances: Vec<PluginInstance>,
    pub errors: Vec<InstantiationError>,
}

/// Creates one instance per registered widget type
pub struct PluginInstantiator<'a> {
    bus: &'a EventBus,
}

impl<'a> PluginInstantiator<'a> {
    pub fn new(bus: &'a EventBus) -> Self {
        Self { bus }
    }

    /// Instantiate every registration of `contexts`, in order. A type id
    /// already provided by an earlier context is skipped.
    pub fn instantiate<'c>(
        &self,
        contexts: impl IntoIterator<Item = &'c LoadContext>,
        generation: u64,
    ) -> InstantiationOutcome {
        debug_assert!(is_ui_thread(), "widgets must be constructed on the UI thread");

        let mut outcome = InstantiationOutcome::default();
        let mut providers: HashMap<String, PathBuf> = HashMap::new();

        for context in contexts {
            let source = context.original_path();
            for registration in context.registrations() {
                let type_id = registration.type_id();

                if let Some(first) = providers.get(type_id) {
                    warn!("Widget type {} from {:?} already provided by {:?}", type_id, source, first);
                    outcome.errors.push(InstantiationError::DuplicateType {
                        type_id: type_id.to_string(),
                        path: source.to_path_buf(),
                        first: first.clone(),
                    });
                    continue;
                }
                providers.insert(type_id.to_string(), source.to_path_buf());

                let factory = registration.factory();
                let built = catch_unwind(AssertUnwindSafe(|| factory(self.bus)));
                match built {
                    Ok(Ok(widget)) => {
                        debug!("Instantiated widget {} ({})", widget.name(), type_id);
                        outcome.instances.push(PluginInstance {
                            widget,
                            type_id: type_id.to_string(),
                            source: source.to_path_buf(),
                            generation,
                            module: Arc::clone(context.module()),
                        });
                    }
                    Ok(Err(e)) => {
                        warn!("Widget {} failed to construct: {}", type_id, e);
                        outcome.errors.push(InstantiationError::Construction {
                            type_id: type_id.to_string(),
                            path: source.to_path_buf(),
                            source: e,
                        });
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        warn!("Widget {} panicked during construction: {}", type_id, message);
                        outcome.errors.push(InstantiationError::Panicked {
                            type_id: type_id.to_string(),
                            path: source.to_path_buf(),
                            message,
                        });
                    }
                }
            }
        }

        outcome
    }
}
