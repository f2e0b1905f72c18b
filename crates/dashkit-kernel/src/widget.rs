//! Widget capability contract
//!
//! A widget is anything with a display name and a renderable view. The host
//! never looks further than this; what a widget does with bus payloads is its
//! own business.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::error::WidgetResult;

/// Something the host can put on screen.
pub trait Renderable: Send + Sync {
    /// Produce the current textual rendition of the view.
    fn render(&self) -> String;
}

/// Shared handle to a widget view.
///
/// Hosts hand out handles that keep the producing module resident; a handle
/// still held when its generation is torn down pins that module until the
/// handle is dropped.
pub type ViewHandle = Arc<dyn Renderable>;

/// The capability set a widget type must expose to be hosted.
pub trait Widget: Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// The widget's view.
    fn view(&self) -> ViewHandle;
}

/// Designated constructor of a widget type: the notification bus is the only
/// dependency a widget receives.
pub trait FromEventBus: Sized {
    fn from_event_bus(bus: &EventBus) -> WidgetResult<Self>;
}

/// Factory stored in a module's registration table.
pub type WidgetFactory = Arc<dyn Fn(&EventBus) -> WidgetResult<Box<dyn Widget>> + Send + Sync>;

/// Registration table filled by a module's self-registration entry point.
pub trait WidgetRegistrar {
    /// Register a factory under a stable type identifier.
    fn register(&mut self, type_id: &str, factory: WidgetFactory);
}
