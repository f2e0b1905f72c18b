//! dashkit kernel
//!
//! Shared contract between the widget host and widget modules:
//! - [`Widget`] / [`Renderable`]: the capability set every widget exposes
//! - [`EventBus`]: topic based publish/subscribe used to feed widgets
//! - [`WidgetRegistrar`]: the self-registration table a module fills at load time
//! - [`abi`]: exported symbol names and the `export_widgets!` macro

pub mod abi;
pub mod bus;
pub mod error;
pub mod widget;

#[cfg(feature = "config")]
pub mod config;

pub use bus::{EventBus, Handler, Subscription, topics};
pub use error::{WidgetError, WidgetResult};
pub use widget::{FromEventBus, Renderable, ViewHandle, Widget, WidgetFactory, WidgetRegistrar};
