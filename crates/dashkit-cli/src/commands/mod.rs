//! CLI command implementations

pub mod list;
pub mod run;

use dashkit_host::{EventBus, HostConfig, UiDispatcher, WidgetManager};

/// Build the bus, the UI thread and the widget manager.
pub(crate) fn build_manager(config: HostConfig) -> anyhow::Result<WidgetManager> {
    let bus = EventBus::new();
    let dispatcher = UiDispatcher::spawn("dashkit-ui")?;
    Ok(WidgetManager::new(config, bus, dispatcher)?)
}
