//! Text widget
//!
//! Shows the last text submitted on the bus together with its character and
//! word counts.

use std::sync::Arc;

use dashkit_kernel::{
    EventBus, FromEventBus, Renderable, Subscription, ViewHandle, Widget, WidgetResult, topics,
};
use parking_lot::RwLock;

/// Summary of a submitted text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextStats {
    pub text: String,
    pub chars: usize,
    pub words: usize,
}

impl TextStats {
    pub fn of(text: &str) -> Self {
        Self {
            text: text.to_string(),
            chars: text.chars().count(),
            words: text.split_whitespace().count(),
        }
    }
}

#[derive(Default)]
pub struct TextView {
    latest: RwLock<Option<TextStats>>,
}

impl TextView {
    pub fn update(&self, data: &str) {
        *self.latest.write() = Some(TextStats::of(data));
    }

    pub fn latest(&self) -> Option<TextStats> {
        self.latest.read().clone()
    }
}

impl Renderable for TextView {
    fn render(&self) -> String {
        match &*self.latest.read() {
            None => "Waiting for data...".to_string(),
            Some(stats) => format!(
                "{}\nCharacters: {}\nWords: {}",
                stats.text, stats.chars, stats.words
            ),
        }
    }
}

pub struct TextWidget {
    view: Arc<TextView>,
    _subscription: Subscription,
}

impl FromEventBus for TextWidget {
    fn from_event_bus(bus: &EventBus) -> WidgetResult<Self> {
        let view = Arc::new(TextView::default());
        let target = Arc::clone(&view);
        let subscription = bus.subscribe(topics::DATA_SUBMITTED, move |data| target.update(data));
        Ok(Self {
            view,
            _subscription: subscription,
        })
    }
}

impl Widget for TextWidget {
    fn name(&self) -> &str {
        "Text Widget"
    }

    fn view(&self) -> ViewHandle {
        self.view.clone()
    }
}

dashkit_kernel::export_widgets! {
    "dashkit.text" => TextWidget,
}
