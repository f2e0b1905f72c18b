//! Charts widget
//!
//! Parses the numbers of every submitted text and renders them as a
//! horizontal bar chart.

use std::sync::Arc;

use dashkit_kernel::{
    EventBus, FromEventBus, Renderable, Subscription, ViewHandle, Widget, WidgetResult, topics,
};
use parking_lot::RwLock;

/// Width of the longest bar in characters
pub const BAR_WIDTH: usize = 40;

pub const PARSE_ERROR: &str =
    "Cannot parse the numbers. Input space separated numbers (e.g. 10 50 30 80)";

/// Numbers of `text`, split on whitespace, commas and semicolons. Tokens that
/// are not numbers are skipped.
pub fn parse_numbers(text: &str) -> Vec<f64> {
    text.split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse::<f64>().ok())
        .filter(|n| n.is_finite())
        .collect()
}

/// Render `numbers` as labelled bars scaled to the largest value.
pub fn bar_chart(numbers: &[f64]) -> String {
    let max = numbers.iter().copied().fold(f64::MIN, f64::max);
    let max = if max <= 0.0 { 1.0 } else { max };

    numbers
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let len = ((value.max(0.0) / max) * BAR_WIDTH as f64).round() as usize;
            format!("{:>2} | {} {:.1}", i + 1, "#".repeat(len), value)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, PartialEq)]
enum ChartState {
    Empty,
    Invalid,
    Values(Vec<f64>),
}

pub struct ChartView {
    state: RwLock<ChartState>,
}

impl Default for ChartView {
    fn default() -> Self {
        Self {
            state: RwLock::new(ChartState::Empty),
        }
    }
}

impl ChartView {
    pub fn update(&self, data: &str) {
        let numbers = parse_numbers(data);
        *self.state.write() = if numbers.is_empty() {
            ChartState::Invalid
        } else {
            ChartState::Values(numbers)
        };
    }

    /// Values currently charted
    pub fn values(&self) -> Vec<f64> {
        match &*self.state.read() {
            ChartState::Values(values) => values.clone(),
            _ => Vec::new(),
        }
    }
}

impl Renderable for ChartView {
    fn render(&self) -> String {
        match &*self.state.read() {
            ChartState::Empty => "No data yet".to_string(),
            ChartState::Invalid => PARSE_ERROR.to_string(),
            ChartState::Values(values) => bar_chart(values),
        }
    }
}

pub struct ChartsWidget {
    view: Arc<ChartView>,
    _subscription: Subscription,
}

impl FromEventBus for ChartsWidget {
    fn from_event_bus(bus: &EventBus) -> WidgetResult<Self> {
        let view = Arc::new(ChartView::default());
        let target = Arc::clone(&view);
        let subscription = bus.subscribe(topics::DATA_SUBMITTED, move |data| target.update(data));
        Ok(Self {
            view,
            _subscription: subscription,
        })
    }
}

impl Widget for ChartsWidget {
    fn name(&self) -> &str {
        "Charts Widget"
    }

    fn view(&self) -> ViewHandle {
        self.view.clone()
    }
}

dashkit_kernel::export_widgets! {
    "dashkit.charts" => ChartsWidget,
}
