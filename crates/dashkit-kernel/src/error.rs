//! Typed errors raised by widget code.

use thiserror::Error;

/// Errors a widget may report while being constructed or fed data.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WidgetError {
    /// The widget could not be constructed.
    #[error("Widget construction failed: {0}")]
    ConstructionFailed(String),

    /// A payload received from the bus could not be interpreted.
    #[error("Invalid widget input: {0}")]
    InvalidInput(String),

    /// Catch-all for errors that don't fit the above categories.
    #[error("{0}")]
    Other(String),
}

/// Result type for widget operations.
pub type WidgetResult<T> = Result<T, WidgetError>;
