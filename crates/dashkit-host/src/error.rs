//! Error taxonomy of the widget host
//!
//! Per-item errors ([`StagingError`], [`LoadError`], [`InstantiationError`])
//! are collected into a reload report and never abort their loop.
//! [`ReloadError`] is reserved for failures outside those loops; it aborts the
//! cycle to an empty generation.

use std::any::Any;
use std::path::PathBuf;

use dashkit_kernel::WidgetError;
use dashkit_kernel::config::ConfigError;

/// A module file could not be copied into the shadow directory.
#[derive(Debug, thiserror::Error)]
#[error("Failed to stage {path:?}: {source}")]
pub struct StagingError {
    /// Original file that was skipped
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// A staged module could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to open module {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Module {path:?} is missing symbol `{symbol}`")]
    MissingSymbol { path: PathBuf, symbol: String },

    #[error("Module {path:?} ABI mismatch: expected {expected}, got {actual}")]
    AbiMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[error("Module {path:?} registered widget type `{type_id}` more than once")]
    DuplicateRegistration { path: PathBuf, type_id: String },

    #[error("Module {path:?} failed during self-registration: {reason}")]
    Registration { path: PathBuf, reason: String },

    #[error("Failed to close module {path:?}: {reason}")]
    Close { path: PathBuf, reason: String },

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A widget type could not be instantiated.
#[derive(Debug, thiserror::Error)]
pub enum InstantiationError {
    #[error("Widget `{type_id}` from {path:?} failed to construct: {source}")]
    Construction {
        type_id: String,
        path: PathBuf,
        #[source]
        source: WidgetError,
    },

    #[error("Widget `{type_id}` from {path:?} panicked during construction: {message}")]
    Panicked {
        type_id: String,
        path: PathBuf,
        message: String,
    },

    #[error("Widget type `{type_id}` from {path:?} is already provided by {first:?}")]
    DuplicateType {
        type_id: String,
        path: PathBuf,
        first: PathBuf,
    },
}

impl InstantiationError {
    /// Type id of the widget that was skipped
    pub fn type_id(&self) -> &str {
        match self {
            Self::Construction { type_id, .. }
            | Self::Panicked { type_id, .. }
            | Self::DuplicateType { type_id, .. } => type_id,
        }
    }
}

/// Marshaling work onto the UI dispatcher failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("UI dispatcher is shut down")]
    Disconnected,

    #[error("UI task panicked: {0}")]
    Panicked(String),
}

/// Unanticipated failure of a reload cycle.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("Failed to prepare shadow directory {path:?}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to scan widget directory {path:?}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Reload panicked: {0}")]
    Panicked(String),

    #[error("Reload task failed: {0}")]
    Join(String),

    #[error("A blocking reload cannot run on the UI thread")]
    OnUiThread,

    #[error("Widget manager is shut down")]
    ShutDown,
}

/// File watching failed.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("No tokio runtime available to process watch events")]
    NoRuntime,
}

/// Host construction / lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Failed to prepare widget directory {path:?}: {source}")]
    WidgetsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start UI dispatcher: {0}")]
    Dispatcher(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Reload error: {0}")]
    Reload(#[from] ReloadError),
}

/// Render a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
