//! Per-cycle reload report

use std::time::Duration;

use crate::error::{InstantiationError, LoadError, ReloadError, StagingError};
use crate::shadow::CleanupReport;

/// Outcome of one reload cycle
#[derive(Debug, Default)]
pub struct ReloadReport {
    /// Generation published by this cycle
    pub generation: u64,
    /// Names of the published widgets, in order
    pub widgets: Vec<String>,
    pub staged_modules: usize,
    /// Names of modules loaded into a context
    pub loaded_modules: Vec<String>,
    pub staging_errors: Vec<StagingError>,
    pub load_errors: Vec<LoadError>,
    pub instantiation_errors: Vec<InstantiationError>,
    /// Contexts of the previous generation that collapsed
    pub unloaded_contexts: usize,
    /// Contexts that could not collapse because something still references them
    pub leaked_contexts: Vec<String>,
    /// Resident contexts after teardown
    pub resident_contexts: usize,
    /// Resident contexts exceeded the configured maximum
    pub residency_exceeded: bool,
    pub cleanup: CleanupReport,
    /// Failure that aborted the cycle to an empty generation
    pub fatal: Option<ReloadError>,
    pub duration: Duration,
}

impl ReloadReport {
    pub(crate) fn new(generation: u64) -> Self {
        Self {
            generation,
            ..Default::default()
        }
    }

    /// No errors, no leaks
    pub fn is_clean(&self) -> bool {
        self.error_count() == 0 && self.leaked_contexts.is_empty() && !self.residency_exceeded
    }

    pub fn error_count(&self) -> usize {
        self.staging_errors.len()
            + self.load_errors.len()
            + self.instantiation_errors.len()
            + usize::from(self.fatal.is_some())
    }

    /// All errors of the cycle rendered as messages
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::with_capacity(self.error_count());
        errors.extend(self.staging_errors.iter().map(ToString::to_string));
        errors.extend(self.load_errors.iter().map(ToString::to_string));
        errors.extend(self.instantiation_errors.iter().map(ToString::to_string));
        errors.extend(self.fatal.iter().map(ToString::to_string));
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_empty_report_is_clean() {
        let report = ReloadReport::new(4);
        assert_eq!(report.generation, 4);
        assert!(report.is_clean());
        assert!(report.errors().is_empty());
    }

    #[test]
    fn test_errors_are_collected() {
        let mut report = ReloadReport::new(1);
        report.load_errors.push(LoadError::Open {
            path: PathBuf::from("/w/a.so"),
            reason: "bad header".to_string(),
        });
        report.fatal = Some(ReloadError::Panicked("boom".to_string()));

        assert_eq!(report.error_count(), 2);
        assert!(!report.is_clean());
        let errors = report.errors();
        assert!(errors[0].contains("bad header"));
        assert!(errors[1].contains("boom"));
    }

    #[test]
    fn test_leak_is_not_clean() {
        let mut report = ReloadReport::new(2);
        report.leaked_contexts.push("a.so".to_string());
        assert_eq!(report.error_count(), 0);
        assert!(!report.is_clean());
    }
}
