//! Host configuration

use std::path::{Path, PathBuf};

use dashkit_kernel::config::{ConfigResult, load_from_env, load_with_env};
use serde::{Deserialize, Serialize};

/// Prefix of environment variables overriding file configuration.
pub const ENV_PREFIX: &str = "DASHKIT";

/// Widget host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory scanned and watched for widget modules
    pub widgets_dir: PathBuf,
    /// Root under which one shadow directory per generation is created
    pub staging_root: PathBuf,
    /// Recognized module file extensions
    pub extensions: Vec<String>,
    /// Extension of the companion dependency manifest (`<stem>.<ext>`)
    pub manifest_extension: String,
    /// Ignore patterns (`*suffix`, `prefix*` or exact file name)
    pub ignore_patterns: Vec<String>,
    /// Resident load contexts tolerated after a teardown before it is reported as a leak
    pub max_resident_contexts: usize,
    /// Whether to watch the widget directory for changes
    pub watch: bool,
    /// Capacity of the manager event channel
    pub event_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            widgets_dir: PathBuf::from("Widgets"),
            staging_root: std::env::temp_dir().join("WidgetsShadowCopy"),
            extensions: vec!["so".to_string(), "dylib".to_string(), "dll".to_string()],
            manifest_extension: "deps.json".to_string(),
            ignore_patterns: vec!["*.tmp".to_string(), "*.swp".to_string(), "*~".to_string()],
            max_resident_contexts: 64,
            watch: true,
            event_capacity: 64,
        }
    }
}

impl HostConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a YAML/TOML/JSON file, then apply `DASHKIT__*` overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        load_with_env(path.as_ref(), ENV_PREFIX)
    }

    /// Defaults with `DASHKIT__*` overrides applied
    pub fn from_env() -> ConfigResult<Self> {
        load_from_env(ENV_PREFIX)
    }

    /// Set the widget directory
    pub fn with_widgets_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.widgets_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the staging root
    pub fn with_staging_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.staging_root = root.as_ref().to_path_buf();
        self
    }

    /// Replace the recognized module extensions
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Add a recognized module extension
    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extensions.push(ext.to_string());
        self
    }

    /// Set the manifest extension
    pub fn with_manifest_extension(mut self, ext: &str) -> Self {
        self.manifest_extension = ext.to_string();
        self
    }

    /// Add ignore pattern
    pub fn with_ignore(mut self, pattern: &str) -> Self {
        self.ignore_patterns.push(pattern.to_string());
        self
    }

    /// Set the resident context limit
    pub fn with_max_resident_contexts(mut self, max: usize) -> Self {
        self.max_resident_contexts = max;
        self
    }

    /// Enable/disable directory watching
    pub fn with_watch(mut self, enabled: bool) -> Self {
        self.watch = enabled;
        self
    }

    /// Check if a path names a recognized module file.
    ///
    /// Only the name is inspected, so removed files still classify.
    pub fn is_module_file(&self, path: &Path) -> bool {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
            return false;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        !self.ignore_patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                file_name.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                file_name.starts_with(prefix)
            } else {
                file_name == pattern
            }
        })
    }

    /// Companion manifest path of a module file
    pub fn manifest_for(&self, module: &Path) -> PathBuf {
        module.with_extension(&self.manifest_extension)
    }
}
