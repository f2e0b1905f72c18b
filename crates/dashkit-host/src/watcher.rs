//! File system watcher for widget module changes
//!
//! Monitors the widget directory (non-recursively) and hands every relevant
//! change to a trigger callback. There is no debounce window; each event
//! reaches the callback.

use std::path::{Path, PathBuf};
use std::time::Instant;

use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::WatchError;

/// Watch event kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Module file created
    Created,
    /// Module file modified
    Modified,
    /// Module file removed
    Removed,
    /// Module file renamed
    Renamed { from: PathBuf, to: PathBuf },
}

/// Watch event
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Event kind
    pub kind: WatchEventKind,
    /// Affected path
    pub path: PathBuf,
    /// Timestamp
    pub timestamp: Instant,
}

impl WatchEvent {
    /// Create a new watch event
    pub fn new(kind: WatchEventKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            timestamp: Instant::now(),
        }
    }
}

/// Convert a raw notify event into watch events for recognized module files.
pub fn classify(event: &Event, config: &HostConfig) -> Vec<WatchEvent> {
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        if let [from, to] = event.paths.as_slice() {
            if config.is_module_file(from) || config.is_module_file(to) {
                return vec![WatchEvent::new(
                    WatchEventKind::Renamed {
                        from: from.clone(),
                        to: to.clone(),
                    },
                    to.clone(),
                )];
            }
            return Vec::new();
        }
    }

    event
        .paths
        .iter()
        .filter(|path| config.is_module_file(path))
        .filter_map(|path| {
            let kind = match event.kind {
                EventKind::Create(_) => WatchEventKind::Created,
                EventKind::Remove(_) => WatchEventKind::Removed,
                EventKind::Modify(ModifyKind::Name(RenameMode::From)) => WatchEventKind::Removed,
                EventKind::Modify(ModifyKind::Name(RenameMode::To)) => WatchEventKind::Created,
                EventKind::Modify(ModifyKind::Name(_)) => {
                    if path.exists() {
                        WatchEventKind::Created
                    } else {
                        WatchEventKind::Removed
                    }
                }
                EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                    WatchEventKind::Modified
                }
                _ => return None,
            };
            Some(WatchEvent::new(kind, path.clone()))
        })
        .collect()
}

/// Watches the widget directory and forwards module changes.
pub struct ChangeWatcher {
    dir: PathBuf,
    config: HostConfig,
    watcher: Option<RecommendedWatcher>,
    task: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Create a new watcher for `dir`
    pub fn new<P: AsRef<Path>>(dir: P, config: HostConfig) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            config,
            watcher: None,
            task: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start watching. `on_change` runs on a tokio task of `runtime` and
    /// must return quickly.
    pub fn start<F>(&mut self, runtime: &Handle, on_change: F) -> Result<(), WatchError>
    where
        F: Fn(WatchEvent) + Send + Sync + 'static,
    {
        if self.is_running() {
            return Ok(());
        }

        info!("Starting change watcher on {:?}", self.dir);

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!("Watch error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        let config = self.config.clone();
        let task = runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                for watch_event in classify(&event, &config) {
                    debug!("Watch event: {:?}", watch_event);
                    on_change(watch_event);
                }
            }
            debug!("Change watcher event loop finished");
        });

        self.watcher = Some(watcher);
        self.task = Some(task);
        Ok(())
    }

    /// Stop watching
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("Stopping change watcher on {:?}", self.dir);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
