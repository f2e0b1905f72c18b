//! UI-thread dispatcher
//!
//! Widget construction, teardown and change notifications happen on a single
//! dedicated thread. Other threads marshal work onto it with
//! [`UiDispatcher::invoke`] (wait for the result) or [`UiDispatcher::post`]
//! (fire and forget).

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{DispatchError, panic_message};

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static ON_UI_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is a dispatcher's UI thread
pub fn is_ui_thread() -> bool {
    ON_UI_THREAD.with(Cell::get)
}

struct DispatcherInner {
    tx: Mutex<Option<Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

/// Handle to the UI thread. Cloning shares the same thread.
#[derive(Clone)]
pub struct UiDispatcher {
    inner: Arc<DispatcherInner>,
}

impl UiDispatcher {
    /// Spawn a named UI thread.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let thread = thread::Builder::new()
            .name(name.into())
            .spawn(move || run(rx))?;
        let thread_id = thread.thread().id();

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                tx: Mutex::new(Some(tx)),
                thread: Mutex::new(Some(thread)),
                thread_id,
            }),
        })
    }

    /// Whether the calling thread is this dispatcher's thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Run `f` on the UI thread and wait for its result. Runs inline when
    /// already on the UI thread.
    pub fn invoke<F, R>(&self, f: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| DispatchError::Panicked(panic_message(payload.as_ref())));
        }

        let (reply_tx, reply_rx) = bounded(1);
        self.send(Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| DispatchError::Panicked(panic_message(payload.as_ref())));
            let _ = reply_tx.send(result);
        }))?;

        reply_rx.recv().map_err(|_| DispatchError::Disconnected)?
    }

    /// Queue `f` on the UI thread without waiting.
    pub fn post<F>(&self, f: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Box::new(move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
                error!("UI task panicked: {}", panic_message(payload.as_ref()));
            }
        }))
    }

    fn send(&self, job: Job) -> Result<(), DispatchError> {
        let guard = self.inner.tx.lock();
        let tx = guard.as_ref().ok_or(DispatchError::Disconnected)?;
        tx.send(job).map_err(|_| DispatchError::Disconnected)
    }

    /// Stop accepting work, drain queued jobs and join the thread.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.tx.lock().is_none()
    }
}

impl DispatcherInner {
    fn shutdown(&self) {
        self.tx.lock().take();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if thread::current().id() == self.thread_id {
                // Exits on its own once the queue is drained.
                return;
            }
            if handle.join().is_err() {
                error!("UI thread terminated abnormally");
            }
        }
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for UiDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiDispatcher")
            .field("thread_id", &self.inner.thread_id)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn run(rx: Receiver<Job>) {
    ON_UI_THREAD.with(|flag| flag.set(true));
    debug!("UI thread started");
    for job in rx {
        job();
    }
    debug!("UI thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_invoke_runs_on_ui_thread() {
        let dispatcher = UiDispatcher::spawn("ui-test").unwrap();
        assert!(!is_ui_thread());
        assert!(!dispatcher.is_current());

        let on_ui = dispatcher.invoke(is_ui_thread).unwrap();
        assert!(on_ui);

        let name = dispatcher
            .invoke(|| thread::current().name().map(str::to_string))
            .unwrap();
        assert_eq!(name.as_deref(), Some("ui-test"));
    }

    #[test]
    fn test_nested_invoke_runs_inline() {
        let dispatcher = UiDispatcher::spawn("ui-nested").unwrap();
        let inner = dispatcher.clone();
        let value = dispatcher
            .invoke(move || inner.invoke(|| 21 * 2).unwrap())
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_panic_is_reported_and_thread_survives() {
        let dispatcher = UiDispatcher::spawn("ui-panic").unwrap();
        let err = dispatcher.invoke::<_, ()>(|| panic!("view crashed")).unwrap_err();
        assert!(matches!(err, DispatchError::Panicked(ref m) if m == "view crashed"));

        assert_eq!(dispatcher.invoke(|| 1).unwrap(), 1);
    }

    #[test]
    fn test_post_and_shutdown_drains_queue() {
        let dispatcher = UiDispatcher::spawn("ui-post").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            dispatcher
                .post(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        dispatcher.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(dispatcher.is_shut_down());
        assert!(matches!(
            dispatcher.invoke(|| ()),
            Err(DispatchError::Disconnected)
        ));
    }
}
