//! Change aggregation and debounced delivery to the single client.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use fnv::FnvHashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::{ChangeEvent, DidFilesChangedParams};

/// Receiver of debounced change batches.
pub trait FileSystemWatcherClient: Send + Sync {
    fn on_did_files_changed(&self, event: DidFilesChangedParams);
}

impl FileSystemWatcherClient for mpsc::UnboundedSender<DidFilesChangedParams> {
    fn on_did_files_changed(&self, event: DidFilesChangedParams) {
        let _ = self.send(event);
    }
}

/// Changes accumulated since the last flush, one entry per URI.
///
/// A later push for the same URI replaces the earlier one in place, so the
/// flushed batch lists URIs in the order they were first seen.
#[derive(Debug, Default)]
pub struct ChangeWindow {
    changes: Vec<ChangeEvent>,
    index: FnvHashMap<String, usize>,
}

impl ChangeWindow {
    pub fn push(&mut self, change: ChangeEvent) {
        match self.index.get(&change.uri) {
            Some(&slot) => self.changes[slot] = change,
            None => {
                self.index.insert(change.uri.clone(), self.changes.len());
                self.changes.push(change);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Takes every change and leaves an empty window behind.
    pub fn take(&mut self) -> Vec<ChangeEvent> {
        self.index.clear();
        std::mem::take(&mut self.changes)
    }
}

struct DispatchState {
    window: ChangeWindow,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every re-arm; a timer only flushes if it is still current.
    generation: u64,
    client: Option<Arc<dyn FileSystemWatcherClient>>,
    closed: bool,
}

struct DispatchInner {
    quiet_period: Duration,
    state: Mutex<DispatchState>,
}

/// Debounced dispatcher owning the change window, the client and the single
/// flush timer.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatchInner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Dispatcher")
            .field("quiet_period", &self.inner.quiet_period)
            .field("pending", &state.window.len())
            .field("has_client", &state.client.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                quiet_period,
                state: Mutex::new(DispatchState {
                    window: ChangeWindow::default(),
                    timer: None,
                    generation: 0,
                    client: None,
                    closed: false,
                }),
            }),
        }
    }

    /// Adds a change to the window and re-arms the flush timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn push(&self, change: ChangeEvent) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.window.push(change);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;
        let inner = Arc::downgrade(&self.inner);
        let quiet_period = self.inner.quiet_period;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet_period).await;
            flush(inner, generation);
        }));
    }

    /// Registers the single client, replacing any previous one.
    ///
    /// Registering after [`Dispatcher::close`] is ignored.
    pub fn set_client(&self, client: Option<Arc<dyn FileSystemWatcherClient>>) {
        let mut state = self.inner.state.lock();
        if client.is_some() && state.closed {
            log::debug!("ignoring client registration on a disposed watcher");
            return;
        }
        state.client = client;
    }

    pub fn has_client(&self) -> bool {
        self.inner.state.lock().client.is_some()
    }

    /// Number of URIs waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().window.len()
    }

    /// Detaches the client, cancels the timer and drops pending changes.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.client = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.window.take();
    }

}

/// Delivers the window if `generation` still names the armed timer.
///
/// A timer that already woke up cannot be aborted, so a re-arm racing with
/// its flush leaves it running; the stale generation makes it a no-op.
fn flush(inner: Weak<DispatchInner>, generation: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let (changes, client) = {
        let mut state = inner.state.lock();
        if state.generation != generation {
            return;
        }
        state.timer = None;
        (state.window.take(), state.client.clone())
    };
    if changes.is_empty() {
        return;
    }
    match client {
        Some(client) => client.on_did_files_changed(DidFilesChangedParams { changes }),
        None => log::debug!("dropping {} changes, no client registered", changes.len()),
    }
}
