//! Native watch adapter: the only OS-coupled part of the watcher.
//!
//! Backends implement [`NativeBackend`]; the `notify` crate provides the
//! platform primitive (inotify, FSEvents, ReadDirectoryChangesW, or polling).
//! Callbacks never touch watcher state directly, they forward normalized
//! [`RawEvent`] batches through a [`RawEventSink`] to the handle's pump task.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::{BackendKind, WatcherConfig};
use crate::error::{Result, WatcherError};
use crate::types::{RawAction, RawEvent};

/// A message from a native watch to its pump task.
#[derive(Debug)]
pub enum NativeSignal {
    /// Events reported by one native callback invocation.
    Batch(Vec<RawEvent>),
    /// The native watch cannot continue.
    Fatal(String),
}

/// Sending half handed to a backend when a watch starts.
#[derive(Debug, Clone)]
pub struct RawEventSink {
    tx: mpsc::UnboundedSender<NativeSignal>,
}

impl RawEventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NativeSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Forwards a batch. Returns `false` once the receiving side is gone.
    pub fn send_batch(&self, events: Vec<RawEvent>) -> bool {
        if events.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(NativeSignal::Batch(events)).is_ok()
    }

    pub fn send_fatal(&self, message: impl Into<String>) -> bool {
        self.tx.send(NativeSignal::Fatal(message.into())).is_ok()
    }
}

/// A running native watch. Stopping releases every OS resource it holds.
pub trait NativeWatch: Send {
    fn stop(&mut self);
}

/// Capability to start recursive watches on a canonical root.
///
/// `start` may block (recursive registration walks the tree); callers run
/// it on the blocking pool.
pub trait NativeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn start(&self, root: &Path, sink: RawEventSink) -> Result<Box<dyn NativeWatch>>;
}

impl fmt::Debug for dyn NativeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeBackend({})", self.name())
    }
}

/// Selects the backend variant configured for this process.
pub fn backend_for(config: &WatcherConfig) -> Arc<dyn NativeBackend> {
    Arc::new(NotifyBackend::new(config.backend, config.native_poll_interval()))
}

/// `notify`-based backend.
#[derive(Debug, Clone)]
pub struct NotifyBackend {
    kind: BackendKind,
    poll_interval: Duration,
}

impl NotifyBackend {
    pub fn new(kind: BackendKind, poll_interval: Duration) -> Self {
        Self {
            kind,
            poll_interval,
        }
    }
}

impl NativeBackend for NotifyBackend {
    fn name(&self) -> &'static str {
        match self.kind {
            BackendKind::Recommended => "notify-recommended",
            BackendKind::Poll => "notify-poll",
        }
    }

    fn start(&self, root: &Path, sink: RawEventSink) -> Result<Box<dyn NativeWatch>> {
        let callback_root = root.to_path_buf();
        let handler = move |event_result: notify::Result<Event>| match event_result {
            Ok(event) => {
                sink.send_batch(translate_event(&callback_root, event));
            }
            Err(error) => {
                sink.send_fatal(error.to_string());
            }
        };

        let create_error = |error: notify::Error| {
            WatcherError::Native(format!(
                "failed to create filesystem watcher for {}: {error}",
                root.display()
            ))
        };

        match self.kind {
            BackendKind::Recommended => {
                let watcher = RecommendedWatcher::new(handler, notify::Config::default())
                    .map_err(create_error)?;
                Ok(Box::new(NotifyWatch::attach(watcher, root)?))
            }
            BackendKind::Poll => {
                let config = notify::Config::default().with_poll_interval(self.poll_interval);
                let watcher = PollWatcher::new(handler, config).map_err(create_error)?;
                Ok(Box::new(NotifyWatch::attach(watcher, root)?))
            }
        }
    }
}

struct NotifyWatch<W: Watcher + Send> {
    watcher: Option<W>,
    root: PathBuf,
}

impl<W: Watcher + Send> NotifyWatch<W> {
    fn attach(mut watcher: W, root: &Path) -> Result<Self> {
        let recursive_mode = if root.is_dir() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root, recursive_mode).map_err(|error| {
            WatcherError::Native(format!("failed to watch {}: {error}", root.display()))
        })?;
        Ok(Self {
            watcher: Some(watcher),
            root: root.to_path_buf(),
        })
    }
}

impl<W: Watcher + Send> NativeWatch for NotifyWatch<W> {
    fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            // The root may already be gone, in which case the kernel dropped the watch.
            let _ = watcher.unwatch(&self.root);
            log::info!("Stopped watching: {}", self.root.display());
        }
    }
}

impl<W: Watcher + Send> Drop for NotifyWatch<W> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Translates one `notify` event into raw watcher events.
pub fn translate_event(root: &Path, event: Event) -> Vec<RawEvent> {
    if event.need_rescan() {
        return vec![RawEvent::for_path(RawAction::Modified, root)];
    }

    let Event { kind, paths, .. } = event;
    match kind {
        EventKind::Access(_) => Vec::new(),
        EventKind::Create(_) => each_path(&paths, RawAction::Created),
        EventKind::Remove(_) => each_path(&paths, RawAction::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            vec![RawEvent::renamed(&paths[0], &paths[1])]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            each_path(&paths, RawAction::Deleted)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            each_path(&paths, RawAction::Created)
        }
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .map(|path| {
                let action = if path.exists() {
                    RawAction::Created
                } else {
                    RawAction::Deleted
                };
                RawEvent::for_path(action, path)
            })
            .collect(),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            each_path(&paths, RawAction::Modified)
        }
    }
}

fn each_path(paths: &[PathBuf], action: RawAction) -> Vec<RawEvent> {
    paths
        .iter()
        .map(|path| RawEvent::for_path(action, path))
        .collect()
}
