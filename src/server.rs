//! FileWatcherServer - watch registry and public API.
//!
//! The registry is the only place handle lifecycle changes. It is guarded by
//! a single mutex because requests, notify callbacks (via pump tasks) and poll
//! tasks all run on different threads. The lock is never held across an
//! `.await`, while running dispose actions, or while calling the client.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use fnv::FnvHashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::WatcherConfig;
use crate::dispatch::{Dispatcher, FileSystemWatcherClient};
use crate::dispose::DisposeChain;
use crate::error::{Result, WatcherError};
use crate::resolve::{
    path_in_scope, path_to_uri, resolve_entry, resolve_path, uri_to_path, ResolvedPath,
};
use crate::types::{
    ChangeEvent, ChangeType, DidFilesChangedParams, RawAction, RawEvent, WatchId, WatchOptions,
    WatchState,
};
use crate::watcher::{
    backend_for, spawn_existence_poll, trim_change_events, IgnoreFilter, NativeBackend,
    NativeSignal, RawEventSink,
};

/// A registered watch root.
struct WatchHandle {
    root: PathBuf,
    canonical_path: PathBuf,
    state: WatchState,
    disposer: Arc<DisposeChain>,
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("root", &self.root)
            .field("canonical_path", &self.canonical_path)
            .field("state", &self.state.as_str())
            .finish()
    }
}

#[derive(Debug)]
struct Registry {
    next_id: u32,
    watchers: BTreeMap<WatchId, WatchHandle>,
    ignore: FnvHashMap<WatchId, IgnoreFilter>,
    disposed: bool,
}

impl Registry {
    fn new() -> Self {
        Self {
            next_id: 1,
            watchers: BTreeMap::new(),
            ignore: FnvHashMap::default(),
            disposed: false,
        }
    }

    fn allocate_id(&mut self) -> WatchId {
        let id = WatchId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Returns the live watch whose canonical root covers `canonical_path`.
    fn covering_watch(&self, canonical_path: &Path) -> Option<WatchId> {
        self.watchers
            .iter()
            .find(|(_, handle)| path_in_scope(&handle.canonical_path, canonical_path))
            .map(|(id, _)| *id)
    }
}

struct ServerShared {
    config: WatcherConfig,
    backend: Arc<dyn NativeBackend>,
    dispatcher: Dispatcher,
    registry: Mutex<Registry>,
}

/// Watches directory roots and delivers debounced change batches to one client.
pub struct FileWatcherServer {
    shared: Arc<ServerShared>,
}

impl fmt::Debug for FileWatcherServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWatcherServer")
            .field("config", &self.shared.config)
            .field("backend", &self.shared.backend)
            .field("registry", &*self.shared.registry.lock())
            .field("dispatcher", &self.shared.dispatcher)
            .finish()
    }
}

impl FileWatcherServer {
    /// Creates a server backed by the native primitive selected in `config`.
    pub fn new(config: WatcherConfig) -> Result<Self> {
        let backend = backend_for(&config);
        Self::with_backend(config, backend)
    }

    /// Creates a server with an explicit native backend.
    pub fn with_backend(config: WatcherConfig, backend: Arc<dyn NativeBackend>) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(config.debounce());
        Ok(Self {
            shared: Arc::new(ServerShared {
                config,
                backend,
                dispatcher,
                registry: Mutex::new(Registry::new()),
            }),
        })
    }

    /// Starts watching `root_uri` recursively and returns its watch id.
    ///
    /// If an existing watch already covers the canonical root, its id is
    /// returned and `options` are discarded. Roots that do not exist yet are
    /// polled until they appear.
    pub async fn watch_file_changes(&self, root_uri: &str, options: WatchOptions) -> Result<WatchId> {
        let base_path = uri_to_path(root_uri)?;
        let canonical_path = resolve_path(&base_path).path;
        let exists = tokio::fs::try_exists(&base_path).await.unwrap_or(false);

        let shared = &self.shared;
        let (id, disposer) = {
            let mut registry = shared.registry.lock();
            if registry.disposed {
                return Err(WatcherError::Disposed);
            }
            if let Some(existing) = registry.covering_watch(&canonical_path) {
                log::debug!(
                    "reusing watch {existing} for {}",
                    canonical_path.display()
                );
                return Ok(existing);
            }

            let id = registry.allocate_id();
            log::debug!("Starting watching: {}", base_path.display());
            let disposer = Arc::new(DisposeChain::new());
            let weak = Arc::downgrade(shared);
            disposer.push("registry entry", move || {
                if let Some(shared) = weak.upgrade() {
                    shared.registry.lock().watchers.remove(&id);
                }
            });
            registry.watchers.insert(
                id,
                WatchHandle {
                    root: base_path.clone(),
                    canonical_path,
                    state: WatchState::Requested,
                    disposer: disposer.clone(),
                },
            );
            (id, disposer)
        };

        if exists {
            ServerShared::spawn_start(shared, id, base_path, options, disposer);
        } else {
            shared.set_state(id, WatchState::Polling);
            let weak = Arc::downgrade(shared);
            let poll_disposer = disposer.clone();
            let poll_root = base_path.clone();
            let poll = spawn_existence_poll(base_path, shared.config.poll_interval(), move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if poll_disposer.is_disposed() {
                    return;
                }
                shared.push_change(id, resolve_path(&poll_root), ChangeType::Added);
                ServerShared::spawn_start(&shared, id, poll_root, options, poll_disposer);
            });
            disposer.push("existence poll", move || poll.abort());
        }

        Ok(id)
    }

    /// Stops a watch. Unknown or already disposed ids are ignored.
    pub fn unwatch_file_changes(&self, id: WatchId) {
        self.shared.unwatch(id);
    }

    /// Registers the client receiving change batches, replacing any previous
    /// one. Registering on a disposed server is a no-op.
    pub fn set_client(&self, client: Option<Arc<dyn FileSystemWatcherClient>>) {
        self.shared.dispatcher.set_client(client);
    }

    /// Convenience for clients that consume batches from a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DidFilesChangedParams> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.set_client(Some(Arc::new(tx)));
        rx
    }

    /// Whether events at `path` are dropped for watch `id`.
    pub fn should_ignore(&self, id: WatchId, path: &Path) -> bool {
        self.shared.should_ignore(id, path)
    }

    /// Current lifecycle state. Ids that were issued and later released
    /// report [`WatchState::Disposed`]; ids never issued report `None`.
    pub fn watch_state(&self, id: WatchId) -> Option<WatchState> {
        let registry = self.shared.registry.lock();
        match registry.watchers.get(&id) {
            Some(handle) => Some(handle.state),
            None if id.0 > 0 && id.0 < registry.next_id => Some(WatchState::Disposed),
            None => None,
        }
    }

    /// Live watches and their canonical roots, in id order.
    pub fn watched_roots(&self) -> Vec<(WatchId, PathBuf)> {
        self.shared
            .registry
            .lock()
            .watchers
            .iter()
            .map(|(id, handle)| (*id, handle.canonical_path.clone()))
            .collect()
    }

    /// Disposes every outstanding watch and detaches the client.
    pub fn dispose(&self) {
        let handles = {
            let mut registry = self.shared.registry.lock();
            if registry.disposed {
                return;
            }
            registry.disposed = true;
            std::mem::take(&mut registry.watchers)
        };
        for (id, handle) in handles {
            log::debug!("disposing watch {id}: {}", handle.root.display());
            handle.disposer.dispose();
        }
        self.shared.registry.lock().ignore.clear();
        self.shared.dispatcher.close();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.registry.lock().disposed
    }
}

impl Drop for FileWatcherServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl ServerShared {
    fn set_state(&self, id: WatchId, state: WatchState) {
        if let Some(handle) = self.registry.lock().watchers.get_mut(&id) {
            log::trace!("watch {id}: {} -> {}", handle.state.as_str(), state.as_str());
            handle.state = state;
        }
    }

    fn unwatch(&self, id: WatchId) {
        let handle = self.registry.lock().watchers.remove(&id);
        if let Some(handle) = handle {
            log::debug!("Stopping watch {id}: {}", handle.root.display());
            handle.disposer.dispose();
        }
    }

    fn should_ignore(&self, id: WatchId, path: &Path) -> bool {
        self.registry
            .lock()
            .ignore
            .get(&id)
            .is_some_and(|filter| filter.is_ignored(path))
    }

    fn spawn_start(
        shared: &Arc<Self>,
        id: WatchId,
        base_path: PathBuf,
        options: WatchOptions,
        disposer: Arc<DisposeChain>,
    ) {
        let shared = shared.clone();
        tokio::spawn(async move {
            shared.start_native(id, base_path, options, disposer).await;
        });
    }

    async fn start_native(
        self: Arc<Self>,
        id: WatchId,
        base_path: PathBuf,
        options: WatchOptions,
        disposer: Arc<DisposeChain>,
    ) {
        if disposer.is_disposed() {
            return;
        }
        if !options.ignored.is_empty() {
            log::debug!("Files ignored for watching {:?}", options.ignored);
        }

        let root = resolve_path(&base_path).path;
        let (sink, rx) = RawEventSink::channel();
        let backend = self.backend.clone();
        let start_root = root.clone();
        let started = tokio::task::spawn_blocking(move || backend.start(&start_root, sink)).await;

        let mut native = match started {
            Ok(Ok(native)) => native,
            Ok(Err(error)) => {
                log::warn!("Failed to watch \"{}\": {error}", base_path.display());
                self.unwatch(id);
                return;
            }
            Err(error) => {
                log::warn!(
                    "Failed to watch \"{}\": startup task failed: {error}",
                    base_path.display()
                );
                self.unwatch(id);
                return;
            }
        };

        if disposer.is_disposed() {
            log::debug!("Stopping watching: {}", root.display());
            native.stop();
            return;
        }

        self.registry
            .lock()
            .ignore
            .insert(id, IgnoreFilter::compile(&options.ignored));
        let pump = tokio::spawn(pump_events(Arc::downgrade(&self), id, base_path, rx));
        let pump_abort = pump.abort_handle();

        let weak = Arc::downgrade(&self);
        let native_root = root.clone();
        disposer.push("native watch", move || {
            if let Some(shared) = weak.upgrade() {
                shared.registry.lock().ignore.remove(&id);
            }
            log::debug!("Stopping watching: {}", native_root.display());
            native.stop();
            pump_abort.abort();
        });

        self.set_state(id, WatchState::Active);
        log::info!("Started watching: {}", root.display());
    }

    /// Trims one raw batch and pushes the surviving changes.
    fn handle_raw_batch(&self, id: WatchId, events: Vec<RawEvent>) {
        for event in trim_change_events(events) {
            let RawEvent {
                action,
                directory,
                file,
                old_file,
                new_file,
            } = event;
            match action {
                RawAction::Renamed => {
                    if let Some(old_file) = old_file {
                        self.push_change(id, resolve_entry(&directory, &old_file), ChangeType::Deleted);
                    }
                    if let Some(new_file) = new_file {
                        self.push_change(id, resolve_entry(&directory, &new_file), ChangeType::Added);
                    }
                }
                RawAction::Created | RawAction::Deleted | RawAction::Modified => {
                    let Some(file) = file else {
                        continue;
                    };
                    let change_type = match action {
                        RawAction::Created => ChangeType::Added,
                        RawAction::Deleted => ChangeType::Deleted,
                        _ => ChangeType::Updated,
                    };
                    self.push_change(id, resolve_entry(&directory, &file), change_type);
                }
            }
        }
    }

    fn push_change(&self, id: WatchId, resolved: ResolvedPath, change_type: ChangeType) {
        if self.should_ignore(id, &resolved.path) {
            log::trace!("Ignored: {id}:{}", resolved.path.display());
            return;
        }
        log::debug!("{}: {id}:{}", change_type.as_str(), resolved.path.display());
        let mut change = ChangeEvent::new(path_to_uri(&resolved.path), change_type);
        change.resolution = resolved.resolution;
        self.dispatcher.push(change);
    }
}

/// Drains native signals for one watch. Signals already queued when a batch
/// arrives are folded into it before trimming.
async fn pump_events(
    shared: Weak<ServerShared>,
    id: WatchId,
    root: PathBuf,
    mut rx: mpsc::UnboundedReceiver<NativeSignal>,
) {
    while let Some(signal) = rx.recv().await {
        let mut batch = Vec::new();
        let mut fatal = None;
        let mut collect = |signal: NativeSignal| match signal {
            NativeSignal::Batch(events) => batch.extend(events),
            NativeSignal::Fatal(message) => {
                fatal.get_or_insert(message);
            }
        };
        collect(signal);
        while let Ok(next) = rx.try_recv() {
            collect(next);
        }

        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !batch.is_empty() {
            shared.handle_raw_batch(id, batch);
        }
        if let Some(message) = fatal {
            log::warn!("Failed to watch \"{}\": {message}", root.display());
            shared.unwatch(id);
            return;
        }
    }
}

#[cfg(test)]
mod tests;
