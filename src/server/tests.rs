use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::config::BackendKind;
use crate::watcher::NativeWatch;

/// Backend whose watches are driven by the test instead of the OS.
#[derive(Default)]
struct ScriptedBackend {
    started: Mutex<Vec<PathBuf>>,
    sinks: Mutex<Vec<(PathBuf, RawEventSink)>>,
    stopped: Arc<Mutex<Vec<PathBuf>>>,
    gate: Mutex<Option<std_mpsc::Receiver<()>>>,
    fail_start: Mutex<bool>,
}

impl ScriptedBackend {
    /// Makes the next `start` block until the returned sender fires.
    fn gate_next_start(&self) -> std_mpsc::Sender<()> {
        let (tx, rx) = std_mpsc::channel();
        *self.gate.lock() = Some(rx);
        tx
    }

    fn started(&self) -> Vec<PathBuf> {
        self.started.lock().clone()
    }

    fn stopped(&self) -> Vec<PathBuf> {
        self.stopped.lock().clone()
    }

    fn emit(&self, root: &Path, events: Vec<RawEvent>) -> bool {
        self.sink_for(root)
            .is_some_and(|sink| sink.send_batch(events))
    }

    fn fail(&self, root: &Path, message: &str) -> bool {
        self.sink_for(root)
            .is_some_and(|sink| sink.send_fatal(message))
    }

    fn sink_for(&self, root: &Path) -> Option<RawEventSink> {
        self.sinks
            .lock()
            .iter()
            .rev()
            .find(|(path, _)| path == root)
            .map(|(_, sink)| sink.clone())
    }
}

impl NativeBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn start(&self, root: &Path, sink: RawEventSink) -> Result<Box<dyn NativeWatch>> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if *self.fail_start.lock() {
            return Err(WatcherError::Native("no watch descriptors left".to_string()));
        }
        self.started.lock().push(root.to_path_buf());
        self.sinks.lock().push((root.to_path_buf(), sink));
        Ok(Box::new(ScriptedWatch {
            root: Some(root.to_path_buf()),
            stopped: self.stopped.clone(),
        }))
    }
}

struct ScriptedWatch {
    root: Option<PathBuf>,
    stopped: Arc<Mutex<Vec<PathBuf>>>,
}

impl NativeWatch for ScriptedWatch {
    fn stop(&mut self) {
        if let Some(root) = self.root.take() {
            self.stopped.lock().push(root);
        }
    }
}

fn test_config() -> WatcherConfig {
    WatcherConfig {
        debounce_ms: 20,
        poll_interval_ms: 10,
        ..WatcherConfig::default()
    }
}

fn scripted_server() -> (FileWatcherServer, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::default());
    let server = FileWatcherServer::with_backend(test_config(), backend.clone()).expect("server");
    (server, backend)
}

fn canonical_tempdir() -> (TempDir, PathBuf) {
    let temp = TempDir::new().expect("tempdir");
    let root = fs::canonicalize(temp.path()).expect("canonicalize");
    (temp, root)
}

fn uri(path: &Path) -> String {
    path_to_uri(path)
}

fn raw(action: RawAction, path: &Path) -> RawEvent {
    RawEvent::for_path(action, path)
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn next_batch(rx: &mut mpsc::UnboundedReceiver<DidFilesChangedParams>) -> Vec<ChangeEvent> {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for a batch")
        .expect("client channel closed")
        .changes
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<DidFilesChangedParams>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "unexpected delivery");
}

async fn active_watch(
    server: &FileWatcherServer,
    backend: &ScriptedBackend,
    root: &Path,
    options: WatchOptions,
) -> WatchId {
    let id = server
        .watch_file_changes(&uri(root), options)
        .await
        .expect("watch");
    eventually("native start", || {
        server.watch_state(id) == Some(WatchState::Active) && backend.started().contains(&root.to_path_buf())
    })
    .await;
    id
}

#[tokio::test]
async fn atomic_save_surfaces_as_single_update() {
    let (server, backend) = scripted_server();
    let mut rx = server.subscribe();
    let (_temp, root) = canonical_tempdir();
    let file = root.join("doc.txt");
    fs::write(&file, b"v2").expect("write");

    active_watch(&server, &backend, &root, WatchOptions::default()).await;
    assert!(backend.emit(
        &root,
        vec![raw(RawAction::Deleted, &file), raw(RawAction::Created, &file)],
    ));

    let changes = next_batch(&mut rx).await;
    assert_eq!(changes, vec![ChangeEvent::new(uri(&file), ChangeType::Updated)]);
}

#[tokio::test]
async fn transient_file_is_never_delivered() {
    let (server, backend) = scripted_server();
    let mut rx = server.subscribe();
    let (_temp, root) = canonical_tempdir();
    let transient = root.join("transient.swp");

    active_watch(&server, &backend, &root, WatchOptions::default()).await;
    backend.emit(
        &root,
        vec![raw(RawAction::Created, &transient), raw(RawAction::Deleted, &transient)],
    );

    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn rename_is_delete_then_add() {
    let (server, backend) = scripted_server();
    let mut rx = server.subscribe();
    let (_temp, root) = canonical_tempdir();
    let old = root.join("old.txt");
    let new = root.join("new.txt");
    fs::write(&new, b"moved").expect("write");

    active_watch(&server, &backend, &root, WatchOptions::default()).await;
    backend.emit(&root, vec![RawEvent::renamed(&old, &new)]);

    let changes = next_batch(&mut rx).await;
    assert_eq!(
        changes,
        vec![
            ChangeEvent::new(uri(&old), ChangeType::Deleted),
            ChangeEvent::new(uri(&new), ChangeType::Added),
        ]
    );
    assert_eq!(changes[0].resolution, crate::types::Resolution::ParentCanonical);
    assert_eq!(changes[1].resolution, crate::types::Resolution::Canonical);
}

#[tokio::test]
async fn burst_collapses_to_last_write_per_uri() {
    let (server, backend) = scripted_server();
    let mut rx = server.subscribe();
    let (_temp, root) = canonical_tempdir();
    let a = root.join("a.txt");
    let b = root.join("b.txt");

    active_watch(&server, &backend, &root, WatchOptions::default()).await;
    backend.emit(&root, vec![raw(RawAction::Created, &a)]);
    backend.emit(&root, vec![raw(RawAction::Modified, &a), raw(RawAction::Created, &b)]);
    backend.emit(&root, vec![raw(RawAction::Deleted, &b)]);

    let changes = next_batch(&mut rx).await;
    assert_eq!(changes.len(), 2);
    assert!(changes.contains(&ChangeEvent::new(uri(&a), ChangeType::Updated)));
    assert!(changes.contains(&ChangeEvent::new(uri(&b), ChangeType::Deleted)));
}

#[tokio::test]
async fn ignored_paths_never_reach_the_client() {
    let (server, backend) = scripted_server();
    let mut rx = server.subscribe();
    let (_temp, root) = canonical_tempdir();
    let tmp = root.join("foo.tmp");
    let nested_tmp = root.join("sub").join("bar.tmp");
    let kept = root.join("foo.txt");

    let id = active_watch(&server, &backend, &root, WatchOptions::ignoring(["**/*.tmp"])).await;
    assert!(server.should_ignore(id, &tmp));
    assert!(!server.should_ignore(id, &kept));

    backend.emit(
        &root,
        vec![
            raw(RawAction::Created, &tmp),
            raw(RawAction::Modified, &nested_tmp),
            raw(RawAction::Created, &kept),
        ],
    );

    let changes = next_batch(&mut rx).await;
    assert_eq!(changes, vec![ChangeEvent::new(uri(&kept), ChangeType::Added)]);
}

#[tokio::test]
async fn nested_request_reuses_ancestor_watch() {
    let (server, backend) = scripted_server();
    let (_temp, root) = canonical_tempdir();
    let nested = root.join("b").join("c");
    fs::create_dir_all(&nested).expect("mkdir");
    let parent = root.join("b");

    let first = active_watch(&server, &backend, &parent, WatchOptions::default()).await;
    let second = server
        .watch_file_changes(&uri(&nested), WatchOptions::ignoring(["**/*.log"]))
        .await
        .expect("nested watch");

    assert_eq!(first, second);
    assert_eq!(backend.started(), vec![parent.clone()]);
    assert!(!server.should_ignore(first, &nested.join("x.log")));

    let sibling = root.join("bc");
    fs::create_dir(&sibling).expect("mkdir sibling");
    let third = server
        .watch_file_changes(&uri(&sibling), WatchOptions::default())
        .await
        .expect("sibling watch");
    assert_ne!(third, first, "prefix match compares path components");
}

#[tokio::test]
async fn symlinked_root_dedups_against_target() {
    let (server, backend) = scripted_server();
    let (_temp, root) = canonical_tempdir();
    let target = root.join("target");
    fs::create_dir(&target).expect("mkdir");

    let id = active_watch(&server, &backend, &target, WatchOptions::default()).await;

    #[cfg(unix)]
    {
        let link = root.join("link");
        std::os::unix::fs::symlink(&target, &link).expect("symlink");
        let via_link = server
            .watch_file_changes(&uri(&link), WatchOptions::default())
            .await
            .expect("watch via link");
        assert_eq!(via_link, id);
    }
    assert_eq!(server.watched_roots(), vec![(id, target)]);
}

#[tokio::test]
async fn ids_are_monotonic_and_never_reused() {
    let (server, backend) = scripted_server();
    let (_temp, root) = canonical_tempdir();
    let a = root.join("a");
    let b = root.join("b");
    fs::create_dir(&a).expect("mkdir a");
    fs::create_dir(&b).expect("mkdir b");

    let first = active_watch(&server, &backend, &a, WatchOptions::default()).await;
    server.unwatch_file_changes(first);
    let second = active_watch(&server, &backend, &b, WatchOptions::default()).await;
    let third = active_watch(&server, &backend, &a, WatchOptions::default()).await;

    assert_eq!(first, WatchId(1));
    assert_eq!(second, WatchId(2));
    assert_eq!(third, WatchId(3));
    assert_eq!(server.watch_state(first), Some(WatchState::Disposed));
    assert_eq!(server.watch_state(WatchId(99)), None);
}

#[tokio::test]
async fn missing_root_is_polled_then_watched() {
    let (server, backend) = scripted_server();
    let mut rx = server.subscribe();
    let (_temp, base) = canonical_tempdir();
    let missing = base.join("missing");

    let id = server
        .watch_file_changes(&uri(&missing), WatchOptions::default())
        .await
        .expect("watch");
    assert_eq!(server.watch_state(id), Some(WatchState::Polling));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(backend.started().is_empty());

    fs::create_dir(&missing).expect("mkdir");
    let changes = next_batch(&mut rx).await;
    assert_eq!(changes, vec![ChangeEvent::new(uri(&missing), ChangeType::Added)]);

    eventually("native start after creation", || {
        server.watch_state(id) == Some(WatchState::Active)
    })
    .await;
    assert_eq!(backend.started(), vec![missing.clone()]);

    let child = missing.join("child.txt");
    backend.emit(&missing, vec![raw(RawAction::Created, &child)]);
    let changes = next_batch(&mut rx).await;
    assert_eq!(changes, vec![ChangeEvent::new(uri(&child), ChangeType::Added)]);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn unwatch_while_polling_never_starts_native_watch() {
    let (server, backend) = scripted_server();
    let mut rx = server.subscribe();
    let (_temp, base) = canonical_tempdir();
    let missing = base.join("later");

    let id = server
        .watch_file_changes(&uri(&missing), WatchOptions::default())
        .await
        .expect("watch");
    server.unwatch_file_changes(id);
    fs::create_dir(&missing).expect("mkdir");

    assert_quiet(&mut rx).await;
    assert!(backend.started().is_empty());
    assert_eq!(server.watch_state(id), Some(WatchState::Disposed));
}

#[tokio::test]
async fn unwatch_during_startup_stops_native_watch_once_started() {
    let (server, backend) = scripted_server();
    let mut rx = server.subscribe();
    let (_temp, root) = canonical_tempdir();
    let release = backend.gate_next_start();

    let id = server
        .watch_file_changes(&uri(&root), WatchOptions::default())
        .await
        .expect("watch");
    server.unwatch_file_changes(id);
    release.send(()).expect("release startup");

    eventually("late native stop", || backend.stopped() == vec![root.clone()]).await;
    assert!(
        !backend.emit(&root, vec![raw(RawAction::Created, &root.join("a"))]),
        "event channel must be closed"
    );
    assert_quiet(&mut rx).await;
    assert_eq!(server.watch_state(id), Some(WatchState::Disposed));
}

#[tokio::test]
async fn native_failure_disposes_only_that_watch() {
    let (server, backend) = scripted_server();
    let mut rx = server.subscribe();
    let (_temp, base) = canonical_tempdir();
    let failing = base.join("failing");
    let healthy = base.join("healthy");
    fs::create_dir(&failing).expect("mkdir");
    fs::create_dir(&healthy).expect("mkdir");

    let failing_id = active_watch(&server, &backend, &failing, WatchOptions::default()).await;
    let healthy_id = active_watch(&server, &backend, &healthy, WatchOptions::default()).await;

    assert!(backend.fail(&failing, "inotify watch limit reached"));
    eventually("failing watch disposed", || {
        server.watch_state(failing_id) == Some(WatchState::Disposed)
    })
    .await;
    assert_eq!(backend.stopped(), vec![failing.clone()]);

    let file = healthy.join("still.txt");
    backend.emit(&healthy, vec![raw(RawAction::Created, &file)]);
    let changes = next_batch(&mut rx).await;
    assert_eq!(changes, vec![ChangeEvent::new(uri(&file), ChangeType::Added)]);
    assert_eq!(server.watch_state(healthy_id), Some(WatchState::Active));

    // The failed root can be watched again under a fresh id.
    let again = active_watch(&server, &backend, &failing, WatchOptions::default()).await;
    assert_ne!(again, failing_id);
}

#[tokio::test]
async fn startup_failure_disposes_the_watch() {
    let (server, backend) = scripted_server();
    let (_temp, root) = canonical_tempdir();
    *backend.fail_start.lock() = true;

    let id = server
        .watch_file_changes(&uri(&root), WatchOptions::default())
        .await
        .expect("request itself succeeds");
    eventually("disposed after failed start", || {
        server.watch_state(id) == Some(WatchState::Disposed)
    })
    .await;
    assert!(server.watched_roots().is_empty());
}

#[tokio::test]
async fn unwatch_is_idempotent() {
    let (server, backend) = scripted_server();
    let (_temp, root) = canonical_tempdir();
    let id = active_watch(&server, &backend, &root, WatchOptions::default()).await;

    server.unwatch_file_changes(id);
    server.unwatch_file_changes(id);
    server.unwatch_file_changes(WatchId(42));

    assert_eq!(backend.stopped(), vec![root]);
    assert!(!server.should_ignore(id, Path::new("/anything")));
}

#[tokio::test]
async fn dispose_releases_everything_and_detaches_client() {
    let (server, backend) = scripted_server();
    let mut rx = server.subscribe();
    let (_temp, base) = canonical_tempdir();
    let live = base.join("live");
    let polled = base.join("polled");
    fs::create_dir(&live).expect("mkdir");

    active_watch(&server, &backend, &live, WatchOptions::default()).await;
    server
        .watch_file_changes(&uri(&polled), WatchOptions::default())
        .await
        .expect("polled watch");

    server.dispose();
    server.dispose();

    assert!(server.is_disposed());
    assert_eq!(backend.stopped(), vec![live.clone()]);
    assert!(server.watched_roots().is_empty());
    assert!(rx.recv().await.is_none(), "client is detached");

    let (tx, _late) = mpsc::unbounded_channel();
    server.set_client(Some(Arc::new(tx)));
    assert!(matches!(
        server
            .watch_file_changes(&uri(&live), WatchOptions::default())
            .await,
        Err(WatcherError::Disposed)
    ));

    fs::create_dir(&polled).expect("mkdir polled");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.started(), vec![live]);
}

#[tokio::test]
async fn invalid_uri_is_a_request_error() {
    let (server, _backend) = scripted_server();
    let result = server
        .watch_file_changes("ftp://host/dir", WatchOptions::default())
        .await;
    assert!(matches!(result, Err(WatcherError::InvalidUri(_))));
    assert!(server.watched_roots().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notify_backend_reports_real_changes() {
    assert_real_changes_delivered(test_config()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poll_backend_reports_real_changes() {
    let config = WatcherConfig {
        backend: BackendKind::Poll,
        native_poll_interval_ms: 50,
        ..test_config()
    };
    assert_eq!(backend_for(&config).name(), "notify-poll");
    assert_real_changes_delivered(config).await;
}

async fn assert_real_changes_delivered(config: WatcherConfig) {
    let server = FileWatcherServer::new(config).expect("server");
    let mut rx = server.subscribe();
    let (_temp, root) = canonical_tempdir();

    let id = server
        .watch_file_changes(&uri(&root), WatchOptions::ignoring(["**/*.tmp"]))
        .await
        .expect("watch");
    eventually("notify watch active", || {
        server.watch_state(id) == Some(WatchState::Active)
    })
    .await;

    fs::write(root.join("scratch.tmp"), b"x").expect("write tmp");
    let file = root.join("hello.txt");
    fs::write(&file, b"hello").expect("write");

    let expected = uri(&file);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    while tokio::time::Instant::now() < deadline {
        match timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Some(batch)) => seen.extend(batch.changes),
            Ok(None) => break,
            Err(_) if seen.iter().any(|c| c.uri == expected) => break,
            Err(_) => {}
        }
    }

    assert!(
        seen.iter().any(|change| change.uri == expected),
        "expected a change for {expected}, saw {seen:?}"
    );
    assert!(seen.iter().all(|change| !change.uri.ends_with(".tmp")));

    server.unwatch_file_changes(id);
    assert_eq!(server.watch_state(id), Some(WatchState::Disposed));
}
