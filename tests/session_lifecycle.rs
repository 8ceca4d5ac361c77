//! Session lifecycle integration tests.
//!
//! Local-backend tests drive a real `/bin/sh` and are Unix-only; remote
//! tests run against a scripted in-memory transport that echoes input and
//! honors the close-once contract.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::timeout;

use term_relay::{
    BroadcastSink, Config, ConnectionInfo, EventKind, OutputEvent, RemoteAuth, RemoteChannel,
    RemoteConnection, RemoteShell, RemoteTransport, Result, SessionKind, SessionOrchestrator,
    SessionStatus, TermRelayError,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Helpers
// ============================================================================

type EventRx = broadcast::Receiver<(String, OutputEvent)>;

async fn next_event(rx: &mut EventRx) -> (String, OutputEvent) {
    timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

/// Receive events until one on `topic` satisfies the predicate.
async fn wait_for(rx: &mut EventRx, topic: &str, pred: impl Fn(&OutputEvent) -> bool) -> OutputEvent {
    loop {
        let (t, event) = next_event(rx).await;
        if t == topic && pred(&event) {
            return event;
        }
    }
}

/// Receive the next event published on `topic`, skipping other sessions.
async fn next_on_topic(rx: &mut EventRx, topic: &str) -> OutputEvent {
    loop {
        let (t, event) = next_event(rx).await;
        if t == topic {
            return event;
        }
    }
}

/// After the exit event, nothing further may arrive for the session.
async fn assert_stream_ended(rx: &mut EventRx, topic: &str) {
    loop {
        match timeout(Duration::from_millis(250), rx.recv()).await {
            Err(_) => return,
            Ok(Ok((t, event))) => {
                assert_ne!(t, topic, "event published after exit: {:?}", event);
            }
            Ok(Err(_)) => return,
        }
    }
}

async fn wait_connected(rx: &mut EventRx, topic: &str) {
    wait_for(rx, topic, |e| {
        e.kind == EventKind::Status && e.data == "connected"
    })
    .await;
}

fn connection_info() -> ConnectionInfo {
    ConnectionInfo {
        host: "build-02.internal".into(),
        port: 22,
        username: "deploy".into(),
        auth: RemoteAuth::Password("secret".into()),
    }
}

// ============================================================================
// Scripted remote transport
// ============================================================================

/// Echoes every write back as output; closes once; reports exit code 0.
struct FakeChannel {
    out_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    closed: AtomicBool,
    close_count: AtomicUsize,
    notify: Notify,
    geometry: Mutex<(u16, u16)>,
}

impl FakeChannel {
    fn new(out_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            out_tx: Mutex::new(Some(out_tx)),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            notify: Notify::new(),
            geometry: Mutex::new((80, 24)),
        }
    }
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    async fn write(&self, data: &[u8]) -> Result<()> {
        let sender = self.out_tx.lock().unwrap().clone();
        match sender {
            Some(tx) => tx
                .send(data.to_vec())
                .await
                .map_err(|_| TermRelayError::WriteFailed),
            None => Err(TermRelayError::WriteFailed),
        }
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        *self.geometry.lock().unwrap() = (cols, rows);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_count.fetch_add(1, Ordering::SeqCst);
        // Ends output delivery so the pump sees EOF.
        self.out_tx.lock().unwrap().take();
        self.notify.notify_waiters();
    }

    async fn wait_closed(&self) -> Option<i32> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Some(0);
            }
            let notified = self.notify.notified();
            if self.closed.load(Ordering::SeqCst) {
                return Some(0);
            }
            notified.await;
        }
    }
}

struct FakeConnection {
    fail_open: bool,
    disconnects: AtomicUsize,
    channel: Mutex<Option<Arc<FakeChannel>>>,
}

#[async_trait]
impl RemoteConnection for FakeConnection {
    async fn open_shell(&self, _cols: u16, _rows: u16) -> Result<RemoteShell> {
        if self.fail_open {
            return Err(TermRelayError::ChannelOpenFailed("pty refused".into()));
        }
        let (out_tx, out_rx) = mpsc::channel(32);
        let channel = Arc::new(FakeChannel::new(out_tx));
        *self.channel.lock().unwrap() = Some(Arc::clone(&channel));
        Ok(RemoteShell {
            channel,
            output: out_rx,
        })
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeTransport {
    fail_connect: bool,
    fail_open: bool,
    last: Mutex<Option<Arc<FakeConnection>>>,
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn connect(&self, _info: &ConnectionInfo) -> Result<Arc<dyn RemoteConnection>> {
        if self.fail_connect {
            return Err(TermRelayError::ConnectionFailed("host unreachable".into()));
        }
        let connection = Arc::new(FakeConnection {
            fail_open: self.fail_open,
            disconnects: AtomicUsize::new(0),
            channel: Mutex::new(None),
        });
        *self.last.lock().unwrap() = Some(Arc::clone(&connection));
        Ok(connection)
    }
}

fn setup(
    config: Config,
    transport: Arc<FakeTransport>,
) -> (Arc<SessionOrchestrator>, Arc<BroadcastSink>) {
    let sink = Arc::new(BroadcastSink::new(1024));
    let orch = SessionOrchestrator::new(config, sink.clone(), transport as Arc<dyn RemoteTransport>);
    (orch, sink)
}

// ============================================================================
// Local sessions
// ============================================================================

#[tokio::test]
#[cfg(unix)]
async fn test_local_shell_echo_round_trip() {
    let (orch, sink) = setup(Config::default(), Arc::new(FakeTransport::default()));
    let mut events = sink.subscribe();

    let id = orch
        .start_local_session("alice", SessionKind::LocalShell, None, None)
        .unwrap();
    let topic = id.topic();

    wait_connected(&mut events, &topic).await;

    orch.send_input(&id, "alice", b"echo hello\n").await.unwrap();
    let event = wait_for(&mut events, &topic, |e| {
        e.kind == EventKind::Output && e.data.contains("hello")
    })
    .await;
    assert!(event.data.contains("hello"));

    orch.disconnect(&id, Some("alice")).await.unwrap();
    assert!(matches!(
        orch.get_info(&id),
        Err(TermRelayError::SessionNotFound(_))
    ));
}

#[tokio::test]
#[cfg(unix)]
async fn test_quota_exceeded_for_fourth_session() {
    let (orch, sink) = setup(Config::default(), Arc::new(FakeTransport::default()));
    let _events = sink.subscribe();

    let ids: Vec<_> = (0..3)
        .map(|_| {
            orch.start_local_session("alice", SessionKind::LocalShell, None, None)
                .unwrap()
        })
        .collect();

    let fourth = orch.start_local_session("alice", SessionKind::LocalShell, None, None);
    assert!(matches!(fourth, Err(TermRelayError::QuotaExceeded { .. })));

    // A different owner is unaffected.
    let bobs = orch
        .start_local_session("bob", SessionKind::LocalShell, None, None)
        .unwrap();

    for id in ids.iter().chain([&bobs]) {
        orch.disconnect(id, None).await.unwrap();
    }
}

#[tokio::test]
async fn test_path_traversal_spawns_nothing() {
    let (orch, _sink) = setup(Config::default(), Arc::new(FakeTransport::default()));

    let result = orch.start_local_session(
        "alice",
        SessionKind::LocalScript,
        Some("../../etc/passwd".into()),
        None,
    );
    assert!(matches!(
        result,
        Err(TermRelayError::PathTraversalRejected(_))
    ));
    assert!(orch.list_sessions("alice").unwrap().is_empty());
}

#[tokio::test]
#[cfg(unix)]
async fn test_access_denied_leaves_backend_untouched() {
    let (orch, sink) = setup(Config::default(), Arc::new(FakeTransport::default()));
    let mut events = sink.subscribe();

    let id = orch
        .start_local_session("alice", SessionKind::LocalShell, None, None)
        .unwrap();
    wait_connected(&mut events, &id.topic()).await;

    let result = orch.send_input(&id, "mallory", b"rm -rf /\n").await;
    assert!(matches!(result, Err(TermRelayError::AccessDenied { .. })));

    // Session still healthy for the real owner.
    assert_eq!(orch.get_info(&id).unwrap().status, SessionStatus::Connected);
    orch.send_input(&id, "alice", b"true\n").await.unwrap();

    orch.disconnect(&id, Some("alice")).await.unwrap();
}

#[tokio::test]
#[cfg(unix)]
async fn test_script_exit_propagation_and_ordering() {
    use std::io::Write;

    let base = tempfile::tempdir().unwrap();
    let script = base.path().join("steps.sh");
    let mut file = std::fs::File::create(&script).unwrap();
    writeln!(file, "#!/bin/sh\necho A\necho B\nexit 0").unwrap();
    drop(file);

    let mut config = Config::default();
    config.session.script_base_dir = base.path().to_path_buf();

    let (orch, sink) = setup(config, Arc::new(FakeTransport::default()));
    let mut events = sink.subscribe();

    let id = orch
        .start_local_session(
            "alice",
            SessionKind::LocalScript,
            Some("steps.sh".into()),
            None,
        )
        .unwrap();
    let topic = id.topic();

    // Collect everything up to and including the exit event.
    let mut trail = Vec::new();
    loop {
        let event = next_on_topic(&mut events, &topic).await;
        let done = event.kind == EventKind::Exit;
        trail.push(event);
        if done {
            break;
        }
    }

    let exit_event = trail.last().unwrap();
    assert_eq!(exit_event.exit_code, Some(0));

    // The watcher reports the terminal status right before the exit.
    let before_exit = &trail[trail.len() - 2];
    assert_eq!(before_exit.kind, EventKind::Status);
    assert_eq!(before_exit.data, "disconnected");

    let outputs: String = trail
        .iter()
        .filter(|e| e.kind == EventKind::Output)
        .map(|e| e.data.as_str())
        .collect();
    let a = outputs.find('A').expect("A in output");
    let b = outputs.find('B').expect("B in output");
    assert!(a < b, "stdout ordering must be preserved");

    // The watcher finalized the registry before publishing exit, and the
    // exit event is the last one for the session.
    assert!(matches!(
        orch.get_info(&id),
        Err(TermRelayError::SessionNotFound(_))
    ));
    assert_stream_ended(&mut events, &topic).await;
}

#[tokio::test]
#[cfg(unix)]
async fn test_expiry_sweep_removes_and_terminates() {
    let mut config = Config::default();
    config.session.timeout_minutes = 0; // expire immediately

    let (orch, sink) = setup(config, Arc::new(FakeTransport::default()));
    let mut events = sink.subscribe();

    let id = orch
        .start_local_session("alice", SessionKind::LocalShell, None, None)
        .unwrap();
    let topic = id.topic();
    wait_connected(&mut events, &topic).await;

    orch.sweep_once();

    // The shell may still flush prompt bytes while being killed; the
    // terminal pair always comes last, disconnected status then exit.
    let mut trail = Vec::new();
    loop {
        let event = next_on_topic(&mut events, &topic).await;
        let done = event.kind == EventKind::Exit;
        trail.push(event);
        if done {
            break;
        }
    }
    let n = trail.len();
    assert_eq!(trail[n - 2].kind, EventKind::Status);
    assert_eq!(trail[n - 2].data, "disconnected");
    assert_stream_ended(&mut events, &topic).await;

    assert!(matches!(
        orch.get_info(&id),
        Err(TermRelayError::SessionNotFound(_))
    ));
}

#[tokio::test]
#[cfg(unix)]
async fn test_disconnect_is_idempotent_under_repeats() {
    let (orch, sink) = setup(Config::default(), Arc::new(FakeTransport::default()));
    let mut events = sink.subscribe();

    let id = orch
        .start_local_session("alice", SessionKind::LocalShell, None, None)
        .unwrap();
    wait_connected(&mut events, &id.topic()).await;

    orch.disconnect(&id, Some("alice")).await.unwrap();
    orch.disconnect(&id, Some("alice")).await.unwrap();
    orch.disconnect(&id, None).await.unwrap();
}

#[tokio::test]
#[cfg(unix)]
async fn test_shutdown_drains_everything() {
    let (orch, sink) = setup(Config::default(), Arc::new(FakeTransport::default()));
    let mut events = sink.subscribe();

    let a = orch
        .start_local_session("alice", SessionKind::LocalShell, None, None)
        .unwrap();
    let b = orch
        .start_local_session("bob", SessionKind::LocalShell, None, None)
        .unwrap();
    wait_connected(&mut events, &a.topic()).await;
    wait_connected(&mut events, &b.topic()).await;

    orch.shutdown().await;
    assert!(orch.list_sessions("alice").unwrap().is_empty());
    assert!(orch.list_sessions("bob").unwrap().is_empty());
}

// ============================================================================
// Remote sessions
// ============================================================================

#[tokio::test]
async fn test_remote_session_round_trip() {
    let transport = Arc::new(FakeTransport::default());
    let (orch, sink) = setup(Config::default(), transport.clone());
    let mut events = sink.subscribe();

    let id = orch
        .start_remote_session("alice", connection_info())
        .unwrap();
    let topic = id.topic();
    wait_connected(&mut events, &topic).await;

    orch.send_input(&id, "alice", b"uptime\r").await.unwrap();
    let event = wait_for(&mut events, &topic, |e| {
        e.kind == EventKind::Output && e.data.contains("uptime")
    })
    .await;
    assert!(event.data.contains("uptime"));

    // Geometry propagates to the channel.
    orch.resize(&id, "alice", 132, 43).await.unwrap();
    let connection = transport.last.lock().unwrap().clone().unwrap();
    let channel = connection.channel.lock().unwrap().clone().unwrap();
    assert_eq!(*channel.geometry.lock().unwrap(), (132, 43));

    orch.disconnect(&id, Some("alice")).await.unwrap();

    // Terminal events come from the exit watcher in a fixed order:
    // disconnected status first, the exit event last.
    let status = next_on_topic(&mut events, &topic).await;
    assert_eq!(status.kind, EventKind::Status);
    assert_eq!(status.data, "disconnected");
    let exit = next_on_topic(&mut events, &topic).await;
    assert_eq!(exit.kind, EventKind::Exit);
    assert_eq!(exit.exit_code, Some(0));
    assert_stream_ended(&mut events, &topic).await;

    // Teardown ran exactly once despite watcher and disconnect racing.
    assert_eq!(channel.close_count.load(Ordering::SeqCst), 1);
    assert_eq!(connection.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remote_connect_failure_marks_error() {
    let transport = Arc::new(FakeTransport {
        fail_connect: true,
        ..Default::default()
    });
    let (orch, sink) = setup(Config::default(), transport);
    let mut events = sink.subscribe();

    let id = orch
        .start_remote_session("alice", connection_info())
        .unwrap();
    let topic = id.topic();

    wait_for(&mut events, &topic, |e| {
        e.kind == EventKind::Status && e.data == "error"
    })
    .await;

    let info = orch.get_info(&id).unwrap();
    assert_eq!(info.status, SessionStatus::Error);
    assert!(info.last_error.unwrap().contains("unreachable"));

    // An errored session has no watcher; disconnect itself reports the
    // removal, and the slot is freed.
    orch.disconnect(&id, Some("alice")).await.unwrap();
    let status = next_on_topic(&mut events, &topic).await;
    assert_eq!(status.kind, EventKind::Status);
    assert_eq!(status.data, "disconnected");
    assert!(orch.list_sessions("alice").unwrap().is_empty());
}

#[tokio::test]
async fn test_open_shell_failure_disconnects_connection() {
    let transport = Arc::new(FakeTransport {
        fail_open: true,
        ..Default::default()
    });
    let (orch, sink) = setup(Config::default(), transport.clone());
    let mut events = sink.subscribe();

    let id = orch
        .start_remote_session("alice", connection_info())
        .unwrap();
    let topic = id.topic();

    wait_for(&mut events, &topic, |e| {
        e.kind == EventKind::Status && e.data == "error"
    })
    .await;

    // The half-open connection was torn down before the error surfaced.
    let connection = transport.last.lock().unwrap().clone().unwrap();
    assert_eq!(connection.disconnects.load(Ordering::SeqCst), 1);

    let info = orch.get_info(&id).unwrap();
    assert!(info.last_error.unwrap().contains("pty refused"));
}

#[tokio::test]
async fn test_remote_channel_self_close_publishes_exit() {
    let transport = Arc::new(FakeTransport::default());
    let (orch, sink) = setup(Config::default(), transport.clone());
    let mut events = sink.subscribe();

    let id = orch
        .start_remote_session("alice", connection_info())
        .unwrap();
    let topic = id.topic();
    wait_connected(&mut events, &topic).await;

    // The remote side drops the channel.
    let connection = transport.last.lock().unwrap().clone().unwrap();
    let channel = connection.channel.lock().unwrap().clone().unwrap();
    channel.close().await;

    let status = next_on_topic(&mut events, &topic).await;
    assert_eq!(status.kind, EventKind::Status);
    assert_eq!(status.data, "disconnected");
    let exit = next_on_topic(&mut events, &topic).await;
    assert_eq!(exit.kind, EventKind::Exit);
    assert_eq!(exit.exit_code, Some(0));
    assert!(matches!(
        orch.get_info(&id),
        Err(TermRelayError::SessionNotFound(_))
    ));

    // Input after close fails cleanly.
    let result = orch.send_input(&id, "alice", b"ls\n").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_resize_is_noop_for_local_sessions() {
    // Uses a session in CONNECTED state without a real process: remote
    // transport is not involved, so spawn a shell only on Unix.
    #[cfg(unix)]
    {
        let (orch, sink) = setup(Config::default(), Arc::new(FakeTransport::default()));
        let mut events = sink.subscribe();

        let id = orch
            .start_local_session("alice", SessionKind::LocalShell, None, None)
            .unwrap();
        wait_connected(&mut events, &id.topic()).await;

        assert!(orch.resize(&id, "alice", 132, 43).await.is_ok());
        orch.disconnect(&id, Some("alice")).await.unwrap();
    }
}
