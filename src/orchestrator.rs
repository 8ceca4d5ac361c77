//! Session orchestrator: the façade over registry, backends, and pumps.
//!
//! `start_*` returns as soon as the registry has reserved a slot; backend
//! acquisition happens on a background task that reports its outcome
//! through the registry and the output sink, never to the original caller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::TermRelayError;
use crate::event::{OutputEvent, OutputSink};
use crate::process;
use crate::pump;
use crate::remote::{ConnectionInfo, RemoteShellHandle, RemoteTransport};
use crate::session::{
    BackendHandle, SessionId, SessionInfo, SessionKind, SessionRegistry, SessionStatus,
    TakeOutcome,
};
use crate::Result;

/// Queue depth for caller input per session.
const INPUT_QUEUE: usize = 64;

/// Initial geometry for remote interactive shells.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Creates, multiplexes, and tears down terminal sessions.
pub struct SessionOrchestrator {
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn OutputSink>,
    transport: Arc<dyn RemoteTransport>,
    config: Config,
}

impl SessionOrchestrator {
    pub fn new(
        config: Config,
        sink: Arc<dyn OutputSink>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new(
            config.session.max_sessions_per_owner,
            config.session_timeout(),
        ));
        Arc::new(Self {
            registry,
            sink,
            transport,
            config,
        })
    }

    /// The registry, for status queries by embedders.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Start a local shell or script session.
    ///
    /// Returns the session ID immediately; spawning and pump wiring happen
    /// asynchronously. Script paths are traversal-checked before a slot is
    /// reserved, so a rejected path allocates nothing.
    pub fn start_local_session(
        self: &Arc<Self>,
        owner: &str,
        kind: SessionKind,
        script_path: Option<String>,
        working_dir: Option<PathBuf>,
    ) -> Result<SessionId> {
        match kind {
            SessionKind::LocalShell => {}
            SessionKind::LocalScript => {
                let script = script_path.as_deref().ok_or_else(|| {
                    TermRelayError::SpawnFailed("script session requires a script path".into())
                })?;
                process::resolve_script(&self.config.session.script_base_dir, script)?;
            }
            SessionKind::RemoteShell => {
                return Err(TermRelayError::SpawnFailed(
                    "remote sessions are started via start_remote_session".into(),
                ))
            }
        }

        self.sweep_once();
        let id = self
            .registry
            .create(owner, kind, script_path.clone(), working_dir.clone())?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.connect_local(id, kind, script_path, working_dir).await;
        });

        Ok(id)
    }

    /// Start a remote interactive shell session over SSH.
    pub fn start_remote_session(
        self: &Arc<Self>,
        owner: &str,
        info: ConnectionInfo,
    ) -> Result<SessionId> {
        self.sweep_once();
        let id = self
            .registry
            .create(owner, SessionKind::RemoteShell, None, None)?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.connect_remote(id, info).await;
        });

        Ok(id)
    }

    async fn connect_local(
        &self,
        id: SessionId,
        kind: SessionKind,
        script_path: Option<String>,
        working_dir: Option<PathBuf>,
    ) {
        if !self.begin_connecting(&id) {
            return;
        }

        let spawned = match kind {
            SessionKind::LocalScript => {
                // Checked at submission; a failure here means no slot leak,
                // just a connect error like any other.
                match script_path.as_deref() {
                    Some(script) => process::spawn_script(
                        &self.config.session.script_base_dir,
                        script,
                        working_dir.as_deref(),
                    ),
                    None => Err(TermRelayError::SpawnFailed("missing script path".into())),
                }
            }
            _ => process::spawn_shell(working_dir.as_deref()),
        };

        let mut handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_connect(&id, e);
                return;
            }
        };

        let (stdin, stdout, stderr) = handle.take_streams();
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (term_tx, term_rx) = mpsc::channel(1);

        let mut output_pumps = Vec::new();
        if let Some(stdout) = stdout {
            output_pumps.push(pump::pump_output(stdout, id, Arc::clone(&self.sink), false));
        }
        if let Some(stderr) = stderr {
            output_pumps.push(pump::pump_output(stderr, id, Arc::clone(&self.sink), true));
        }
        if let Some(stdin) = stdin {
            pump::run_input_writer(stdin, id, input_rx);
        }
        pump::watch_local_exit(
            handle,
            term_rx,
            output_pumps,
            id,
            Arc::clone(&self.sink),
            Arc::clone(&self.registry),
        );

        let backend = BackendHandle::local(input_tx, term_tx);
        self.complete_connect(&id, backend).await;
    }

    async fn connect_remote(&self, id: SessionId, info: ConnectionInfo) {
        if !self.begin_connecting(&id) {
            return;
        }

        let connection = match self.transport.connect(&info).await {
            Ok(connection) => connection,
            Err(e) => {
                self.fail_connect(&id, e);
                return;
            }
        };

        let shell = match connection.open_shell(DEFAULT_COLS, DEFAULT_ROWS).await {
            Ok(shell) => shell,
            Err(e) => {
                // A half-open connection must not outlive the failure.
                connection.disconnect().await;
                self.fail_connect(&id, e);
                return;
            }
        };

        let handle = Arc::new(RemoteShellHandle::new(shell.channel, connection));
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);

        let output_pump = pump::pump_remote_output(shell.output, id, Arc::clone(&self.sink));
        pump::run_remote_input_writer(Arc::clone(&handle), id, input_rx);
        pump::watch_remote_exit(
            Arc::clone(&handle),
            output_pump,
            id,
            Arc::clone(&self.sink),
            Arc::clone(&self.registry),
        );

        let backend = BackendHandle::remote(input_tx, handle);
        self.complete_connect(&id, backend).await;
    }

    /// CAS Created -> Connecting. Returns false when the session vanished
    /// or a disconnect already won; the connect task then backs out.
    fn begin_connecting(&self, id: &SessionId) -> bool {
        match self.registry.transition(
            id,
            &[SessionStatus::Created],
            SessionStatus::Connecting,
            None,
        ) {
            Ok(()) => true,
            Err(e) => {
                debug!(session = %id, error = %e, "connect aborted before start");
                false
            }
        }
    }

    async fn complete_connect(&self, id: &SessionId, backend: BackendHandle) {
        match self.registry.attach_connected(id, backend) {
            Ok(()) => {
                info!(session = %id, "session connected");
                self.sink.publish(&id.topic(), OutputEvent::status("connected"));
            }
            Err(backend) => {
                // A disconnect raced the connect; release the fresh backend.
                warn!(session = %id, "session closed during connect, releasing backend");
                backend.release(true).await;
            }
        }
    }

    /// Record a connect/spawn failure. The caller already holds the
    /// session ID, so the failure surfaces as ERROR status plus events,
    /// never as a thrown error.
    fn fail_connect(&self, id: &SessionId, error: TermRelayError) {
        let message = error.to_string();
        warn!(session = %id, error = %message, "session connect failed");

        let recorded = self.registry.transition(
            id,
            &[SessionStatus::Connecting],
            SessionStatus::Error,
            Some(message.clone()),
        );
        if recorded.is_ok() {
            self.sink.publish(&id.topic(), OutputEvent::error(message));
            self.sink.publish(&id.topic(), OutputEvent::status("error"));
        }
    }

    /// Forward caller input to the session's backend.
    ///
    /// The activity clock is refreshed only when the input carries a
    /// command-terminating control character, not on every keystroke.
    pub async fn send_input(&self, id: &SessionId, owner: &str, data: &[u8]) -> Result<()> {
        let input = self.registry.connected_input(id, owner)?;
        pump::write(&input, data.to_vec()).await?;

        if data.contains(&b'\n') || data.contains(&b'\r') {
            let _ = self.registry.touch(id);
        }
        Ok(())
    }

    /// Propagate terminal geometry to the backend. No-op for local
    /// sessions; pipes have no geometry.
    pub async fn resize(&self, id: &SessionId, owner: &str, cols: u16, rows: u16) -> Result<()> {
        match self.registry.connected_remote(id, owner)? {
            Some(shell) => shell.channel().resize(cols, rows).await,
            None => Ok(()),
        }
    }

    /// Close a session and release its backend. Idempotent.
    ///
    /// `owner` is required (and checked) for user-initiated calls, `None`
    /// for system-initiated cleanup.
    pub async fn disconnect(&self, id: &SessionId, owner: Option<&str>) -> Result<()> {
        if let Some(owner) = owner {
            match self.registry.check_access(id, owner) {
                Ok(()) => {}
                Err(TermRelayError::SessionNotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        match self.registry.take_backend(id) {
            Ok(TakeOutcome::Taken(Some(backend))) => {
                // The exit watcher publishes the terminal status and exit
                // events once the output pumps drain.
                backend.release(false).await;
            }
            Ok(TakeOutcome::Taken(None)) => {
                // No backend ever attached (still connecting, or errored),
                // so no watcher exists to report the removal.
                self.sink
                    .publish(&id.topic(), OutputEvent::status("disconnected"));
            }
            Ok(TakeOutcome::AlreadyDisconnected) => {}
            Err(TermRelayError::SessionNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        }

        let _ = self.registry.remove(id);
        debug!(session = %id, "session disconnected");
        Ok(())
    }

    /// Read-only session snapshot.
    pub fn get_info(&self, id: &SessionId) -> Result<SessionInfo> {
        self.registry
            .get(id)?
            .ok_or_else(|| TermRelayError::SessionNotFound(id.to_string()))
    }

    /// Snapshot of one owner's sessions.
    pub fn list_sessions(&self, owner: &str) -> Result<Vec<SessionInfo>> {
        self.registry.list_by_owner(owner)
    }

    /// One expiry pass: force-close sessions past expiry or with a dead
    /// backend. Also runs opportunistically before each create.
    pub fn sweep_once(self: &Arc<Self>) {
        let swept = match self.registry.sweep_expired(Instant::now()) {
            Ok(swept) => swept,
            Err(e) => {
                warn!(error = %e, "expiry sweep failed");
                return;
            }
        };

        for (id, backend) in swept {
            info!(session = %id, "sweeping expired session");
            let sink = Arc::clone(&self.sink);
            tokio::spawn(async move {
                match backend {
                    // The exit watcher reports the terminal events.
                    Some(backend) => backend.release(true).await,
                    None => {
                        sink.publish(&id.topic(), OutputEvent::status("disconnected"))
                    }
                }
            });
        }
    }

    /// Run the periodic expiry sweep until the returned task is aborted.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The immediate first tick would sweep an empty registry.
            interval.tick().await;
            loop {
                interval.tick().await;
                this.sweep_once();
            }
        })
    }

    /// Force-disconnect every session. Called at shutdown.
    pub async fn shutdown(&self) {
        for (id, backend) in self.registry.drain() {
            match backend {
                // The exit watcher reports the terminal events.
                Some(backend) => backend.release(true).await,
                None => self
                    .sink
                    .publish(&id.topic(), OutputEvent::status("disconnected")),
            }
        }
        info!("all sessions drained");
    }
}
