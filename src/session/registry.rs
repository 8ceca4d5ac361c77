//! Session registry: the single source of truth for session existence,
//! status, and backend ownership.
//!
//! All mutation funnels through compare-and-set style operations so that
//! the orchestrator, the I/O pump tasks, the expiry sweeper, and
//! user-initiated disconnects can race on the same session without
//! double-releasing a backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use super::{SessionId, SessionStatus};
use crate::error::TermRelayError;
use crate::remote::RemoteShellHandle;
use crate::Result;

/// What backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Locally spawned interactive shell.
    LocalShell,
    /// Locally spawned script file.
    LocalScript,
    /// Interactive shell over a remote secure connection.
    RemoteShell,
}

/// Kind-specific teardown control.
pub enum BackendControl {
    /// Local process: the exit watcher owns the child; teardown is a
    /// terminate request (payload: force flag) on its control channel.
    Local { terminate: mpsc::Sender<bool> },
    /// Remote shell: close-once channel + connection wrapper.
    Remote { shell: Arc<RemoteShellHandle> },
}

/// The backend resource attached to a session. Exclusively owned by the
/// session entry; moved out exactly once on teardown.
pub struct BackendHandle {
    input: mpsc::Sender<Vec<u8>>,
    control: BackendControl,
}

impl BackendHandle {
    pub fn local(input: mpsc::Sender<Vec<u8>>, terminate: mpsc::Sender<bool>) -> Self {
        Self {
            input,
            control: BackendControl::Local { terminate },
        }
    }

    pub fn remote(input: mpsc::Sender<Vec<u8>>, shell: Arc<RemoteShellHandle>) -> Self {
        Self {
            input,
            control: BackendControl::Remote { shell },
        }
    }

    /// Clone of the input channel feeding the backend's writer task.
    pub fn input(&self) -> mpsc::Sender<Vec<u8>> {
        self.input.clone()
    }

    /// The remote shell wrapper, when this is a remote backend.
    pub fn remote_shell(&self) -> Option<Arc<RemoteShellHandle>> {
        match &self.control {
            BackendControl::Remote { shell } => Some(Arc::clone(shell)),
            BackendControl::Local { .. } => None,
        }
    }

    /// The backend died on its own: its writer task ended and dropped the
    /// input receiver. Lets the sweep catch sessions whose exit event was
    /// lost.
    pub fn is_dead(&self) -> bool {
        match &self.control {
            BackendControl::Local { .. } => self.input.is_closed(),
            BackendControl::Remote { shell } => {
                self.input.is_closed() || !shell.is_connected()
            }
        }
    }

    /// Release the underlying resource. For local backends this hands a
    /// terminate request to the exit watcher, which owns the child; for
    /// remote backends it closes channel and connection (once).
    pub async fn release(&self, force: bool) {
        match &self.control {
            BackendControl::Local { terminate } => {
                // Watcher gone means the process already exited.
                let _ = terminate.try_send(force);
            }
            BackendControl::Remote { shell } => shell.close_all().await,
        }
    }
}

/// Outcome of [`SessionRegistry::take_backend`].
pub enum TakeOutcome {
    /// This caller moved the session to DISCONNECTED; carries the backend
    /// handle when one was attached.
    Taken(Option<BackendHandle>),
    /// A concurrent caller already disconnected the session.
    AlreadyDisconnected,
}

/// A tracked session.
struct Session {
    kind: SessionKind,
    owner: String,
    status: SessionStatus,
    script_path: Option<String>,
    working_dir: Option<PathBuf>,
    created_at: Instant,
    last_activity_at: Instant,
    expires_at: Instant,
    last_error: Option<String>,
    backend: Option<BackendHandle>,
}

/// Read-only snapshot of a session for status queries.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub kind: SessionKind,
    pub owner: String,
    pub status: SessionStatus,
    pub script_path: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub expires_at: Instant,
    pub last_error: Option<String>,
}

impl Session {
    fn snapshot(&self, id: SessionId) -> SessionInfo {
        SessionInfo {
            id,
            kind: self.kind,
            owner: self.owner.clone(),
            status: self.status,
            script_path: self.script_path.clone(),
            working_dir: self.working_dir.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            expires_at: self.expires_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Thread-safe session store with per-owner quota enforcement and
/// time-based expiry.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Session>>,
    max_per_owner: usize,
    timeout: Duration,
}

impl SessionRegistry {
    pub fn new(max_per_owner: usize, timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_per_owner,
            timeout,
        }
    }

    /// Reserve a slot for a new session in CREATED status.
    ///
    /// The quota check and the insert happen under one write lock, so two
    /// concurrent creates from the same owner cannot both slip past the
    /// limit.
    pub fn create(
        &self,
        owner: &str,
        kind: SessionKind,
        script_path: Option<String>,
        working_dir: Option<PathBuf>,
    ) -> Result<SessionId> {
        let mut sessions = self.write_lock()?;

        let live = sessions
            .values()
            .filter(|s| s.owner == owner && s.status.counts_against_quota())
            .count();
        if live >= self.max_per_owner {
            return Err(TermRelayError::QuotaExceeded {
                owner: owner.to_string(),
                limit: self.max_per_owner,
            });
        }

        let id = SessionId::new();
        let now = Instant::now();
        sessions.insert(
            id,
            Session {
                kind,
                owner: owner.to_string(),
                status: SessionStatus::Created,
                script_path,
                working_dir,
                created_at: now,
                last_activity_at: now,
                expires_at: now + self.timeout,
                last_error: None,
                backend: None,
            },
        );
        debug!(session = %id, owner, ?kind, "session reserved");
        Ok(id)
    }

    /// Snapshot lookup, no side effects.
    pub fn get(&self, id: &SessionId) -> Result<Option<SessionInfo>> {
        let sessions = self.read_lock()?;
        Ok(sessions.get(id).map(|s| s.snapshot(*id)))
    }

    /// Snapshot list of one owner's sessions.
    pub fn list_by_owner(&self, owner: &str) -> Result<Vec<SessionInfo>> {
        let sessions = self.read_lock()?;
        Ok(sessions
            .iter()
            .filter(|(_, s)| s.owner == owner)
            .map(|(id, s)| s.snapshot(*id))
            .collect())
    }

    /// Number of tracked sessions.
    pub fn count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Compare-and-set status update.
    ///
    /// Fails with `InvalidTransition` if the current status is not in
    /// `from_allowed`, guarding against double-cleanup races. Records the
    /// error message on transitions to ERROR.
    pub fn transition(
        &self,
        id: &SessionId,
        from_allowed: &[SessionStatus],
        to: SessionStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut sessions = self.write_lock()?;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| TermRelayError::SessionNotFound(id.to_string()))?;

        if !from_allowed.contains(&session.status) {
            return Err(TermRelayError::InvalidTransition {
                from: session.status,
                to,
            });
        }
        session.status.transition_to(to)?;
        if to == SessionStatus::Error {
            session.last_error = error;
        }
        Ok(())
    }

    /// Attach the freshly acquired backend and mark the session CONNECTED.
    ///
    /// Only valid from CONNECTING. On any failure (session gone, or a
    /// disconnect won the race) the handle is handed back so the caller
    /// can release it.
    pub fn attach_connected(
        &self,
        id: &SessionId,
        handle: BackendHandle,
    ) -> std::result::Result<(), BackendHandle> {
        let Ok(mut sessions) = self.sessions.write() else {
            return Err(handle);
        };
        match sessions.get_mut(id) {
            Some(session) if session.status == SessionStatus::Connecting => {
                session.status = SessionStatus::Connected;
                session.backend = Some(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Move the session to DISCONNECTED and take its backend handle.
    ///
    /// The first caller gets `Taken`; concurrent disconnect, exit
    /// detection, and expiry all call this, and only one of them will see
    /// the handle. `Taken(None)` means the session was live but never
    /// acquired a backend (still connecting, or errored).
    pub fn take_backend(&self, id: &SessionId) -> Result<TakeOutcome> {
        let mut sessions = self.write_lock()?;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| TermRelayError::SessionNotFound(id.to_string()))?;

        if session.status == SessionStatus::Disconnected {
            return Ok(TakeOutcome::AlreadyDisconnected);
        }
        session.status = SessionStatus::Disconnected;
        Ok(TakeOutcome::Taken(session.backend.take()))
    }

    /// Clone of the connected backend's input channel, with ownership and
    /// status checked under the same lock.
    pub fn connected_input(&self, id: &SessionId, owner: &str) -> Result<mpsc::Sender<Vec<u8>>> {
        let sessions = self.read_lock()?;
        let session = sessions
            .get(id)
            .ok_or_else(|| TermRelayError::SessionNotFound(id.to_string()))?;
        Self::check_owner(id, session, owner)?;
        Self::check_connected(id, session)?;
        session
            .backend
            .as_ref()
            .map(|b| b.input())
            .ok_or(TermRelayError::WriteFailed)
    }

    /// The connected backend's remote shell, if it has one. `Ok(None)`
    /// for local sessions, where resize is a no-op.
    pub fn connected_remote(
        &self,
        id: &SessionId,
        owner: &str,
    ) -> Result<Option<Arc<RemoteShellHandle>>> {
        let sessions = self.read_lock()?;
        let session = sessions
            .get(id)
            .ok_or_else(|| TermRelayError::SessionNotFound(id.to_string()))?;
        Self::check_owner(id, session, owner)?;
        Self::check_connected(id, session)?;
        Ok(session.backend.as_ref().and_then(|b| b.remote_shell()))
    }

    /// Verify the caller owns the session.
    pub fn check_access(&self, id: &SessionId, owner: &str) -> Result<()> {
        let sessions = self.read_lock()?;
        let session = sessions
            .get(id)
            .ok_or_else(|| TermRelayError::SessionNotFound(id.to_string()))?;
        Self::check_owner(id, session, owner)
    }

    /// Refresh the activity timestamp and push expiry out.
    pub fn touch(&self, id: &SessionId) -> Result<()> {
        let mut sessions = self.write_lock()?;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| TermRelayError::SessionNotFound(id.to_string()))?;
        let now = Instant::now();
        session.last_activity_at = now;
        session.expires_at = now + self.timeout;
        Ok(())
    }

    /// Remove a session from the map. Returns any backend handle still
    /// attached so the caller can do a best-effort release.
    pub fn remove(&self, id: &SessionId) -> Result<Option<BackendHandle>> {
        let mut sessions = self.write_lock()?;
        Ok(sessions.remove(id).and_then(|s| s.backend))
    }

    /// Remove and return all sessions past expiry or whose backend has
    /// independently died.
    pub fn sweep_expired(&self, now: Instant) -> Result<Vec<(SessionId, Option<BackendHandle>)>> {
        let mut sessions = self.write_lock()?;
        let doomed: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, s)| {
                s.expires_at <= now || s.backend.as_ref().map(|b| b.is_dead()).unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();

        Ok(doomed
            .into_iter()
            .filter_map(|id| sessions.remove(&id).map(|s| (id, s.backend)))
            .collect())
    }

    /// Shutdown path: remove every session, returning the handles.
    pub fn drain(&self) -> Vec<(SessionId, Option<BackendHandle>)> {
        let Ok(mut sessions) = self.sessions.write() else {
            return Vec::new();
        };
        sessions.drain().map(|(id, s)| (id, s.backend)).collect()
    }

    fn check_owner(id: &SessionId, session: &Session, owner: &str) -> Result<()> {
        if session.owner != owner {
            return Err(TermRelayError::AccessDenied {
                session: id.to_string(),
                owner: owner.to_string(),
            });
        }
        Ok(())
    }

    fn check_connected(id: &SessionId, session: &Session) -> Result<()> {
        if !session.status.can_accept_input() {
            return Err(TermRelayError::NotConnected {
                session: id.to_string(),
                status: session.status,
            });
        }
        Ok(())
    }

    fn read_lock(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<SessionId, Session>>> {
        self.sessions.read().map_err(|_| TermRelayError::LockPoisoned)
    }

    fn write_lock(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Session>>> {
        self.sessions
            .write()
            .map_err(|_| TermRelayError::LockPoisoned)
    }
}
