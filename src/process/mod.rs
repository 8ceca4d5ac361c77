//! Process execution engine.
//!
//! Spawns and manages a local OS process (interactive shell or a specific
//! script file) and exposes its standard streams. Lifetime ownership
//! belongs to the session; the engine only provides the primitives.

mod launch;

pub use launch::{interactive_shell, resolve_script, script_command, LaunchPlan, OsFamily};

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::TermRelayError;
use crate::Result;

/// Grace window between a termination request and a forced kill.
const TERM_GRACE: Duration = Duration::from_secs(3);

/// A spawned local process with its standard streams.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

/// Spawn an interactive shell for the host OS.
pub fn spawn_shell(working_dir: Option<&Path>) -> Result<ProcessHandle> {
    let plan = interactive_shell(OsFamily::host());
    spawn_plan(&plan, working_dir)
}

/// Spawn a specific script file, resolved against `base_dir`.
///
/// The path is traversal-checked before the filesystem is touched. On
/// Unix, a script without the execute bit gets one chance at `u+x` before
/// the spawn is attempted.
pub fn spawn_script(
    base_dir: &Path,
    script: &str,
    working_dir: Option<&Path>,
) -> Result<ProcessHandle> {
    let resolved = resolve_script(base_dir, script)?;
    let plan = script_command(OsFamily::host(), &resolved);

    #[cfg(unix)]
    if plan.args.is_empty() {
        // Direct-exec plan: the script itself must be runnable.
        ensure_executable(&resolved);
    }

    spawn_plan(&plan, working_dir)
}

/// Grant the execute bit once if it is missing. Best effort: a failure
/// here surfaces later as SpawnFailed with the OS error.
#[cfg(unix)]
fn ensure_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if mode & 0o111 == 0 {
        debug!(script = %path.display(), "granting execute permission");
        let mut perms = metadata.permissions();
        perms.set_mode(mode | 0o700);
        if let Err(e) = std::fs::set_permissions(path, perms) {
            warn!(script = %path.display(), error = %e, "failed to grant execute permission");
        }
    }
}

fn spawn_plan(plan: &LaunchPlan, working_dir: Option<&Path>) -> Result<ProcessHandle> {
    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| TermRelayError::SpawnFailed(format!("{}: {}", plan.program, e)))?;

    let pid = child.id().unwrap_or(0);
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    debug!(program = %plan.program, pid, "process spawned");

    Ok(ProcessHandle {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

impl ProcessHandle {
    /// OS process ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the three standard streams. Each can be taken once.
    pub fn take_streams(
        &mut self,
    ) -> (
        Option<ChildStdin>,
        Option<ChildStdout>,
        Option<ChildStderr>,
    ) {
        (self.stdin.take(), self.stdout.take(), self.stderr.take())
    }

    /// Check whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the process to exit, returning its exit code when known.
    pub async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(pid = self.pid, error = %e, "wait on child failed");
                None
            }
        }
    }

    /// Request termination, returning the exit code when known.
    ///
    /// Graceful first (SIGTERM on Unix), forced kill if the process ignores
    /// the request within the grace window or when `force` is set. On
    /// Windows there is no graceful equivalent for this handle shape, so
    /// termination is always forced.
    pub async fn terminate(&mut self, force: bool) -> Option<i32> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return status.code();
        }

        #[cfg(unix)]
        if !force {
            // SAFETY: plain kill(2) with a valid pid and signal.
            unsafe {
                libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
            }
            if let Ok(Ok(status)) = tokio::time::timeout(TERM_GRACE, self.child.wait()).await {
                return status.code();
            }
            debug!(pid = self.pid, "SIGTERM ignored, killing");
        }

        if let Err(e) = self.child.start_kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!(pid = self.pid, error = %e, "kill failed");
            }
        }
        self.child.wait().await.ok().and_then(|s| s.code())
    }
}
