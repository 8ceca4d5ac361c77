//! I/O pump: background readers, writers, and exit watchers.
//!
//! Output is pushed the moment bytes are available. Pumping is chunk-based,
//! never line-buffered, because prompts without a trailing newline are
//! common and must render immediately in the client. All pumping runs on
//! dedicated tasks so session creation and input submission never block on
//! I/O availability.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TermRelayError;
use crate::event::{OutputEvent, OutputSink};
use crate::process::ProcessHandle;
use crate::remote::RemoteShellHandle;
use crate::session::{SessionId, SessionRegistry, TakeOutcome};
use crate::Result;

/// Read chunk size for stream pumping.
const READ_BUFFER_SIZE: usize = 4096;

/// Back-off after a transient read error, to avoid spinning.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Forward caller input to a backend's writer task.
///
/// Fails with `WriteFailed` once the writer task has ended (backend input
/// closed). Sends from one caller are applied in call order.
pub async fn write(input: &mpsc::Sender<Vec<u8>>, data: Vec<u8>) -> Result<()> {
    input
        .send(data)
        .await
        .map_err(|_| TermRelayError::WriteFailed)
}

/// Start a dedicated reader that turns a byte stream into output events.
///
/// Each chunk becomes one `output` (or `error`, for stderr) event published
/// to the session's topic. Transient read errors are logged and the loop
/// keeps going; only a detected close ends it.
pub fn pump_output<R>(
    reader: R,
    id: SessionId,
    sink: Arc<dyn OutputSink>,
    is_error_stream: bool,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let topic = id.topic();
    tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(session = %id, "stream EOF");
                    break;
                }
                Ok(n) => {
                    let data = String::from_utf8_lossy(&buf[..n]).to_string();
                    let event = if is_error_stream {
                        OutputEvent::error(data)
                    } else {
                        OutputEvent::output(data)
                    };
                    sink.publish(&topic, event);
                }
                Err(e) => match e.kind() {
                    std::io::ErrorKind::Interrupted => continue,
                    std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset => {
                        debug!(session = %id, "stream closed: {}", e);
                        break;
                    }
                    _ => {
                        // Partial line loss beats killing a healthy session.
                        warn!(session = %id, error = %e, "transient read error");
                        tokio::time::sleep(READ_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    })
}

/// Same contract as [`pump_output`], over the remote adapter's delivery
/// channel instead of a raw stream.
pub fn pump_remote_output(
    mut output: mpsc::Receiver<Vec<u8>>,
    id: SessionId,
    sink: Arc<dyn OutputSink>,
) -> JoinHandle<()> {
    let topic = id.topic();
    tokio::spawn(async move {
        while let Some(chunk) = output.recv().await {
            let data = String::from_utf8_lossy(&chunk).to_string();
            sink.publish(&topic, OutputEvent::output(data));
        }
        debug!(session = %id, "remote output channel closed");
    })
}

/// Writer task for a local backend: owns the process stdin and applies
/// queued input in order. Ends when the input channel closes or the pipe
/// breaks.
pub fn run_input_writer<W>(writer: W, id: SessionId, mut rx: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(data) = rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                warn!(session = %id, error = %e, "input write failed");
                break;
            }
            if let Err(e) = writer.flush().await {
                warn!(session = %id, error = %e, "input flush failed");
                break;
            }
        }
        debug!(session = %id, "input writer finished");
    })
}

/// Writer task for a remote backend: forwards queued input to the channel.
pub fn run_remote_input_writer(
    shell: Arc<RemoteShellHandle>,
    id: SessionId,
    mut rx: mpsc::Receiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let channel = shell.channel();
        while let Some(data) = rx.recv().await {
            if let Err(e) = channel.write(&data).await {
                warn!(session = %id, error = %e, "remote input write failed");
                break;
            }
        }
        debug!(session = %id, "remote input writer finished");
    })
}

/// Exit watcher for a local backend.
///
/// Owns the child: blocks until the process exits or a terminate request
/// arrives (payload: force flag). The output pumps are drained, then the
/// watcher publishes the terminal `disconnected` status followed by the
/// single `exit` event, so `exit` is always the last event for the
/// session and the terminal pair never races a disconnect or sweep.
pub fn watch_local_exit(
    mut process: ProcessHandle,
    mut terminate_rx: mpsc::Receiver<bool>,
    output_pumps: Vec<JoinHandle<()>>,
    id: SessionId,
    sink: Arc<dyn OutputSink>,
    registry: Arc<SessionRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let exit_code = tokio::select! {
            code = process.wait() => {
                debug!(session = %id, ?code, "process exited");
                code
            }
            force = terminate_rx.recv() => {
                let force = force.unwrap_or(true);
                process.terminate(force).await
            }
        };

        // The pipes are closed now; the pumps finish on EOF.
        for pump in output_pumps {
            let _ = pump.await;
        }

        finalize(&id, &registry).await;
        let topic = id.topic();
        sink.publish(&topic, OutputEvent::status("disconnected"));
        sink.publish(&topic, OutputEvent::exit(exit_code));
    })
}

/// Exit watcher for a remote backend: blocks until the channel closes,
/// drains the output pump, then publishes the terminal `disconnected`
/// status and the final `exit` event.
pub fn watch_remote_exit(
    shell: Arc<RemoteShellHandle>,
    output_pump: JoinHandle<()>,
    id: SessionId,
    sink: Arc<dyn OutputSink>,
    registry: Arc<SessionRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let exit_code = shell.channel().wait_closed().await;
        debug!(session = %id, ?exit_code, "remote channel closed");

        shell.close_all().await;
        let _ = output_pump.await;

        finalize(&id, &registry).await;
        let topic = id.topic();
        sink.publish(&topic, OutputEvent::status("disconnected"));
        sink.publish(&topic, OutputEvent::exit(exit_code));
    })
}

/// Registry cleanup shared by both watchers. Tolerates having lost the
/// race to a user disconnect or the expiry sweep: the session may already
/// be disconnected or gone, and the backend handle may already be taken.
async fn finalize(id: &SessionId, registry: &SessionRegistry) {
    if let Ok(TakeOutcome::Taken(Some(handle))) = registry.take_backend(id) {
        handle.release(true).await;
    }
    let _ = registry.remove(id);
}
