//! Remote shell adapter.
//!
//! Wraps the remote-execution (SSH) protocol behind a small trait
//! boundary. The protocol handshake and encryption internals are an
//! external collaborator; the core only depends on connect / open-shell /
//! write / resize / close operations.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::Result;

/// How to reach and authenticate against the remote host.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: RemoteAuth,
}

/// Authentication material for the remote connection.
#[derive(Debug, Clone)]
pub enum RemoteAuth {
    Password(String),
    KeyFile(PathBuf),
}

/// Establishes secure connections. Implemented by the protocol library
/// binding; faked in tests.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Establish the underlying secure connection.
    ///
    /// Fails with `ConnectionFailed` on auth or network errors.
    async fn connect(&self, info: &ConnectionInfo) -> Result<Arc<dyn RemoteConnection>>;
}

/// An established secure connection.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Open a pseudo-terminal-backed interactive channel with the given
    /// initial geometry. Output bytes start flowing on the returned
    /// receiver as soon as the shell is up.
    ///
    /// Fails with `ChannelOpenFailed`.
    async fn open_shell(&self, cols: u16, rows: u16) -> Result<RemoteShell>;

    /// Tear down the connection. Idempotent; safe on an already-closed
    /// connection.
    async fn disconnect(&self);
}

/// An open interactive channel plus its output delivery stream.
pub struct RemoteShell {
    pub channel: Arc<dyn RemoteChannel>,
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// The interactive channel itself.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Send raw bytes/keystrokes to the remote shell.
    ///
    /// Fails with `WriteFailed` once the channel is closed.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Propagate terminal geometry changes so remote line wrapping stays
    /// correct.
    async fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Whether the channel is still open.
    fn is_connected(&self) -> bool;

    /// Close the channel. Idempotent. Implementations must end output
    /// delivery (drop the output sender) on close so readers see EOF.
    async fn close(&self);

    /// Resolve once the channel has closed, with the remote exit status
    /// when the server reported one.
    async fn wait_closed(&self) -> Option<i32>;
}

/// Owns a channel and its parent connection, guaranteeing both are torn
/// down at most once even when disconnect, exit detection, and the expiry
/// sweep race.
pub struct RemoteShellHandle {
    channel: Arc<dyn RemoteChannel>,
    connection: Arc<dyn RemoteConnection>,
    closed: AtomicBool,
}

impl RemoteShellHandle {
    pub fn new(channel: Arc<dyn RemoteChannel>, connection: Arc<dyn RemoteConnection>) -> Self {
        Self {
            channel,
            connection,
            closed: AtomicBool::new(false),
        }
    }

    /// The channel, for write/resize delegation.
    pub fn channel(&self) -> Arc<dyn RemoteChannel> {
        Arc::clone(&self.channel)
    }

    /// Whether the channel still reports a live connection.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.channel.is_connected()
    }

    /// Close the channel, then the connection. First caller wins; later
    /// callers return immediately.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing remote shell channel and connection");
        self.channel.close().await;
        self.connection.disconnect().await;
    }
}
