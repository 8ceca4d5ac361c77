//! # term-relay
//!
//! Interactive terminal session manager for release-engineering consoles.
//!
//! This crate creates, multiplexes, and tears down many concurrent,
//! long-lived, bidirectional command-execution sessions. Each session is
//! backed either by a locally spawned shell/script process or by a remote
//! interactive shell over SSH, and its output streams in real time to an
//! external publish/subscribe sink.
//!
//! ## Features
//!
//! - **Two backends, one contract**: local processes and remote SSH shells
//!   behind the same session-facing operations
//! - **Hard per-owner quota**: atomic with session creation
//! - **Continuous I/O pumping**: chunk-based, never line-buffered, on
//!   dedicated tasks that never block the control path
//! - **Leak-free lifecycle**: exactly-once backend release under racing
//!   disconnect, exit detection, and expiry sweeps
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use term_relay::{BroadcastSink, Config, SessionKind, SessionOrchestrator};
//! # use term_relay::{ConnectionInfo, RemoteConnection, RemoteTransport};
//! # struct NoRemote;
//! # #[async_trait::async_trait]
//! # impl RemoteTransport for NoRemote {
//! #     async fn connect(&self, _: &ConnectionInfo) -> term_relay::Result<Arc<dyn RemoteConnection>> {
//! #         Err(term_relay::TermRelayError::ConnectionFailed("n/a".into()))
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> term_relay::Result<()> {
//!     term_relay::logging::try_init().ok();
//!
//!     let sink = Arc::new(BroadcastSink::default());
//!     let orchestrator =
//!         SessionOrchestrator::new(Config::default(), sink.clone(), Arc::new(NoRemote));
//!
//!     let mut events = sink.subscribe();
//!     let id = orchestrator.start_local_session("alice", SessionKind::LocalShell, None, None)?;
//!
//!     orchestrator.send_input(&id, "alice", b"echo hello\n").await?;
//!     while let Ok((topic, event)) = events.recv().await {
//!         println!("{topic}: {:?}", event);
//!     }
//!
//!     orchestrator.disconnect(&id, Some("alice")).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod pump;
pub mod remote;
pub mod session;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, TermRelayError};
pub use event::{BroadcastSink, EventKind, OutputEvent, OutputSink};
pub use orchestrator::SessionOrchestrator;
pub use remote::{
    ConnectionInfo, RemoteAuth, RemoteChannel, RemoteConnection, RemoteShell, RemoteShellHandle,
    RemoteTransport,
};
pub use session::{
    BackendHandle, SessionId, SessionInfo, SessionKind, SessionRegistry, SessionStatus,
    TakeOutcome,
};
