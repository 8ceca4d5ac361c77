//! Session identity, status, and the concurrent registry.

mod id;
mod registry;
mod state;

pub use id::SessionId;
pub use registry::{
    BackendControl, BackendHandle, SessionInfo, SessionKind, SessionRegistry, TakeOutcome,
};
pub use state::SessionStatus;
