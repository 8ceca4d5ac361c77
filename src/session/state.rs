//! Session status state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a terminal session.
///
/// Monotonic except for the Connecting fork: a connecting session ends up
/// either Connected or Error depending on how backend acquisition went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    /// Session slot reserved, backend not yet requested.
    #[default]
    Created,
    /// Background connect/spawn task is running.
    Connecting,
    /// Backend is live and accepting input.
    Connected,
    /// Backend acquisition failed; see the session's last error.
    Error,
    /// Terminal state; backend resources have been released.
    Disconnected,
}

impl SessionStatus {
    /// Check if transition to target status is valid.
    ///
    /// Valid transitions:
    /// - Created -> Connecting
    /// - Connecting -> Connected
    /// - Connecting -> Error
    /// - Connected -> Disconnected
    /// - any non-terminal -> Disconnected (forced cleanup)
    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        use SessionStatus::*;
        match (*self, target) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Created, Connecting) => true,
            (Connecting, Connected) | (Connecting, Error) => true,
            _ => false,
        }
    }

    /// Attempt to transition to a new status.
    ///
    /// Returns `Ok(())` if the transition is valid, or an error otherwise.
    pub fn transition_to(&mut self, target: SessionStatus) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(crate::error::TermRelayError::InvalidTransition {
                from: *self,
                to: target,
            })
        }
    }

    /// Check if this is the terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Disconnected)
    }

    /// Check if the session counts against its owner's quota.
    pub fn counts_against_quota(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if the session can accept input and resize calls.
    pub fn can_accept_input(&self) -> bool {
        matches!(self, SessionStatus::Connected)
    }
}
