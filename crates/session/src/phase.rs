//! Session life cycle shared by sender and receiver.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Negotiating,
    Transferring,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

/// Inputs that move a session between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Manifest sent (sender) or received (receiver).
    Negotiate,
    Accepted,
    Rejected,
    NegotiationTimeout,
    AllAcknowledged,
    HashMatched,
    HashMismatched,
    /// Unrecoverable I/O, exhausted retries, or a timeout while verifying.
    Fatal,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub event: PhaseEvent,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    /// Returns the phase reached from `self` on `event`.
    pub fn on(self, event: PhaseEvent) -> Result<Phase, InvalidTransition> {
        use Phase::*;
        use PhaseEvent::*;

        let next = match (self, event) {
            (Init, Negotiate) => Negotiating,
            (Negotiating, Negotiate) => Negotiating,
            (Negotiating, Accepted) => Transferring,
            (Negotiating, Rejected | NegotiationTimeout) => Failed,
            (Transferring, AllAcknowledged) => Verifying,
            (Verifying, HashMatched) => Completed,
            (Verifying, HashMismatched) => Failed,
            (Init | Negotiating | Transferring | Verifying, Fatal) => Failed,
            (Init | Negotiating | Transferring | Verifying, Cancel) => Cancelled,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }
}
