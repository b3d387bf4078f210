//! QR session state machine
//!
//! Every legal edge lives in [`next_status`]; guards live in [`apply`]. Nothing
//! else in the crate decides whether a transition is allowed.
//!
//! ```text
//! pending --proof-of-scan--> scanned --approve--> authenticated
//!                                    \--deny----> denied
//! pending | scanned --(now > expires_at)--> expired
//! ```

use chrono::{DateTime, Utc};
use scanpass_core::SessionStatus;
use thiserror::Error;

use crate::session::{ActorId, QrSession};

/// Kind of event applied to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ProofOfScan,
    Approve,
    Deny,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EventKind::ProofOfScan => "proof-of-scan",
            EventKind::Approve => "approve",
            EventKind::Deny => "deny",
        })
    }
}

/// An event together with the inputs its guard needs
#[derive(Debug, Clone)]
pub enum Event {
    /// Scanner submitted a proof token; `proof_verified` is the token clock result
    ProofOfScan { actor: ActorId, proof_verified: bool },
    Approve { actor: ActorId },
    Deny { actor: ActorId },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ProofOfScan { .. } => EventKind::ProofOfScan,
            Event::Approve { .. } => EventKind::Approve,
            Event::Deny { .. } => EventKind::Deny,
        }
    }

    fn actor(&self) -> &ActorId {
        match self {
            Event::ProofOfScan { actor, .. } | Event::Approve { actor } | Event::Deny { actor } => {
                actor
            }
        }
    }
}

/// Why a transition was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The session is past its expiry; never retryable
    #[error("session expired")]
    Expired,
    /// No edge for this event from the current status; never retryable
    #[error("cannot {event} a session that is {from}")]
    IllegalEdge { from: SessionStatus, event: EventKind },
    /// Proof token rejected; retryable with a fresh token while time remains
    #[error("proof of scan rejected")]
    InvalidProof,
    /// Actor is not the scanner bound to the session
    #[error("actor does not match the session's scanner")]
    IdentityMismatch,
}

impl TransitionError {
    /// Whether the same operation may be retried with fresh input
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransitionError::InvalidProof)
    }
}

/// A validated transition, ready to be written with a conditional update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionStatus,
    pub to: SessionStatus,
    /// Scanner to bind; only set on the pending -> scanned edge
    pub bind_actor: Option<ActorId>,
}

/// The transition table. `None` means the edge does not exist.
pub fn next_status(from: SessionStatus, event: EventKind) -> Option<SessionStatus> {
    use EventKind::*;
    use SessionStatus::*;

    match (from, event) {
        (Pending, ProofOfScan) => Some(Scanned),
        (Scanned, Approve) => Some(Authenticated),
        (Scanned, Deny) => Some(Denied),
        (Pending, Approve | Deny) => None,
        (Scanned, ProofOfScan) => None,
        (Authenticated | Denied | Expired, _) => None,
    }
}

/// Status as observed at `now`, with lazy expiry applied
pub fn effective_status(session: &QrSession, now: DateTime<Utc>) -> SessionStatus {
    if !session.status.is_terminal() && session.is_expired_at(now) {
        SessionStatus::Expired
    } else {
        session.status
    }
}

/// Force a non-terminal session past its expiry into `expired`.
///
/// Returns whether the session changed.
pub fn coerce_expiry(session: &mut QrSession, now: DateTime<Utc>) -> bool {
    let status = effective_status(session, now);
    if status != session.status {
        session.status = status;
        true
    } else {
        false
    }
}

/// Check expiry and edge legality without evaluating guards.
///
/// Lets callers reject early before doing guard work such as proof verification.
pub fn check_edge(
    session: &QrSession,
    event: EventKind,
    now: DateTime<Utc>,
) -> Result<SessionStatus, TransitionError> {
    let from = effective_status(session, now);
    if from == SessionStatus::Expired {
        return Err(TransitionError::Expired);
    }
    next_status(from, event).ok_or(TransitionError::IllegalEdge { from, event })
}

/// Validate `event` against `session` at `now` and describe the resulting transition.
///
/// Never mutates the session; the caller persists the returned transition.
pub fn apply(
    session: &QrSession,
    event: &Event,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    let to = check_edge(session, event.kind(), now)?;
    let from = session.status;

    match event {
        Event::ProofOfScan {
            actor,
            proof_verified,
        } => {
            if !proof_verified {
                return Err(TransitionError::InvalidProof);
            }
            Ok(Transition {
                from,
                to,
                bind_actor: Some(actor.clone()),
            })
        }
        Event::Approve { .. } | Event::Deny { .. } => {
            match &session.authorized_by {
                Some(bound) if bound == event.actor() => {}
                _ => return Err(TransitionError::IdentityMismatch),
            }
            Ok(Transition {
                from,
                to,
                bind_actor: None,
            })
        }
    }
}
