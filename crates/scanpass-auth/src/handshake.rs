//! QR login handshake
//!
//! [`Handshake`] runs the four operations of a scan-to-login:
//!
//! 1. `initiate`: the requester creates a session and displays its QR payload
//! 2. `prove_scan`: the scanner proves it read the code and binds itself
//! 3. `decide`: the bound scanner approves or denies
//! 4. `resolve`: the requester polls for the outcome
//!
//! Transition rules come from [`crate::state`]; every write goes through the
//! store's conditional update so concurrent calls cannot both succeed.

use chrono::{DateTime, Utc};
use scanpass_core::{
    Decision, DecideRequest, ProveScanRequest, QrPayload, RequesterContext, SessionStatus,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::handoff::HandoffSigner;
use crate::session::{ActorId, QrSession, SessionId};
use crate::state::{self, Event, EventKind, TransitionError};
use crate::storage::{SessionPatch, SessionStore, StoreError, StoreResult};
use crate::token_clock::TokenClock;

/// Largest accepted gap between the scanner's claimed time and server time
pub const TIMESTAMP_TOLERANCE_SECONDS: u64 = 5;

/// Handshake outcomes other than success
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("QR session not found")]
    NotFound,
    #[error("QR session is {status}")]
    StateConflict { status: SessionStatus },
    #[error("Not authenticated")]
    AuthenticationRequired,
    #[error("Not the scanner bound to this session")]
    AuthorizationMismatch,
    #[error("Invalid token")]
    InvalidProof,
    #[error("Timestamp too far from server time")]
    TimestampOutOfBounds,
    #[error("Invalid handoff token")]
    InvalidHandoffToken,
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Storage failure: {0}")]
    Infrastructure(String),
}

impl HandshakeError {
    /// Only infrastructure failures may be retried with identical input
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandshakeError::Infrastructure(_))
    }
}

impl From<StoreError> for HandshakeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => HandshakeError::NotFound,
            StoreError::Conflict { observed, .. } => {
                HandshakeError::StateConflict { status: observed }
            }
            other => HandshakeError::Infrastructure(other.to_string()),
        }
    }
}

impl From<TransitionError> for HandshakeError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Expired => HandshakeError::StateConflict {
                status: SessionStatus::Expired,
            },
            TransitionError::IllegalEdge { from, .. } => {
                HandshakeError::StateConflict { status: from }
            }
            TransitionError::InvalidProof => HandshakeError::InvalidProof,
            TransitionError::IdentityMismatch => HandshakeError::AuthorizationMismatch,
        }
    }
}

pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Result of initiating a session
#[derive(Debug, Clone)]
pub struct InitiatedSession {
    pub session_id: SessionId,
    /// QR payload carrying the encoded secret
    pub payload: QrPayload,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a successful proof-of-scan
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// Shown to the scanner's user for confirmation
    pub requester_context: RequesterContext,
    /// Present when requested and a signing key is available
    pub handoff_token: Option<String>,
}

/// What the requester learns when it polls
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub status: SessionStatus,
    /// Set once authenticated; used to mint the requester's own session
    pub grant: Option<RequesterGrant>,
}

/// Everything needed to sign the requester in after approval
#[derive(Debug, Clone, PartialEq)]
pub struct RequesterGrant {
    pub session_id: SessionId,
    /// The approving scanner's identity
    pub user: ActorId,
    /// The requester's own context captured at initiation
    pub requester_context: RequesterContext,
    /// When the QR session itself expires
    pub expires_at: DateTime<Utc>,
}

/// Retry policy for transient storage failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Runs QR login handshakes against a session store
pub struct Handshake {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    token_clock: TokenClock,
    handoff: HandoffSigner,
    retry: RetryPolicy,
}

impl Handshake {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, handoff: HandoffSigner) -> Self {
        Self {
            store,
            clock,
            token_clock: TokenClock::default(),
            handoff,
            retry: RetryPolicy::default(),
        }
    }

    /// Builder pattern: set the storage retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            attempts: retry.attempts.max(1),
            backoff: retry.backoff,
        };
        self
    }

    /// Create a pending session for an unauthenticated requester
    pub async fn initiate(&self, context: RequesterContext) -> HandshakeResult<InitiatedSession> {
        let session = QrSession::new(context, self.clock.now());
        let store = &self.store;
        let stored = self
            .retry_store("create", move || store.create(session.clone()))
            .await?;

        info!("Initiated QR session {}", stored.id);
        Ok(InitiatedSession {
            payload: stored.qr_payload(),
            session_id: stored.id,
            created_at: stored.created_at,
            expires_at: stored.expires_at,
        })
    }

    /// Verify the scanner's proof and bind it to the session
    pub async fn prove_scan(
        &self,
        request: &ProveScanRequest,
        actor: Option<&ActorId>,
    ) -> HandshakeResult<ScanOutcome> {
        let actor = actor.ok_or(HandshakeError::AuthenticationRequired)?;
        let session_id = required_id(&request.session_id)?;
        if request.token.is_empty() {
            return Err(HandshakeError::Validation("token is required".to_string()));
        }
        let timestamp = request
            .timestamp
            .ok_or_else(|| HandshakeError::Validation("timestamp is required".to_string()))?;

        // Cheap sanity bound before any cryptography
        let now = self.clock.now();
        let skew = now.timestamp().abs_diff(timestamp);
        if skew > TIMESTAMP_TOLERANCE_SECONDS {
            warn!("Rejecting proof for {}: clock skew {}s", session_id, skew);
            return Err(HandshakeError::TimestampOutOfBounds);
        }

        let session = self.load(&session_id, now).await?;
        state::check_edge(&session, EventKind::ProofOfScan, now)?;

        let proof_verified = self
            .token_clock
            .verify(session.secret.as_bytes(), &request.token, timestamp);
        let event = Event::ProofOfScan {
            actor: actor.clone(),
            proof_verified,
        };
        let transition = state::apply(&session, &event, now).map_err(|e| {
            if e == TransitionError::InvalidProof {
                warn!("Invalid proof token for session {}", session_id);
            }
            HandshakeError::from(e)
        })?;

        let updated = self
            .commit(&session_id, transition.from, transition.into(), now)
            .await?;
        info!("QR session {} scanned by {}", session_id, actor);

        let handoff_token = if request.issue_handoff {
            match self.handoff.issue(&session_id, now.timestamp()) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!("Could not issue handoff token for {}: {}", session_id, e);
                    None
                }
            }
        } else {
            None
        };

        Ok(ScanOutcome {
            requester_context: updated.requester_context,
            handoff_token,
        })
    }

    /// Approve or deny a scanned session as its bound scanner
    pub async fn decide(
        &self,
        request: &DecideRequest,
        decision: Decision,
        actor: Option<&ActorId>,
    ) -> HandshakeResult<SessionStatus> {
        let actor = actor.ok_or(HandshakeError::AuthenticationRequired)?;
        let now = self.clock.now();
        let session_id = self.decision_target(request, now)?;

        let session = self.load(&session_id, now).await?;
        let event = match decision {
            Decision::Approve => Event::Approve {
                actor: actor.clone(),
            },
            Decision::Deny => Event::Deny {
                actor: actor.clone(),
            },
        };
        let transition = state::apply(&session, &event, now).map_err(|e| {
            if e == TransitionError::IdentityMismatch {
                warn!("{} tried to decide session {} bound to another scanner", actor, session_id);
            }
            HandshakeError::from(e)
        })?;

        let updated = self
            .commit(&session_id, transition.from, transition.into(), now)
            .await?;
        info!("QR session {} is now {}", session_id, updated.status);
        Ok(updated.status)
    }

    /// Report a session's status to its requester
    pub async fn resolve(&self, session_id: &str) -> HandshakeResult<Resolution> {
        let session_id = required_id(session_id)?;
        let now = self.clock.now();
        let session = self.load(&session_id, now).await?;
        let status = state::effective_status(&session, now);

        let grant = match (status, session.authorized_by) {
            (SessionStatus::Authenticated, Some(user)) => Some(RequesterGrant {
                session_id: session.id,
                user,
                requester_context: session.requester_context,
                expires_at: session.expires_at,
            }),
            _ => None,
        };

        debug!("Resolved QR session {} as {}", session_id, status);
        Ok(Resolution { status, grant })
    }

    /// Work out which session a decision targets
    fn decision_target(
        &self,
        request: &DecideRequest,
        now: DateTime<Utc>,
    ) -> HandshakeResult<SessionId> {
        let explicit = request
            .session_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(SessionId::from_string);
        let handoff = request.handoff_token.as_deref().filter(|s| !s.is_empty());

        match (explicit, handoff) {
            (explicit, Some(token)) => {
                let verified = self.handoff.verify(token, now).map_err(|e| {
                    warn!("Rejected handoff token: {}", e);
                    HandshakeError::InvalidHandoffToken
                })?;
                match explicit {
                    Some(id) if id != verified.session_id => Err(HandshakeError::Validation(
                        "sessionId does not match handoff token".to_string(),
                    )),
                    _ => Ok(verified.session_id),
                }
            }
            (Some(id), None) => Ok(id),
            (None, None) => Err(HandshakeError::Validation(
                "sessionId or handoffToken is required".to_string(),
            )),
        }
    }

    async fn load(&self, id: &SessionId, now: DateTime<Utc>) -> HandshakeResult<QrSession> {
        let store = &self.store;
        Ok(self
            .retry_store("get", move || store.get_by_id(id, now))
            .await?)
    }

    /// Conditional update that tolerates a retried write having already landed
    async fn commit(
        &self,
        id: &SessionId,
        expected: SessionStatus,
        patch: SessionPatch,
        now: DateTime<Utc>,
    ) -> HandshakeResult<QrSession> {
        let mut delay = self.retry.backoff;
        let mut attempt = 1;
        loop {
            match self
                .store
                .conditional_update(id, expected, patch.clone(), now)
                .await
            {
                Ok(session) => return Ok(session),
                Err(StoreError::Conflict { .. }) if attempt > 1 => {
                    // An earlier attempt may have been applied before failing
                    let current = self.load(id, now).await?;
                    if current.status == patch.status
                        && (patch.authorized_by.is_none()
                            || current.authorized_by == patch.authorized_by)
                    {
                        return Ok(current);
                    }
                    return Err(HandshakeError::StateConflict {
                        status: current.status,
                    });
                }
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    warn!("Storage update failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn retry_store<T, F, Fut>(&self, op: &str, mut f: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut delay = self.retry.backoff;
        let mut attempt = 1;
        loop {
            match f().await {
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    warn!("Storage {} failed (attempt {}): {}", op, attempt, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn required_id(id: &str) -> HandshakeResult<SessionId> {
    let id = id.trim();
    if id.is_empty() {
        return Err(HandshakeError::Validation("sessionId is required".to_string()));
    }
    Ok(SessionId::from_string(id))
}
