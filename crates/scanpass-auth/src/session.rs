//! QR login session identity and data
//!
//! A [`QrSession`] is created by the requester and carries the shared secret
//! that the scanner must prove it has read.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use scanpass_core::{QrPayload, RequesterContext, SessionStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed session time-to-live in seconds
pub const SESSION_TTL_SECONDS: i64 = 300;

/// How long a session stays readable after it expires, in seconds
pub const RETENTION_SECONDS: i64 = 3600;

/// Secret length in bytes (256 bits)
pub const SECRET_LEN: usize = 32;

/// Unique identifier for a QR session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new random session ID
    pub fn new() -> Self {
        Self(format!("qr_{}", Uuid::new_v4().simple()))
    }

    /// Wrap an ID received from a caller
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of an authenticated actor (the scanner's user ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The 256-bit secret shared with the scanner through the QR code.
///
/// Its `Debug` output is redacted; the encoded form only leaves the process
/// in the QR payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionSecret([u8; SECRET_LEN]);

impl SessionSecret {
    /// Generate a fresh random secret
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self(rng.gen())
    }

    /// Decode from the URL-safe text form
    pub fn decode(encoded: &str) -> Option<Self> {
        let bytes = BASE64URL.decode(encoded.trim_end_matches('=')).ok()?;
        let bytes: [u8; SECRET_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// URL-safe text form used in the QR payload
    pub fn encode(&self) -> String {
        BASE64URL.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}

impl TryFrom<String> for SessionSecret {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decode(&value).ok_or_else(|| "invalid session secret encoding".to_string())
    }
}

impl From<SessionSecret> for String {
    fn from(secret: SessionSecret) -> Self {
        secret.encode()
    }
}

/// A QR login session as persisted by the storage collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrSession {
    /// Unique session identifier
    pub id: SessionId,
    /// Shared secret; read only by proof verification
    pub secret: SessionSecret,
    /// Current lifecycle status
    pub status: SessionStatus,
    /// Scanner identity, bound when the session is first proven
    pub authorized_by: Option<ActorId>,
    /// Requester metadata captured at creation
    pub requester_context: RequesterContext,
    pub created_at: DateTime<Utc>,
    /// `created_at + SESSION_TTL_SECONDS`, never extended
    pub expires_at: DateTime<Utc>,
}

impl QrSession {
    /// Create a pending session with a fresh id and secret
    pub fn new(requester_context: RequesterContext, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            secret: SessionSecret::generate(),
            status: SessionStatus::Pending,
            authorized_by: None,
            requester_context,
            created_at: now,
            expires_at: now + Duration::seconds(SESSION_TTL_SECONDS),
        }
    }

    /// Whether `now` is past the session's expiry
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Payload to encode into the QR code
    pub fn qr_payload(&self) -> QrPayload {
        QrPayload {
            session_id: self.id.to_string(),
            secret: self.secret.encode(),
        }
    }
}
