//! Short-lived signed handoff tokens
//!
//! A handoff token carries a proven session reference from the proof-of-scan
//! step to the decision step. Tokens are HS256 JWTs valid for five seconds.
//! The verifier only ever accepts HS256. The `alg` header is compared
//! against that constant and never used to choose how to verify.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{
    decode, decode_header, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey,
    Header, Validation,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::session::SessionId;

/// How long an issued handoff token stays valid
pub const HANDOFF_VALIDITY_SECONDS: i64 = 5;

/// The only accepted signing algorithm
pub const PINNED_ALGORITHM: Algorithm = Algorithm::HS256;

/// Handoff token failures. All of them are reported to callers identically.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("malformed handoff token")]
    Malformed,
    #[error("handoff token algorithm is not HS256")]
    AlgorithmMismatch,
    #[error("handoff token signed with an unknown key")]
    UnknownKey,
    #[error("handoff token signature mismatch")]
    BadSignature,
    #[error("handoff token expired")]
    Expired,
    #[error("no signing key available")]
    NoSigningKey,
    #[error("failed to sign handoff token: {0}")]
    Signing(String),
}

/// A symmetric signing key and its identifier
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    secret: Arc<[u8]>,
}

impl SigningKey {
    pub fn new(kid: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            kid: kid.into(),
            secret: Arc::from(secret.as_ref()),
        }
    }

    /// Random 256-bit key with a random identifier
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 32] = rng.gen();
        Self::new(new_kid(), bytes)
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

fn new_kid() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Source of handoff signing keys; lets the surrounding system rotate keys
/// without restarting verification.
pub trait KeyProvider: Send + Sync {
    /// Key used for newly issued tokens
    fn signing_key(&self) -> Option<SigningKey>;

    /// Key matching a token's `kid` header
    fn verification_key(&self, kid: &str) -> Option<SigningKey>;
}

#[derive(Debug, Default)]
struct KeyringInner {
    current: Option<SigningKey>,
    previous: Option<SigningKey>,
}

/// In-process keyring holding the current key and the one it replaced
#[derive(Debug, Default)]
pub struct Keyring {
    inner: RwLock<KeyringInner>,
}

impl Keyring {
    /// Keyring with a single active key
    pub fn new(key: SigningKey) -> Self {
        Self {
            inner: RwLock::new(KeyringInner {
                current: Some(key),
                previous: None,
            }),
        }
    }

    /// Keyring using a configured secret
    pub fn from_secret(secret: impl AsRef<[u8]>) -> Self {
        Self::new(SigningKey::new(new_kid(), secret))
    }

    /// Make `key` current; the old current key remains valid for verification
    pub fn rotate(&self, key: SigningKey) {
        if let Ok(mut guard) = self.inner.write() {
            info!("Rotating handoff signing key to {}", key.kid());
            guard.previous = guard.current.replace(key);
        }
    }
}

impl KeyProvider for Keyring {
    fn signing_key(&self) -> Option<SigningKey> {
        self.inner.read().ok().and_then(|g| g.current.clone())
    }

    fn verification_key(&self, kid: &str) -> Option<SigningKey> {
        let guard = self.inner.read().ok()?;
        let key = [&guard.current, &guard.previous]
            .into_iter()
            .flatten()
            .find(|k| k.kid == kid)
            .cloned();
        key
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HandoffClaims {
    #[serde(rename = "sessionId")]
    session_id: String,
    iat: i64,
    exp: i64,
}

/// Contents of a verified handoff token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedHandoff {
    pub session_id: SessionId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies handoff tokens
#[derive(Clone)]
pub struct HandoffSigner {
    keys: Arc<dyn KeyProvider>,
}

impl HandoffSigner {
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self { keys }
    }

    /// Sign a token for `session_id` valid from `issued_at` for five seconds
    pub fn issue(&self, session_id: &SessionId, issued_at: i64) -> Result<String, HandoffError> {
        let key = self.keys.signing_key().ok_or(HandoffError::NoSigningKey)?;

        let mut header = Header::new(PINNED_ALGORITHM);
        header.kid = Some(key.kid.clone());

        let claims = HandoffClaims {
            session_id: session_id.to_string(),
            iat: issued_at,
            exp: issued_at + HANDOFF_VALIDITY_SECONDS,
        };

        encode(&header, &claims, &EncodingKey::from_secret(&key.secret))
            .map_err(|e| HandoffError::Signing(e.to_string()))
    }

    /// Verify a token at `now`. Any failure rejects the whole token.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<VerifiedHandoff, HandoffError> {
        let header = decode_header(token).map_err(|_| HandoffError::Malformed)?;
        if header.alg != PINNED_ALGORITHM {
            debug!("Rejecting handoff token with algorithm {:?}", header.alg);
            return Err(HandoffError::AlgorithmMismatch);
        }

        let kid = header.kid.ok_or(HandoffError::UnknownKey)?;
        let key = self
            .keys
            .verification_key(&kid)
            .ok_or(HandoffError::UnknownKey)?;

        // Expiry is checked below against the caller's clock
        let mut validation = Validation::new(PINNED_ALGORITHM);
        validation.algorithms = vec![PINNED_ALGORITHM];
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "iat"]);

        let data = decode::<HandoffClaims>(token, &DecodingKey::from_secret(&key.secret), &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => HandoffError::BadSignature,
                ErrorKind::InvalidAlgorithm => HandoffError::AlgorithmMismatch,
                _ => HandoffError::Malformed,
            })?;
        let claims = data.claims;

        let lifetime = claims
            .exp
            .checked_sub(claims.iat)
            .ok_or(HandoffError::Malformed)?;
        if claims.session_id.is_empty() || !(0..=HANDOFF_VALIDITY_SECONDS).contains(&lifetime) {
            return Err(HandoffError::Malformed);
        }
        if claims.exp < now.timestamp() {
            return Err(HandoffError::Expired);
        }

        let issued_at = Utc
            .timestamp_opt(claims.iat, 0)
            .single()
            .ok_or(HandoffError::Malformed)?;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or(HandoffError::Malformed)?;

        Ok(VerifiedHandoff {
            session_id: SessionId::from_string(claims.session_id),
            issued_at,
            expires_at,
        })
    }
}
