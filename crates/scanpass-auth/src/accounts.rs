//! Users, application sessions and login activity
//!
//! This is the session-issuance side of the handshake: it authenticates
//! scanners by bearer token and mints the requester's own session once a QR
//! login is approved. Tokens are only kept as SHA-256 hashes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::handshake::RequesterGrant;
use crate::session::{ActorId, RETENTION_SECONDS};

/// Default application session lifetime in hours
pub const APP_SESSION_HOURS: i64 = 24;

/// How many login activity entries are kept per user
pub const ACTIVITY_LIMIT: usize = 20;

/// Account errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("Username already taken: {0}")]
    UsernameTaken(String),
    #[error("Invalid username")]
    InvalidUsername,
    #[error("Unknown user: {0}")]
    UnknownUser(String),
}

pub type AccountResult<T> = Result<T, AccountError>;

/// A registered user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// An application session (what the `session` cookie refers to)
#[derive(Debug, Clone)]
struct AppSession {
    id: String,
    user_id: String,
    device_info: String,
    ip_address: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Public view of an application session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSessionInfo {
    pub id: String,
    pub user_id: String,
    pub device_info: String,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&AppSession> for AppSessionInfo {
    fn from(s: &AppSession) -> Self {
        Self {
            id: s.id.clone(),
            user_id: s.user_id.clone(),
            device_info: s.device_info.clone(),
            ip_address: s.ip_address.clone(),
            created_at: s.created_at,
            expires_at: s.expires_at,
        }
    }
}

/// A freshly minted session and its bearer token
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub info: AppSessionInfo,
    /// Plaintext token; only available at issuance
    pub token: String,
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub session_id: String,
}

impl Identity {
    pub fn actor(&self) -> ActorId {
        ActorId::new(self.user_id.clone())
    }
}

/// How a login happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginMethod {
    /// Requester signed in through an approved QR handshake
    Qr,
    /// Scanner proved a QR code
    QrScan,
    /// Session issued out of band by the operator
    Bootstrap,
}

/// One login event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginActivity {
    pub id: String,
    pub user_id: String,
    pub method: LoginMethod,
    pub timestamp: DateTime<Utc>,
    pub device_info: String,
    pub success: bool,
}

#[derive(Debug, Default)]
struct Accounts {
    users: HashMap<String, User>,
    /// Sessions indexed by token hash
    sessions: HashMap<String, AppSession>,
    /// QR sessions that already produced a requester session, with their expiry
    granted: HashMap<String, DateTime<Utc>>,
    activity: Vec<LoginActivity>,
}

/// In-memory account store
pub struct AccountStore {
    inner: RwLock<Accounts>,
    clock: Arc<dyn Clock>,
    session_ttl: Duration,
}

impl AccountStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_session_ttl(clock, Duration::hours(APP_SESSION_HOURS))
    }

    pub fn with_session_ttl(clock: Arc<dyn Clock>, session_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Accounts::default()),
            clock,
            session_ttl,
        }
    }

    /// Register a user
    pub async fn create_user(&self, username: &str) -> AccountResult<User> {
        let username = username.trim();
        if username.is_empty() || username.len() > 64 {
            return Err(AccountError::InvalidUsername);
        }

        let mut accounts = self.inner.write().await;
        if accounts.users.values().any(|u| u.username == username) {
            return Err(AccountError::UsernameTaken(username.to_string()));
        }

        let user = User {
            id: prefixed_id("usr"),
            username: username.to_string(),
            created_at: self.clock.now(),
        };
        accounts.users.insert(user.id.clone(), user.clone());
        info!("Created user {}", user.id);
        Ok(user)
    }

    /// Mint an application session for a user
    pub async fn issue_session(
        &self,
        user_id: &str,
        device_info: &str,
        ip_address: &str,
    ) -> AccountResult<IssuedSession> {
        let mut accounts = self.inner.write().await;
        self.issue_locked(&mut accounts, user_id, device_info, ip_address)
    }

    fn issue_locked(
        &self,
        accounts: &mut Accounts,
        user_id: &str,
        device_info: &str,
        ip_address: &str,
    ) -> AccountResult<IssuedSession> {
        if !accounts.users.contains_key(user_id) {
            return Err(AccountError::UnknownUser(user_id.to_string()));
        }

        let now = self.clock.now();
        accounts.sessions.retain(|_, s| s.expires_at >= now);

        let token = generate_token();
        let session = AppSession {
            id: prefixed_id("ses"),
            user_id: user_id.to_string(),
            device_info: device_info.to_string(),
            ip_address: ip_address.to_string(),
            created_at: now,
            expires_at: now + self.session_ttl,
        };
        let info = AppSessionInfo::from(&session);
        accounts.sessions.insert(hash_token(&token), session);
        info!("Issued session {} for user {}", info.id, user_id);

        Ok(IssuedSession { info, token })
    }

    /// Mint the requester's session for an approved QR login.
    ///
    /// The session is bound to the requester's own context, not the scanner's.
    /// Returns `None` if this QR session already produced one.
    pub async fn issue_for_handshake(
        &self,
        grant: &RequesterGrant,
    ) -> AccountResult<Option<IssuedSession>> {
        let mut accounts = self.inner.write().await;

        // A QR session is only resolvable until storage forgets it
        let now = self.clock.now();
        let retention = Duration::seconds(RETENTION_SECONDS);
        accounts
            .granted
            .retain(|_, expires_at| now <= *expires_at + retention);

        if accounts.granted.contains_key(grant.session_id.as_str()) {
            return Ok(None);
        }
        let requester = &grant.requester_context;
        let issued = self.issue_locked(
            &mut accounts,
            grant.user.as_str(),
            &requester.device,
            &requester.ip_address,
        )?;
        accounts
            .granted
            .insert(grant.session_id.to_string(), grant.expires_at);
        Ok(Some(issued))
    }

    /// Resolve a bearer token to its identity
    pub async fn authenticate(&self, token: &str) -> Option<Identity> {
        if token.is_empty() {
            return None;
        }
        let accounts = self.inner.read().await;
        let session = accounts.sessions.get(&hash_token(token))?;
        if self.clock.now() > session.expires_at {
            return None;
        }
        Some(Identity {
            user_id: session.user_id.clone(),
            session_id: session.id.clone(),
        })
    }

    /// Revoke the session behind `token`
    pub async fn revoke(&self, token: &str) -> bool {
        let mut accounts = self.inner.write().await;
        match accounts.sessions.remove(&hash_token(token)) {
            Some(session) => {
                info!("Revoked session {}", session.id);
                true
            }
            None => false,
        }
    }

    /// Active sessions for a user
    pub async fn sessions_for(&self, user_id: &str) -> Vec<AppSessionInfo> {
        let now = self.clock.now();
        let accounts = self.inner.read().await;
        let mut sessions: Vec<AppSessionInfo> = accounts
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.expires_at >= now)
            .map(AppSessionInfo::from)
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Append a login event
    pub async fn record_login(
        &self,
        user_id: &str,
        method: LoginMethod,
        device_info: &str,
        success: bool,
    ) -> LoginActivity {
        let entry = LoginActivity {
            id: prefixed_id("log"),
            user_id: user_id.to_string(),
            method,
            timestamp: self.clock.now(),
            device_info: device_info.to_string(),
            success,
        };
        let mut accounts = self.inner.write().await;
        accounts.activity.push(entry.clone());
        let count = accounts
            .activity
            .iter()
            .filter(|a| a.user_id == user_id)
            .count();
        if count > ACTIVITY_LIMIT {
            if let Some(oldest) = accounts.activity.iter().position(|a| a.user_id == user_id) {
                accounts.activity.remove(oldest);
            }
        }
        entry
    }

    /// Most recent login events for a user, oldest first
    pub async fn activity_for(&self, user_id: &str) -> Vec<LoginActivity> {
        let accounts = self.inner.read().await;
        let entries: Vec<LoginActivity> = accounts
            .activity
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        let skip = entries.len().saturating_sub(ACTIVITY_LIMIT);
        entries.into_iter().skip(skip).collect()
    }
}

fn prefixed_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Generate a secure random token
fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    BASE64.encode(bytes)
}

/// Hash a token for storage
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let result = hasher.finalize();
    BASE64.encode(result)
}
