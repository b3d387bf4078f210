//! Storage for QR sessions
//!
//! [`SessionStore`] is the contract the handshake needs from persistence:
//! record-level create and read, plus a conditional update that only applies
//! when the stored status still matches what the caller saw.
//!
//! [`SessionStorage`] implements it in memory, optionally persisted to
//! `~/.config/scanpass/sessions.json`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scanpass_core::SessionStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::session::{ActorId, QrSession, SessionId, RETENTION_SECONDS};
use crate::state::{coerce_expiry, Transition};

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session already exists: {0}")]
    Duplicate(String),
    #[error("Session is {observed}, expected {expected}")]
    Conflict {
        expected: SessionStatus,
        observed: SessionStatus,
    },
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Configuration directory not found")]
    NoConfigDir,
}

impl StoreError {
    /// Whether the failure is infrastructure-level and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Unavailable(_))
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Mutation applied by a conditional update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPatch {
    pub status: SessionStatus,
    /// Scanner to bind; ignored if one is already bound
    pub authorized_by: Option<ActorId>,
}

impl SessionPatch {
    fn apply_to(&self, session: &mut QrSession) {
        session.status = self.status;
        if session.authorized_by.is_none() {
            session.authorized_by = self.authorized_by.clone();
        }
    }
}

impl From<Transition> for SessionPatch {
    fn from(transition: Transition) -> Self {
        Self {
            status: transition.to,
            authorized_by: transition.bind_actor,
        }
    }
}

/// Persistence contract for QR sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a new session
    async fn create(&self, session: QrSession) -> StoreResult<QrSession>;

    /// Load a session, with lazy expiry applied as of `now`
    async fn get_by_id(&self, id: &SessionId, now: DateTime<Utc>) -> StoreResult<QrSession>;

    /// Apply `patch` only if the session's status (after expiry coercion at
    /// `now`) is still `expected`. Returns the updated session.
    async fn conditional_update(
        &self,
        id: &SessionId,
        expected: SessionStatus,
        patch: SessionPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<QrSession>;
}

/// Stored data structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredData {
    /// Sessions indexed by ID
    sessions: HashMap<String, QrSession>,
}

/// Session storage with optional file persistence
pub struct SessionStorage {
    /// Path to the storage file, if persisted
    path: Option<PathBuf>,
    /// In-memory copy of all sessions
    data: Arc<RwLock<StoredData>>,
}

impl SessionStorage {
    /// Create storage at the default path
    pub async fn new() -> StoreResult<Self> {
        let path = Self::default_path()?;
        Self::with_path(path).await
    }

    /// Create storage that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Arc::new(RwLock::new(StoredData::default())),
        }
    }

    /// Create storage at a specific path
    ///
    /// Loads existing data from disk if present.
    pub async fn with_path(path: PathBuf) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = if tokio::fs::try_exists(&path).await? {
            let contents = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str(&contents) {
                Ok(data) => {
                    info!("Loaded session storage from {:?}", path);
                    data
                }
                Err(e) => {
                    warn!("Failed to parse session storage, starting fresh: {}", e);
                    StoredData::default()
                }
            }
        } else {
            debug!("No existing session storage, creating new");
            StoredData::default()
        };

        Ok(Self {
            path: Some(path),
            data: Arc::new(RwLock::new(data)),
        })
    }

    /// Get the default storage path (~/.config/scanpass/sessions.json)
    pub fn default_path() -> StoreResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(StoreError::NoConfigDir)?;
        Ok(config_dir.join("scanpass").join("sessions.json"))
    }

    /// Write `data` to disk; the caller holds the write lock
    async fn save(&self, data: &StoredData) -> StoreResult<()> {
        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(data)?;
            tokio::fs::write(path, json).await?;
            debug!("Saved session storage to {:?}", path);
        }
        Ok(())
    }

    /// Number of stored sessions
    pub async fn len(&self) -> usize {
        self.data.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Delete sessions that expired more than `grace` ago and can no longer change.
    ///
    /// Returns how many were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>, grace: Duration) -> StoreResult<usize> {
        let mut data = self.data.write().await;
        let removed = prune(&mut data.sessions, now, grace);
        if removed > 0 {
            self.save(&data).await?;
            info!("Purged {} expired sessions", removed);
        }
        Ok(removed)
    }
}

/// Drop sessions more than `grace` past expiry; those can no longer change
fn prune(sessions: &mut HashMap<String, QrSession>, now: DateTime<Utc>, grace: Duration) -> usize {
    let before = sessions.len();
    sessions.retain(|_, s| now <= s.expires_at + grace);
    before - sessions.len()
}

#[async_trait]
impl SessionStore for SessionStorage {
    async fn create(&self, session: QrSession) -> StoreResult<QrSession> {
        let id = session.id.to_string();
        let mut data = self.data.write().await;
        if data.sessions.contains_key(&id) {
            return Err(StoreError::Duplicate(id));
        }

        // Clean up old sessions while we hold the lock
        let removed = prune(
            &mut data.sessions,
            session.created_at,
            Duration::seconds(RETENTION_SECONDS),
        );
        if removed > 0 {
            debug!("Pruned {} old sessions", removed);
        }
        data.sessions.insert(id.clone(), session.clone());
        self.save(&data).await?;
        debug!("Stored session {}", id);
        Ok(session)
    }

    async fn get_by_id(&self, id: &SessionId, now: DateTime<Utc>) -> StoreResult<QrSession> {
        {
            let data = self.data.read().await;
            let session = data
                .sessions
                .get(id.as_str())
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if !session.is_expired_at(now) || session.status.is_terminal() {
                return Ok(session.clone());
            }
        }

        // Expiry is due; re-check and persist it under the write lock
        let mut data = self.data.write().await;
        let session = data
            .sessions
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let changed = coerce_expiry(session, now);
        let session = session.clone();
        if changed {
            info!("Session {} expired", id);
            self.save(&data).await?;
        }
        Ok(session)
    }

    async fn conditional_update(
        &self,
        id: &SessionId,
        expected: SessionStatus,
        patch: SessionPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<QrSession> {
        let mut data = self.data.write().await;
        let session = data
            .sessions
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let expired_now = coerce_expiry(session, now);
        if session.status != expected {
            let observed = session.status;
            if expired_now {
                self.save(&data).await?;
            }
            return Err(StoreError::Conflict { expected, observed });
        }

        patch.apply_to(session);
        let session = session.clone();
        self.save(&data).await?;
        debug!("Session {} moved {} -> {}", id, expected, session.status);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanpass_core::RequesterContext;
    use tempfile::tempdir;

    fn scanned_patch(actor: &str) -> SessionPatch {
        SessionPatch {
            status: SessionStatus::Scanned,
            authorized_by: Some(ActorId::new(actor)),
        }
    }

    #[tokio::test]
    async fn test_storage_crud() {
        let storage = SessionStorage::in_memory();
        let now = Utc::now();
        let session = QrSession::new(RequesterContext::default(), now);
        let id = session.id.clone();

        storage.create(session.clone()).await.unwrap();
        assert!(matches!(
            storage.create(session).await,
            Err(StoreError::Duplicate(_))
        ));

        let loaded = storage.get_by_id(&id, now).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Pending);

        let missing = storage.get_by_id(&SessionId::new(), now).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_conditional_update_is_compare_and_swap() {
        let storage = SessionStorage::in_memory();
        let now = Utc::now();
        let session = storage
            .create(QrSession::new(RequesterContext::default(), now))
            .await
            .unwrap();

        let updated = storage
            .conditional_update(&session.id, SessionStatus::Pending, scanned_patch("usr_a"), now)
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Scanned);
        assert_eq!(updated.authorized_by, Some(ActorId::new("usr_a")));

        let second = storage
            .conditional_update(&session.id, SessionStatus::Pending, scanned_patch("usr_b"), now)
            .await;
        assert!(matches!(
            second,
            Err(StoreError::Conflict {
                observed: SessionStatus::Scanned,
                ..
            })
        ));

        let stored = storage.get_by_id(&session.id, now).await.unwrap();
        assert_eq!(stored.authorized_by, Some(ActorId::new("usr_a")));
    }

    #[tokio::test]
    async fn test_patch_never_rebinds_actor() {
        let storage = SessionStorage::in_memory();
        let now = Utc::now();
        let session = storage
            .create(QrSession::new(RequesterContext::default(), now))
            .await
            .unwrap();
        storage
            .conditional_update(&session.id, SessionStatus::Pending, scanned_patch("usr_a"), now)
            .await
            .unwrap();

        let patch = SessionPatch {
            status: SessionStatus::Authenticated,
            authorized_by: Some(ActorId::new("usr_b")),
        };
        let done = storage
            .conditional_update(&session.id, SessionStatus::Scanned, patch, now)
            .await
            .unwrap();
        assert_eq!(done.authorized_by, Some(ActorId::new("usr_a")));
    }

    #[tokio::test]
    async fn test_expiry_coerced_on_read_and_update() {
        let storage = SessionStorage::in_memory();
        let now = Utc::now();
        let session = storage
            .create(QrSession::new(RequesterContext::default(), now))
            .await
            .unwrap();
        let late = now + Duration::seconds(301);

        let result = storage
            .conditional_update(&session.id, SessionStatus::Pending, scanned_patch("usr_a"), late)
            .await;
        assert!(matches!(
            result,
            Err(StoreError::Conflict {
                observed: SessionStatus::Expired,
                ..
            })
        ));

        // Coercion was persisted: even an earlier clock now sees expired
        let loaded = storage.get_by_id(&session.id, now).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Expired);
        assert!(loaded.authorized_by.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_updates_single_winner() {
        let storage = Arc::new(SessionStorage::in_memory());
        let now = Utc::now();
        let session = storage
            .create(QrSession::new(RequesterContext::default(), now))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let storage = storage.clone();
            let id = session.id.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .conditional_update(
                        &id,
                        SessionStatus::Pending,
                        scanned_patch(&format!("usr_{i}")),
                        now,
                    )
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_storage_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let now = Utc::now();

        let session = {
            let storage = SessionStorage::with_path(path.clone()).await.unwrap();
            let session = storage
                .create(QrSession::new(RequesterContext::default(), now))
                .await
                .unwrap();
            storage
                .conditional_update(&session.id, SessionStatus::Pending, scanned_patch("usr_a"), now)
                .await
                .unwrap();
            session
        };

        // Reload from disk
        let storage = SessionStorage::with_path(path).await.unwrap();
        let loaded = storage.get_by_id(&session.id, now).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Scanned);
        assert_eq!(loaded.secret, session.secret);
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let storage = SessionStorage::with_path(path).await.unwrap();
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let storage = SessionStorage::in_memory();
        let now = Utc::now();
        let old = storage
            .create(QrSession::new(RequesterContext::default(), now))
            .await
            .unwrap();
        storage
            .create(QrSession::new(
                RequesterContext::default(),
                now + Duration::minutes(20),
            ))
            .await
            .unwrap();

        let later = now + Duration::minutes(20);
        let removed = storage
            .purge_expired(later, Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(matches!(
            storage.get_by_id(&old.id, later).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_create_prunes_long_expired_sessions() {
        let storage = SessionStorage::in_memory();
        let start = Utc::now();
        for _ in 0..50 {
            storage
                .create(QrSession::new(RequesterContext::default(), start))
                .await
                .unwrap();
        }

        // Still inside the retention window: nothing goes
        let soon = start + Duration::minutes(30);
        storage
            .create(QrSession::new(RequesterContext::default(), soon))
            .await
            .unwrap();
        assert_eq!(storage.len().await, 51);

        let month = start + Duration::days(30);
        let fresh = storage
            .create(QrSession::new(RequesterContext::default(), month))
            .await
            .unwrap();
        assert_eq!(storage.len().await, 1);
        assert!(storage.get_by_id(&fresh.id, month).await.is_ok());
    }
}
