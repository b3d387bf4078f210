//! Scanpass Auth - QR login handshake
//!
//! Lets a user already signed in on one device (the scanner) approve a login
//! on a second device (the requester) by scanning its QR code.
//!
//! # Handshake Flow
//!
//! 1. Requester calls `Handshake::initiate()` and displays the QR payload
//!    (session id + 256-bit secret)
//! 2. Scanner reads the code and submits `TokenClock::generate(secret, now)`
//!    to `Handshake::prove_scan()`, which binds the scanner to the session
//! 3. The same scanner approves or denies via `Handshake::decide()`
//! 4. Requester polls `Handshake::resolve()`; once authenticated it is issued
//!    its own application session through `AccountStore::issue_for_handshake()`
//!
//! # Example
//!
//! ```no_run
//! use scanpass_auth::{
//!     ActorId, Handshake, HandoffSigner, Keyring, SessionStorage, SigningKey, SystemClock,
//! };
//! use scanpass_core::RequesterContext;
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let keys = Arc::new(Keyring::new(SigningKey::generate()));
//!     let handshake = Handshake::new(
//!         Arc::new(SessionStorage::in_memory()),
//!         Arc::new(SystemClock),
//!         HandoffSigner::new(keys),
//!     );
//!
//!     let started = handshake.initiate(RequesterContext::default()).await.unwrap();
//!     println!("Show this QR code: {}", started.payload.to_uri());
//!
//!     // Later, the requester polls
//!     let resolution = handshake.resolve(started.session_id.as_str()).await.unwrap();
//!     println!("Status: {}", resolution.status);
//! }
//! ```

pub mod accounts;
pub mod clock;
pub mod handoff;
pub mod handshake;
pub mod session;
pub mod state;
pub mod storage;
pub mod token_clock;

pub use accounts::{
    hash_token, AccountError, AccountStore, AppSessionInfo, Identity, IssuedSession,
    LoginActivity, LoginMethod, User, APP_SESSION_HOURS,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use handoff::{
    HandoffError, HandoffSigner, KeyProvider, Keyring, SigningKey, VerifiedHandoff,
    HANDOFF_VALIDITY_SECONDS,
};
pub use handshake::{
    Handshake, HandshakeError, HandshakeResult, InitiatedSession, RequesterGrant, Resolution,
    RetryPolicy, ScanOutcome, TIMESTAMP_TOLERANCE_SECONDS,
};
pub use session::{
    ActorId, QrSession, SessionId, SessionSecret, RETENTION_SECONDS, SESSION_TTL_SECONDS,
};
pub use state::{Event, EventKind, Transition, TransitionError};
pub use storage::{SessionPatch, SessionStorage, SessionStore, StoreError, StoreResult};
pub use token_clock::{TokenClock, DEFAULT_WINDOW, STEP_SECONDS};
