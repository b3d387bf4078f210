//! Shared application state

use axum::http::HeaderMap;
use scanpass_auth::{AccountStore, Handshake, Identity};
use scanpass_core::Config;
use std::sync::Arc;

use crate::auth::extract_token;

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// QR login handshake
    pub handshake: Arc<Handshake>,
    /// Users, application sessions and login activity
    pub accounts: Arc<AccountStore>,
}

impl AppState {
    /// Create a new application state
    pub fn new(config: Config, handshake: Arc<Handshake>, accounts: Arc<AccountStore>) -> Self {
        Self {
            config,
            handshake,
            accounts,
        }
    }

    /// Identify the caller from its bearer token or session cookie
    pub async fn authenticate(&self, headers: &HeaderMap) -> Option<Identity> {
        let token = extract_token(headers)?;
        self.accounts.authenticate(&token).await
    }
}
