//! Configuration types for scanpass

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Longest accepted application session lifetime (one year)
pub const MAX_APP_SESSION_HOURS: i64 = 8760;

/// Main configuration for the scanpass server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind the HTTP listener to
    pub bind: IpAddr,
    /// Server port
    pub port: u16,
    /// JSON file for persisting QR sessions (in-memory only if None)
    pub state_file: Option<PathBuf>,
    /// How many times a transient storage failure is attempted before giving up
    pub storage_attempts: u32,
    /// Delay between storage attempts, doubled after each failure
    pub storage_backoff_ms: u64,
    /// Lifetime of application sessions minted for requesters and scanners
    pub app_session_hours: i64,
    /// Whether the session cookie carries the `Secure` attribute
    pub secure_cookies: bool,
    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<PathBuf>,
    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 8080,
            state_file: None,
            storage_attempts: 3,
            storage_backoff_ms: 50,
            app_session_hours: 24,
            secure_cookies: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set bind address
    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set state file
    pub fn with_state_file(mut self, path: Option<PathBuf>) -> Self {
        self.state_file = path;
        self
    }

    /// Builder pattern: set app session lifetime
    pub fn with_app_session_hours(mut self, hours: i64) -> Self {
        self.app_session_hours = hours;
        self
    }

    /// Builder pattern: set TLS certificate and key paths
    pub fn with_tls(mut self, cert: Option<PathBuf>, key: Option<PathBuf>) -> Self {
        self.tls_cert = cert;
        self.tls_key = key;
        self
    }

    /// Builder pattern: set secure cookie flag
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    /// Whether both TLS paths are configured
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Initial delay between storage attempts
    pub fn storage_backoff(&self) -> Duration {
        Duration::from_millis(self.storage_backoff_ms)
    }

    /// Check the values that can't be expressed in the types
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_APP_SESSION_HOURS).contains(&self.app_session_hours) {
            return Err(Error::invalid_field(
                "app_session_hours",
                format!(
                    "{} is outside 1..={}",
                    self.app_session_hours, MAX_APP_SESSION_HOURS
                ),
            ));
        }
        if self.storage_attempts == 0 {
            return Err(Error::invalid_field("storage_attempts", "must be at least 1"));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(Error::Config(
                "TLS needs both a certificate and a key".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket address the server listens on
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.bind, self.port)
    }
}
