//! Scanpass Core - Shared types and protocol definitions
//!
//! This crate provides the configuration, error and wire types used across
//! all scanpass components.

pub mod config;
pub mod error;
pub mod protocol;

pub use config::{Config, MAX_APP_SESSION_HOURS};
pub use error::{Error, Result};
pub use protocol::{
    Decision, DecideRequest, GeoHint, InitiateResponse, ProveScanRequest, ProveScanResponse,
    QrPayload, RequesterContext, ResolveResponse, SessionStatus,
};
