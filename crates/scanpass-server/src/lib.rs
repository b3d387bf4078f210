//! Scanpass Server - Axum-based HTTP API
//!
//! This crate exposes the QR login handshake and the account endpoints over
//! JSON routes.

pub mod auth;
pub mod http;
pub mod state;
pub mod tls;

pub use http::create_router;
pub use state::AppState;
pub use tls::create_rustls_config_from_files;
