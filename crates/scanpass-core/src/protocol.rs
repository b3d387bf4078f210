//! HTTP protocol message types
//!
//! Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// URI scheme used for QR payloads
pub const QR_URI_SCHEME: &str = "scanpass://login";

/// Lifecycle status of a QR login session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, waiting for a scanner to prove it read the code
    Pending,
    /// Proven by a scanner, waiting for its decision
    Scanned,
    /// Approved by the scanner
    Authenticated,
    /// Denied by the scanner
    Denied,
    /// Time-to-live elapsed before a decision
    Expired,
}

impl SessionStatus {
    /// Whether no further transition can leave this status
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Authenticated | SessionStatus::Denied | SessionStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Scanned => "scanned",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Denied => "denied",
            SessionStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scanner decision on a scanned session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Deny,
}

/// Coarse location hint for the requester, supplied by the surrounding system
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoHint {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
}

/// What the requester looked like when it created the session.
///
/// Shown to the scanner for confirmation and reused when the requester's own
/// application session is minted. Never interpreted by the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequesterContext {
    /// Network origin of the requester
    pub ip_address: String,
    /// Device descriptor (usually the user agent)
    pub device: String,
    /// Optional geo hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoHint>,
}

/// Data encoded into the QR code shown on the requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub session_id: String,
    /// Base64url-encoded session secret
    pub secret: String,
}

impl QrPayload {
    /// Render as `scanpass://login?session=<id>&secret=<secret>`
    pub fn to_uri(&self) -> String {
        format!(
            "{}?session={}&secret={}",
            QR_URI_SCHEME, self.session_id, self.secret
        )
    }
}

/// Response to session initiation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub session_id: String,
    pub secret: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Ready-to-render QR content
    pub qr_uri: String,
}

/// Proof-of-scan request sent by the scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProveScanRequest {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub token: String,
    /// Scanner's claimed epoch seconds
    pub timestamp: Option<i64>,
    /// Ask for a handoff token for the following decision
    #[serde(default)]
    pub issue_handoff: bool,
}

/// Proof-of-scan response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProveScanResponse {
    pub requester_context: RequesterContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_token: Option<String>,
}

/// Approve/deny request; either field identifies the session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecideRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub handoff_token: Option<String>,
}

/// Status poll response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub status: SessionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qr_uri() {
        let payload = QrPayload {
            session_id: "qr_0a1b2c".to_string(),
            secret: "c2VjcmV0LXNlY3JldA".to_string(),
        };
        let uri = payload.to_uri();
        assert_eq!(
            uri,
            "scanpass://login?session=qr_0a1b2c&secret=c2VjcmV0LXNlY3JldA"
        );
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ResolveResponse {
            status: SessionStatus::Authenticated,
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"authenticated"}"#);
        assert!(SessionStatus::Denied.is_terminal());
        assert!(!SessionStatus::Scanned.is_terminal());
    }

    #[test]
    fn test_prove_scan_request_defaults() {
        let req: ProveScanRequest = serde_json::from_str(r#"{"sessionId":"qr_1"}"#).unwrap();
        assert_eq!(req.session_id, "qr_1");
        assert!(req.token.is_empty());
        assert!(req.timestamp.is_none());
        assert!(!req.issue_handoff);
    }
}
