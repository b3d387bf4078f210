//! Request identity helpers
//!
//! Callers authenticate with `Authorization: Bearer <token>` or the `session`
//! cookie set after a QR login.

use axum::http::{header, HeaderMap, HeaderValue};

/// Name of the application session cookie
pub const SESSION_COOKIE: &str = "session";

/// Client IP headers in order of preference, and whether to take the first
/// entry of a comma-separated list
const IP_HEADERS: [(&str, bool); 4] = [
    ("x-vercel-forwarded-for", true),
    ("cf-connecting-ip", false),
    ("x-real-ip", false),
    ("x-forwarded-for", true),
];

/// Extract the caller's session token from the request headers
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Best-effort client IP from proxy headers
pub fn client_ip(headers: &HeaderMap) -> String {
    for (name, list) in IP_HEADERS {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let ip = if list {
            value.split(',').next().unwrap_or_default().trim()
        } else {
            value.trim()
        };
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    "Unknown".to_string()
}

/// The caller's user agent, or "Unknown"
pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("Unknown")
        .to_string()
}

/// Build the `Set-Cookie` value for a freshly issued session
pub fn session_cookie(token: &str, max_age_secs: i64, secure: bool) -> Option<HeaderValue> {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, token, max_age_secs
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).ok()
}

/// `Set-Cookie` value that clears the session cookie
pub fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_static("session=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}
