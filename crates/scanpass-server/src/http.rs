//! HTTP request handlers
//!
//! QR login endpoints plus account endpoints for signed-in users.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use scanpass_auth::{
    AppSessionInfo, HandshakeError, LoginActivity, LoginMethod, DEFAULT_WINDOW,
    HANDOFF_VALIDITY_SECONDS, SESSION_TTL_SECONDS, TIMESTAMP_TOLERANCE_SECONDS,
};
use scanpass_core::{
    Decision, DecideRequest, InitiateResponse, ProveScanRequest, ProveScanResponse,
    RequesterContext, ResolveResponse,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{clear_session_cookie, client_ip, extract_token, session_cookie, user_agent};
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // QR login API
        .route("/api/qr/session", post(initiate_handler))
        .route("/api/qr/session/:id", get(resolve_handler))
        .route("/api/qr/verify", post(prove_scan_handler))
        .route("/api/qr/approve", post(approve_handler))
        .route("/api/qr/deny", post(deny_handler))
        // Account API
        .route("/api/auth/logout", post(logout_handler))
        .route("/api/account/sessions", get(sessions_handler))
        .route("/api/account/activity", get(activity_handler))
        // Server info
        .route("/api/info", get(server_info_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON error response
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Not authenticated")
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            format!("Invalid request: {}", rejection.body_text()),
        )
    }
}

/// JSON body extractor that reports bad input as an [`ApiError`]
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct ApiJson<T>(T);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

impl From<HandshakeError> for ApiError {
    fn from(e: HandshakeError) -> Self {
        let status = match &e {
            HandshakeError::NotFound => StatusCode::NOT_FOUND,
            HandshakeError::StateConflict { .. } => StatusCode::GONE,
            HandshakeError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            HandshakeError::AuthorizationMismatch => StatusCode::FORBIDDEN,
            HandshakeError::InvalidProof => StatusCode::FORBIDDEN,
            HandshakeError::TimestampOutOfBounds => StatusCode::BAD_REQUEST,
            HandshakeError::InvalidHandoffToken => StatusCode::UNAUTHORIZED,
            HandshakeError::Validation(_) => StatusCode::BAD_REQUEST,
            HandshakeError::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        // Storage details stay in the logs
        let message = match &e {
            HandshakeError::Infrastructure(detail) => {
                warn!("Storage failure: {}", detail);
                "Service temporarily unavailable".to_string()
            }
            other => other.to_string(),
        };
        Self::new(status, message)
    }
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

// ============================================================================
// QR Login Handlers
// ============================================================================

/// Start a QR login for the calling (unauthenticated) device
async fn initiate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<InitiateResponse>, ApiError> {
    let context = RequesterContext {
        ip_address: client_ip(&headers),
        device: user_agent(&headers),
        geo: None,
    };

    let started = state.handshake.initiate(context).await?;
    Ok(Json(InitiateResponse {
        session_id: started.session_id.to_string(),
        qr_uri: started.payload.to_uri(),
        secret: started.payload.secret,
        created_at: started.created_at,
        expires_at: started.expires_at,
    }))
}

/// Scanner proves it read the QR code
async fn prove_scan_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<ProveScanRequest>,
) -> Result<Json<ProveScanResponse>, ApiError> {
    let identity = state.authenticate(&headers).await;
    let actor = identity.as_ref().map(|i| i.actor());

    let outcome = state.handshake.prove_scan(&request, actor.as_ref()).await?;

    if let Some(identity) = identity {
        state
            .accounts
            .record_login(&identity.user_id, LoginMethod::QrScan, "QR Scanner", true)
            .await;
    }

    Ok(Json(ProveScanResponse {
        requester_context: outcome.requester_context,
        handoff_token: outcome.handoff_token,
    }))
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<DecideRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    decide(&state, &headers, &request, Decision::Approve).await
}

async fn deny_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<DecideRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    decide(&state, &headers, &request, Decision::Deny).await
}

async fn decide(
    state: &AppState,
    headers: &HeaderMap,
    request: &DecideRequest,
    decision: Decision,
) -> Result<Json<SuccessResponse>, ApiError> {
    let actor = state.authenticate(headers).await.map(|i| i.actor());
    state
        .handshake
        .decide(request, decision, actor.as_ref())
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Requester polls for the outcome; signs it in once approved
async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let resolution = state.handshake.resolve(&id).await?;
    let body = Json(ResolveResponse {
        status: resolution.status,
    });

    let Some(grant) = resolution.grant else {
        return Ok(body.into_response());
    };

    let issued = match state.accounts.issue_for_handshake(&grant).await {
        Ok(Some(issued)) => issued,
        Ok(None) => return Ok(body.into_response()),
        Err(e) => {
            warn!("Could not issue session for QR login {}: {}", grant.session_id, e);
            return Ok(body.into_response());
        }
    };

    state
        .accounts
        .record_login(
            grant.user.as_str(),
            LoginMethod::Qr,
            &grant.requester_context.device,
            true,
        )
        .await;
    info!("QR login {} completed for {}", grant.session_id, grant.user);

    let max_age = state.config.app_session_hours * 3600;
    match session_cookie(&issued.token, max_age, state.config.secure_cookies) {
        Some(cookie) => Ok(([(header::SET_COOKIE, cookie)], body).into_response()),
        None => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build session cookie",
        )),
    }
}

// ============================================================================
// Account Handlers
// ============================================================================

/// Revoke the caller's session
async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = extract_token(&headers).ok_or_else(ApiError::unauthorized)?;
    if !state.accounts.revoke(&token).await {
        return Err(ApiError::unauthorized());
    }
    Ok((
        StatusCode::NO_CONTENT,
        [(header::SET_COOKIE, clear_session_cookie())],
    )
        .into_response())
}

/// List the caller's active sessions
async fn sessions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<AppSessionInfo>>, ApiError> {
    let identity = state
        .authenticate(&headers)
        .await
        .ok_or_else(ApiError::unauthorized)?;
    Ok(Json(state.accounts.sessions_for(&identity.user_id).await))
}

/// Recent logins for the caller
async fn activity_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<LoginActivity>>, ApiError> {
    let identity = state
        .authenticate(&headers)
        .await
        .ok_or_else(ApiError::unauthorized)?;
    Ok(Json(state.accounts.activity_for(&identity.user_id).await))
}

// ============================================================================
// Server Info
// ============================================================================

/// Server information response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Server version
    pub version: String,
    /// QR session lifetime
    pub session_ttl_seconds: i64,
    /// Token clock steps accepted on either side of the claimed time
    pub token_window: i64,
    /// Largest accepted clock skew for proofs
    pub timestamp_tolerance_seconds: u64,
    /// Handoff token lifetime
    pub handoff_validity_seconds: i64,
    /// Whether the server is serving HTTPS
    pub tls: bool,
}

/// Get server information
async fn server_info_handler(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    Json(ServerInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        session_ttl_seconds: SESSION_TTL_SECONDS,
        token_window: DEFAULT_WINDOW,
        timestamp_tolerance_seconds: TIMESTAMP_TOLERANCE_SECONDS,
        handoff_validity_seconds: HANDOFF_VALIDITY_SECONDS,
        tls: state.config.tls_enabled(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use scanpass_auth::{
        AccountStore, HandoffSigner, Handshake, Keyring, ManualClock, SessionSecret,
        SessionStorage, SigningKey, TokenClock,
    };
    use scanpass_core::Config;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const T0: i64 = 1_717_000_000;

    struct TestApp {
        router: Router,
        state: Arc<AppState>,
    }

    fn test_app() -> TestApp {
        let clock = Arc::new(ManualClock::at_epoch(T0));
        let keys = Arc::new(Keyring::new(SigningKey::new("test", b"router-test-key")));
        let handshake = Handshake::new(
            Arc::new(SessionStorage::in_memory()),
            clock.clone(),
            HandoffSigner::new(keys),
        );
        let accounts = AccountStore::new(clock);
        let state = Arc::new(AppState::new(
            Config::default(),
            Arc::new(handshake),
            Arc::new(accounts),
        ));
        TestApp {
            router: create_router(state.clone()),
            state,
        }
    }

    async fn signed_in(app: &TestApp, name: &str) -> String {
        let user = app.state.accounts.create_user(name).await.unwrap();
        app.state
            .accounts
            .issue_session(&user.id, "Phone", "10.0.0.9")
            .await
            .unwrap()
            .token
    }

    async fn send(
        app: &TestApp,
        method: &str,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, HeaderMap, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("user-agent", "TestAgent/1.0")
            .header("x-real-ip", "203.0.113.5");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, value)
    }

    fn proof_token(secret: &str, at: i64) -> String {
        let secret = SessionSecret::decode(secret).unwrap();
        TokenClock::generate(secret.as_bytes(), at)
    }

    #[tokio::test]
    async fn test_qr_login_over_http() {
        let app = test_app();
        let scanner = signed_in(&app, "alice").await;

        let (status, _, started) = send(&app, "POST", "/api/qr/session", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let session_id = started["sessionId"].as_str().unwrap().to_string();
        let secret = started["secret"].as_str().unwrap().to_string();
        assert!(started["qrUri"].as_str().unwrap().contains(&session_id));

        let verify = json!({
            "sessionId": session_id,
            "token": proof_token(&secret, T0),
            "timestamp": T0,
        });
        let (status, _, scanned) =
            send(&app, "POST", "/api/qr/verify", Some(&scanner), Some(verify)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(scanned["requesterContext"]["ipAddress"], "203.0.113.5");
        assert_eq!(scanned["requesterContext"]["device"], "TestAgent/1.0");

        let uri = format!("/api/qr/session/{session_id}");
        let (_, headers, polled) = send(&app, "GET", &uri, None, None).await;
        assert_eq!(polled["status"], "scanned");
        assert!(headers.get(header::SET_COOKIE).is_none());
        assert!(polled.get("secret").is_none());

        let (status, _, _) = send(
            &app,
            "POST",
            "/api/qr/approve",
            Some(&scanner),
            Some(json!({ "sessionId": session_id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, headers, polled) = send(&app, "GET", &uri, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(polled["status"], "authenticated");
        let cookie = headers
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.contains("HttpOnly"));

        // The requester's new session works and carries the requester's context
        let token = cookie
            .strip_prefix("session=")
            .and_then(|rest| rest.split(';').next())
            .unwrap()
            .to_string();
        let (status, _, sessions) =
            send(&app, "GET", "/api/account/sessions", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let sessions = sessions.as_array().unwrap();
        assert!(sessions
            .iter()
            .any(|s| s["deviceInfo"] == "TestAgent/1.0" && s["ipAddress"] == "203.0.113.5"));

        // Polling again does not mint a second session
        let (_, headers, _) = send(&app, "GET", &uri, None, None).await;
        assert!(headers.get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_error_status_codes() {
        let app = test_app();
        let scanner = signed_in(&app, "alice").await;
        let intruder = signed_in(&app, "mallory").await;

        let (_, _, started) = send(&app, "POST", "/api/qr/session", None, None).await;
        let session_id = started["sessionId"].as_str().unwrap().to_string();
        let secret = started["secret"].as_str().unwrap().to_string();

        let verify = json!({
            "sessionId": session_id,
            "token": proof_token(&secret, T0),
            "timestamp": T0,
        });
        let (status, _, body) =
            send(&app, "POST", "/api/qr/verify", None, Some(verify.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let skewed = json!({
            "sessionId": session_id,
            "token": proof_token(&secret, T0 + 10),
            "timestamp": T0 + 10,
        });
        let (status, _, _) = send(&app, "POST", "/api/qr/verify", Some(&scanner), Some(skewed)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let wrong = json!({ "sessionId": session_id, "token": "0123456789abcdef", "timestamp": T0 });
        let (status, _, _) = send(&app, "POST", "/api/qr/verify", Some(&scanner), Some(wrong)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _, _) =
            send(&app, "POST", "/api/qr/verify", Some(&scanner), Some(verify.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = send(&app, "POST", "/api/qr/verify", Some(&scanner), Some(verify)).await;
        assert_eq!(status, StatusCode::GONE);

        let (status, _, _) = send(
            &app,
            "POST",
            "/api/qr/deny",
            Some(&intruder),
            Some(json!({ "sessionId": session_id })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _, _) = send(&app, "GET", "/api/qr/session/qr_nope", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = send(
            &app,
            "POST",
            "/api/qr/approve",
            Some(&scanner),
            Some(json!({ "handoffToken": "not.a.token" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bad_json_gets_error_body() {
        let app = test_app();
        let scanner = signed_in(&app, "alice").await;

        for body in [r#"{not json"#, r#"{"sessionId":"qr_1","token":"x","timestamp":"soon"}"#] {
            let request = Request::builder()
                .method("POST")
                .uri("/api/qr/verify")
                .header("authorization", format!("Bearer {scanner}"))
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap();
            let response = app.router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(
                response.headers().get(header::CONTENT_TYPE).unwrap(),
                "application/json"
            );
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value: Value = serde_json::from_slice(&bytes).unwrap();
            assert!(value["error"].as_str().unwrap().starts_with("Invalid request"));
        }
    }

    #[tokio::test]
    async fn test_handoff_over_http() {
        let app = test_app();
        let scanner = signed_in(&app, "alice").await;

        let (_, _, started) = send(&app, "POST", "/api/qr/session", None, None).await;
        let session_id = started["sessionId"].as_str().unwrap().to_string();
        let secret = started["secret"].as_str().unwrap().to_string();

        let verify = json!({
            "sessionId": session_id,
            "token": proof_token(&secret, T0),
            "timestamp": T0,
            "issueHandoff": true,
        });
        let (_, _, scanned) = send(&app, "POST", "/api/qr/verify", Some(&scanner), Some(verify)).await;
        let handoff = scanned["handoffToken"].as_str().unwrap().to_string();

        let (status, _, _) = send(
            &app,
            "POST",
            "/api/qr/deny",
            Some(&scanner),
            Some(json!({ "handoffToken": handoff })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let uri = format!("/api/qr/session/{session_id}");
        let (_, _, polled) = send(&app, "GET", &uri, None, None).await;
        assert_eq!(polled["status"], "denied");
    }

    #[tokio::test]
    async fn test_logout_and_activity() {
        let app = test_app();
        let token = signed_in(&app, "alice").await;

        let (status, _, activity) =
            send(&app, "GET", "/api/account/activity", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(activity.as_array().unwrap().is_empty());

        let (status, headers, _) = send(&app, "POST", "/api/auth/logout", Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(headers
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("Max-Age=0"));

        let (status, _, _) = send(&app, "GET", "/api/account/sessions", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_server_info() {
        let app = test_app();
        let (status, _, info) = send(&app, "GET", "/api/info", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["sessionTtlSeconds"], 300);
        assert_eq!(info["tokenWindow"], 2);
        assert_eq!(info["handoffValiditySeconds"], 5);
        assert_eq!(info["tls"], false);
    }

    #[test]
    fn test_infrastructure_errors_hide_details() {
        let err = ApiError::from(HandshakeError::Infrastructure("disk full at /var".into()));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.message.contains("/var"));
    }
}
