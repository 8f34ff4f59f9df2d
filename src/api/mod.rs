// HTTP surface of the gateway

mod sse;
mod streamable;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, HeaderName, Method, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::auth::AuthError;
use crate::server::GatewayState;
use crate::types::{SessionId, TrustDomain};

pub type AppState = Arc<GatewayState>;

/// Path of the RFC 9728 protected-resource metadata document.
pub const RESOURCE_METADATA_PATH: &str = "/.well-known/oauth-protected-resource";

const MCP_SESSION_ID: HeaderName = HeaderName::from_static("mcp-session-id");

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/sse", get(sse::open_stream))
        .route("/messages", post(sse::post_message))
        .route(
            "/mcp",
            post(streamable::handle_post)
                .get(method_not_allowed)
                .delete(method_not_allowed),
        )
        .route(RESOURCE_METADATA_PATH, get(resource_metadata))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer()),
        )
        .with_state(state)
}

/// CORS for browser-based MCP clients. The request origin is mirrored back.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            MCP_SESSION_ID,
        ])
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .expose_headers([header::WWW_AUTHENTICATE, MCP_SESSION_ID])
        .max_age(Duration::from_secs(86400))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn method_not_allowed(method: Method) -> Response {
    debug!("Received {} MCP request", method);
    json_rpc_error(StatusCode::METHOD_NOT_ALLOWED, -32000, "Method not allowed.")
}

/// RFC 9728 protected-resource metadata.
async fn resource_metadata(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let settings = state.settings().await;
    let base = resource_base(settings.public_base_url.as_deref(), &headers);

    let authorization_servers: Vec<String> = if settings.auth.cf_access_configured() {
        vec![
            TrustDomain::normalize(&settings.auth.cf_access_team_domain).into_inner(),
        ]
    } else {
        Vec::new()
    };

    Json(json!({
        "resource": base,
        "authorization_servers": authorization_servers,
        "bearer_methods_supported": ["header"],
    }))
}

/// Base URL advertised to clients: the configured public URL, else `https://<Host>`.
fn resource_base(public_base_url: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(base) = public_base_url {
        return base.to_string();
    }

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("https://{}", host)
}

/// 401 with an RFC 9728 `WWW-Authenticate` challenge.
async fn unauthorized(state: &GatewayState, headers: &HeaderMap, error: &AuthError) -> Response {
    let settings = state.settings().await;
    let base = resource_base(settings.public_base_url.as_deref(), headers);
    warn!("Rejected request: {}", error);

    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            format!(
                "Bearer resource_metadata=\"{}{}\"",
                base, RESOURCE_METADATA_PATH
            ),
        )],
        Json(json!({
            "error": "invalid_token",
            "error_description": error.to_string(),
        })),
    )
        .into_response()
}

fn json_rpc_error(status: StatusCode, code: i64, message: &str) -> Response {
    (
        status,
        Json(json!({
            "jsonrpc": "2.0",
            "error": { "code": code, "message": message },
            "id": null,
        })),
    )
        .into_response()
}

/// Terminates its session when dropped, i.e. when the response stream that
/// owns it ends, errors, or is abandoned by the peer.
struct SessionGuard {
    state: AppState,
    id: SessionId,
}

impl SessionGuard {
    fn new(state: AppState, id: SessionId) -> Self {
        Self { state, id }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.state.sessions().terminate(&self.id) {
            debug!(session_id = %self.id, "Response stream ended");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::verifier::tests::{POLICY_AUD, StubProvider, TEAM_DOMAIN, valid_token};
    use crate::auth::{AccessTokenVerifier, AuthConfig, Authenticator};
    use crate::server::RuntimeSettings;
    use crate::session::TransportKind;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use futures::StreamExt;
    use tower::ServiceExt;

    const ACCEPT_BOTH: &str = "application/json, text/event-stream";

    fn state_with(auth: AuthConfig, public_base_url: Option<&str>) -> AppState {
        let provider = StubProvider::new();
        let authenticator = Authenticator::new(AccessTokenVerifier::new(provider));
        Arc::new(GatewayState::new(
            authenticator,
            RuntimeSettings {
                auth,
                public_base_url: public_base_url.map(str::to_string),
            },
        ))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn initialize_request() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "0.0.1" }
            }
        })
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(state_with(AuthConfig::with_local_secret("s3cr3t"), None));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn test_mcp_get_and_delete_not_allowed() {
        let app = create_router(state_with(AuthConfig::default(), None));
        for method in [Method::GET, Method::DELETE] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method(method)
                        .uri("/mcp")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            let body = body_json(response).await;
            assert_eq!(body["error"]["code"], -32000);
            assert_eq!(body["error"]["message"], "Method not allowed.");
            assert_eq!(body["id"], Value::Null);
        }
    }

    #[tokio::test]
    async fn test_unauthorized_challenge_uses_host() {
        let app = create_router(state_with(AuthConfig::with_local_secret("s3cr3t"), None));
        let response = app
            .oneshot(
                Request::post("/mcp")
                    .header(header::HOST, "mcp.example.com")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Bearer resource_metadata=\"https://mcp.example.com/.well-known/oauth-protected-resource\""
        );
        let body = body_json(response).await;
        assert_eq!(body["error"], "invalid_token");
        assert_eq!(body["error_description"], "Invalid Bearer token");
    }

    #[tokio::test]
    async fn test_unauthorized_challenge_uses_public_base_url() {
        let app = create_router(state_with(
            AuthConfig::with_local_secret("s3cr3t"),
            Some("https://gateway.example.org"),
        ));
        let response = app
            .oneshot(Request::get("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Bearer resource_metadata=\"https://gateway.example.org/.well-known/oauth-protected-resource\""
        );
        let body = body_json(response).await;
        assert_eq!(body["error_description"], "Authentication required");
    }

    #[tokio::test]
    async fn test_invalid_access_token_rejected_despite_valid_bearer() {
        let auth =
            AuthConfig::with_cloudflare_access(TEAM_DOMAIN, POLICY_AUD).and_local_secret("s3cr3t");
        let app = create_router(state_with(auth, None));
        let response = app
            .oneshot(
                Request::post("/mcp")
                    .header("cf-access-jwt-assertion", "aaaaaaaa.bbbbbbbb.cccccccc")
                    .header(header::AUTHORIZATION, "Bearer s3cr3t")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error_description"], "Invalid Cloudflare Access token");
    }

    #[tokio::test]
    async fn test_cors_preflight_mirrors_origin() {
        let app = create_router(state_with(AuthConfig::with_local_secret("s3cr3t"), None));
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/mcp")
                    .header(header::ORIGIN, "https://inspector.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "authorization")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_success());
        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://inspector.example"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "86400");
    }

    #[tokio::test]
    async fn test_cors_headers_on_rejection() {
        let app = create_router(state_with(AuthConfig::with_local_secret("s3cr3t"), None));
        let response = app
            .oneshot(
                Request::post("/mcp")
                    .header(header::ORIGIN, "https://inspector.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://inspector.example"
        );
        let exposed = headers[header::ACCESS_CONTROL_EXPOSE_HEADERS]
            .to_str()
            .unwrap()
            .to_ascii_lowercase();
        assert!(exposed.contains("www-authenticate"));
    }

    #[tokio::test]
    async fn test_resource_metadata() {
        let auth = AuthConfig::with_cloudflare_access(format!("{}/", TEAM_DOMAIN), POLICY_AUD);
        let app = create_router(state_with(auth, Some("https://gateway.example.org")));
        let response = app
            .oneshot(
                Request::get(RESOURCE_METADATA_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["resource"], "https://gateway.example.org");
        assert_eq!(body["authorization_servers"], json!([TEAM_DOMAIN]));
        assert_eq!(body["bearer_methods_supported"], json!(["header"]));
    }

    #[tokio::test]
    async fn test_messages_unknown_session() {
        let app = create_router(state_with(AuthConfig::default(), None));
        let response = app
            .oneshot(
                Request::post("/messages?sessionId=nope")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(initialize_request().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_text(response).await,
            "No transport found for sessionId nope"
        );
    }

    #[tokio::test]
    async fn test_sse_session_lifecycle() {
        let state = state_with(AuthConfig::with_local_secret("s3cr3t"), None);
        let app = create_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::get("/sse")
                    .header(header::AUTHORIZATION, "Bearer s3cr3t")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.sessions().count_by_kind(TransportKind::LegacyPush), 1);

        let mut events = response.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let first = String::from_utf8(first.to_vec()).unwrap();
        assert!(first.contains("event: endpoint"));

        let endpoint = first
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap()
            .to_string();
        assert!(endpoint.starts_with("/messages?sessionId="));

        // Malformed body
        let response = app
            .clone()
            .oneshot(
                Request::post(endpoint.as_str())
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(
                Request::post(endpoint.as_str())
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(initialize_request().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let reply = tokio::time::timeout(Duration::from_secs(5), async {
            let mut collected = String::new();
            while let Some(Ok(chunk)) = events.next().await {
                collected.push_str(&String::from_utf8_lossy(&chunk));
                if collected.contains("\"result\"") {
                    break;
                }
            }
            collected
        })
        .await
        .unwrap();
        assert!(reply.contains("event: message"));
        assert!(reply.contains("protocolVersion"));

        // Peer goes away: the session is released.
        drop(events);
        assert_eq!(state.sessions().count(), 0);

        let session_id = endpoint.trim_start_matches("/messages?sessionId=");
        let response = app
            .oneshot(
                Request::post(endpoint.as_str())
                    .body(Body::from(initialize_request().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_text(response).await,
            format!("No transport found for sessionId {}", session_id)
        );
    }

    #[tokio::test]
    async fn test_sse_stream_ends_on_terminate_all() {
        let state = state_with(AuthConfig::default(), None);
        let app = create_router(state.clone());

        let response = app
            .oneshot(Request::get("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let mut events = response.into_body().into_data_stream();
        events.next().await.unwrap().unwrap();

        assert_eq!(state.sessions().terminate_all(), 1);

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(chunk) = events.next().await {
                if chunk.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(drained.is_ok());
        assert_eq!(state.sessions().count(), 0);
    }

    #[tokio::test]
    async fn test_streamable_initialize() {
        let state = state_with(AuthConfig::with_local_secret("s3cr3t"), None);
        let app = create_router(state.clone());

        let response = app
            .oneshot(
                Request::post("/mcp")
                    .header(header::AUTHORIZATION, "Bearer s3cr3t")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::ACCEPT, ACCEPT_BOTH)
                    .body(Body::from(initialize_request().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            state.sessions().count_by_kind(TransportKind::Bidirectional),
            1
        );

        let body = tokio::time::timeout(Duration::from_secs(5), body_text(response))
            .await
            .unwrap();
        assert!(body.contains("protocolVersion"));
        assert_eq!(state.sessions().count(), 0);
    }
}
