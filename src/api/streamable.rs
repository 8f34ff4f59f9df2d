//! Bidirectional transport: `POST /mcp` handed to rmcp's stateless
//! streamable HTTP service.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    response::Response,
};
use futures::stream::{self, StreamExt};
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use tower::ServiceExt;
use tracing::{debug, error, info};

use super::{AppState, SessionGuard, json_rpc_error, unauthorized};
use crate::server::{GatewayConnection, ProtocolServer, SessionIdentity};
use crate::session::{ShutdownSignal, TransportKind};
use crate::types::SessionId;

pub(super) async fn handle_post(State(state): State<AppState>, request: Request) -> Response {
    let headers = request.headers().clone();
    let outcome = state.authenticate(&headers).await;
    if let Some(error) = outcome.error() {
        return unauthorized(&state, &headers, error).await;
    }

    let id = SessionId::generate();
    let (signal, shutdown_rx) = ShutdownSignal::new();
    if let Err(e) = state.sessions().register(
        id.clone(),
        TransportKind::Bidirectional,
        GatewayConnection::new(signal, None),
    ) {
        error!("Error handling MCP request: {}", e);
        return json_rpc_error(StatusCode::INTERNAL_SERVER_ERROR, -32603, "Internal server error");
    }
    debug!(session_id = %id, method = ?outcome.method(), "New connection");

    let guard = SessionGuard::new(state.clone(), id.clone());
    let identity = SessionIdentity::new(id.clone(), TransportKind::Bidirectional, &outcome);
    let service = StreamableHttpService::new(
        move || Ok(ProtocolServer::new(identity.clone())),
        Arc::new(LocalSessionManager::default()),
        StreamableHttpServerConfig {
            stateful_mode: false,
            ..Default::default()
        },
    );

    let response = match service.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    if state.sessions().activate(&id).is_ok() {
        info!(session_id = %id, status = %response.status(), "MCP request accepted");
    }

    // The session lives exactly as long as the response body.
    let (parts, body) = response.into_parts();
    let data = Body::new(body).into_data_stream().take_until(shutdown_rx);
    let guarded = stream::unfold((data, guard), |(mut data, guard)| async move {
        data.next().await.map(|chunk| (chunk, (data, guard)))
    });

    Response::from_parts(parts, Body::from_stream(guarded))
}
