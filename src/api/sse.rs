//! Legacy push transport: `GET /sse` streams server messages, `POST /messages`
//! carries client messages.
//!
//! Each session runs its own [`ProtocolServer`] over an in-memory duplex pipe
//! of newline-delimited JSON-RPC. The SSE response reads from one end; posted
//! messages are written to it by a pump task.

use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream::{self, Stream, StreamExt};
use rmcp::ServiceExt;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{AppState, SessionGuard, json_rpc_error, unauthorized};
use crate::server::{GatewayConnection, ProtocolServer, SessionIdentity};
use crate::session::{ShutdownSignal, TransportKind};
use crate::types::SessionId;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub(super) struct MessageQuery {
    #[serde(rename = "sessionId", default)]
    session_id: String,
}

pub(super) async fn open_stream(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let outcome = state.authenticate(&headers).await;
    if let Some(error) = outcome.error() {
        return unauthorized(&state, &headers, error).await;
    }

    let id = SessionId::generate();
    let (signal, shutdown_rx) = ShutdownSignal::new();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    if let Err(e) = state.sessions().register(
        id.clone(),
        TransportKind::LegacyPush,
        GatewayConnection::new(signal, Some(inbound_tx)),
    ) {
        warn!("Failed to register SSE session: {}", e);
        return json_rpc_error(StatusCode::INTERNAL_SERVER_ERROR, -32603, "Internal server error");
    }
    info!(session_id = %id, method = ?outcome.method(), "New SSE connection");

    let (gateway_end, server_end) = tokio::io::duplex(PIPE_CAPACITY);
    let (gateway_read, gateway_write) = tokio::io::split(gateway_end);
    let (server_read, server_write) = tokio::io::split(server_end);

    tokio::spawn(pump_inbound(inbound_rx, gateway_write, shutdown_rx));

    let identity = SessionIdentity::new(id.clone(), TransportKind::LegacyPush, &outcome);
    let server_state = state.clone();
    let server_id = id.clone();
    tokio::spawn(async move {
        match ProtocolServer::new(identity)
            .serve((server_read, server_write))
            .await
        {
            Ok(running) => {
                if let Err(e) = server_state.sessions().activate(&server_id) {
                    debug!("Session ended before activation: {}", e);
                }
                let _ = running.waiting().await;
            }
            Err(e) => debug!(session_id = %server_id, "SSE session handshake ended: {}", e),
        }
        server_state.sessions().terminate(&server_id);
    });

    let guard = SessionGuard::new(state, id.clone());
    Sse::new(event_stream(&id, gateway_read, guard))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// `endpoint` event, then one `message` event per line the server writes.
fn event_stream(
    id: &SessionId,
    reader: tokio::io::ReadHalf<DuplexStream>,
    guard: SessionGuard,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + use<> {
    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?sessionId={}", id));

    let messages = stream::unfold(
        (BufReader::new(reader).lines(), guard),
        |(mut lines, guard)| async move {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let event = Event::default().event("message").data(line);
                    Some((Ok(event), (lines, guard)))
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(session_id = %guard.id, "SSE stream error: {}", e);
                    None
                }
            }
        },
    );

    stream::once(async move { Ok(endpoint) }).chain(messages)
}

/// Forward posted messages into the server's pipe until the session closes.
async fn pump_inbound(
    mut inbound: mpsc::UnboundedReceiver<String>,
    mut writer: WriteHalf<DuplexStream>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            message = inbound.recv() => {
                let Some(message) = message else { break };
                let line = format!("{}\n", message);
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            _ = &mut shutdown => break,
        }
    }

    // EOF on the server side ends its service loop.
    let _ = writer.shutdown().await;
}

pub(super) async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Response {
    let id = SessionId::new(query.session_id);
    let no_transport = || {
        (
            StatusCode::BAD_REQUEST,
            format!("No transport found for sessionId {}", id),
        )
            .into_response()
    };

    let Some(session) = state
        .sessions()
        .lookup(&id)
        .filter(|s| s.kind() == TransportKind::LegacyPush)
    else {
        return no_transport();
    };

    let message: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Invalid message: {}", e)).into_response();
        }
    };

    debug!(session_id = %id, "SSE message");
    if !session.connection().deliver(message.to_string()) {
        return no_transport();
    }

    (StatusCode::ACCEPTED, "Accepted").into_response()
}
