//! Gateway runtime: shared state, the fronted MCP server, and the HTTP
//! listener lifecycle.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use http::HeaderMap;
use rmcp::{
    ErrorData as McpError,
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api;
use crate::auth::{
    AuthConfig, AuthMethod, AuthOutcome, Authenticator, KeySetError, VerifiedPrincipal,
};
use crate::config::{GatewaySettings, check_bind_security};
use crate::session::{SessionConnection, SessionRegistry, ShutdownSignal, TransportKind};
use crate::types::SessionId;

/// Who a protocol session belongs to. Fixed when the session is created.
#[derive(Debug, Clone, Serialize)]
pub struct SessionIdentity {
    pub session_id: SessionId,
    pub transport: TransportKind,
    pub method: AuthMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<VerifiedPrincipal>,
}

impl SessionIdentity {
    pub fn new(session_id: SessionId, transport: TransportKind, outcome: &AuthOutcome) -> Self {
        Self {
            session_id,
            transport,
            method: outcome.method().unwrap_or(AuthMethod::None),
            principal: outcome.principal().cloned(),
        }
    }
}

/// MCP server exposed behind the gateway, one instance per session.
#[derive(Clone)]
pub struct ProtocolServer {
    identity: SessionIdentity,
}

impl ProtocolServer {
    pub fn new(identity: SessionIdentity) -> Self {
        Self { identity }
    }

    fn whoami_tool() -> Tool {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {}
        });
        let input_schema = match schema {
            serde_json::Value::Object(map) => map,
            _ => JsonObject::new(),
        };

        Tool {
            name: Cow::Borrowed("whoami"),
            title: Some("Who am I".to_string()),
            description: Some(Cow::Borrowed(
                "Report how this session was authenticated and the verified identity, if any.",
            )),
            input_schema: Arc::new(input_schema),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }
}

impl ServerHandler for ProtocolServer {
    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let result = ListToolsResult {
            tools: vec![Self::whoami_tool()],
            next_cursor: None,
            ..Default::default()
        };
        std::future::ready(Ok(result))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let result = match &*request.name {
            "whoami" => serde_json::to_string(&self.identity)
                .map(|text| CallToolResult {
                    content: vec![Content::text(text)],
                    structured_content: None,
                    is_error: Some(false),
                    meta: None,
                })
                .map_err(|e| McpError::internal_error(e.to_string(), None)),
            other => Err(McpError::invalid_params(
                format!("Unknown tool: {}", other),
                None,
            )),
        };
        std::future::ready(result)
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "MCP endpoint behind an authentication gateway (Cloudflare Access or bearer token)."
                    .to_string(),
            ),
        }
    }
}

/// Resource owned by a registered session: its shutdown trigger and, for
/// legacy-push sessions, the channel `POST /messages` feeds.
#[derive(Debug)]
pub struct GatewayConnection {
    shutdown: ShutdownSignal,
    inbound: Option<mpsc::UnboundedSender<String>>,
}

impl GatewayConnection {
    pub fn new(shutdown: ShutdownSignal, inbound: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self { shutdown, inbound }
    }

    /// Queue a raw JSON-RPC message for the session's protocol server.
    pub fn deliver(&self, message: String) -> bool {
        match &self.inbound {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}

impl SessionConnection for GatewayConnection {
    fn close(&self) {
        self.shutdown.fire();
    }
}

/// Settings the request path reads on every call.
#[derive(Debug, Clone, Default)]
pub struct RuntimeSettings {
    pub auth: AuthConfig,
    /// Base for 401 challenges; `https://<Host>` when unset.
    pub public_base_url: Option<String>,
}

impl From<&GatewaySettings> for RuntimeSettings {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            auth: settings.auth_config(),
            public_base_url: settings
                .public_base_url
                .as_ref()
                .filter(|url| !url.is_empty())
                .map(|url| url.trim_end_matches('/').to_string()),
        }
    }
}

/// State shared by every request handler.
pub struct GatewayState {
    settings: RwLock<RuntimeSettings>,
    authenticator: Authenticator,
    sessions: SessionRegistry<GatewayConnection>,
}

impl GatewayState {
    pub fn new(authenticator: Authenticator, settings: RuntimeSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            authenticator,
            sessions: SessionRegistry::new(),
        }
    }

    pub async fn settings(&self) -> RuntimeSettings {
        self.settings.read().await.clone()
    }

    pub async fn auth_config(&self) -> AuthConfig {
        self.settings.read().await.auth.clone()
    }

    /// Run the authentication chain against the current settings snapshot.
    pub async fn authenticate(&self, headers: &HeaderMap) -> AuthOutcome {
        let config = self.auth_config().await;
        self.authenticator.authenticate(headers, &config).await
    }

    pub fn sessions(&self) -> &SessionRegistry<GatewayConnection> {
        &self.sessions
    }

    /// Swap in new settings. Returns whether the trust configuration changed,
    /// in which case every cached verification has been dropped.
    pub async fn apply_settings(&self, settings: RuntimeSettings) -> bool {
        let mut current = self.settings.write().await;
        let trust_changed = current.auth.trust_changed(&settings.auth);
        *current = settings;
        drop(current);

        if trust_changed {
            self.authenticator.clear_caches();
            info!("Trust configuration changed, verification caches cleared");
        }
        trust_changed
    }
}

struct RunningListener {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<std::io::Result<()>>,
}

/// The authentication gateway: HTTP listener plus the state it serves.
pub struct Gateway {
    state: Arc<GatewayState>,
    running: Mutex<Option<RunningListener>>,
}

impl Gateway {
    /// Create a gateway that verifies Cloudflare tokens against remote key sets.
    pub fn new(settings: &GatewaySettings) -> Result<Self, KeySetError> {
        Ok(Self::with_authenticator(Authenticator::remote()?, settings))
    }

    pub fn with_authenticator(authenticator: Authenticator, settings: &GatewaySettings) -> Self {
        Self {
            state: Arc::new(GatewayState::new(authenticator, settings.into())),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Bind and start serving. Returns the bound address.
    ///
    /// Refuses a non-loopback address while no authentication is configured.
    pub async fn start(&self, bind: &str) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(listener) = running.as_ref() {
            bail!("Gateway is already running on {}", listener.local_addr);
        }

        let auth = self.state.auth_config().await;
        check_bind_security(bind, &auth)?;

        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind {}", bind))?;
        let local_addr = listener.local_addr()?;

        let router = api::create_router(self.state.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        if auth.requires_auth() {
            info!("MCP gateway listening on http://{} (auth enabled)", local_addr);
        } else {
            info!("MCP gateway listening on http://{} (open access)", local_addr);
        }

        *running = Some(RunningListener {
            local_addr,
            shutdown: shutdown_tx,
            handle,
        });
        Ok(local_addr)
    }

    /// Close every session, then shut the listener down gracefully.
    ///
    /// Stopping a gateway that is not running is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(listener) = self.running.lock().await.take() else {
            return Ok(());
        };

        let closed = self.state.sessions().terminate_all();
        info!("Stopping MCP gateway ({} session(s) closed)", closed);

        let _ = listener.shutdown.send(());
        match listener.handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("HTTP server error during shutdown: {}", e);
                Err(e.into())
            }
            Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|l| l.local_addr)
    }

    /// Live sessions across both transports.
    pub fn connection_count(&self) -> usize {
        self.state.sessions().count()
    }

    /// Apply reloaded settings to the running gateway.
    pub async fn apply_settings(&self, settings: &GatewaySettings) -> bool {
        self.state.apply_settings(settings.into()).await
    }
}
