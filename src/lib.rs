// Core modules
pub mod auth;
mod config;
pub mod session;
pub mod types;

// HTTP surface and runtime
pub mod api;
pub mod server;

// Re-export key types and functions
pub use auth::{
    AccessTokenVerifier, AuthConfig, AuthError, AuthMethod, AuthOutcome, Authenticator,
    VerifiedPrincipal, credentials,
};
pub use config::{
    ConfigError, DEFAULT_BIND_HOST, DEFAULT_PORT, GatewaySettings, check_bind_security,
    load_settings, load_settings_from, resolve_settings_path,
};
pub use server::{Gateway, GatewayState, ProtocolServer};
pub use session::{SessionRegistry, TransportKind};
