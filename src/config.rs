//! Gateway settings loaded from a JSON file.
//!
//! The file uses the same keys the settings UI writes (`authCode`,
//! `cfAccessEnabled`, `cfAccessTeamDomain`, `cfAccessPolicyAud`, `port`).
//! String values may reference environment variables as `${NAME}`.

use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::{env, fs, path::Path, path::PathBuf};

use crate::auth::AuthConfig;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 16806;

/// Default bind host. Anything else requires an authentication method.
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";

/// Settings as persisted by the external settings collaborator.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewaySettings {
    /// Local shared secret for `Authorization: Bearer` access.
    pub auth_code: Option<String>,
    pub cf_access_enabled: bool,
    /// e.g. "https://myteam.cloudflareaccess.com"
    pub cf_access_team_domain: String,
    /// Application Audience (AUD) tag.
    pub cf_access_policy_aud: String,
    pub port: Option<u16>,
    /// Full bind address; overrides `port` when set.
    pub bind_address: Option<String>,
    /// Base URL advertised in 401 challenges and resource metadata.
    pub public_base_url: Option<String>,
}

impl GatewaySettings {
    /// Build the runtime authentication snapshot from these settings.
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            local_secret: self.auth_code.clone(),
            cf_access_enabled: self.cf_access_enabled,
            cf_access_team_domain: self.cf_access_team_domain.clone(),
            cf_access_policy_aud: self.cf_access_policy_aud.clone(),
        }
    }

    /// Address the HTTP listener binds to.
    pub fn bind_addr(&self) -> String {
        match &self.bind_address {
            Some(addr) => addr.clone(),
            None => format!(
                "{}:{}",
                DEFAULT_BIND_HOST,
                self.port.unwrap_or(DEFAULT_PORT)
            ),
        }
    }
}

/// Errors raised while loading or validating settings.
#[derive(Debug)]
pub enum ConfigError {
    /// The settings file exists but could not be read.
    Io(PathBuf, std::io::Error),
    /// The settings file is not valid JSON for [`GatewaySettings`].
    Parse(PathBuf, serde_json::Error),
    /// Non-loopback bind requested while no authentication is configured.
    InsecureBind(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, e) => write!(f, "Failed to read {}: {}", path.display(), e),
            Self::Parse(path, e) => write!(f, "Failed to parse {}: {}", path.display(), e),
            Self::InsecureBind(addr) => write!(
                f,
                "Refusing to listen on {} without authentication; set an authentication code (authCode) or configure Cloudflare Access",
                addr
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Locate the settings file, if any.
///
/// Lookup order: `$GATEWAY_CONFIG`, `$XDG_CONFIG_HOME/mcp-access-gateway/settings.json`,
/// `./gateway.json`.
pub fn resolve_settings_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("GATEWAY_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg)
            .join("mcp-access-gateway")
            .join("settings.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("gateway.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_settings(mut settings: GatewaySettings) -> GatewaySettings {
    for val in [
        settings.auth_code.as_mut(),
        Some(&mut settings.cf_access_team_domain),
        Some(&mut settings.cf_access_policy_aud),
        settings.bind_address.as_mut(),
        settings.public_base_url.as_mut(),
    ]
    .into_iter()
    .flatten()
    {
        *val = expand_env_vars(val);
    }

    settings
}

/// Load settings from an explicit path.
pub fn load_settings_from(path: &Path) -> Result<GatewaySettings, ConfigError> {
    let raw =
        fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    let settings: GatewaySettings =
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
    Ok(expand_settings(settings))
}

/// Load settings from the resolved location, falling back to defaults
/// when no settings file exists.
pub fn load_settings() -> Result<GatewaySettings, ConfigError> {
    match resolve_settings_path() {
        Some(path) => {
            tracing::debug!("Loading gateway settings from {}", path.display());
            load_settings_from(&path)
        }
        None => {
            tracing::debug!("No settings file found, using defaults");
            Ok(GatewaySettings::default())
        }
    }
}

/// Reject binding beyond loopback when every request would be let through.
pub fn check_bind_security(bind: &str, auth: &AuthConfig) -> Result<(), ConfigError> {
    if auth.local_secret_configured() || auth.cf_access_configured() {
        return Ok(());
    }

    let loopback = match bind.parse::<SocketAddr>() {
        Ok(addr) => addr.ip().is_loopback(),
        Err(_) => bind
            .rsplit_once(':')
            .map(|(host, _)| host == "localhost")
            .unwrap_or(false),
    };

    if loopback {
        Ok(())
    } else {
        Err(ConfigError::InsecureBind(bind.to_string()))
    }
}
