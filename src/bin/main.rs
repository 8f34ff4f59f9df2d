use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use http::{HeaderMap, HeaderValue, header::AUTHORIZATION};
use mcp_access_gateway::{
    Authenticator, Gateway, GatewaySettings, credentials::ACCESS_TOKEN_HEADER, load_settings,
};
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mcp-access-gateway")]
#[command(about = "Authentication gateway for MCP over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Settings overrides shared by every command.
#[derive(Args, Clone, Debug, Default)]
struct Overrides {
    /// Local shared secret accepted as `Authorization: Bearer <code>`
    #[arg(long, env = "GATEWAY_AUTH_CODE")]
    auth_code: Option<String>,
    /// Cloudflare Access team domain; enables Access verification
    #[arg(long, env = "GATEWAY_CF_TEAM_DOMAIN")]
    cf_team_domain: Option<String>,
    /// Cloudflare Access application audience tag
    #[arg(long, env = "GATEWAY_CF_POLICY_AUD")]
    cf_policy_aud: Option<String>,
    /// Base URL advertised in 401 challenges, e.g. https://mcp.example.com
    #[arg(long)]
    public_base_url: Option<String>,
}

impl Overrides {
    fn apply(&self, settings: &mut GatewaySettings) {
        if let Some(code) = &self.auth_code {
            settings.auth_code = Some(code.clone());
        }
        if let Some(domain) = &self.cf_team_domain {
            settings.cf_access_enabled = true;
            settings.cf_access_team_domain = domain.clone();
        }
        if let Some(aud) = &self.cf_policy_aud {
            settings.cf_access_policy_aud = aud.clone();
        }
        if let Some(url) = &self.public_base_url {
            settings.public_base_url = Some(url.clone());
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (SSE at /sse, streamable HTTP at /mcp)
    Serve {
        /// Bind address, e.g. 127.0.0.1:16806 (defaults to the settings file)
        #[arg(long)]
        bind: Option<String>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Run the authentication chain for a single token and print the decision
    VerifyToken {
        token: String,
        /// Send the token as `Authorization: Bearer` instead of the Access header
        #[arg(long, default_value_t = false)]
        bearer: bool,
        #[command(flatten)]
        overrides: Overrides,
    },
}

fn settings_with(overrides: &Overrides) -> Result<GatewaySettings> {
    let mut settings = load_settings().context("Failed to load gateway settings")?;
    overrides.apply(&mut settings);
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("mcp_access_gateway=info".parse()?)
                .add_directive("rmcp=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, overrides } => {
            let settings = settings_with(&overrides)?;
            let bind = bind.unwrap_or_else(|| settings.bind_addr());

            let gateway = Gateway::new(&settings)?;
            gateway.start(&bind).await?;

            wait_for_shutdown(&gateway, &overrides).await?;

            info!("Shutting down");
            gateway.stop().await?;
        }
        Commands::VerifyToken {
            token,
            bearer,
            overrides,
        } => {
            let settings = settings_with(&overrides)?;
            let authenticator = Authenticator::remote()?;

            let mut headers = HeaderMap::new();
            if bearer {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", token))?,
                );
            } else {
                headers.insert(ACCESS_TOKEN_HEADER, HeaderValue::from_str(&token)?);
            }

            let outcome = authenticator
                .authenticate(&headers, &settings.auth_config())
                .await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if let Some(principal) = outcome.principal() {
                println!("{}", serde_json::to_string_pretty(principal)?);
            }
        }
    }

    Ok(())
}

/// Block until Ctrl-C, reloading settings on SIGHUP.
#[cfg(unix)]
async fn wait_for_shutdown(gateway: &Gateway, overrides: &Overrides) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = hangup.recv() => reload(gateway, overrides).await,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_gateway: &Gateway, _overrides: &Overrides) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg_attr(not(unix), allow(dead_code))]
async fn reload(gateway: &Gateway, overrides: &Overrides) {
    match settings_with(overrides) {
        Ok(settings) => {
            let trust_changed = gateway.apply_settings(&settings).await;
            info!(
                "Settings reloaded ({} live sessions, trust changed: {})",
                gateway.connection_count(),
                trust_changed
            );
        }
        Err(e) => error!("Settings reload failed, keeping previous settings: {:#}", e),
    }
}
