//! Per-request authentication decision.

use std::fmt;

use http::HeaderMap;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, warn};

use crate::auth::credentials::{AccessToken, Credential, extract_access_token, extract_bearer_token};
use crate::auth::jwks::KeySetError;
use crate::auth::secret::verify_local_secret;
use crate::auth::verifier::{AccessTokenVerifier, VerifiedPrincipal};

/// Secret value meaning "no local secret has been set".
pub const UNSET_SECRET: &str = "CODE_UNSET";

/// Snapshot of the trust settings a request is judged against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Static bearer secret.
    pub local_secret: Option<String>,
    /// Whether Cloudflare Access verification is switched on.
    pub cf_access_enabled: bool,
    /// Team domain, e.g. `https://team.cloudflareaccess.com`. Also the expected issuer.
    pub cf_access_team_domain: String,
    /// Application audience tag.
    pub cf_access_policy_aud: String,
}

impl AuthConfig {
    /// Config that only accepts the given bearer secret.
    pub fn with_local_secret(secret: impl Into<String>) -> Self {
        Self {
            local_secret: Some(secret.into()),
            ..Default::default()
        }
    }

    /// Config that trusts Cloudflare Access tokens for one team and audience.
    pub fn with_cloudflare_access(
        team_domain: impl Into<String>,
        policy_aud: impl Into<String>,
    ) -> Self {
        Self {
            cf_access_enabled: true,
            cf_access_team_domain: team_domain.into(),
            cf_access_policy_aud: policy_aud.into(),
            ..Default::default()
        }
    }

    /// Add a local secret to an existing config.
    pub fn and_local_secret(mut self, secret: impl Into<String>) -> Self {
        self.local_secret = Some(secret.into());
        self
    }

    pub fn local_secret_configured(&self) -> bool {
        matches!(self.local_secret.as_deref(), Some(s) if !s.is_empty() && s != UNSET_SECRET)
    }

    /// Enabled, with both team domain and audience present.
    pub fn cf_access_configured(&self) -> bool {
        self.cf_access_enabled
            && !self.cf_access_team_domain.is_empty()
            && !self.cf_access_policy_aud.is_empty()
    }

    /// True when any authentication method is configured.
    pub fn requires_auth(&self) -> bool {
        self.local_secret_configured() || self.cf_access_configured()
    }

    /// Whether switching from `self` to `other` invalidates cached verifications.
    pub fn trust_changed(&self, other: &AuthConfig) -> bool {
        self.cf_access_enabled != other.cf_access_enabled
            || self.cf_access_team_domain != other.cf_access_team_domain
            || self.cf_access_policy_aud != other.cf_access_policy_aud
    }
}

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No credential found on any channel
    Unauthenticated,
    /// Access header or cookie carried a token that failed verification
    InvalidAccessToken,
    /// Signed bearer token failed verification and no local secret is set
    InvalidOAuthToken,
    /// Bearer value did not match the local secret
    InvalidBearerToken,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "Authentication required"),
            Self::InvalidAccessToken => write!(f, "Invalid Cloudflare Access token"),
            Self::InvalidOAuthToken => write!(f, "Invalid Cloudflare OAuth token"),
            Self::InvalidBearerToken => write!(f, "Invalid Bearer token"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Which mechanism admitted a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Nothing configured; open access
    None,
    /// Access assertion header or cookie
    CloudflareAccess,
    /// Cloudflare-issued token presented as a bearer value
    CloudflareLinkedApp,
    /// Local shared secret
    BearerToken,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::CloudflareAccess => "cloudflare-access",
            Self::CloudflareLinkedApp => "cloudflare-linked-app",
            Self::BearerToken => "bearer-token",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AuthMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Result of [`Authenticator::authenticate`].
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Authenticated {
        method: AuthMethod,
        /// Set for the Cloudflare methods.
        principal: Option<VerifiedPrincipal>,
    },
    Rejected(AuthError),
}

impl AuthOutcome {
    fn admitted(method: AuthMethod) -> Self {
        Self::Authenticated {
            method,
            principal: None,
        }
    }

    fn verified(method: AuthMethod, principal: VerifiedPrincipal) -> Self {
        Self::Authenticated {
            method,
            principal: Some(principal),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    pub fn method(&self) -> Option<AuthMethod> {
        match self {
            Self::Authenticated { method, .. } => Some(*method),
            Self::Rejected(_) => None,
        }
    }

    pub fn principal(&self) -> Option<&VerifiedPrincipal> {
        match self {
            Self::Authenticated { principal, .. } => principal.as_ref(),
            Self::Rejected(_) => None,
        }
    }

    pub fn error(&self) -> Option<&AuthError> {
        match self {
            Self::Rejected(e) => Some(e),
            Self::Authenticated { .. } => None,
        }
    }
}

/// Wire shape: `{authenticated, method?, error?}`.
impl Serialize for AuthOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire {
            authenticated: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            method: Option<AuthMethod>,
            #[serde(skip_serializing_if = "Option::is_none")]
            error: Option<String>,
        }

        Wire {
            authenticated: self.is_authenticated(),
            method: self.method(),
            error: self.error().map(|e| e.to_string()),
        }
        .serialize(serializer)
    }
}

/// Runs the ordered authentication chain for incoming requests.
pub struct Authenticator {
    verifier: AccessTokenVerifier,
}

impl Authenticator {
    pub fn new(verifier: AccessTokenVerifier) -> Self {
        Self { verifier }
    }

    /// Authenticator backed by remote key sets.
    pub fn remote() -> Result<Self, KeySetError> {
        Ok(Self::new(AccessTokenVerifier::remote()?))
    }

    /// Decide whether a request may proceed.
    ///
    /// Order:
    /// 1. Nothing configured: open access.
    /// 2. Access header, then cookie. A present but invalid token rejects the
    ///    request outright.
    /// 3. Bearer value. Signed-looking values are tried against Cloudflare
    ///    first, then the local secret if one is set.
    /// 4. Otherwise the request is unauthenticated.
    pub async fn authenticate(&self, headers: &HeaderMap, config: &AuthConfig) -> AuthOutcome {
        let cf_configured = config.cf_access_configured();
        let local_configured = config.local_secret_configured();

        if !cf_configured && !local_configured {
            return AuthOutcome::admitted(AuthMethod::None);
        }

        if cf_configured && let Some(found) = extract_access_token(headers) {
            let AccessToken::Present(token) = found else {
                warn!("Unreadable Cloudflare Access token on request");
                return AuthOutcome::Rejected(AuthError::InvalidAccessToken);
            };
            return match self.verifier.verify(&token, config).await {
                Some(principal) => AuthOutcome::verified(AuthMethod::CloudflareAccess, principal),
                None => AuthOutcome::Rejected(AuthError::InvalidAccessToken),
            };
        }

        if let Some(bearer) = extract_bearer_token(headers) {
            if cf_configured && let Credential::SignedToken(token) = Credential::classify(&bearer) {
                if let Some(principal) = self.verifier.verify(&token, config).await {
                    return AuthOutcome::verified(AuthMethod::CloudflareLinkedApp, principal);
                }

                if !local_configured {
                    return AuthOutcome::Rejected(AuthError::InvalidOAuthToken);
                }

                warn!("Signed bearer token rejected by Cloudflare Access, trying local secret");
            }

            if local_configured {
                if verify_local_secret(&bearer, config) {
                    return AuthOutcome::admitted(AuthMethod::BearerToken);
                }
                return AuthOutcome::Rejected(AuthError::InvalidBearerToken);
            }
        }

        debug!("No usable credential on request");
        AuthOutcome::Rejected(AuthError::Unauthenticated)
    }

    /// Forget cached verifications and key sets. Call whenever trust settings change.
    pub fn clear_caches(&self) {
        self.verifier.clear();
    }

    pub fn verifier(&self) -> &AccessTokenVerifier {
        &self.verifier
    }
}
