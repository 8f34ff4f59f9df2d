//! Cloudflare Access signed-token verification.
//!
//! [`AccessTokenVerifier::verify`] never fails across its boundary: any
//! problem (bad signature, wrong issuer or audience, expiry, key-set fetch
//! failure) is logged and collapsed into `None`, which callers treat as an
//! invalid token.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use jsonwebtoken::{Validation, decode, decode_header};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error, info, warn};

use crate::auth::AuthConfig;
use crate::auth::cache::{VerificationCache, token_fingerprint};
use crate::auth::jwks::{
    DEFAULT_FETCH_TIMEOUT_SECONDS, KeyResolver, KeySetError, KeySetProvider,
    RemoteKeySetProvider, jwks_endpoint,
};
use crate::types::TrustDomain;

/// Claims of a successfully verified signed token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifiedPrincipal {
    #[serde(rename = "sub", default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "iss", default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(
        rename = "aud",
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Option::is_none"
    )]
    pub audiences: Option<Vec<String>>,
    /// Epoch seconds.
    #[serde(rename = "iat", default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,
    /// Epoch seconds.
    #[serde(rename = "exp", default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Remaining claims (e.g. `country`, `identity_nonce`).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl VerifiedPrincipal {
    /// Best label for logs: email, then subject.
    pub fn display(&self) -> &str {
        self.email
            .as_deref()
            .or(self.subject.as_deref())
            .unwrap_or("unknown")
    }
}

/// `aud` may be a single string or an array.
fn one_or_many<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(
        Option::<OneOrMany>::deserialize(deserializer)?.map(|value| match value {
            OneOrMany::One(aud) => vec![aud],
            OneOrMany::Many(auds) => auds,
        }),
    )
}

/// Key resolver bound to the trust domain it was created for.
struct KeySetHandle {
    domain: TrustDomain,
    resolver: Arc<dyn KeyResolver>,
}

/// Why a token failed verification. Never leaves this module.
#[derive(Debug)]
enum VerificationFailure {
    KeySet(KeySetError),
    Token(jsonwebtoken::errors::Error),
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeySet(e) => write!(f, "{}", e),
            Self::Token(e) => write!(f, "{}", e),
        }
    }
}

impl From<KeySetError> for VerificationFailure {
    fn from(e: KeySetError) -> Self {
        Self::KeySet(e)
    }
}

impl From<jsonwebtoken::errors::Error> for VerificationFailure {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        Self::Token(e)
    }
}

/// Verifies Cloudflare Access tokens against the configured trust domain.
///
/// Owns the per-domain key-set handle and the verified-token cache. Both are
/// reset by [`clear`](Self::clear), which must be invoked whenever the trust
/// settings change.
pub struct AccessTokenVerifier {
    provider: Arc<dyn KeySetProvider>,
    key_set: Mutex<Option<KeySetHandle>>,
    cache: Mutex<VerificationCache>,
}

impl AccessTokenVerifier {
    /// Create a verifier that obtains key sets from `provider`.
    pub fn new(provider: Arc<dyn KeySetProvider>) -> Self {
        Self {
            provider,
            key_set: Mutex::new(None),
            cache: Mutex::new(VerificationCache::default()),
        }
    }

    /// Create a verifier that fetches key sets over HTTP.
    pub fn remote() -> Result<Self, KeySetError> {
        let provider =
            RemoteKeySetProvider::new(Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECONDS))?;
        Ok(Self::new(Arc::new(provider)))
    }

    /// Verify a signed token, returning its claims when valid.
    pub async fn verify(&self, token: &str, config: &AuthConfig) -> Option<VerifiedPrincipal> {
        if !config.cf_access_enabled {
            debug!("Cloudflare Access is not enabled");
            return None;
        }

        if !config.cf_access_configured() {
            error!("Cloudflare Access is enabled but not properly configured");
            return None;
        }

        let cached = lock(&self.cache).get(token);
        if let Some(principal) = cached {
            debug!(
                "Using cached Cloudflare Access token for: {}",
                principal.display()
            );
            return Some(principal);
        }

        match self.verify_uncached(token, config).await {
            Ok(principal) => {
                lock(&self.cache).insert(token, principal.clone());
                info!(
                    "Cloudflare Access token validated for: {}",
                    principal.display()
                );
                Some(principal)
            }
            Err(e) => {
                warn!(
                    fingerprint = %token_fingerprint(token),
                    "Cloudflare Access token validation failed: {}",
                    e
                );
                None
            }
        }
    }

    async fn verify_uncached(
        &self,
        token: &str,
        config: &AuthConfig,
    ) -> Result<VerifiedPrincipal, VerificationFailure> {
        let domain = TrustDomain::normalize(&config.cf_access_team_domain);
        let resolver = self.resolver_for(&domain)?;

        let header = decode_header(token)?;
        let resolved = resolver.resolve(header.kid.as_deref()).await?;

        let mut validation = Validation::new(resolved.algorithm);
        validation.set_issuer(&[domain.as_str()]);
        validation.set_audience(&[config.cf_access_policy_aud.as_str()]);
        validation.leeway = 0;
        validation.validate_nbf = true;

        let token_data = decode::<VerifiedPrincipal>(token, &resolved.key, &validation)?;
        Ok(token_data.claims)
    }

    /// Reuse the key set for `domain`, or replace it when the domain changed.
    fn resolver_for(&self, domain: &TrustDomain) -> Result<Arc<dyn KeyResolver>, KeySetError> {
        let mut slot = lock(&self.key_set);
        if let Some(handle) = slot.as_ref()
            && handle.domain == *domain
        {
            return Ok(handle.resolver.clone());
        }

        let url = jwks_endpoint(domain);
        info!("Creating JWKS instance for: {}", url);
        let resolver = self.provider.key_set(&url)?;
        *slot = Some(KeySetHandle {
            domain: domain.clone(),
            resolver: resolver.clone(),
        });
        Ok(resolver)
    }

    /// Drop the key-set handle and every cached verification.
    pub fn clear(&self) {
        *lock(&self.key_set) = None;
        lock(&self.cache).clear();
        info!("Cloudflare Access caches cleared");
    }

    /// Number of cached verifications.
    pub fn cached_tokens(&self) -> usize {
        lock(&self.cache).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
