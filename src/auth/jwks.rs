//! JWKS (JSON Web Key Set) fetching and caching module.
//!
//! A [`RemoteKeySet`] fetches the signing keys published by a trust domain
//! and keeps them for reuse. The verifier talks to it through the
//! [`KeyResolver`] trait so tests can substitute a counting stub, and obtains
//! resolvers from a [`KeySetProvider`] whenever the configured domain changes.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::TrustDomain;

/// Default key-set cache TTL in seconds (10 minutes).
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 600;

/// Maximum stale cache age in seconds (24 hours).
pub const MAX_STALE_CACHE_SECONDS: u64 = 86400;

/// Minimum delay between two fetches triggered by unknown key ids.
pub const DEFAULT_REFRESH_COOLDOWN_SECONDS: u64 = 30;

/// Upper bound on a single key-set fetch.
pub const DEFAULT_FETCH_TIMEOUT_SECONDS: u64 = 10;

/// Path segment identifying an OIDC SaaS application domain.
const OIDC_PATH_SEGMENT: &str = "/cdn-cgi/access/sso/oidc/";

/// Resolve the key-set endpoint for a trust domain.
///
/// OIDC SaaS apps (`https://team.cloudflareaccess.com/cdn-cgi/access/sso/oidc/<client_id>`)
/// publish keys at `<domain>/jwks`; standard Access apps at
/// `<domain>/cdn-cgi/access/certs`.
pub fn jwks_endpoint(domain: &TrustDomain) -> String {
    if domain.as_str().contains(OIDC_PATH_SEGMENT) {
        format!("{}/jwks", domain)
    } else {
        format!("{}/cdn-cgi/access/certs", domain)
    }
}

/// A single JSON Web Key from a JWKS document.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA")
    pub kty: String,
    /// Key ID (optional, used to match JWT header kid)
    pub kid: Option<String>,
    /// Algorithm (e.g., "RS256")
    pub alg: Option<String>,
    /// Key use (e.g., "sig" for signature)
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    /// RSA modulus (base64url encoded)
    pub n: Option<String>,
    /// RSA exponent (base64url encoded)
    pub e: Option<String>,
}

/// A JWKS document containing multiple keys.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

/// Key material ready for signature verification.
#[derive(Clone)]
pub struct ResolvedKey {
    pub key: DecodingKey,
    /// The only algorithm this key may verify.
    pub algorithm: Algorithm,
}

/// Boxed future returned by [`KeyResolver::resolve`].
pub type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ResolvedKey, KeySetError>> + Send + 'a>>;

/// Source of verification keys for one trust domain.
pub trait KeyResolver: Send + Sync {
    /// Find the key for `kid`, or any key when the token names none.
    fn resolve<'a>(&'a self, kid: Option<&'a str>) -> ResolveFuture<'a>;
}

/// Creates a resolver for a key-set endpoint.
///
/// Called once per trust domain; the verifier keeps the returned resolver
/// until the configured domain changes.
pub trait KeySetProvider: Send + Sync {
    fn key_set(&self, jwks_url: &str) -> Result<Arc<dyn KeyResolver>, KeySetError>;
}

/// Cached key entry with metadata.
#[derive(Clone)]
struct CachedKey {
    resolved: ResolvedKey,
}

/// Remote key set with TTL-based refresh.
pub struct RemoteKeySet {
    /// The JWKS endpoint URL.
    jwks_url: String,
    /// Cache TTL.
    cache_ttl: Duration,
    /// Minimum interval between fetches.
    refresh_cooldown: Duration,
    /// Whether to allow stale cache on fetch failure.
    allow_stale: bool,
    /// Cached keys by kid.
    keys: RwLock<HashMap<String, CachedKey>>,
    /// Last successful fetch time.
    last_fetch: RwLock<Option<Instant>>,
    /// Last fetch attempt, successful or not.
    last_attempt: RwLock<Option<Instant>>,
    /// HTTP client for fetching JWKS.
    client: reqwest::Client,
}

impl RemoteKeySet {
    /// Create a new remote key set.
    pub fn new(jwks_url: String, client: reqwest::Client) -> Self {
        Self {
            jwks_url,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECONDS),
            refresh_cooldown: Duration::from_secs(DEFAULT_REFRESH_COOLDOWN_SECONDS),
            allow_stale: true,
            keys: RwLock::new(HashMap::new()),
            last_fetch: RwLock::new(None),
            last_attempt: RwLock::new(None),
            client,
        }
    }

    /// Override the cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Override the cooldown between fetches for unknown key ids.
    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown = cooldown;
        self
    }

    /// Endpoint this key set fetches from.
    pub fn url(&self) -> &str {
        &self.jwks_url
    }

    /// Get a decoding key by key ID.
    ///
    /// If `kid` is None, returns the first available key.
    /// Fetches from the JWKS endpoint if the cache is stale or the key is unknown,
    /// at most once per cooldown window.
    pub async fn get_key(&self, kid: Option<&str>) -> Result<ResolvedKey, KeySetError> {
        let fresh = {
            let last_fetch = self.last_fetch.read().await;
            matches!(*last_fetch, Some(t) if t.elapsed() <= self.cache_ttl)
        };

        if fresh {
            if let Some(key) = self.get_from_cache(kid).await {
                return Ok(key);
            }

            // Unknown kid on a fresh cache: rate-limit refetches.
            let cooling_down = {
                let last_attempt = self.last_attempt.read().await;
                matches!(*last_attempt, Some(t) if t.elapsed() < self.refresh_cooldown)
            };
            if cooling_down {
                return Err(missing_key(kid));
            }
        }

        match self.fetch_keys().await {
            Ok(()) => self.get_from_cache(kid).await.ok_or_else(|| missing_key(kid)),
            Err(e) => {
                if self.allow_stale {
                    let stale_ok = {
                        let last_fetch = self.last_fetch.read().await;
                        last_fetch
                            .map(|t| t.elapsed() < Duration::from_secs(MAX_STALE_CACHE_SECONDS))
                            .unwrap_or(false)
                    };

                    if stale_ok {
                        warn!("JWKS fetch failed, using stale cache: {}", e);
                        if let Some(key) = self.get_from_cache(kid).await {
                            return Ok(key);
                        }
                    }
                }

                Err(e)
            }
        }
    }

    /// Get a key from the cache without fetching.
    async fn get_from_cache(&self, kid: Option<&str>) -> Option<ResolvedKey> {
        let keys = self.keys.read().await;

        match kid {
            Some(k) => keys.get(k).map(|c| c.resolved.clone()),
            None => keys.values().next().map(|c| c.resolved.clone()),
        }
    }

    /// Fetch keys from the JWKS endpoint, replacing the cached set.
    pub async fn fetch_keys(&self) -> Result<(), KeySetError> {
        debug!("Fetching JWKS from {}", self.jwks_url);
        *self.last_attempt.write().await = Some(Instant::now());

        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| KeySetError::FetchError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(KeySetError::FetchError(format!(
                "HTTP {} from JWKS endpoint",
                response.status()
            )));
        }

        let jwks: JwksDocument = response
            .json()
            .await
            .map_err(|e| KeySetError::ParseError(e.to_string()))?;

        let mut new_keys = HashMap::new();

        for jwk in jwks.keys {
            if jwk.kty != "RSA" {
                debug!("Skipping non-RSA key: {:?}", jwk.kty);
                continue;
            }

            if jwk.key_use.as_deref() == Some("enc") {
                debug!("Skipping encryption key");
                continue;
            }

            match Self::jwk_to_resolved_key(&jwk) {
                Ok(resolved) => {
                    let kid = jwk.kid.clone().unwrap_or_else(|| "default".to_string());
                    debug!("Cached key with kid: {}", kid);
                    new_keys.insert(kid, CachedKey { resolved });
                }
                Err(e) => {
                    warn!("Failed to parse JWK: {}", e);
                }
            }
        }

        if new_keys.is_empty() {
            return Err(KeySetError::NoValidKeys);
        }

        let count = new_keys.len();
        *self.keys.write().await = new_keys;
        *self.last_fetch.write().await = Some(Instant::now());

        debug!("Successfully cached {} keys from {}", count, self.jwks_url);
        Ok(())
    }

    /// Convert an RSA JWK to verification key material.
    fn jwk_to_resolved_key(jwk: &Jwk) -> Result<ResolvedKey, KeySetError> {
        let n = jwk
            .n
            .as_ref()
            .ok_or_else(|| KeySetError::ParseError("Missing 'n' in RSA key".to_string()))?;
        let e = jwk
            .e
            .as_ref()
            .ok_or_else(|| KeySetError::ParseError("Missing 'e' in RSA key".to_string()))?;

        let algorithm = match jwk.alg.as_deref() {
            None => Algorithm::RS256,
            Some(alg @ ("RS256" | "RS384" | "RS512" | "PS256" | "PS384" | "PS512")) => alg
                .parse()
                .map_err(|_| KeySetError::ParseError(format!("Unsupported alg: {}", alg)))?,
            Some(other) => {
                return Err(KeySetError::ParseError(format!(
                    "Unsupported alg for RSA key: {}",
                    other
                )));
            }
        };

        let key = DecodingKey::from_rsa_components(n, e)
            .map_err(|e| KeySetError::ParseError(format!("Invalid RSA components: {}", e)))?;

        Ok(ResolvedKey { key, algorithm })
    }

    /// Check if the cache has any keys.
    pub async fn has_keys(&self) -> bool {
        !self.keys.read().await.is_empty()
    }

    /// Get the number of cached keys.
    pub async fn key_count(&self) -> usize {
        self.keys.read().await.len()
    }
}

impl KeyResolver for RemoteKeySet {
    fn resolve<'a>(&'a self, kid: Option<&'a str>) -> ResolveFuture<'a> {
        Box::pin(self.get_key(kid))
    }
}

fn missing_key(kid: Option<&str>) -> KeySetError {
    match kid {
        Some(k) => KeySetError::KeyNotFound(k.to_string()),
        None => KeySetError::NoKeysAvailable,
    }
}

/// Builds [`RemoteKeySet`]s that share one HTTP client.
#[derive(Clone)]
pub struct RemoteKeySetProvider {
    client: reqwest::Client,
}

impl RemoteKeySetProvider {
    /// Create a provider whose fetches time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, KeySetError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeySetError::FetchError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl KeySetProvider for RemoteKeySetProvider {
    fn key_set(&self, jwks_url: &str) -> Result<Arc<dyn KeyResolver>, KeySetError> {
        let parsed =
            url::Url::parse(jwks_url).map_err(|e| KeySetError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "https" | "http") {
            return Err(KeySetError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        Ok(Arc::new(RemoteKeySet::new(
            parsed.to_string(),
            self.client.clone(),
        )))
    }
}

/// Errors that can occur when working with a remote key set.
#[derive(Debug, Clone)]
pub enum KeySetError {
    /// Failed to fetch JWKS from endpoint.
    FetchError(String),
    /// Failed to parse JWKS response.
    ParseError(String),
    /// The key-set endpoint is not a usable URL.
    InvalidUrl(String),
    /// No valid keys found in JWKS.
    NoValidKeys,
    /// Key with specified kid not found.
    KeyNotFound(String),
    /// No keys available in cache.
    NoKeysAvailable,
}

impl fmt::Display for KeySetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FetchError(msg) => write!(f, "Failed to fetch JWKS: {}", msg),
            Self::ParseError(msg) => write!(f, "Failed to parse JWKS: {}", msg),
            Self::InvalidUrl(msg) => write!(f, "Invalid JWKS URL: {}", msg),
            Self::NoValidKeys => write!(f, "No valid keys found in JWKS"),
            Self::KeyNotFound(kid) => write!(f, "Key not found: {}", kid),
            Self::NoKeysAvailable => write!(f, "No keys available in cache"),
        }
    }
}

impl std::error::Error for KeySetError {}
