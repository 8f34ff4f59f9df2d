//! Request authentication.
//!
//! Decides, per request, whether the caller may reach the protocol server and
//! which mechanism admitted it:
//!
//! - **Cloudflare Access**: signed assertion in the `Cf-Access-Jwt-Assertion`
//!   header or `CF_Authorization` cookie, verified against the team's key set
//! - **Cloudflare linked app**: the same kind of signed token sent as a bearer value
//! - **Bearer token**: a locally configured shared secret
//! - **None**: open access when nothing is configured
//!
//! ## Security Model
//!
//! - A present but invalid Access assertion rejects the request; no other
//!   channel is tried
//! - Key-set and network failures count as invalid, never as authenticated
//! - Raw tokens are never logged or used as cache keys
//!
//! ## Usage
//!
//! ```ignore
//! let authenticator = Authenticator::remote()?;
//! let outcome = authenticator.authenticate(&headers, &config).await;
//! if let Some(err) = outcome.error() {
//!     return unauthorized(err);
//! }
//! ```

pub mod cache;
pub mod credentials;
mod decision;
pub mod jwks;
mod secret;
pub mod verifier;

pub use credentials::{
    AccessToken, Credential, extract_access_token, extract_bearer_token, looks_like_jwt,
};
pub use decision::{AuthConfig, AuthError, AuthMethod, AuthOutcome, Authenticator, UNSET_SECRET};
pub use jwks::{KeyResolver, KeySetError, KeySetProvider, RemoteKeySet, jwks_endpoint};
pub use secret::verify_local_secret;
pub use verifier::{AccessTokenVerifier, VerifiedPrincipal};
