//! NewType wrappers for strong typing throughout the gateway.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a raw token where a cache fingerprint is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Opaque identifier of a protocol session.
    ///
    /// Generated by the transport layer when a connection is accepted and
    /// used as the key in the session registry. Handlers only ever see this
    /// identifier, never the session object itself.
    SessionId
);

newtype_string!(
    /// Cache key derived from a raw signed token.
    ///
    /// Short tokens are kept verbatim; longer ones are reduced to
    /// `first16...last16:length` so full credentials are not kept as map keys.
    TokenFingerprint
);

newtype_string!(
    /// Issuer authority that signed tokens are validated against
    /// (e.g., "https://myteam.cloudflareaccess.com").
    ///
    /// Always stored without a trailing slash.
    TrustDomain
);

impl SessionId {
    /// Generate a fresh random session identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl TrustDomain {
    /// Normalize a configured team domain by stripping one trailing slash.
    pub fn normalize(raw: &str) -> Self {
        Self(raw.strip_suffix('/').unwrap_or(raw).to_string())
    }
}
