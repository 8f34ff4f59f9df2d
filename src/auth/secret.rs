//! Local shared-secret verification.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::auth::AuthConfig;

/// Check a bearer value against the locally configured secret.
///
/// Both sides are hashed first so the comparison is constant-time and
/// independent of the secret's length. Returns `false` when no secret is
/// configured.
pub fn verify_local_secret(token: &str, config: &AuthConfig) -> bool {
    if !config.local_secret_configured() {
        return false;
    }

    let Some(expected) = config.local_secret.as_deref() else {
        return false;
    };

    digest(token).ct_eq(&digest(expected)).into()
}

fn digest(value: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UNSET_SECRET;

    #[test]
    fn test_matching_secret() {
        let config = AuthConfig::with_local_secret("s3cr3t");
        assert!(verify_local_secret("s3cr3t", &config));
    }

    #[test]
    fn test_mismatched_secret() {
        let config = AuthConfig::with_local_secret("s3cr3t");
        assert!(!verify_local_secret("s3cr3T", &config));
        assert!(!verify_local_secret("s3cr3t ", &config));
        assert!(!verify_local_secret("", &config));
    }

    #[test]
    fn test_unconfigured_secret_never_matches() {
        assert!(!verify_local_secret("", &AuthConfig::default()));

        let sentinel = AuthConfig::with_local_secret(UNSET_SECRET);
        assert!(!verify_local_secret(UNSET_SECRET, &sentinel));

        let empty = AuthConfig::with_local_secret("");
        assert!(!verify_local_secret("", &empty));
    }
}
