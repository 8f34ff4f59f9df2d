//! Verified-token cache.
//!
//! Memoizes successful signed-token verifications so repeated requests with
//! the same token skip the key-set lookup and signature check until shortly
//! before the token expires. Bounded to [`MAX_TOKEN_CACHE_SIZE`] entries with
//! strict FIFO eviction (insertion order, reads do not refresh position).

use std::collections::{HashMap, VecDeque};

use crate::auth::verifier::VerifiedPrincipal;
use crate::types::TokenFingerprint;

/// Maximum number of cached verifications.
pub const MAX_TOKEN_CACHE_SIZE: usize = 100;

/// Entries expire this long before the token's own `exp`.
pub const TOKEN_CACHE_BUFFER_MS: i64 = 30_000;

/// Tokens shorter than this are used verbatim as cache keys.
const FINGERPRINT_MIN_LENGTH: usize = 40;

/// Number of leading/trailing characters kept in a fingerprint.
const FINGERPRINT_EDGE: usize = 16;

/// Derive the cache key for a raw token.
///
/// Short tokens are used as-is; longer ones become
/// `first16...last16:length`.
pub fn token_fingerprint(token: &str) -> TokenFingerprint {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() < FINGERPRINT_MIN_LENGTH {
        return TokenFingerprint::new(token);
    }

    let head: String = chars[..FINGERPRINT_EDGE].iter().collect();
    let tail: String = chars[chars.len() - FINGERPRINT_EDGE..].iter().collect();
    TokenFingerprint::new(format!("{}...{}:{}", head, tail, chars.len()))
}

#[derive(Debug, Clone)]
struct CacheEntry {
    principal: VerifiedPrincipal,
    /// Epoch milliseconds after which the entry is stale.
    expires_at: i64,
}

/// Bounded FIFO cache of verified principals keyed by token fingerprint.
#[derive(Debug)]
pub struct VerificationCache {
    entries: HashMap<TokenFingerprint, CacheEntry>,
    /// Keys in insertion order; front is evicted first.
    order: VecDeque<TokenFingerprint>,
    capacity: usize,
}

impl Default for VerificationCache {
    fn default() -> Self {
        Self::new(MAX_TOKEN_CACHE_SIZE)
    }
}

impl VerificationCache {
    /// Create an empty cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Look up a token, dropping the entry if it has expired.
    pub fn get(&mut self, token: &str) -> Option<VerifiedPrincipal> {
        self.get_at(token, now_millis())
    }

    /// Store a verified principal for a token.
    pub fn insert(&mut self, token: &str, principal: VerifiedPrincipal) {
        self.insert_at(token, principal)
    }

    fn get_at(&mut self, token: &str, now: i64) -> Option<VerifiedPrincipal> {
        let key = token_fingerprint(token);
        let entry = self.entries.get(&key)?;

        if now >= entry.expires_at {
            self.remove(&key);
            return None;
        }

        Some(entry.principal.clone())
    }

    fn insert_at(&mut self, token: &str, principal: VerifiedPrincipal) {
        let key = token_fingerprint(token);
        let exp = principal.expires_at.unwrap_or(0);
        let entry = CacheEntry {
            expires_at: exp.saturating_mul(1000).saturating_sub(TOKEN_CACHE_BUFFER_MS),
            principal,
        };

        // Overwriting keeps the original insertion position.
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = entry;
            return;
        }

        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        self.order.push_back(key.clone());
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &TokenFingerprint) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }

    /// Drop every entry. Must be called whenever trust settings change.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Number of entries currently held (including not-yet-evicted stale ones).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(sub: &str, exp: i64) -> VerifiedPrincipal {
        VerifiedPrincipal {
            subject: Some(sub.to_string()),
            expires_at: Some(exp),
            ..Default::default()
        }
    }

    fn far_future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_fingerprint_short_token_verbatim() {
        let token = "a".repeat(39);
        assert_eq!(token_fingerprint(&token).as_str(), token);
    }

    #[test]
    fn test_fingerprint_long_token() {
        let token = format!("{}{}{}", "A".repeat(16), "m".repeat(20), "Z".repeat(16));
        let fp = token_fingerprint(&token);
        assert_eq!(
            fp.as_str(),
            format!("{}...{}:52", "A".repeat(16), "Z".repeat(16))
        );
    }

    #[test]
    fn test_fingerprint_distinguishes_length() {
        let a = format!("{}{}{}", "x".repeat(16), "y".repeat(10), "z".repeat(16));
        let b = format!("{}{}{}", "x".repeat(16), "y".repeat(11), "z".repeat(16));
        assert_ne!(token_fingerprint(&a), token_fingerprint(&b));
    }

    #[test]
    fn test_cache_hit_before_expiry() {
        let mut cache = VerificationCache::default();
        let exp = 2_000_000;
        cache.insert_at("token-1", principal("alice", exp));

        let now = exp * 1000 - TOKEN_CACHE_BUFFER_MS - 1;
        let hit = cache.get_at("token-1", now).expect("cached");
        assert_eq!(hit.subject.as_deref(), Some("alice"));
    }

    #[test]
    fn test_cache_expires_buffer_before_exp() {
        let mut cache = VerificationCache::default();
        let exp = 2_000_000;
        cache.insert_at("token-1", principal("alice", exp));

        let now = exp * 1000 - TOKEN_CACHE_BUFFER_MS;
        assert!(cache.get_at("token-1", now).is_none());
        // Expired entry is evicted, not merely hidden.
        assert!(cache.is_empty());
        assert!(cache.order.is_empty());
    }

    #[test]
    fn test_cache_missing_exp_is_never_served() {
        let mut cache = VerificationCache::default();
        let mut p = principal("alice", 0);
        p.expires_at = None;
        cache.insert("token-1", p);
        assert!(cache.get("token-1").is_none());
    }

    #[test]
    fn test_cache_fifo_eviction() {
        let mut cache = VerificationCache::default();
        let exp = far_future();

        for i in 0..MAX_TOKEN_CACHE_SIZE {
            cache.insert(&format!("token-{}", i), principal("u", exp));
        }
        assert_eq!(cache.len(), MAX_TOKEN_CACHE_SIZE);

        // Reading the oldest entry must not protect it (FIFO, not LRU).
        assert!(cache.get("token-0").is_some());

        cache.insert("token-new", principal("u", exp));
        assert_eq!(cache.len(), MAX_TOKEN_CACHE_SIZE);
        assert!(cache.get("token-0").is_none());
        assert!(cache.get("token-1").is_some());
        assert!(cache.get("token-new").is_some());
    }

    #[test]
    fn test_cache_overwrite_keeps_position() {
        let mut cache = VerificationCache::new(2);
        let exp = far_future();

        cache.insert("a", principal("first", exp));
        cache.insert("b", principal("b", exp));
        cache.insert("a", principal("second", exp));
        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.get("a").and_then(|p| p.subject),
            Some("second".to_string())
        );

        cache.insert("c", principal("c", exp));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_cache_clear() {
        let mut cache = VerificationCache::default();
        cache.insert("a", principal("a", far_future()));
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get("a").is_none());
    }
}
