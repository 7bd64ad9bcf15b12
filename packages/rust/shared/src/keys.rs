//! Resource key derivation and the shared store's key-space.
//!
//! [`ResourceKey::durable`] names cache entries and must be stable for an
//! address. [`ResourceKey::scratch`] names transient files and is unique per
//! call. The two are separate constructors so a salted name can never end up
//! as a cache key.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use crate::types::ArticleKey;

/// Hard upper bound on a derived key, safe for common filesystems.
pub const MAX_KEY_LEN: usize = 210;

/// Hex digits of the address digest appended to every durable key.
const DIGEST_HEX_LEN: usize = 16;

/// Room left for the encoded address once the digest suffix is attached.
const ENCODED_PREFIX_LEN: usize = MAX_KEY_LEN - DIGEST_HEX_LEN - 1;

/// Filesystem- and store-safe identifier derived from a resource address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Deterministic key for the durable cache. Equal addresses always map
    /// to equal keys; the digest suffix keeps truncated prefixes apart.
    pub fn durable(address: &str) -> Self {
        let mut key = encoded_prefix(address);
        key.push('_');
        key.push_str(&digest_hex(address));
        Self(key)
    }

    /// Unique key for scratch files derived from `address`. Never use it to
    /// look anything up.
    pub fn scratch(address: &str) -> Self {
        let salt = uuid::Uuid::now_v7().simple().to_string();
        let mut key = encoded_prefix(address);
        key.truncate(MAX_KEY_LEN - salt.len() - 1);
        key.push('_');
        key.push_str(&salt);
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Separators to `_`, base64, then anything outside `[A-Za-z0-9]` to `_`.
fn encoded_prefix(address: &str) -> String {
    let normalized = address.replace([':', '/', '\\'], "_");
    let encoded = URL_SAFE_NO_PAD.encode(normalized.as_bytes());
    encoded
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(ENCODED_PREFIX_LEN)
        .collect()
}

fn digest_hex(address: &str) -> String {
    let hash = Sha256::digest(address.as_bytes());
    let mut out = format!("{hash:x}");
    out.truncate(DIGEST_HEX_LEN);
    out
}

// ---------------------------------------------------------------------------
// Key-space
// ---------------------------------------------------------------------------

/// Prefixes for every record kind in the shared store.
pub mod space {
    use super::ArticleKey;

    pub const FETCH_STATE: &str = "crawler:";
    pub const PAGE: &str = "page:";
    pub const SCREENSHOT: &str = "screenshot:";
    pub const BUSY: &str = "busy:";
    pub const DONE: &str = "done:";
    pub const ARTICLE: &str = "article:";
    pub const SUMMARY: &str = "summary:";
    pub const FEED: &str = "feed:";

    /// `crawler:<address>`
    pub fn fetch_state(address: &str) -> String {
        format!("{FETCH_STATE}{address}")
    }

    /// `page:<address>`
    pub fn page(address: &str) -> String {
        format!("{PAGE}{address}")
    }

    /// `screenshot:<address>`
    pub fn screenshot(address: &str) -> String {
        format!("{SCREENSHOT}{address}")
    }

    /// `busy:<articleKey>`
    pub fn busy(key: &ArticleKey) -> String {
        format!("{BUSY}{key}")
    }

    /// `done:<articleKey>`
    pub fn done(key: &ArticleKey) -> String {
        format!("{DONE}{key}")
    }

    /// `article:<feed>:<index>`
    pub fn article(key: &ArticleKey) -> String {
        format!("{ARTICLE}{key}")
    }

    /// `article:<feed>:`, the prefix of all articles of one feed.
    pub fn articles_of(feed: &str) -> String {
        format!("{ARTICLE}{feed}:")
    }

    /// `summary:<articleKey>`
    pub fn summary(key: &ArticleKey) -> String {
        format!("{SUMMARY}{key}")
    }

    /// `feed:<name>`
    pub fn feed(name: &str) -> String {
        format!("{FEED}{name}")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn corpus() -> Vec<String> {
        let hosts = [
            "https://tildes.net",
            "https://news.ycombinator.com",
            "http://example.com",
            "https://lobste.rs",
        ];
        let mut out = Vec::with_capacity(10_000);
        for i in 0..10_000 {
            let host = hosts[i % hosts.len()];
            let addr = match i % 5 {
                0 => format!("{host}/~comp/{i:x}/a-long-discussion-title"),
                1 => format!("{host}/item?id={}", 40_000_000 + i),
                2 => format!(
                    "{host}/very/deep/path/{}/{i}",
                    "segment/".repeat(30)
                ),
                3 => format!("{host}/s/{i}/comments#c{}", i * 7),
                _ => format!("{host}/search?q=rust+{i}&page=2"),
            };
            out.push(addr);
        }
        out
    }

    #[test]
    fn durable_is_deterministic() {
        let addr = "https://tildes.net/~tech/1abc/some_title";
        assert_eq!(ResourceKey::durable(addr), ResourceKey::durable(addr));
    }

    #[test]
    fn durable_has_no_collisions_across_corpus() {
        let addresses = corpus();
        let keys: HashSet<ResourceKey> =
            addresses.iter().map(|a| ResourceKey::durable(a)).collect();
        assert_eq!(keys.len(), addresses.len());
    }

    #[test]
    fn keys_are_bounded_and_safe() {
        let long = format!("https://example.com/{}", "x/".repeat(500));
        for key in [ResourceKey::durable(&long), ResourceKey::scratch(&long)] {
            assert!(key.as_str().len() <= MAX_KEY_LEN, "{} too long", key.as_str().len());
            assert!(
                key.as_str()
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            );
        }
    }

    #[test]
    fn separators_that_normalize_alike_stay_distinct() {
        let a = ResourceKey::durable("https://a.test/x:y");
        let b = ResourceKey::durable("https://a.test/x/y");
        assert_ne!(a, b);
    }

    #[test]
    fn scratch_keys_are_unique_and_never_durable() {
        let addr = "https://example.com/page";
        let s1 = ResourceKey::scratch(addr);
        let s2 = ResourceKey::scratch(addr);
        assert_ne!(s1, s2);
        assert_ne!(s1, ResourceKey::durable(addr));
    }

    #[test]
    fn key_space_shapes() {
        let key = ArticleKey {
            feed: "tildes".into(),
            index: "20240301T000000.000Zguid".into(),
        };
        assert_eq!(
            space::article(&key),
            "article:tildes:20240301T000000.000Zguid"
        );
        assert!(space::article(&key).starts_with(&space::articles_of("tildes")));
        assert_eq!(space::fetch_state("https://x.test"), "crawler:https://x.test");
        assert_eq!(space::busy(&key), "busy:tildes:20240301T000000.000Zguid");
    }
}
