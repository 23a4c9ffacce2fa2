//! Namespaced, TTL'd cache store shared by every component.
//!
//! The store owns all cached values; everything else is a transient reader or
//! producer. Backend failures never escape: a failed read is a miss and a
//! failed write is logged and dropped, so callers treat the cache as advisory.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::Settings;

/// Sub-caches with independent value types and default TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// lowercase hostname label -> publisher key
    Domains,
    /// pubkey -> relay list
    Relays,
    /// pubkey -> blob server list
    Servers,
    /// pubkey + path -> path mapping
    Paths,
    /// sha256 -> URLs known to have served the blob
    Blobs,
    /// sha256 -> blob bytes
    Content,
    /// short-lived absence marks
    Negative,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Domains => "domains",
            Namespace::Relays => "relays",
            Namespace::Servers => "servers",
            Namespace::Paths => "paths",
            Namespace::Blobs => "blobs",
            Namespace::Content => "content",
            Namespace::Negative => "negative",
        }
    }

    /// Default TTL for entries in this namespace.
    pub fn ttl(&self, settings: &Settings) -> Duration {
        match self {
            Namespace::Content => settings.content_cache_ttl,
            Namespace::Negative => settings.negative_cache_ttl,
            _ => settings.cache_default_ttl,
        }
    }

    /// Namespaces whose entries are refreshed on read under sliding expiration.
    fn slides(&self) -> bool {
        matches!(
            self,
            Namespace::Domains | Namespace::Relays | Namespace::Servers | Namespace::Paths
        )
    }
}

/// Tagged value envelope, one variant per namespace value type.
///
/// The tag makes entries self-describing so byte arrays survive the text
/// round trip; an unknown tag or a mismatched shape is rejected at read time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheValue {
    Pubkey { hex: String },
    RelayList { relays: Vec<String> },
    ServerList { servers: Vec<String> },
    PathMapping {
        pubkey: String,
        path: String,
        sha256: String,
        created_at: u64,
    },
    BlobUrls { urls: Vec<String> },
    Bytes { data: Vec<u8> },
    /// Unit value for negative marks.
    Present,
}

/// Handle to the process-wide cache, cheap to clone into tasks.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn Backend>,
    settings: Arc<Settings>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn Backend>, settings: Arc<Settings>) -> Self {
        Self { backend, settings }
    }

    /// Read-only lookup. Missing, expired, and corrupt entries are all absent.
    pub async fn get(&self, ns: Namespace, key: &str) -> Option<CacheValue> {
        let text = match self.backend.get(ns.as_str(), key).await {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!(ns = ns.as_str(), key, "cache read failed: {e:#}");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(ns = ns.as_str(), key, "corrupt cache entry dropped: {e}");
                None
            }
        }
    }

    /// Lookup that additionally restarts the TTL on a hit when sliding
    /// expiration is enabled and the namespace is eligible for it.
    pub async fn get_refreshing(&self, ns: Namespace, key: &str) -> Option<CacheValue> {
        let value = self.get(ns, key).await?;
        if self.settings.sliding_expiration && ns.slides() {
            self.refresh(ns, key, &value).await;
        }
        Some(value)
    }

    /// Store under the namespace default TTL.
    pub async fn put(&self, ns: Namespace, key: &str, value: &CacheValue) {
        self.put_ttl(ns, key, value, ns.ttl(&self.settings)).await;
    }

    /// Store under an explicit TTL. Backend errors are logged and dropped.
    pub async fn put_ttl(&self, ns: Namespace, key: &str, value: &CacheValue, ttl: Duration) {
        let text = match serde_json::to_string(value) {
            Ok(text) => text,
            Err(e) => {
                warn!(ns = ns.as_str(), key, "cache value failed to encode: {e}");
                return;
            }
        };
        if let Err(e) = self.backend.put(ns.as_str(), key, &text, ttl).await {
            warn!(ns = ns.as_str(), key, "cache write failed: {e:#}");
        }
    }

    pub async fn delete(&self, ns: Namespace, key: &str) {
        if let Err(e) = self.backend.delete(ns.as_str(), key).await {
            warn!(ns = ns.as_str(), key, "cache delete failed: {e:#}");
        }
    }

    pub async fn clear(&self, ns: Namespace) {
        if let Err(e) = self.backend.clear(ns.as_str()).await {
            warn!(ns = ns.as_str(), "cache clear failed: {e:#}");
        }
    }

    /// Refresh the pubkey-scoped entries behind a domain hit in parallel.
    ///
    /// This is a hint, not a contract: entries that are gone stay gone and
    /// backend failures are logged, never propagated.
    pub async fn touch_related(&self, pubkey_hex: &str, domain: &str) {
        let (relays, servers, domains) = tokio::join!(
            self.touch(Namespace::Relays, pubkey_hex),
            self.touch(Namespace::Servers, pubkey_hex),
            self.touch(Namespace::Domains, domain),
        );
        debug!(
            pubkey = pubkey_hex,
            domain, relays, servers, domains, "refreshed related entries"
        );
    }

    async fn touch(&self, ns: Namespace, key: &str) -> bool {
        match self.backend.touch(ns.as_str(), key, ns.ttl(&self.settings)).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(ns = ns.as_str(), key, "cache touch failed: {e:#}");
                false
            }
        }
    }

    /// Restart the TTL for a value just read; re-puts when the backend
    /// cannot extend in place.
    async fn refresh(&self, ns: Namespace, key: &str, value: &CacheValue) {
        let ttl = ns.ttl(&self.settings);
        match self.backend.touch(ns.as_str(), key, ttl).await {
            Ok(true) => {}
            Ok(false) => self.put_ttl(ns, key, value, ttl).await,
            Err(e) => warn!(ns = ns.as_str(), key, "cache refresh failed: {e:#}"),
        }
    }
}
