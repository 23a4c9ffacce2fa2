//! Read path: translate `(pubkey, path)` into a blob hash via cache and relays.

use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheStore, CacheValue, Namespace};
use crate::config::Settings;
use crate::event::{newest, valid_sha256_hex, Filter, MAPPING_KIND, RELAY_LIST_KIND, SERVER_LIST_KIND};
use crate::keys::Pubkey;
use crate::pool::RelayPool;

/// Conventional fallback document consulted when a path has no mapping.
const NOT_FOUND_PATH: &str = "/404.html";

/// Outcome of one relay lookup for a path mapping.
enum Lookup {
    /// A mapping event carried a content hash.
    Found(String),
    /// No event came back; the verdict depends on the fallback.
    Missing,
    /// An event came back without a content hash; the path is gone.
    Revoked,
}

/// Resolves list documents and path mappings, cache-first with relay fallback.
///
/// Every operation is infallible at this boundary: relay trouble reads as
/// "no result" and falls through to defaults or a negative mark.
#[derive(Clone)]
pub struct Resolver {
    cache: CacheStore,
    pool: Arc<RelayPool>,
    settings: Arc<Settings>,
}

impl Resolver {
    pub fn new(cache: CacheStore, pool: Arc<RelayPool>, settings: Arc<Settings>) -> Self {
        Self {
            cache,
            pool,
            settings,
        }
    }

    /// Preferred read relays for a pubkey, defaulting to the configured seed
    /// relays when the user has published no usable list.
    pub async fn relay_list(&self, pubkey: &Pubkey) -> Vec<String> {
        let key = pubkey.hex();
        if let Some(CacheValue::RelayList { relays }) =
            self.cache.get_refreshing(Namespace::Relays, &key).await
        {
            return relays;
        }
        let filter = Filter {
            authors: Some(vec![key.clone()]),
            kinds: Some(vec![RELAY_LIST_KIND]),
            limit: Some(1),
            ..Default::default()
        };
        let events = self
            .pool
            .query(
                &self.settings.default_relays,
                &filter,
                self.settings.relay_query_timeout,
            )
            .await;
        let relays = match newest(events) {
            Some(ev) => {
                let urls = ev.relay_urls();
                if urls.is_empty() {
                    self.settings.default_relays.clone()
                } else {
                    urls
                }
            }
            None => self.settings.default_relays.clone(),
        };
        self.cache
            .put(
                Namespace::Relays,
                &key,
                &CacheValue::RelayList {
                    relays: relays.clone(),
                },
            )
            .await;
        relays
    }

    /// Preferred blob servers for a pubkey, queried over the user's own
    /// relays, defaulting to the configured servers.
    pub async fn server_list(&self, pubkey: &Pubkey) -> Vec<String> {
        let key = pubkey.hex();
        if let Some(CacheValue::ServerList { servers }) =
            self.cache.get_refreshing(Namespace::Servers, &key).await
        {
            return servers;
        }
        let relays = self.relay_list(pubkey).await;
        let relays = if relays.is_empty() {
            self.settings.default_relays.clone()
        } else {
            relays
        };
        let filter = Filter {
            authors: Some(vec![key.clone()]),
            kinds: Some(vec![SERVER_LIST_KIND]),
            limit: Some(1),
            ..Default::default()
        };
        let events = self
            .pool
            .query(&relays, &filter, self.settings.relay_query_timeout)
            .await;
        let servers = match newest(events) {
            Some(ev) => {
                let urls = ev.server_urls();
                if urls.is_empty() {
                    self.settings.default_servers.clone()
                } else {
                    urls
                }
            }
            None => self.settings.default_servers.clone(),
        };
        self.cache
            .put(
                Namespace::Servers,
                &key,
                &CacheValue::ServerList {
                    servers: servers.clone(),
                },
            )
            .await;
        servers
    }

    /// Resolve the blob hash mapped to `(pubkey, path)`.
    ///
    /// Falls back once to `/404.html` when the requested path has no mapping.
    /// A path served through the fallback is not absent, so negative marks
    /// are only written once both the path and its fallback have missed;
    /// retries of a truly unmapped path then skip the relay round trip for
    /// the mark's TTL.
    pub async fn resolve_mapping(&self, pubkey: &Pubkey, path: &str) -> Option<String> {
        let author = pubkey.hex();
        // paths whose lookups came back empty, awaiting a terminal verdict
        let mut unresolved: Vec<String> = vec![];
        let mut current = path.to_string();
        // at most the requested path and the /404.html fallback
        for _ in 0..2 {
            let key = format!("{author}{current}");
            if let Some(CacheValue::PathMapping { sha256, .. }) =
                self.cache.get_refreshing(Namespace::Paths, &key).await
            {
                return Some(sha256);
            }
            if self
                .cache
                .get(Namespace::Negative, &negative_key(&key))
                .await
                .is_some()
            {
                debug!(path = current.as_str(), "negative mark hit");
                self.mark_negative_all(&unresolved).await;
                return None;
            }
            match self.query_mapping(pubkey, &current, &key).await {
                Lookup::Found(sha256) => return Some(sha256),
                Lookup::Revoked => {
                    unresolved.push(key);
                    self.mark_negative_all(&unresolved).await;
                    return None;
                }
                Lookup::Missing => unresolved.push(key),
            }
            if current != NOT_FOUND_PATH {
                current = NOT_FOUND_PATH.to_string();
                continue;
            }
            break;
        }
        self.mark_negative_all(&unresolved).await;
        None
    }

    /// One relay lookup for a path: user relays first, then the union with
    /// the defaults under a longer deadline.
    async fn query_mapping(&self, pubkey: &Pubkey, path: &str, key: &str) -> Lookup {
        let author = pubkey.hex();
        let filter = Filter {
            authors: Some(vec![author.clone()]),
            kinds: Some(vec![MAPPING_KIND]),
            d: Some(vec![path.to_string()]),
            limit: Some(1),
            ..Default::default()
        };
        let user_relays = self.relay_list(pubkey).await;
        let short = self.settings.relay_query_timeout;
        let mut events = self.pool.query(&user_relays, &filter, short).await;
        if events.is_empty() {
            let mut union = user_relays;
            for relay in &self.settings.default_relays {
                if !union.contains(relay) {
                    union.push(relay.clone());
                }
            }
            events = self.pool.query(&union, &filter, short * 2).await;
        }
        let Some(ev) = newest(events) else {
            return Lookup::Missing;
        };
        match ev.tag_value("x") {
            Some(sha) if valid_sha256_hex(sha) => {
                let sha256 = sha.to_lowercase();
                self.cache
                    .put(
                        Namespace::Paths,
                        key,
                        &CacheValue::PathMapping {
                            pubkey: author,
                            path: path.to_string(),
                            sha256: sha256.clone(),
                            created_at: ev.created_at,
                        },
                    )
                    .await;
                Lookup::Found(sha256)
            }
            _ => {
                debug!(path, event = ev.id.as_str(), "mapping event without content hash");
                Lookup::Revoked
            }
        }
    }

    async fn mark_negative_all(&self, keys: &[String]) {
        for key in keys {
            self.cache
                .put_ttl(
                    Namespace::Negative,
                    &negative_key(key),
                    &CacheValue::Present,
                    self.settings.negative_cache_ttl,
                )
                .await;
        }
    }
}

fn negative_key(paths_key: &str) -> String {
    format!("paths:{paths_key}")
}

/// Normalize an incoming HTTP path to the canonical mapped form.
pub fn normalize_path(path: &str) -> String {
    if path.ends_with('/') {
        return format!("{path}index.html");
    }
    let last = path.rsplit('/').next().unwrap_or("");
    if !last.contains('.') {
        return format!("{path}/index.html");
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::event::{Event, Tag};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    fn test_pubkey() -> Pubkey {
        Pubkey::from_hex(&"11".repeat(32)).unwrap()
    }

    fn sha() -> String {
        "ab".repeat(32)
    }

    fn mapping_event(pubkey: &Pubkey, path: &str, sha256: &str, created_at: u64) -> Event {
        Event {
            id: format!("ev-{path}-{created_at}"),
            pubkey: pubkey.hex(),
            kind: MAPPING_KIND,
            created_at,
            tags: vec![
                Tag(vec!["d".into(), path.into()]),
                Tag(vec!["x".into(), sha256.into()]),
            ],
            content: String::new(),
            sig: String::new(),
        }
    }

    /// Relay answering REQs from a fixed event set by matching kind and
    /// `#d`, counting the REQs it receives.
    async fn mock_relay(events: Vec<Event>, reqs: Arc<AtomicUsize>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let events = events.clone();
                let reqs = reqs.clone();
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        let TMsg::Text(txt) = msg else { continue };
                        let val: Value = serde_json::from_str(&txt).unwrap();
                        if val[0] != "REQ" {
                            continue;
                        }
                        reqs.fetch_add(1, Ordering::SeqCst);
                        let sub = val[1].as_str().unwrap().to_string();
                        let filter = &val[2];
                        let kinds: Vec<u64> = filter["kinds"]
                            .as_array()
                            .map(|a| a.iter().filter_map(|v| v.as_u64()).collect())
                            .unwrap_or_default();
                        let d = filter["#d"][0].as_str();
                        for ev in &events {
                            let kind_ok = kinds.is_empty() || kinds.contains(&(ev.kind as u64));
                            let d_ok = d.is_none() || ev.tag_value("d") == d;
                            if kind_ok && d_ok {
                                ws.send(TMsg::Text(json!(["EVENT", sub, ev]).to_string()))
                                    .await
                                    .unwrap();
                            }
                        }
                        ws.send(TMsg::Text(json!(["EOSE", sub]).to_string()))
                            .await
                            .unwrap();
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    fn settings_with_relay(relay: &str) -> Arc<Settings> {
        Arc::new(Settings {
            base_domain: "example.com".into(),
            bind_http: "127.0.0.1:0".into(),
            default_relays: vec![relay.to_string()],
            default_servers: vec!["https://fallback".into()],
            cache_backend: "memory".into(),
            cache_default_ttl: Duration::from_secs(60),
            negative_cache_ttl: Duration::from_secs(60),
            content_cache_ttl: Duration::from_secs(60),
            cache_max_entries: 64,
            sliding_expiration: false,
            relay_query_timeout: Duration::from_millis(800),
            connection_idle_threshold: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            realtime_invalidation: false,
            invalidation_relays: vec![relay.to_string()],
            invalidation_reconnect_delay: Duration::from_secs(5),
            max_file_size: 1024,
            request_timeout: Duration::from_secs(10),
            tor_socks: None,
        })
    }

    fn resolver(settings: Arc<Settings>) -> Resolver {
        let cache = CacheStore::new(Arc::new(MemoryBackend::new(64)), settings.clone());
        let pool = Arc::new(RelayPool::new(
            settings.connection_idle_threshold,
            settings.cleanup_interval,
            None,
        ));
        Resolver::new(cache, pool, settings)
    }

    #[test]
    fn normalize_path_rules() {
        assert_eq!(normalize_path("/"), "/index.html");
        assert_eq!(normalize_path("/blog/"), "/blog/index.html");
        assert_eq!(normalize_path("/about"), "/about/index.html");
        assert_eq!(normalize_path("/a.css"), "/a.css");
        assert_eq!(normalize_path("/docs/v1.2/guide"), "/docs/v1.2/guide/index.html");
    }

    #[tokio::test]
    async fn relay_list_defaults_cached_when_no_event() {
        let reqs = Arc::new(AtomicUsize::new(0));
        let relay = mock_relay(vec![], reqs.clone()).await;
        let rv = resolver(settings_with_relay(&relay));
        let pubkey = test_pubkey();

        let relays = rv.relay_list(&pubkey).await;
        assert_eq!(relays, vec![relay.clone()]);
        assert_eq!(reqs.load(Ordering::SeqCst), 1);

        // second lookup is served from the cache
        let relays = rv.relay_list(&pubkey).await;
        assert_eq!(relays, vec![relay]);
        assert_eq!(reqs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn relay_list_keeps_read_capable_entries_in_order() {
        let pubkey = test_pubkey();
        let ev = Event {
            id: "list".into(),
            pubkey: pubkey.hex(),
            kind: RELAY_LIST_KIND,
            created_at: 1,
            tags: vec![
                Tag(vec!["r".into(), "wss://u1".into(), "read".into()]),
                Tag(vec!["r".into(), "wss://u2".into()]),
                Tag(vec!["r".into(), "wss://u3".into(), "write".into()]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        let relay = mock_relay(vec![ev], Arc::default()).await;
        let rv = resolver(settings_with_relay(&relay));
        assert_eq!(rv.relay_list(&pubkey).await, vec!["wss://u1", "wss://u2"]);
    }

    #[tokio::test]
    async fn server_list_falls_back_to_defaults() {
        let relay = mock_relay(vec![], Arc::default()).await;
        let rv = resolver(settings_with_relay(&relay));
        let servers = rv.server_list(&test_pubkey()).await;
        assert_eq!(servers, vec!["https://fallback"]);
    }

    #[tokio::test]
    async fn server_list_parses_event_entries() {
        let pubkey = test_pubkey();
        let ev = Event {
            id: "servers".into(),
            pubkey: pubkey.hex(),
            kind: SERVER_LIST_KIND,
            created_at: 1,
            tags: vec![
                Tag(vec!["server".into(), "https://s1".into()]),
                Tag(vec!["server".into(), "https://s2".into()]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        let relay = mock_relay(vec![ev], Arc::default()).await;
        let rv = resolver(settings_with_relay(&relay));
        assert_eq!(
            rv.server_list(&pubkey).await,
            vec!["https://s1", "https://s2"]
        );
    }

    #[tokio::test]
    async fn mapping_resolved_from_relay_then_cached() {
        let reqs = Arc::new(AtomicUsize::new(0));
        let pubkey = test_pubkey();
        let relay = mock_relay(
            vec![mapping_event(&pubkey, "/index.html", &sha(), 1)],
            reqs.clone(),
        )
        .await;
        let rv = resolver(settings_with_relay(&relay));

        assert_eq!(
            rv.resolve_mapping(&pubkey, "/index.html").await,
            Some(sha())
        );
        let after_first = reqs.load(Ordering::SeqCst);

        // cache hit: no further relay traffic
        assert_eq!(
            rv.resolve_mapping(&pubkey, "/index.html").await,
            Some(sha())
        );
        assert_eq!(reqs.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn mapping_served_from_cache_without_any_query() {
        let reqs = Arc::new(AtomicUsize::new(0));
        let relay = mock_relay(vec![], reqs.clone()).await;
        let settings = settings_with_relay(&relay);
        let pubkey = test_pubkey();
        let cache = CacheStore::new(Arc::new(MemoryBackend::new(64)), settings.clone());
        cache
            .put(
                Namespace::Paths,
                &format!("{}{}", pubkey.hex(), "/index.html"),
                &CacheValue::PathMapping {
                    pubkey: pubkey.hex(),
                    path: "/index.html".into(),
                    sha256: sha(),
                    created_at: 1,
                },
            )
            .await;
        let pool = Arc::new(RelayPool::new(
            settings.connection_idle_threshold,
            settings.cleanup_interval,
            None,
        ));
        let rv = Resolver::new(cache, pool, settings);
        assert_eq!(
            rv.resolve_mapping(&pubkey, "/index.html").await,
            Some(sha())
        );
        assert_eq!(reqs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn newest_mapping_wins() {
        let pubkey = test_pubkey();
        let old = mapping_event(&pubkey, "/index.html", &"cc".repeat(32), 1);
        let new = mapping_event(&pubkey, "/index.html", &sha(), 9);
        let relay = mock_relay(vec![old, new], Arc::default()).await;
        let rv = resolver(settings_with_relay(&relay));
        assert_eq!(
            rv.resolve_mapping(&pubkey, "/index.html").await,
            Some(sha())
        );
    }

    #[tokio::test]
    async fn missing_path_falls_back_to_404_document() {
        let pubkey = test_pubkey();
        let relay = mock_relay(
            vec![mapping_event(&pubkey, "/404.html", &sha(), 1)],
            Arc::default(),
        )
        .await;
        let rv = resolver(settings_with_relay(&relay));
        assert_eq!(rv.resolve_mapping(&pubkey, "/missing").await, Some(sha()));
        // a path served through the fallback is not absent: repeating the
        // request inside the negative TTL must resolve the same way
        assert_eq!(rv.resolve_mapping(&pubkey, "/missing").await, Some(sha()));
    }

    #[tokio::test]
    async fn negative_mark_suppresses_requery() {
        let reqs = Arc::new(AtomicUsize::new(0));
        let relay = mock_relay(vec![], reqs.clone()).await;
        let rv = resolver(settings_with_relay(&relay));
        let pubkey = test_pubkey();

        assert_eq!(rv.resolve_mapping(&pubkey, "/nope").await, None);
        let after_first = reqs.load(Ordering::SeqCst);
        assert!(after_first > 0);

        // second miss within the negative TTL issues no relay traffic
        assert_eq!(rv.resolve_mapping(&pubkey, "/nope").await, None);
        assert_eq!(reqs.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn mapping_without_x_tag_marks_negative() {
        let pubkey = test_pubkey();
        let mut ev = mapping_event(&pubkey, "/index.html", &sha(), 1);
        ev.tags.retain(|Tag(fields)| fields[0] != "x");
        let reqs = Arc::new(AtomicUsize::new(0));
        let relay = mock_relay(vec![ev], reqs.clone()).await;
        let rv = resolver(settings_with_relay(&relay));

        assert_eq!(rv.resolve_mapping(&pubkey, "/index.html").await, None);
        let after_first = reqs.load(Ordering::SeqCst);
        assert_eq!(rv.resolve_mapping(&pubkey, "/index.html").await, None);
        assert_eq!(reqs.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn unreachable_relays_resolve_to_absent() {
        let settings = settings_with_relay("ws://127.0.0.1:1");
        let rv = resolver(settings);
        assert_eq!(rv.resolve_mapping(&test_pubkey(), "/x.html").await, None);
    }
}
