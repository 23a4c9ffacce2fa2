//! Real-time cache invalidation from publish events.
//!
//! An always-on set of subscriptions against the invalidation relays turns
//! arriving publish events into cache writes, so most lookups are in-process
//! map hits before any client asks. Without it, stale mappings would linger
//! until TTL expiry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, CacheValue, Namespace};
use crate::config::Settings;
use crate::event::{
    req_frame, valid_sha256_hex, Event, Filter, MAPPING_KIND, RELAY_LIST_KIND, SERVER_LIST_KIND,
};
use crate::pool::connect_ws;

/// Mapping-event lookback that rehydrates the cache after downtime.
const MAPPING_LOOKBACK_SECS: u64 = 3600;

/// Lifecycle of the subscriber as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Disabled,
    Connecting,
    Live,
    Degraded,
    Closed,
}

/// Long-lived subscription task set feeding the cache store.
pub struct InvalidationSubscriber {
    cache: CacheStore,
    settings: Arc<Settings>,
    state: Arc<Mutex<SubscriberState>>,
    shutting_down: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InvalidationSubscriber {
    pub fn new(cache: CacheStore, settings: Arc<Settings>) -> Self {
        let initial = if settings.realtime_invalidation {
            SubscriberState::Connecting
        } else {
            SubscriberState::Disabled
        };
        Self {
            cache,
            settings,
            state: Arc::new(Mutex::new(initial)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(vec![]),
        }
    }

    pub fn state(&self) -> SubscriberState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SubscriberState::Closed)
    }

    /// Open the subscriptions eagerly. A no-op when disabled by config.
    pub fn start(&self) {
        if !self.settings.realtime_invalidation {
            return;
        }
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(_) => return,
        };
        if !tasks.is_empty() {
            return;
        }
        for relay in self.settings.invalidation_relays.clone() {
            let cache = self.cache.clone();
            let settings = self.settings.clone();
            let state = self.state.clone();
            let shutting_down = self.shutting_down.clone();
            tasks.push(tokio::spawn(async move {
                run_relay(relay, cache, settings, state, shutting_down).await;
            }));
        }
    }

    /// Stop all subscriptions and cancel pending reconnects. Idempotent.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        set_state(&self.state, SubscriberState::Closed);
    }
}

fn set_state(state: &Arc<Mutex<SubscriberState>>, next: SubscriberState) {
    if let Ok(mut state) = state.lock() {
        // CLOSED is terminal
        if *state != SubscriberState::Closed {
            *state = next;
        }
    }
}

/// Subscribe to one relay forever, reconnecting after drops.
async fn run_relay(
    relay: String,
    cache: CacheStore,
    settings: Arc<Settings>,
    state: Arc<Mutex<SubscriberState>>,
    shutting_down: Arc<AtomicBool>,
) {
    loop {
        if shutting_down.load(Ordering::SeqCst) {
            break;
        }
        set_state(&state, SubscriberState::Connecting);
        if let Err(e) = subscribe_once(&relay, &cache, &settings, &state).await {
            warn!(relay = relay.as_str(), "invalidation subscription error: {e:#}");
        }
        if shutting_down.load(Ordering::SeqCst) {
            break;
        }
        set_state(&state, SubscriberState::Degraded);
        debug!(
            relay = relay.as_str(),
            "invalidation subscription lost, reconnecting after delay"
        );
        tokio::time::sleep(settings.invalidation_reconnect_delay).await;
    }
}

/// One connection's lifetime: subscribe to the three filters and feed every
/// received event into the cache until the socket closes.
async fn subscribe_once(
    relay: &str,
    cache: &CacheStore,
    settings: &Settings,
    state: &Arc<Mutex<SubscriberState>>,
) -> Result<()> {
    let mut ws = connect_ws(relay, settings.tor_socks.as_deref()).await?;
    let now = unix_now();
    let filters = [
        (
            "inv-map",
            Filter {
                kinds: Some(vec![MAPPING_KIND]),
                since: Some(now.saturating_sub(MAPPING_LOOKBACK_SECS)),
                ..Default::default()
            },
        ),
        (
            "inv-rel",
            Filter {
                kinds: Some(vec![RELAY_LIST_KIND]),
                since: Some(now),
                ..Default::default()
            },
        ),
        (
            "inv-srv",
            Filter {
                kinds: Some(vec![SERVER_LIST_KIND]),
                since: Some(now),
                ..Default::default()
            },
        ),
    ];
    for (sub_id, filter) in &filters {
        ws.send(Message::Text(req_frame(sub_id, filter))).await?;
    }
    set_state(state, SubscriberState::Live);
    info!(relay, "invalidation subscriptions live");
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(txt) => {
                if let Some(ev) = parse_event(&txt) {
                    if let Err(e) = handle_event(cache, settings, &ev).await {
                        warn!(
                            event = ev.id.as_str(),
                            kind = ev.kind,
                            pubkey = ev.pubkey.as_str(),
                            "invalidation handler error: {e:#}"
                        );
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// Extract the event payload from an `["EVENT", sub, {…}]` frame.
fn parse_event(txt: &str) -> Option<Event> {
    let val = serde_json::from_str::<Value>(txt).ok()?;
    let arr = val.as_array()?;
    if arr.first()?.as_str()? != "EVENT" || arr.len() < 3 {
        return None;
    }
    serde_json::from_value(arr[2].clone()).ok()
}

/// Apply one publish event to the cache.
async fn handle_event(cache: &CacheStore, settings: &Settings, ev: &Event) -> Result<()> {
    match ev.kind {
        MAPPING_KIND => {
            let Some(path) = ev.tag_value("d") else {
                // a mapping without a path is meaningless
                return Ok(());
            };
            let key = format!("{}{}", ev.pubkey, path);
            match ev.tag_value("x") {
                Some(sha) if valid_sha256_hex(sha) => {
                    if let Some(CacheValue::PathMapping { created_at, .. }) =
                        cache.get(Namespace::Paths, &key).await
                    {
                        if created_at > ev.created_at {
                            return Ok(());
                        }
                    }
                    cache
                        .put(
                            Namespace::Paths,
                            &key,
                            &CacheValue::PathMapping {
                                pubkey: ev.pubkey.clone(),
                                path: path.to_string(),
                                sha256: sha.to_lowercase(),
                                created_at: ev.created_at,
                            },
                        )
                        .await;
                    debug!(pubkey = ev.pubkey.as_str(), path, "mapping pre-cached");
                }
                _ => {
                    // a mapping without a hash revokes the path
                    cache.delete(Namespace::Paths, &key).await;
                    debug!(pubkey = ev.pubkey.as_str(), path, "mapping invalidated");
                }
            }
        }
        RELAY_LIST_KIND => {
            let urls = ev.relay_urls();
            let relays = if urls.is_empty() {
                settings.default_relays.clone()
            } else {
                urls
            };
            cache
                .put(
                    Namespace::Relays,
                    &ev.pubkey,
                    &CacheValue::RelayList { relays },
                )
                .await;
        }
        SERVER_LIST_KIND => {
            let urls = ev.server_urls();
            let servers = if urls.is_empty() {
                settings.default_servers.clone()
            } else {
                urls
            };
            cache
                .put(
                    Namespace::Servers,
                    &ev.pubkey,
                    &CacheValue::ServerList { servers },
                )
                .await;
        }
        kind => debug!(kind, "ignoring unexpected event kind"),
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
