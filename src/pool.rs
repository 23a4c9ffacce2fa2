//! Relay connection pool: long-lived WebSockets, query fan-out, idle cleanup.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::event::{close_frame, req_frame, Event, Filter};

/// Grace period after the first event of a unique lookup before returning.
const EARLY_TERMINATION_GRACE: Duration = Duration::from_millis(200);

/// Updates routed to a subscription's collector.
enum SubUpdate {
    Event(Event),
    Eose,
}

type SubSender = mpsc::UnboundedSender<SubUpdate>;
type SubMap = Arc<Mutex<HashMap<String, SubSender>>>;

/// One logical connection per relay URL.
struct RelayConn {
    url: String,
    out: mpsc::UnboundedSender<Message>,
    subs: SubMap,
    last_used: Mutex<Instant>,
    reader: JoinHandle<()>,
}

impl RelayConn {
    fn subscribe(&self, sub_id: &str, tx: SubSender) {
        if let Ok(mut subs) = self.subs.lock() {
            subs.insert(sub_id.to_string(), tx);
        }
    }

    fn unsubscribe(&self, sub_id: &str) {
        if let Ok(mut subs) = self.subs.lock() {
            subs.remove(sub_id);
        }
    }

    fn send(&self, text: String) -> bool {
        self.out.send(Message::Text(text)).is_ok()
    }

    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn is_dead(&self) -> bool {
        self.reader.is_finished() || self.out.is_closed()
    }

    /// Close the socket and wake any pending subscriptions.
    fn close(&self) {
        debug!(relay = self.url.as_str(), "closing relay connection");
        let _ = self.out.send(Message::Close(None));
        self.reader.abort();
        if let Ok(mut subs) = self.subs.lock() {
            for (_, tx) in subs.drain() {
                let _ = tx.send(SubUpdate::Eose);
            }
        }
    }
}

/// Owns all outgoing relay connections and multiplexes queries onto them.
pub struct RelayPool {
    conns: Arc<Mutex<HashMap<String, Arc<RelayConn>>>>,
    proxy: Option<String>,
    idle_threshold: Duration,
    janitor: Mutex<Option<JoinHandle<()>>>,
    next_sub: AtomicU64,
}

impl RelayPool {
    /// Create the pool and start its cleanup janitor. No connections are
    /// opened until the first query needs them.
    pub fn new(
        idle_threshold: Duration,
        cleanup_interval: Duration,
        proxy: Option<String>,
    ) -> Self {
        let conns: Arc<Mutex<HashMap<String, Arc<RelayConn>>>> = Arc::default();
        let janitor_conns = conns.clone();
        let janitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                Self::reap_idle(&janitor_conns, idle_threshold);
            }
        });
        Self {
            conns,
            proxy,
            idle_threshold,
            janitor: Mutex::new(Some(janitor)),
            next_sub: AtomicU64::new(0),
        }
    }

    /// Broadcast `filter` to every reachable relay in `relays` and collect
    /// events until all contacted relays signal end-of-stored-events or the
    /// timeout fires. Partial completion is not an error; individual relay
    /// failures never fail the query.
    pub async fn query(&self, relays: &[String], filter: &Filter, timeout: Duration) -> Vec<Event> {
        let sub_id = format!("q{}", self.next_sub.fetch_add(1, Ordering::Relaxed));
        let end = tokio::time::Instant::now() + timeout;
        let ordered = self.prioritize(relays);

        let attempts = ordered.iter().map(|url| async {
            match tokio::time::timeout(timeout, self.get_or_connect(url)).await {
                Ok(Ok(conn)) => Some(conn),
                Ok(Err(e)) => {
                    debug!(relay = url.as_str(), "relay unavailable for query: {e:#}");
                    None
                }
                Err(_) => {
                    debug!(relay = url.as_str(), "relay connect timed out");
                    None
                }
            }
        });
        let results = futures_util::future::join_all(attempts).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut contacted = vec![];
        let req = req_frame(&sub_id, filter);
        for conn in results.into_iter().flatten() {
            conn.subscribe(&sub_id, tx.clone());
            if conn.send(req.clone()) {
                conn.touch();
                contacted.push(conn);
            } else {
                conn.unsubscribe(&sub_id);
            }
        }
        drop(tx);
        if contacted.is_empty() {
            return vec![];
        }

        let unique = filter.is_unique_lookup();
        let mut deadline = Box::pin(tokio::time::sleep_until(end));
        let mut remaining = contacted.len();
        let mut seen = HashSet::new();
        let mut events: Vec<Event> = vec![];
        loop {
            tokio::select! {
                _ = deadline.as_mut() => break,
                update = rx.recv() => match update {
                    Some(SubUpdate::Event(ev)) => {
                        if seen.insert(ev.id.clone()) {
                            events.push(ev);
                        }
                        if unique {
                            // first answer in hand: wait only a short grace
                            // period for a newer one before returning
                            let grace = tokio::time::Instant::now() + EARLY_TERMINATION_GRACE;
                            deadline.as_mut().reset(grace.min(end));
                        }
                    }
                    Some(SubUpdate::Eose) => {
                        remaining = remaining.saturating_sub(1);
                        if remaining == 0 {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        let close = close_frame(&sub_id);
        for conn in &contacted {
            conn.unsubscribe(&sub_id);
            conn.send(close.clone());
            conn.touch();
        }
        events
    }

    /// Reuse the live connection for `url` or establish a new one.
    async fn get_or_connect(&self, url: &str) -> Result<Arc<RelayConn>> {
        if let Ok(mut conns) = self.conns.lock() {
            if let Some(conn) = conns.get(url).cloned() {
                if !conn.is_dead() {
                    return Ok(conn);
                }
                conn.close();
                conns.remove(url);
            }
        }
        let conn = Arc::new(spawn_conn(url, self.proxy.as_deref()).await?);
        let mut conns = self
            .conns
            .lock()
            .map_err(|_| anyhow!("connection table lock poisoned"))?;
        // a racing caller may have connected first; keep the existing one
        match conns.get(url) {
            Some(existing) if !existing.is_dead() => {
                conn.close();
                Ok(existing.clone())
            }
            _ => {
                conns.insert(url.to_string(), conn.clone());
                Ok(conn)
            }
        }
    }

    /// Stable ordering hint: relays with a warm connection come first,
    /// caller order is preserved within each class. Duplicates are dropped.
    fn prioritize(&self, relays: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let deduped: Vec<String> = relays
            .iter()
            .filter(|u| seen.insert((*u).clone()))
            .cloned()
            .collect();
        let connected: HashSet<String> = match self.conns.lock() {
            Ok(conns) => conns
                .iter()
                .filter(|(_, c)| !c.is_dead())
                .map(|(url, _)| url.clone())
                .collect(),
            Err(_) => HashSet::new(),
        };
        let (warm, cold): (Vec<_>, Vec<_>) = deduped
            .into_iter()
            .partition(|u| connected.contains(u));
        warm.into_iter().chain(cold).collect()
    }

    /// Close every connection idle beyond `threshold`. Called by the janitor
    /// on each tick.
    fn reap_idle(conns: &Mutex<HashMap<String, Arc<RelayConn>>>, threshold: Duration) {
        let Ok(mut conns) = conns.lock() else { return };
        conns.retain(|url, conn| {
            if conn.is_dead() || conn.idle_for() >= threshold {
                debug!(relay = url.as_str(), "closing idle relay connection");
                conn.close();
                false
            } else {
                true
            }
        });
    }

    /// Run one janitor pass now. Exposed for deterministic cleanup tests.
    pub fn sweep(&self) {
        Self::reap_idle(&self.conns, self.idle_threshold);
    }

    /// Number of live pooled connections.
    pub fn connection_count(&self) -> usize {
        self.conns.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Close all connections and stop the janitor. Idempotent.
    pub fn shutdown(&self) {
        if let Ok(mut janitor) = self.janitor.lock() {
            if let Some(handle) = janitor.take() {
                handle.abort();
            }
        }
        if let Ok(mut conns) = self.conns.lock() {
            for (_, conn) in conns.drain() {
                conn.close();
            }
        }
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Establish a connection and spawn its reader and writer tasks.
async fn spawn_conn(url: &str, proxy: Option<&str>) -> Result<RelayConn> {
    let ws = connect_ws(url, proxy).await?;
    let (mut sink, mut stream) = ws.split();
    let (out, mut out_rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });
    let subs: SubMap = Arc::default();
    let reader_subs = subs.clone();
    let reader_url = url.to_string();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(txt) => route_frame(&txt, &reader_subs),
                Message::Close(_) => break,
                _ => {}
            }
        }
        debug!(relay = reader_url.as_str(), "relay connection closed");
        // wake pending subscriptions so queries do not stall on this relay
        if let Ok(mut subs) = reader_subs.lock() {
            for (_, tx) in subs.drain() {
                let _ = tx.send(SubUpdate::Eose);
            }
        }
    });
    Ok(RelayConn {
        url: url.to_string(),
        out,
        subs,
        last_used: Mutex::new(Instant::now()),
        reader,
    })
}

/// Route an incoming `EVENT`/`EOSE` frame to its subscription.
fn route_frame(txt: &str, subs: &SubMap) {
    let Ok(val) = serde_json::from_str::<Value>(txt) else {
        return;
    };
    let Some(arr) = val.as_array() else { return };
    let update = match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 3 => {
            match serde_json::from_value::<Event>(arr[2].clone()) {
                Ok(ev) => SubUpdate::Event(ev),
                Err(e) => {
                    debug!("dropping malformed event: {e}");
                    return;
                }
            }
        }
        Some("EOSE") if arr.len() >= 2 => SubUpdate::Eose,
        _ => return,
    };
    let Some(sub_id) = arr.get(1).and_then(|v| v.as_str()) else {
        return;
    };
    let Ok(mut subs) = subs.lock() else { return };
    if let Some(tx) = subs.get(sub_id) {
        if tx.send(update).is_err() {
            subs.remove(sub_id);
        }
    }
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
///
/// `TcpStream` and `Socks5Stream` are boxed behind `dyn AsyncReadWrite` so
/// the caller handles both transports uniformly.
pub(crate) async fn connect_ws(
    relay: &str,
    proxy: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = proxy {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
