//! Gossip event model shared by the pool, resolver, and subscriber.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// File-path mapping events: `["d", path]` plus `["x", sha256]`.
pub const MAPPING_KIND: u32 = 34128;
/// Preferred-relay list events: `["r", url, marker?]`.
pub const RELAY_LIST_KIND: u32 = 10002;
/// Preferred-blob-server list events: `["server", url]`.
pub const SERVER_LIST_KIND: u32 = 10063;

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Signed event received from the gossip network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `34128` or `10002`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the named tag, if present.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|Tag(fields)| match fields.as_slice() {
            [t, val, ..] if t == name => Some(val.as_str()),
            _ => None,
        })
    }

    /// Read-capable relay URLs from `["r", url, marker?]` tags.
    ///
    /// An entry counts as read-capable when the marker is absent or `"read"`.
    /// Duplicates are removed, insertion order is preserved, and only `ws://`
    /// or `wss://` URLs are accepted.
    pub fn relay_urls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut urls = vec![];
        for Tag(fields) in &self.tags {
            let (url, readable) = match fields.as_slice() {
                [t, url] if t == "r" => (url, true),
                [t, url, marker, ..] if t == "r" => (url, marker == "read"),
                _ => continue,
            };
            if readable && is_relay_url(url) && seen.insert(url.clone()) {
                urls.push(url.clone());
            }
        }
        urls
    }

    /// Blob-server URLs from `["server", url]` tags, deduped, order preserved.
    pub fn server_urls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut urls = vec![];
        for Tag(fields) in &self.tags {
            if let [t, url, ..] = fields.as_slice() {
                if t == "server"
                    && (url.starts_with("http://") || url.starts_with("https://"))
                    && seen.insert(url.clone())
                {
                    urls.push(url.clone());
                }
            }
        }
        urls
    }
}

fn is_relay_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

/// Subscription filter sent in `REQ` messages.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub d: Option<Vec<String>>,
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    /// Assemble the wire JSON object for this filter.
    pub fn to_value(&self) -> Value {
        let mut filter = serde_json::Map::new();
        if let Some(a) = self.authors.clone() {
            filter.insert(
                "authors".into(),
                Value::Array(a.into_iter().map(Value::String).collect()),
            );
        }
        if let Some(k) = self.kinds.clone() {
            filter.insert(
                "kinds".into(),
                Value::Array(k.into_iter().map(|v| Value::Number(v.into())).collect()),
            );
        }
        if let Some(d) = self.d.clone() {
            filter.insert(
                "#d".into(),
                Value::Array(d.into_iter().map(Value::String).collect()),
            );
        }
        if let Some(since) = self.since {
            filter.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(limit) = self.limit {
            filter.insert("limit".into(), Value::Number(limit.into()));
        }
        Value::Object(filter)
    }

    /// True for single-author, single-mapping-kind, `limit=1` lookups.
    ///
    /// Such filters can have at most one current answer, so a query may stop
    /// early once an event has arrived.
    pub fn is_unique_lookup(&self) -> bool {
        matches!(self.authors.as_deref(), Some([_]))
            && self.kinds.as_deref() == Some(&[MAPPING_KIND])
            && self.limit == Some(1)
    }
}

/// Build the `REQ` frame for a subscription.
pub fn req_frame(sub_id: &str, filter: &Filter) -> String {
    json!(["REQ", sub_id, filter.to_value()]).to_string()
}

/// Build the `CLOSE` frame for a subscription.
pub fn close_frame(sub_id: &str) -> String {
    json!(["CLOSE", sub_id]).to_string()
}

/// Pick the newest event by `created_at`. Query results are unordered.
pub fn newest(events: Vec<Event>) -> Option<Event> {
    events.into_iter().max_by_key(|ev| ev.created_at)
}

/// True for a 64-character lowercase-convertible hex string.
pub fn valid_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
