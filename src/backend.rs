//! Pluggable key-value backends behind the cache store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use rusqlite::OptionalExtension;

/// Storage contract shared by every backend.
///
/// Implementations serialize concurrent access themselves; callers may invoke
/// any operation from any task.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<String>>;
    async fn put(&self, ns: &str, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, ns: &str, key: &str) -> Result<()>;
    async fn clear(&self, ns: &str) -> Result<()>;
    /// Refresh expiry in place without re-sending the value.
    ///
    /// Returns `false` when the entry is gone; the caller re-puts instead.
    async fn touch(&self, ns: &str, key: &str, ttl: Duration) -> Result<bool>;
}

/// Open the backend selected by the configuration string.
///
/// Anything other than `memory` that cannot be opened is a startup error;
/// the process must not silently downgrade to a different backend.
pub async fn open(selector: &str, max_entries: usize) -> Result<Arc<dyn Backend>> {
    if selector == "memory" {
        return Ok(Arc::new(MemoryBackend::new(max_entries)));
    }
    if let Some(rest) = selector.strip_prefix("kv://") {
        let backend = RedisBackend::open(&format!("redis://{rest}"))
            .await
            .with_context(|| format!("opening kv backend {rest}"))?;
        return Ok(Arc::new(backend));
    }
    if let Some(path) = selector.strip_prefix("file://") {
        let backend = SqliteBackend::open(path)
            .await
            .with_context(|| format!("opening file backend {path}"))?;
        return Ok(Arc::new(backend));
    }
    bail!("unknown cache backend: {selector}");
}

fn full_key(ns: &str, key: &str) -> String {
    format!("{ns}:{key}")
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

struct MemoryInner {
    map: HashMap<String, MemoryEntry>,
    // insertion order for FIFO eviction; may hold keys already removed
    order: VecDeque<String>,
}

/// Process-local backend bounded by entry count.
pub struct MemoryBackend {
    max_entries: usize,
    inner: Mutex<MemoryInner>,
}

impl MemoryBackend {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            inner: Mutex::new(MemoryInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|_| anyhow!("memory cache lock poisoned"))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<String>> {
        let mut inner = self.lock()?;
        let full = full_key(ns, key);
        match inner.map.get(&full) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.map.remove(&full);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, ns: &str, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.lock()?;
        let full = full_key(ns, key);
        if inner.map.insert(
            full.clone(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        ).is_none()
        {
            inner.order.push_back(full);
        }
        while inner.map.len() > self.max_entries {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn delete(&self, ns: &str, key: &str) -> Result<()> {
        self.lock()?.map.remove(&full_key(ns, key));
        Ok(())
    }

    async fn clear(&self, ns: &str) -> Result<()> {
        let prefix = format!("{ns}:");
        self.lock()?.map.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn touch(&self, ns: &str, key: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.map.get_mut(&full_key(ns, key)) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Networked key-value backend.
pub struct RedisBackend {
    conn: redis::aio::ConnectionManager,
}

impl RedisBackend {
    pub async fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(full_key(ns, key)).await?)
    }

    async fn put(&self, ns: &str, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(full_key(ns, key), value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, ns: &str, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(full_key(ns, key)).await?;
        Ok(())
    }

    async fn clear(&self, ns: &str) -> Result<()> {
        let mut scan_conn = self.conn.clone();
        let keys: Vec<String> = {
            let mut iter = scan_conn
                .scan_match::<_, String>(format!("{ns}:*"))
                .await?;
            let mut keys = vec![];
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if !keys.is_empty() {
            let mut conn = self.conn.clone();
            let _: () = conn.del(keys).await?;
        }
        Ok(())
    }

    async fn touch(&self, ns: &str, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = conn
            .expire(full_key(ns, key), ttl.as_secs().max(1) as i64)
            .await?;
        Ok(refreshed == 1)
    }
}

/// Single-process embedded database backend.
pub struct SqliteBackend {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteBackend {
    pub async fn open(path: &str) -> Result<Self> {
        let path = path.to_string();
        let conn = tokio::task::spawn_blocking(move || -> Result<rusqlite::Connection> {
            let conn = rusqlite::Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS cache (
                     ns TEXT NOT NULL,
                     key TEXT NOT NULL,
                     value TEXT NOT NULL,
                     expires_at INTEGER NOT NULL,
                     PRIMARY KEY (ns, key)
                 )",
            )?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| anyhow!("sqlite lock poisoned"))?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<String>> {
        let (ns, key) = (ns.to_string(), key.to_string());
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT value, expires_at FROM cache WHERE ns = ?1 AND key = ?2",
                    rusqlite::params![ns, key],
                    |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
                )
                .optional()?;
            match row {
                Some((value, expires_at)) if expires_at > unix_millis() => Ok(Some(value)),
                Some(_) => {
                    conn.execute(
                        "DELETE FROM cache WHERE ns = ?1 AND key = ?2",
                        rusqlite::params![ns, key],
                    )?;
                    Ok(None)
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn put(&self, ns: &str, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let (ns, key, value) = (ns.to_string(), key.to_string(), value.to_string());
        let expires_at = unix_millis() + ttl.as_millis() as i64;
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache (ns, key, value, expires_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![ns, key, value, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, ns: &str, key: &str) -> Result<()> {
        let (ns, key) = (ns.to_string(), key.to_string());
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM cache WHERE ns = ?1 AND key = ?2",
                rusqlite::params![ns, key],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear(&self, ns: &str) -> Result<()> {
        let ns = ns.to_string();
        self.call(move |conn| {
            conn.execute("DELETE FROM cache WHERE ns = ?1", rusqlite::params![ns])?;
            Ok(())
        })
        .await
    }

    async fn touch(&self, ns: &str, key: &str, ttl: Duration) -> Result<bool> {
        let (ns, key) = (ns.to_string(), key.to_string());
        let now = unix_millis();
        let expires_at = now + ttl.as_millis() as i64;
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE cache SET expires_at = ?1 WHERE ns = ?2 AND key = ?3 AND expires_at > ?4",
                rusqlite::params![expires_at, ns, key, now],
            )?;
            Ok(changed == 1)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn exercise_round_trip(backend: &dyn Backend) {
        backend
            .put("paths", "k", "v1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            backend.get("paths", "k").await.unwrap(),
            Some("v1".to_string())
        );
        // same key in another namespace is a different entry
        assert_eq!(backend.get("relays", "k").await.unwrap(), None);
        backend.delete("paths", "k").await.unwrap();
        assert_eq!(backend.get("paths", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_round_trip() {
        exercise_round_trip(&MemoryBackend::new(16)).await;
    }

    #[tokio::test]
    async fn memory_expiry() {
        let backend = MemoryBackend::new(16);
        backend
            .put("paths", "k", "v", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(backend.get("paths", "k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(backend.get("paths", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_touch_extends_and_reports_missing() {
        let backend = MemoryBackend::new(16);
        backend
            .put("paths", "k", "v", Duration::from_millis(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend
            .touch("paths", "k", Duration::from_millis(100))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        // still alive: touch restarted the clock
        assert!(backend.get("paths", "k").await.unwrap().is_some());
        assert!(!backend
            .touch("paths", "gone", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn memory_fifo_eviction_under_pressure() {
        let backend = MemoryBackend::new(2);
        for key in ["a", "b", "c"] {
            backend
                .put("paths", key, key, Duration::from_secs(60))
                .await
                .unwrap();
        }
        // oldest insertion evicted first
        assert_eq!(backend.get("paths", "a").await.unwrap(), None);
        assert!(backend.get("paths", "b").await.unwrap().is_some());
        assert!(backend.get("paths", "c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_overwrite_does_not_grow_order() {
        let backend = MemoryBackend::new(2);
        backend
            .put("paths", "a", "1", Duration::from_secs(60))
            .await
            .unwrap();
        backend
            .put("paths", "a", "2", Duration::from_secs(60))
            .await
            .unwrap();
        backend
            .put("paths", "b", "1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            backend.get("paths", "a").await.unwrap(),
            Some("2".to_string())
        );
        assert!(backend.get("paths", "b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_clear_is_scoped_to_namespace() {
        let backend = MemoryBackend::new(16);
        backend
            .put("paths", "k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        backend
            .put("relays", "k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        backend.clear("paths").await.unwrap();
        assert_eq!(backend.get("paths", "k").await.unwrap(), None);
        assert!(backend.get("relays", "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sqlite_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let backend = SqliteBackend::open(path.to_str().unwrap()).await.unwrap();
        exercise_round_trip(&backend).await;
    }

    #[tokio::test]
    async fn sqlite_expiry_and_touch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let backend = SqliteBackend::open(path.to_str().unwrap()).await.unwrap();
        backend
            .put("paths", "k", "v", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(backend.get("paths", "k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(backend.get("paths", "k").await.unwrap(), None);
        assert!(!backend
            .touch("paths", "k", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn sqlite_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        {
            let backend = SqliteBackend::open(path.to_str().unwrap()).await.unwrap();
            backend
                .put("paths", "k", "v", Duration::from_secs(60))
                .await
                .unwrap();
        }
        let backend = SqliteBackend::open(path.to_str().unwrap()).await.unwrap();
        assert_eq!(
            backend.get("paths", "k").await.unwrap(),
            Some("v".to_string())
        );
    }

    #[tokio::test]
    async fn open_selects_memory() {
        assert!(open("memory", 16).await.is_ok());
    }

    #[tokio::test]
    async fn open_selects_file() {
        let dir = TempDir::new().unwrap();
        let selector = format!("file://{}", dir.path().join("c.db").display());
        assert!(open(&selector, 16).await.is_ok());
    }

    #[tokio::test]
    async fn open_rejects_unknown_scheme() {
        assert!(open("carrier-pigeon://coop", 16).await.is_err());
    }
}
