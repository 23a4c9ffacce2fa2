//! Blob retrieval from content-addressed servers with per-server failover.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::{CacheStore, CacheValue, Namespace};
use crate::config::Settings;
use crate::mime;

const USER_AGENT: &str = concat!("nsgate/", env!("CARGO_PKG_VERSION"));

/// Hashes are only re-verified for deployments capped below this size.
const HASH_CHECK_CEILING: usize = 10 * 1024 * 1024;

/// A served blob with its trustworthy content type.
#[derive(Debug, Clone)]
pub struct Blob {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Fetches blobs by SHA-256 from a ranked server list.
///
/// Infallible at the boundary: any per-server trouble moves on to the next
/// candidate, and an exhausted list is simply an absent result.
#[derive(Clone)]
pub struct BlobFetcher {
    http: reqwest::Client,
    cache: CacheStore,
    max_file_size: usize,
}

impl BlobFetcher {
    pub fn new(cache: CacheStore, settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.request_timeout)
            .build()
            .context("building blob fetch client")?;
        Ok(Self {
            http,
            cache,
            max_file_size: settings.max_file_size,
        })
    }

    /// Retrieve the blob for `sha256`, trying `servers` in order.
    ///
    /// `path_hint` only informs content-type determination; two paths
    /// resolving to the same hash share the cached bytes.
    pub async fn fetch(&self, sha256: &str, servers: &[String], path_hint: &str) -> Option<Blob> {
        if let Some(CacheValue::Bytes { data }) =
            self.cache.get(Namespace::Content, sha256).await
        {
            let content_type = mime::resolve(path_hint, None, &data);
            return Some(Blob {
                bytes: data.into(),
                content_type,
            });
        }
        for server in servers {
            let url = format!("{}/{}", server.trim_end_matches('/'), sha256);
            let (data, declared) = match self.fetch_one(&url).await {
                Ok(Some(hit)) => hit,
                Ok(None) => continue,
                Err(e) => {
                    debug!(url = url.as_str(), "blob fetch failed: {e:#}");
                    continue;
                }
            };
            if self.max_file_size < HASH_CHECK_CEILING {
                let actual = hex::encode(Sha256::digest(&data));
                if actual != sha256 {
                    warn!(
                        url = url.as_str(),
                        expected = sha256,
                        actual = actual.as_str(),
                        "served blob does not match its hash"
                    );
                }
            }
            let content_type = mime::resolve(path_hint, declared.as_deref(), &data);
            self.cache
                .put(
                    Namespace::Content,
                    sha256,
                    &CacheValue::Bytes { data: data.clone() },
                )
                .await;
            self.record_source(sha256, &url).await;
            return Some(Blob {
                bytes: data.into(),
                content_type,
            });
        }
        None
    }

    /// One attempt against one server. `Ok(None)` means "try the next one".
    async fn fetch_one(&self, url: &str) -> Result<Option<(Vec<u8>, Option<String>)>> {
        let resp = self.http.get(url).send().await?;
        match resp.status().as_u16() {
            200 => {}
            404 => {
                debug!(url, "blob not on this server");
                return Ok(None);
            }
            413 => {
                debug!(url, "server rejected the request as too large");
                return Ok(None);
            }
            429 => {
                warn!(url, "server is rate limiting us");
                return Ok(None);
            }
            status => {
                debug!(url, status, "unexpected blob server status");
                return Ok(None);
            }
        }
        if let Some(len) = resp.content_length() {
            if len as usize > self.max_file_size {
                debug!(url, len, "declared length exceeds the size cap");
                return Ok(None);
            }
        }
        let declared = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut data = Vec::new();
        let mut resp = resp;
        while let Some(chunk) = resp.chunk().await? {
            if data.len() + chunk.len() > self.max_file_size {
                bail!("body exceeds the {} byte cap", self.max_file_size);
            }
            data.extend_from_slice(&chunk);
        }
        Ok(Some((data, declared)))
    }

    /// Remember that `url` served this blob.
    async fn record_source(&self, sha256: &str, url: &str) {
        let mut urls = match self.cache.get(Namespace::Blobs, sha256).await {
            Some(CacheValue::BlobUrls { urls }) => urls,
            _ => vec![],
        };
        if !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
            self.cache
                .put(Namespace::Blobs, sha256, &CacheValue::BlobUrls { urls })
                .await;
        }
    }
}
