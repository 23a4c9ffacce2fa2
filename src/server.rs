//! HTTP front door mapping subdomain hosts to published static sites.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheStore, CacheValue, Namespace};
use crate::config::Settings;
use crate::fetch::BlobFetcher;
use crate::keys::{host_label, Pubkey};
use crate::resolver::{normalize_path, Resolver};

/// Everything a request pipeline needs, built once at startup.
pub struct Gateway {
    pub settings: Arc<Settings>,
    pub cache: CacheStore,
    pub resolver: Resolver,
    pub fetcher: BlobFetcher,
}

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// Start the gateway HTTP server.
pub async fn serve_http(
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new()
        .route("/healthz", get(healthz))
        .fallback(serve_site)
        .with_state(gateway);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// Serve one site request: host to pubkey, path to hash, hash to bytes.
async fn serve_site(
    State(gateway): State<Arc<Gateway>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) else {
        return not_found();
    };
    let Some(label) = host_label(host, &gateway.settings.base_domain) else {
        debug!(host, "host is not a gateway subdomain");
        return not_found();
    };
    let Some(pubkey) = gateway.resolve_host(&label).await else {
        return not_found();
    };
    let path = normalize_path(uri.path());
    let Some(sha256) = gateway.resolver.resolve_mapping(&pubkey, &path).await else {
        return not_found();
    };
    let etag = format!("\"{sha256}\"");
    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        == Some(etag.as_str())
    {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, etag)
            .body(Body::empty())
            .unwrap();
    }
    let servers = gateway.resolver.server_list(&pubkey).await;
    let Some(blob) = gateway.fetcher.fetch(&sha256, &servers, &path).await else {
        return not_found();
    };
    Response::builder()
        .header(header::CONTENT_TYPE, blob.content_type)
        .header(header::CONTENT_LENGTH, blob.bytes.len())
        .header(header::ETAG, etag)
        .header(header::CACHE_CONTROL, "public, max-age=3600")
        .header("X-Content-SHA256", sha256)
        .body(Body::from(blob.bytes))
        .unwrap()
}

impl Gateway {
    /// Resolve a hostname label to a publisher key via the domains cache.
    async fn resolve_host(&self, label: &str) -> Option<Pubkey> {
        if let Some(CacheValue::Pubkey { hex }) = self
            .cache
            .get_refreshing(Namespace::Domains, label)
            .await
        {
            let pubkey = Pubkey::from_hex(&hex)?;
            if self.settings.sliding_expiration {
                self.cache.touch_related(&hex, label).await;
            }
            return Some(pubkey);
        }
        let pubkey = Pubkey::from_npub(label)?;
        self.cache
            .put(
                Namespace::Domains,
                label,
                &CacheValue::Pubkey { hex: pubkey.hex() },
            )
            .await;
        Some(pubkey)
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}
