mod backend;
mod cache;
mod config;
mod event;
mod fetch;
mod keys;
mod mime;
mod pool;
mod resolver;
mod server;
mod subscriber;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing::info;

use cache::CacheStore;
use config::Settings;
use fetch::BlobFetcher;
use keys::Pubkey;
use pool::RelayPool;
use resolver::Resolver;
use server::Gateway;
use subscriber::InvalidationSubscriber;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "nsgate",
    author,
    version,
    about = "Gateway serving static sites published over gossip relays"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Launch the HTTP gateway (and the invalidation subscriber if enabled).
    Serve,
    /// Resolve the blob hash for a host and path without serving it.
    Resolve {
        /// Site hostname or bare subdomain label.
        host: String,
        /// Site path, normalized before resolution.
        #[arg(default_value = "/")]
        path: String,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Arc::new(Settings::from_env(&cli.env)?);
    // a non-default backend that cannot be opened refuses startup
    let backend = backend::open(&settings.cache_backend, settings.cache_max_entries).await?;
    let cache = CacheStore::new(backend, settings.clone());
    let pool = Arc::new(RelayPool::new(
        settings.connection_idle_threshold,
        settings.cleanup_interval,
        settings.tor_socks.clone(),
    ));
    let resolver = Resolver::new(cache.clone(), pool.clone(), settings.clone());
    match cli.command {
        Commands::Serve => {
            let fetcher = BlobFetcher::new(cache.clone(), &settings)?;
            let subscriber = InvalidationSubscriber::new(cache.clone(), settings.clone());
            subscriber.start();
            let gateway = Arc::new(Gateway {
                settings: settings.clone(),
                cache,
                resolver,
                fetcher,
            });
            let addr: SocketAddr = settings.bind_http.parse()?;
            info!(%addr, base_domain = settings.base_domain.as_str(), "gateway listening");
            server::serve_http(addr, gateway, shutdown_signal()).await?;
            // in-flight requests have drained: subscriber first, then the pool
            subscriber.shutdown().await;
            pool.shutdown();
        }
        Commands::Resolve { host, path } => {
            let label = keys::host_label(&host, &settings.base_domain)
                .unwrap_or_else(|| host.clone());
            let pubkey = Pubkey::from_npub(&label)
                .ok_or_else(|| anyhow!("{host} does not carry a publisher key"))?;
            let normalized = resolver::normalize_path(&path);
            let result = resolver.resolve_mapping(&pubkey, &normalized).await;
            pool.shutdown();
            match result {
                Some(sha256) => println!("{sha256}"),
                None => return Err(anyhow!("no mapping for {normalized}")),
            }
        }
    }
    Ok(())
}

/// Resolves when the process receives Ctrl-C.
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    run(Cli::parse()).await
}
