//! Larch server binary.
//!
//! Serves the in-memory backend through the wire-protocol listener.
//! Configuration layers: environment variables (`LARCH_*`) under CLI flags.
//!
//! ```bash
//! # Plain server
//! larchd --listen-addr 127.0.0.1:27017
//!
//! # Mirror every request to a reference server and log response diffs
//! larchd --mode diff-normal --proxy-addr 127.0.0.1:27018
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use larch::backend::inmemory::MemoryBackend;
use larch::clientconn;
use larch::clientconn::ConnOpts;
use larch::clientconn::Mode;
use larch::config::ServerConfig;
use larch::handler::BackendHandler;
use larch::metrics::ConnMetrics;

#[derive(Debug, Parser)]
#[command(name = "larchd", version, about = "Wire-protocol document database server")]
struct Args {
    /// Address to bind, host:port.
    #[arg(long)]
    listen_addr: Option<String>,

    /// Operation mode: normal, proxy, diff-normal, or diff-proxy.
    #[arg(long)]
    mode: Option<Mode>,

    /// Upstream address for proxy and diff modes.
    #[arg(long)]
    proxy_addr: Option<String>,

    /// Directory for raw traffic recordings.
    #[arg(long)]
    record_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::load().context("failed to load configuration")?;
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(addr) = args.proxy_addr {
        config.proxy_addr = Some(addr);
    }
    if let Some(dir) = args.record_dir {
        config.record_dir = Some(dir);
    }
    config.validate().context("invalid configuration")?;

    let handler = Arc::new(BackendHandler::new(MemoryBackend::new()));
    let metrics = Arc::new(ConnMetrics::new());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    clientconn::serve(
        listener,
        ConnOpts {
            mode: config.mode,
            handler,
            metrics,
            proxy_addr: config.proxy_addr,
            record_dir: config.record_dir,
            max_message_len: config.max_message_len,
        },
        token,
    )
    .await
}
