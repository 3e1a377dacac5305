//! ct-archive-serve
//!
//! Serves Certificate Transparency log archives, mirrored as sharded zip
//! bundles, over the Static-CT tiled HTTP API without extracting anything to
//! disk. Configuration comes from `CT_*` environment variables; see
//! `--help`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ctarchive_common::{Config, Metrics};
use ctarchive_index::ArchiveIndex;
use ctarchive_server::{serve, server, LogListBuilder};
use ctarchive_zip::{EntryContentCache, IntegrityGate, ZipPartCache, ZipStore};

const ENV_HELP: &str = "\
Environment variables:
  CT_ARCHIVE_PATH                     Archive root containing log folders (default: /var/log/ct/archive)
  CT_ARCHIVE_FOLDER_PATTERN           Log folder pattern, one literal prefix plus trailing '*' (default: ct_*)
  CT_LOG_LIST_REFRESH_INTERVAL        Period of the /logs.v3.json rebuild (default: 10m)
  CT_ARCHIVE_REFRESH_INTERVAL         Period of the archive rescan (default: 5m)
  CT_ZIP_CACHE_MAX_OPEN               Open-zip budget across cache shards (default: 2048)
  CT_ZIP_CACHE_MAX_CONCURRENT_OPENS   Cap on concurrent zip opens (default: 64)
  CT_ENTRY_CACHE_MAX_BYTES            Decompressed-content cache budget, 0 disables (default: 268435456)
  CT_ZIP_INTEGRITY_FAIL_TTL           Cooldown before re-verifying a failed zip (default: 5m)
  CT_HTTP_READ_HEADER_TIMEOUT         Header read timeout, 0 disables (default: 5s)
  CT_HTTP_IDLE_TIMEOUT                Keep-alive idle timeout, 0 disables (default: 60s)
  CT_HTTP_MAX_HEADER_BYTES            Request header size cap (default: 8192)
  CT_HTTP_WRITE_TIMEOUT               Response write deadline, 0 disables (default: 60s)
  CT_HTTP_READ_TIMEOUT                Request read timeout, 0 disables (default: 0)
  CT_HTTP_TRUSTED_SOURCES             CSV of IPs/CIDRs whose X-Forwarded-* headers are honored (default: empty)

Durations use humantime syntax: 30s, 5m, 1h.";

#[derive(Parser, Debug)]
#[command(
    name = "ctarchive-serve",
    about = "Serve Static-CT log archives from sharded zip bundles",
    version,
    after_help = ENV_HELP
)]
struct Args {
    /// Log successful (2xx) HTTP requests too
    #[arg(short, long)]
    verbose: bool,

    /// Enable DEBUG logging
    #[arg(short, long)]
    debug: bool,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Structured JSON logs: ERROR and above to stderr, the rest to stdout.
    let default_level = if args.debug { "debug" } else { "info" };
    let writer = std::io::stderr
        .with_max_level(tracing::Level::ERROR)
        .or_else(std::io::stdout);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
        .init();

    let cfg = Config::from_env().context("invalid configuration")?;
    info!(
        archive_path = %cfg.archive_path.display(),
        folder_pattern = %cfg.folder_pattern,
        "starting ctarchive-serve"
    );

    let metrics = Arc::new(Metrics::new());

    let index = Arc::new(
        ArchiveIndex::new(&cfg, Arc::clone(&metrics))
            .context("failed to build the archive index")?,
    );

    let shutdown = CancellationToken::new();
    index.start(shutdown.clone());

    let integrity = Arc::new(IntegrityGate::new(
        cfg.zip_integrity_fail_ttl,
        Arc::clone(&metrics),
    ));
    let parts = Arc::new(ZipPartCache::new(
        cfg.zip_cache_max_open,
        cfg.zip_cache_max_concurrent_opens,
        Arc::clone(&metrics),
    ));
    let contents = Arc::new(EntryContentCache::new(
        cfg.entry_cache_max_bytes,
        Arc::clone(&metrics),
    ));
    let store = Arc::new(
        ZipStore::new(integrity)
            .with_part_cache(parts)
            .with_entry_cache(contents),
    );

    let loglist = Arc::new(LogListBuilder::new(&cfg, Arc::clone(&index)));
    // The initial log-list build runs before the listener opens; with many
    // large archives this can take a while.
    loglist.start(shutdown.clone()).await;

    let app = Arc::new(server::App {
        cfg: cfg.clone(),
        metrics,
        index,
        store,
        loglist,
        verbose: args.verbose,
    });
    let router = server::router(app);

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signal_shutdown.cancel();
    });

    serve::serve(router, args.listen, &cfg, shutdown)
        .await
        .context("http server failed")?;

    info!("server stopped");
    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
