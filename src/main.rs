mod config;
mod coreapi;
mod detector;
mod error;
mod http;
mod index;
mod ingest;
mod limiter;
mod metrics;
mod pipeline;
mod record;
mod redis_store;
mod services;
mod snapshot;

use axum::serve;
use clap::Parser;
use config::Config;
use coreapi::CoreApiClient;
use detector::ChangeDetector;
use index::{HostIndex, Refresher};
use ingest::Workers;
use limiter::RateLimiter;
use metrics::Metrics;
use pipeline::HostSnap;
use redis_store::RedisSnapshotCache;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostsnapd")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Refresh the host index, run one snapshot file through the pipeline and exit.
    #[arg(long, value_name = "FILE")]
    once: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    let tuning = cfg.tuning();

    info!(
        listen = %cfg.listen,
        workers = cfg.workers,
        qps = tuning.qps,
        burst = tuning.burst,
        change_range_percent = tuning.change_range_percent,
        refresh_interval = %humantime::format_duration(tuning.refresh_interval),
        "starting hostsnapd"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let core = match CoreApiClient::new(&cfg.core_service) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(error = %err, "failed to build core service client");
            std::process::exit(1);
        }
    };
    let redis_client = match redis::Client::open(cfg.redis.url.as_str()) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "invalid redis url");
            std::process::exit(1);
        }
    };
    let cache = match RedisSnapshotCache::connect(&redis_client).await {
        Ok(cache) => Arc::new(cache),
        Err(err) => {
            error!(error = %err, "failed to connect to redis");
            std::process::exit(1);
        }
    };

    let index = Arc::new(HostIndex::new(core.clone(), tuning.page_size));
    let snap = Arc::new(HostSnap::new(
        index.clone(),
        ChangeDetector::new(tuning.change_range_percent),
        RateLimiter::new(tuning.qps, tuning.burst),
        core,
        cache,
        metrics.clone(),
        cfg.redis.snapshot_key_prefix.clone(),
    ));

    if let Some(path) = cli.once {
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) => {
                error!(error = %err, path = %path.display(), "failed to read snapshot file");
                std::process::exit(1);
            }
        };
        metrics.record_refresh(&index.refresh().await);
        match snap.handle_snapshot(&raw).await {
            Ok(outcome) => println!("{}", outcome.label()),
            Err(err) => {
                error!(error = %err, "snapshot handling failed");
                std::process::exit(2);
            }
        }
        return;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let metrics = metrics.clone();
        let index = index.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, index);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let refresher_task = {
        let metrics = metrics.clone();
        let refresher = Refresher::new(index.clone(), tuning.refresh_interval)
            .on_refresh(move |report| metrics.record_refresh(report));
        tokio::spawn(refresher.run(shutdown_rx.clone()))
    };

    let subscriber_task = tokio::spawn(ingest::run_subscriber(
        redis_client,
        cfg.redis.channels.clone(),
        Workers::new(snap, cfg.workers),
        shutdown_rx.clone(),
    ));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = subscriber_task.await;
    let _ = refresher_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
