//! query-exporter binary entry point: CLI parsing, logging setup, config
//! loading, and the executor/HTTP-server/signal-handling run loop.
//!
//! Follows the shape of the teacher's `agent/src/main.rs`: a `clap`-derived
//! `CliArgs`, an `EnvFilter`-seeded `tracing-subscriber` with a sensible
//! fallback, walking the error source chain on startup failure, and a
//! `tokio::select!` between the run loop and the shutdown signal.

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod alerts;
mod database;
mod executor;
mod last_seen;
mod query;
mod registry;
mod scheduler;
mod server;
mod yaml_config;

use clap::Parser;
use executor::Executor;
use shared::defaults::default_port;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// Periodically runs SQL queries against configured databases and exports
/// the results as Prometheus metrics.
#[derive(Parser, Debug)]
#[command(name = "query-exporter", version, about, long_about = None)]
struct CliArgs {
    /// Path to a configuration file. May be given more than once; files are
    /// merged, with duplicate database/metric/query/alert names across
    /// files treated as a fatal error.
    #[arg(long = "config", value_name = "PATH", required = true)]
    config: Vec<PathBuf>,

    /// Validate the configuration and exit without starting the exporter.
    #[arg(long = "check-only")]
    check_only: bool,

    /// Address the scrape HTTP server binds to.
    #[arg(long = "host", default_value = "0.0.0.0")]
    host: String,

    /// Port the scrape HTTP server listens on.
    #[arg(long = "port", default_value_t = default_port())]
    port: u16,
}

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_env("QE_LOG_LEVEL")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("exporter=info,shared=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();

    let cli_args = CliArgs::parse();
    info!(files = cli_args.config.len(), "loading configuration");

    let config = match yaml_config::load_config(&cli_args.config) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load configuration: {err}");
            for cause in err.chain().skip(1) {
                error!("  caused by: {cause}");
            }
            std::process::exit(1);
        }
    };

    if cli_args.check_only {
        info!("configuration is valid");
        std::process::exit(0);
    }

    let mut exec = match Executor::new(config) {
        Ok(exec) => exec,
        Err(err) => {
            error!("failed to initialize executor: {err}");
            std::process::exit(1);
        }
    };

    let registry = exec.registry();
    let handle = exec.handle();
    exec.start();

    let addr: SocketAddr = match format!("{}:{}", cli_args.host, cli_args.port).parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!("invalid bind address {}:{}: {err}", cli_args.host, cli_args.port);
            std::process::exit(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(2);
        }
    };
    info!(%addr, "scrape endpoint listening");

    let app_state = server::AppState::new(registry, handle.clone());
    let router = server::create_router(app_state);
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router).await
    });

    let sweep_handle = handle.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            sweep_handle.clear_expired_series().await;
        }
    });

    let shutdown_signal = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
            let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.expect("install Ctrl-C handler");
            info!("received Ctrl-C");
        }
    };

    tokio::select! {
        _ = exec.run() => {
            error!("executor run loop exited unexpectedly");
        }
        _ = shutdown_signal => {
            info!("shutdown signal received");
        }
    }

    sweep_task.abort();
    server_task.abort();
    exec.stop().await;
    info!("shutdown complete");
}
