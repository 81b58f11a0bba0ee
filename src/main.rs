use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, LogFormat, StoreBackend};
use floodgate::grpc::GrpcServer;
use floodgate::nonce::NonceRegistry;
use floodgate::ratelimit::{Limiter, RuleSet, SystemClock};
use floodgate::store::{CounterStore, MemoryStore, RedisStore};

/// Bound on establishing the first Redis connection at boot.
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Admission control and rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the rule file, overrides `limiter.rules_path`
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Validate configuration and rules, print the rules as JSON, and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = FloodgateConfig::load(args.config.as_deref())?;
    init_tracing(&config);

    info!("Starting Floodgate admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rules_path = args.rules.or_else(|| config.limiter.rules_path.clone());
    let rules = match &rules_path {
        Some(path) => RuleSet::from_file(path)?,
        None => {
            warn!("No rule file configured, every request will be admitted");
            RuleSet::new()
        }
    };
    info!(rules = rules.len(), "Rules loaded");

    if args.check {
        println!("{}", serde_json::to_string_pretty(&rules)?);
        return Ok(());
    }

    let clock = Arc::new(SystemClock);
    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new(clock.clone()));
            store.spawn_sweeper(config.sweep_interval());
            store
        }
        StoreBackend::Redis => {
            let url = config.store.redis_url.as_deref().unwrap_or_default();
            let timeout = config.store_timeout().max(REDIS_CONNECT_TIMEOUT);
            Arc::new(RedisStore::connect(url, timeout).await?)
        }
    };
    info!(backend = store.backend_name(), "Counter store ready");

    let limiter = Arc::new(Limiter::new(
        store.clone(),
        clock,
        rules,
        config.limiter_options()?,
    ));
    let nonces = Arc::new(NonceRegistry::new(
        store,
        &config.store.key_prefix,
        config.store_timeout(),
    ));

    if let (Some(path), Some(every)) = (rules_path, config.reload_interval()) {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match limiter.reload_rules(&path) {
                    Ok(changed) => debug!(changed = changed, "Rule file checked"),
                    Err(e) => warn!(error = %e, "Rule reload failed, keeping current rules"),
                }
            }
        });
    }

    let grpc_server = GrpcServer::new(config.server.grpc_addr, limiter, nonces);

    info!("Starting gRPC server on {}", config.server.grpc_addr);

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Floodgate admission service stopped");
    Ok(())
}

fn init_tracing(config: &FloodgateConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
