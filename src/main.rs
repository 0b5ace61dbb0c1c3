use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{Backend, GatekeeperConfig};
use gatekeeper::ratelimit::{connect_store, Limit, LimiterStore};

/// Drive a limiter store from the command line.
#[derive(Parser, Debug)]
#[command(name = "gatekeeper", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Rate limit key to exercise
    #[arg(long, default_value = "cli")]
    key: String,

    /// Tokens refilled per second
    #[arg(long, default_value_t = 10.0)]
    rate: f64,

    /// Bucket capacity
    #[arg(long, default_value_t = 20)]
    burst: u32,

    /// Tokens consumed per request
    #[arg(long, default_value_t = 1)]
    cost: u32,

    /// Number of requests to send
    #[arg(long, default_value_t = 25)]
    requests: u32,

    /// Pause between requests, in milliseconds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Memory,
    Redis,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Memory => Backend::Memory,
            BackendArg::Redis => Backend::Redis,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => GatekeeperConfig::load(path)?,
        None => GatekeeperConfig::default(),
    };
    if let Some(backend) = args.backend {
        config.store.backend = backend.into();
    }
    info!(backend = ?config.store.backend, "Configuration loaded");

    let limit = Limit::new(args.rate, args.burst)?;
    let store = connect_store(&config.store).await?;

    let mut allowed = 0u32;
    let mut denied = 0u32;

    let run = async {
        for i in 0..args.requests {
            let decision = store.allow_n(&args.key, limit, args.cost).await;
            if decision.allowed {
                allowed += 1;
            } else {
                denied += 1;
            }
            info!(
                request = i + 1,
                allowed = decision.allowed,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Decision"
            );

            if args.interval_ms > 0 {
                tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
            }
        }
    };

    tokio::select! {
        _ = run => {}
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping early");
        }
    }

    debug!("Shutting down limiter store");
    store.shutdown().await;

    println!("allowed={} denied={}", allowed, denied);
    Ok(())
}
