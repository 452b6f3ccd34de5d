use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::clock::SystemClock;
use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{AdmissionPipeline, ServiceGateway, Subject};
use turnstile::store::{MemoryStore, StateStore, TimeoutStore};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Distributed admission control")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive the admission pipeline against an in-process store and print
    /// one JSON line per decision
    Simulate {
        /// User id to charge (anonymous when omitted)
        #[arg(long)]
        user: Option<String>,

        /// API key to charge (none when omitted)
        #[arg(long)]
        api_key: Option<String>,

        /// Check service-to-service budgets for this calling service instead
        #[arg(long)]
        service: Option<String>,

        /// Number of requests to issue
        #[arg(long, default_value_t = 10)]
        requests: u64,

        /// Delay between requests in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = TurnstileConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Simulate {
            user,
            api_key,
            service,
            requests,
            interval_ms,
        } => {
            let subject = Subject { user_id: user, api_key };
            simulate(&config, subject, service, requests, Duration::from_millis(interval_ms)).await?;
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Decisions go to stdout; logs stay on stderr.
    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn simulate(
    config: &TurnstileConfig,
    subject: Subject,
    service: Option<String>,
    requests: u64,
    interval: Duration,
) -> anyhow::Result<()> {
    info!("Starting Turnstile simulation");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let memory = Arc::new(MemoryStore::new());
    let sweeper = memory.spawn_sweeper(Duration::from_secs(config.store.sweep_interval_secs.max(1)));
    let store: Arc<dyn StateStore> = Arc::new(TimeoutStore::new(memory, config.store.timeout()));
    let clock = Arc::new(SystemClock);

    let pipeline = AdmissionPipeline::new(store.clone(), clock.clone(), config);
    let gateway = ServiceGateway::new(store, clock, &config.gateway);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    for request in 1..=requests {
        let result = match service.as_deref() {
            Some(service) => gateway.check(service, subject.user_id()).await,
            None => pipeline.check(&subject).await,
        };

        let line = match result {
            Ok(decision) => match decision.denial() {
                None => json!({
                    "request": request,
                    "status": 200,
                    "admitted": true,
                    "headers": headers_json(&decision.headers()),
                }),
                Some(denial) => json!({
                    "request": request,
                    "status": denial.status_code(),
                    "admitted": false,
                    "headers": headers_json(&denial.headers()),
                    "body": denial.body(),
                }),
            },
            Err(e) => {
                warn!(error = %e, "Admission check failed");
                json!({
                    "request": request,
                    "status": e.status_code(),
                    "admitted": false,
                    "body": e.body(),
                })
            }
        };
        println!("{}", line);

        if request == requests {
            break;
        }
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    sweeper.abort();
    info!("Turnstile simulation finished");
    Ok(())
}

fn headers_json(headers: &[(&'static str, String)]) -> serde_json::Value {
    headers
        .iter()
        .map(|(name, value)| (name.to_string(), json!(value)))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
