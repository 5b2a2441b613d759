use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotaguard::config::QuotaGuardConfig;
use quotaguard::ratelimit::{Janitor, RateLimiter};

/// Outbound call admission control for rate-limited providers.
#[derive(Debug, Parser)]
#[command(name = "quotaguard", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the resolved policy for every configured provider
    Policies,

    /// Drive a burst of calls through the limiter and print each decision
    Simulate {
        /// Provider to charge the calls against
        #[arg(short, long)]
        provider: String,

        /// Caller key
        #[arg(short, long, default_value = "simulated")]
        key: String,

        /// Number of calls to attempt
        #[arg(short = 'n', long, default_value_t = 20)]
        requests: u32,

        /// Pause between calls, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },

    /// Run the janitor and log statistics until interrupted
    Run {
        /// How often to log statistics, in seconds
        #[arg(long, default_value_t = 60)]
        stats_interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = QuotaGuardConfig::load(cli.config.as_deref())?;
    info!(
        providers = config.rate_limiting.providers.len(),
        sweep_interval_secs = config.janitor.sweep_interval_secs,
        "Configuration loaded"
    );

    let limiter = Arc::new(RateLimiter::from_config(&config));

    match cli.command {
        Command::Policies => {
            let policies: Vec<_> = limiter
                .policies()
                .providers()
                .iter()
                .map(|p| limiter.policies().resolve(p))
                .collect();
            println!("{}", serde_json::to_string_pretty(&policies)?);
        }
        Command::Simulate {
            provider,
            key,
            requests,
            interval_ms,
        } => {
            simulate(&limiter, &provider, &key, requests, Duration::from_millis(interval_ms)).await?;
        }
        Command::Run {
            stats_interval_secs,
        } => {
            run(limiter, &config, Duration::from_secs(stats_interval_secs.max(1))).await;
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn simulate(
    limiter: &RateLimiter,
    provider: &str,
    key: &str,
    requests: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    for attempt in 1..=requests {
        let decision = limiter.check(key, provider);
        if decision.allowed {
            limiter.record(key, provider, true, Duration::ZERO);
        }

        let line = json!({
            "attempt": attempt,
            "allowed": decision.allowed,
            "remaining": decision.remaining,
            "reset_in_ms": decision.reset_in.as_millis() as u64,
            "denied_reason": decision.denied_reason.map(|r| r.to_string()),
        });
        println!("{}", line);

        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    let stats = limiter.statistics(Some(provider));
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn run(limiter: Arc<RateLimiter>, config: &QuotaGuardConfig, stats_interval: Duration) {
    let janitor = Janitor::new(limiter.clone(), config.janitor.sweep_interval()).spawn();

    let reporter = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(stats_interval);
            loop {
                interval.tick().await;
                for (provider, stats) in limiter.statistics_by_provider() {
                    info!(
                        provider = %provider,
                        active_keys = stats.active_keys,
                        total_requests = stats.total_requests,
                        allowed = stats.allowed_count,
                        blocked = stats.blocked_count,
                        average_latency_ms = stats.average_latency_ms,
                        "Provider statistics"
                    );
                }
            }
        })
    };

    info!("Quotaguard running, press Ctrl+C to stop");
    shutdown_signal().await;

    reporter.abort();
    janitor.shutdown().await;
    info!(stores = limiter.store_count(), "Quotaguard stopped");
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
