//! `matchforge` binary: loads configuration, starts the engine loops and the
//! health server, and shuts down on SIGINT/SIGTERM.

use anyhow::Result;
use clap::Parser;
use matchforge::config::{validate_config, AppConfig};
use matchforge::service::{AppState, HealthCheck, HealthStatus};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Interval of the engine status line in the service log
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Multi-tenant matchmaking and match-session engine
///
/// Pools player tickets per game and queue, forms groups with the built-in
/// scorer or an external matchmaker, and runs the resulting match sessions.
#[derive(Parser)]
#[command(name = "matchforge", version)]
struct Args {
    /// TOML configuration file; environment variables are used when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override the AMQP broker URL
    #[arg(long, value_name = "URL")]
    amqp_url: Option<String>,

    /// Override the health and metrics port
    #[arg(long, value_name = "PORT")]
    health_port: Option<u16>,

    /// Log engine events instead of publishing them
    #[arg(long)]
    no_amqp: bool,

    /// Shorthand for `--log-level debug`
    #[arg(short, long)]
    debug: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    dry_run: bool,

    /// Start the engine once, report component health and exit non-zero unless healthy
    #[arg(long)]
    health_check: bool,
}

impl Args {
    /// Command-line flags take precedence over file and environment settings
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(level) = &self.log_level {
            config.service.log_level = level.clone();
        }
        if self.debug {
            config.service.log_level = "debug".to_string();
        }
        if let Some(url) = &self.amqp_url {
            config.amqp.url = url.clone();
        }
        if let Some(port) = self.health_port {
            config.service.health_port = port;
        }
        if self.no_amqp {
            config.amqp.enabled = false;
        }
    }

    fn load_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::from_file(path)?,
            None => AppConfig::from_env()?,
        };
        self.apply_overrides(&mut config);
        validate_config(&config)?;
        Ok(config)
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

fn log_configuration(config: &AppConfig) {
    info!(
        service = %config.service.name,
        version = matchforge::VERSION,
        health_port = config.service.health_port,
        amqp = if config.amqp.enabled { config.amqp.url.as_str() } else { "disabled" },
        scheduler_interval_ms = config.matchmaking.scheduler_interval_ms,
        tenants = config.tenants.len(),
        bootstrap_queues = config.queues.len(),
        "Engine configuration"
    );
}

/// One-shot component report for `--health-check`
async fn run_health_check(config: AppConfig) -> Result<ExitCode> {
    let app_state = Arc::new(AppState::new(config).await?);
    app_state.start().await?;
    let report = HealthCheck::check(app_state.clone()).await;
    if let Err(e) = app_state.shutdown().await {
        warn!(error = %e, "Shutdown after health check failed");
    }

    let health = report?;
    println!("{}: {}", health.service, health.status);
    for check in &health.checks {
        match &check.message {
            Some(message) => println!("  {:<16} {} ({})", check.name, check.status, message),
            None => println!("  {:<16} {}", check.name, check.status),
        }
    }
    println!(
        "  matches active={} tickets waiting={}",
        health.stats.active_matches, health.stats.tickets_waiting
    );

    Ok(if health.status == HealthStatus::Healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Resolve on SIGINT, or SIGTERM where supported
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

/// Periodic engine status line: pool depth, open matches and pass outcomes
async fn log_engine_status(app_state: Arc<AppState>) {
    let mut interval = tokio::time::interval(STATUS_LOG_INTERVAL);
    while app_state.is_running().await {
        interval.tick().await;
        match HealthCheck::check(app_state.clone()).await {
            Ok(health) => info!(
                status = ?health.status,
                active_matches = health.stats.active_matches,
                tickets_waiting = health.stats.tickets_waiting,
                passes_run = health.stats.passes_run,
                external_failures = health.stats.external_failures,
                "Engine status"
            ),
            Err(e) => warn!(error = %e, "Engine status check failed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("{:#}", e);
        return Ok(ExitCode::FAILURE);
    }

    if args.health_check {
        return run_health_check(config).await;
    }

    log_configuration(&config);
    if args.dry_run {
        info!("Configuration is valid; not starting the engine");
        return Ok(ExitCode::SUCCESS);
    }

    let shutdown_timeout = config.shutdown_timeout();
    let app_state = Arc::new(AppState::new(config).await?);
    if let Err(e) = app_state.start().await {
        error!(error = %e, "Engine failed to start");
        return Ok(ExitCode::FAILURE);
    }
    let status_task = tokio::spawn(log_engine_status(app_state.clone()));
    info!("Matchforge engine running");

    shutdown_signal().await;
    status_task.abort();

    match tokio::time::timeout(shutdown_timeout, app_state.shutdown()).await {
        Ok(Ok(())) => info!("Matchforge engine stopped"),
        Ok(Err(e)) => error!(error = %e, "Shutdown failed"),
        Err(_) => warn!(
            timeout_secs = shutdown_timeout.as_secs(),
            "Shutdown timed out; exiting anyway"
        ),
    }
    Ok(ExitCode::SUCCESS)
}
