use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use unibot_core::{load_config, validate_config, warmup, Config, ConfigMode, SanitizedConfig};
use unibot_server::app::{self, Components};
use unibot_server::{create_router, AppState, HttpMetrics, LineReplyClient, Replier};

#[derive(Parser)]
#[command(name = "unibot", version, about = "Campus information chatbot")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, env = "UNIBOT_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the webhook server and its background loops
    Server,
    /// Run the bulk ingestion once and exit
    Warmup {
        /// Modules to run (comma separated); defaults to `warmup.modules`
        #[arg(long, value_delimiter = ',')]
        modules: Vec<String>,
        /// Overall deadline; defaults to `warmup.timeout_secs`
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        eprintln!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded from {:?}", cli.config);

    match cli.command {
        Command::Server => serve(config).await,
        Command::Warmup {
            modules,
            timeout_secs,
        } => warmup_once(config, modules, timeout_secs).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    validate_config(&config, ConfigMode::Server).context("Configuration validation failed")?;
    info!(
        config = %serde_json::to_string(&SanitizedConfig::from(&config)).unwrap_or_default(),
        "Starting server"
    );
    let line = config
        .line
        .as_ref()
        .context("[line] section is required by the server")?;

    let components = Components::build(&config)?;
    let http_metrics =
        HttpMetrics::register(&components.metrics).context("Failed to register HTTP metrics")?;
    let replier: Arc<dyn Replier> = Arc::new(
        LineReplyClient::new(&line.api_base, line.channel_access_token.clone())
            .context("Failed to create reply client")?,
    );

    let state = Arc::new(AppState::new(
        components.processor.clone(),
        replier,
        components.store.clone(),
        components.metrics.clone(),
        http_metrics,
        line.channel_secret.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let cleanup_interval = Duration::from_secs(config.limits.cleanup_interval_secs);
    let mut background = vec![
        components
            .chat_limiter
            .spawn_cleanup(cleanup_interval, shutdown_tx.subscribe()),
        components
            .llm_limiter
            .spawn_cleanup(cleanup_interval, shutdown_tx.subscribe()),
        app::spawn_store_sweep(
            components.store.clone(),
            Duration::from_secs(config.cache.sweep_interval_secs),
            shutdown_tx.subscribe(),
        ),
    ];

    if config.warmup.on_startup {
        let modules = app::parse_modules(&config.warmup.modules)?;
        background.push(app::spawn_startup_warmup(
            modules,
            components.warmup.clone(),
            Duration::from_secs(config.warmup.timeout_secs),
            state.warmup_flag(),
            shutdown_tx.subscribe(),
        ));
    } else {
        state.warmup_flag().store(true, Ordering::Release);
    }

    let router = create_router(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let mut stopping = shutdown_tx.subscribe();
    let notify = shutdown_tx.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                info!("Shutdown signal received");
                let _ = notify.send(());
            })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result.context("Server task failed")?.context("Server error")?;
            return Ok(());
        }
        _ = stopping.recv() => {}
    }

    // In-flight webhooks finish their replies; background loops exit.
    let deadline = Duration::from_secs(config.server.shutdown_timeout_secs);
    let drain = async {
        if let Ok(Err(e)) = server.await {
            error!(error = %e, "Server error during shutdown");
        }
        futures::future::join_all(background).await;
    };
    if tokio::time::timeout(deadline, drain).await.is_err() {
        warn!(
            timeout_secs = config.server.shutdown_timeout_secs,
            "Graceful shutdown timed out"
        );
    }
    info!("Server stopped");
    Ok(())
}

async fn warmup_once(config: Config, modules: Vec<String>, timeout_secs: Option<u64>) -> Result<()> {
    validate_config(&config, ConfigMode::Warmup).context("Configuration validation failed")?;
    let names = if modules.is_empty() {
        config.warmup.modules.clone()
    } else {
        modules
    };
    let modules = app::parse_modules(&names)?;
    let deadline = Duration::from_secs(timeout_secs.unwrap_or(config.warmup.timeout_secs));

    let components = Components::build(&config)?;
    let report = tokio::select! {
        report = warmup::run(&modules, &components.warmup, deadline) => report,
        _ = shutdown_signal() => bail!("Warm-up interrupted"),
    };
    app::log_report(&report);

    if !report.modules.is_empty() && report.failed().count() == report.modules.len() {
        bail!("Every warm-up module failed");
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
