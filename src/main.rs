use clap::Parser;
use conductor::config::{AppConfig, LoggingConfig};
use conductor::coordinator::Coordinator;
use conductor::engine::{EngineHandle, PaperEngine};
use conductor::error::Result;
use conductor::killswitch::FileKillSwitch;
use conductor::store::StateStore;
use conductor::train::NullTrainRunner;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "conductor", about = "Multi-symbol trading orchestrator")]
struct Cli {
    /// Configuration directory (default.toml + $CONDUCTOR_ENV overrides)
    #[arg(long, default_value = "config")]
    config_dir: String,

    /// Symbols to run, overriding the configured list
    #[arg(long = "symbol")]
    symbols: Vec<String>,

    /// Seed for the paper engines (reproducible demo runs)
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config_dir)?;
    if !cli.symbols.is_empty() {
        config.symbols = cli.symbols.clone();
    }
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config error: {e}");
        }
        return Err(conductor::error::ConductorError::InvalidConfig(
            errors.join("; "),
        ));
    }

    init_logging(&config.logging);
    info!(symbols = ?config.symbols, "starting conductor");

    let store = Arc::new(StateStore::open(&config.state.path).await);
    let kill_switch = Arc::new(FileKillSwitch::new(&config.kill_switch.path));
    info!(path = %kill_switch.path().display(), "kill switch flag file");

    let mut engines: HashMap<String, Arc<dyn EngineHandle>> = HashMap::new();
    for (i, symbol) in config.symbols.iter().enumerate() {
        let engine: Arc<dyn EngineHandle> = match cli.seed {
            Some(seed) => Arc::new(PaperEngine::with_seed(symbol.clone(), seed + i as u64)),
            None => Arc::new(PaperEngine::new(symbol.clone())),
        };
        engines.insert(symbol.clone(), engine);
    }

    let coordinator = Coordinator::new(
        &config,
        engines,
        store,
        kill_switch,
        Arc::new(NullTrainRunner),
    );
    coordinator.clone().start_all().await;

    let mut status_tick = tokio::time::interval(Duration::from_secs(30));
    status_tick.tick().await; // the immediate first tick
    loop {
        tokio::select! {
            _ = shutdown_signal() => break,
            _ = status_tick.tick() => {
                let telemetry = coordinator.telemetry().await;
                info!(
                    equity = %telemetry.portfolio.portfolio_equity,
                    queue = telemetry.portfolio.queue.current_size,
                    in_flight = telemetry.portfolio.in_flight_count,
                    breaker_active = telemetry.breaker.active,
                    "status"
                );
                if coordinator.is_killed() {
                    info!("coordinator halted, exiting");
                    break;
                }
            }
        }
    }

    info!("shutting down");
    coordinator.shutdown().await;
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},conductor=debug", config.level)));

    if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
        return;
    }

    // Optional daily rolling file logs. `rolling::daily` aborts if it cannot
    // create the initial file, so writability is preflighted first.
    let file_layer = std::env::var("CONDUCTOR_LOG_DIR").ok().and_then(|log_dir| {
        std::fs::create_dir_all(&log_dir).ok()?;
        let test_path = std::path::Path::new(&log_dir).join(".conductor_write_test");
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
            .ok()?;
        let _ = std::fs::remove_file(&test_path);

        let file_appender = tracing_appender::rolling::daily(&log_dir, "conductor.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Keep the guard alive for the life of the process
        Box::leak(Box::new(guard));

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
