//! gbpilot — entry point.
//!
//! ```text
//! gbpilot                        Run with ./gbpilot.toml (defaults if missing)
//! gbpilot --config <path>        Load a custom config TOML
//! gbpilot --gen-config           Write default config to stdout
//! gbpilot --port 9000            Override the listen port
//! ```

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gbpilot_core::decision::{DecisionOracle, ProcessOracle};
use gbpilot_server::config::{spawn_config_watcher, ConfigOverrides, PilotConfig};
use gbpilot_server::service::PilotService;

const CONFIG_POLL: Duration = Duration::from_secs(2);

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "gbpilot", about = "Drive a Game Boy emulator from an external decision process")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "gbpilot.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Override `network.host`.
    #[arg(long)]
    host: Option<String>,

    /// Override `network.port`.
    #[arg(short, long)]
    port: Option<u16>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&PilotConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let overrides = ConfigOverrides {
        host: cli.host,
        port: cli.port,
    };
    let mut config = PilotConfig::load(&cli.config);
    overrides.apply(&mut config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = OpenOptions::new().create(true).append(true).open(&config.logging.file)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    }

    info!("gbpilot v{}", env!("CARGO_PKG_VERSION"));
    info!("emulator socket: {}:{}", config.network.host, config.network.port);
    info!("capture: {} @ {} fps", config.capture.kind, config.capture.fps);
    info!("continuous recording: {}", config.capture.continuous_recording);

    if config.oracle.command.is_empty() {
        warn!("oracle.command is empty; every decision will fail until it is configured");
    }
    let oracle: Arc<dyn DecisionOracle> = Arc::new(ProcessOracle::new(config.to_oracle_config()));

    let shutdown = tokio_util::sync::CancellationToken::new();
    let (config_rx, watcher) =
        spawn_config_watcher(cli.config.clone(), config, overrides, CONFIG_POLL, shutdown.child_token());

    let service = PilotService::new(config_rx, oracle);
    let stop = service.shutdown_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
        shutdown.cancel();
    });

    let result = service.run().await;
    watcher.abort();
    result?;
    Ok(())
}
