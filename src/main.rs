// src/main.rs

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;

use action_relay::app::RelayApplication;
use action_relay::config::ConfigManager;
use action_relay::error::{ErrorKind, Result};
use action_relay::manager::Manager;
use action_relay::simulation::{self, Script};

#[derive(Parser)]
#[command(
    name = "action-relay",
    version = action_relay::VERSION,
    about = "Correlates bus-dispatched UI actions with their responses and persisted entities",
    long_about = None
)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every reconciliation scenario against a scripted backend and print the view
    Simulate {
        /// Request timeout used for the silent scenario
        #[arg(long, default_value_t = 300)]
        timeout_ms: u64,

        /// Answer from a background task after this many milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Validate a configuration file
    ValidateConfig {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Simulate {
            timeout_ms,
            delay_ms,
        } => simulate(&cli, *timeout_ms, *delay_ms).await,
        Commands::ValidateConfig { path } => validate_config(path.clone()).await,
        Commands::ShowConfig => show_config(cli.config.clone()).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if let ErrorKind::Configuration {
            validation_errors, ..
        } = &e.kind
        {
            for problem in validation_errors {
                eprintln!("  - {}", problem);
            }
        }
        for cause in &e.causes {
            eprintln!("  caused by: {}", cause);
        }
        process::exit(1);
    }
}

async fn simulate(cli: &Cli, timeout_ms: u64, delay_ms: Option<u64>) -> Result<()> {
    let sweep_ms = (timeout_ms / 4).max(1);
    let mut app = RelayApplication::new().with_overrides(json!({
        "logging": {"console": {"enabled": cli.verbose}},
        "coordination": {"request_timeout_ms": timeout_ms, "sweep_interval_ms": sweep_ms},
    }));
    if let Some(path) = &cli.config {
        app = app.with_config_file(path);
    }
    app.initialize().await?;

    let recipient = "input";
    let installed = match delay_ms {
        Some(delay) => install_delayed_backend(&app, recipient, Duration::from_millis(delay)).await,
        None => app.install_scripted_backend(recipient).await,
    };
    let backend = match installed {
        Ok(backend) => backend,
        Err(e) => {
            app.shutdown().await?;
            return Err(e);
        }
    };

    let scripts = [
        Script::ResponseFirst,
        Script::NotificationFirst,
        Script::ResponseOnly,
        Script::Fail {
            message: "worker rejected the request".to_string(),
        },
        Script::Silent,
    ];
    let settle = Duration::from_millis(timeout_ms + sweep_ms * 2 + delay_ms.unwrap_or(0) * 2);

    let report = match app.coordinator() {
        Some(coordinator) => {
            Some(simulation::run_scenarios(coordinator, &backend, recipient, &scripts, settle).await)
        }
        None => None,
    };
    app.shutdown().await?;

    if let Some(report) = report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

async fn install_delayed_backend(
    app: &RelayApplication,
    recipient: &str,
    delay: Duration,
) -> Result<std::sync::Arc<simulation::ScriptedBackend>> {
    use action_relay::bus::MessageBus;
    use std::sync::{Arc, Weak};

    let config = app.get_config().await?;
    let bus = app.bus().ok_or_else(|| action_relay::Error::config("Bus is not running"))?;
    let weak_bus: Weak<dyn MessageBus> = {
        let shared: Arc<dyn MessageBus> = bus.clone();
        Arc::downgrade(&shared)
    };
    let backend = Arc::new(
        simulation::ScriptedBackend::new(weak_bus, config.bus.clone(), &config.coordination)
            .with_delay(delay),
    );
    bus.register_route(recipient, backend.clone());
    Ok(backend)
}

async fn validate_config(path: PathBuf) -> Result<()> {
    let mut config_manager = ConfigManager::with_config_file(&path)?;
    config_manager.initialize().await?;
    println!("Configuration {} is valid", path.display());
    Ok(())
}

async fn show_config(path: Option<PathBuf>) -> Result<()> {
    let mut config_manager = match path {
        Some(path) => ConfigManager::with_config_file(path)?,
        None => ConfigManager::new(),
    };
    config_manager.initialize().await?;
    let config = config_manager.get_config().await?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
