use clap::{Parser, Subcommand};
use kandi::config::{load_config, resolve_config_path};
use kandi::pipeline::PipelineMode;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kandi")]
#[command(about = "Kafka to InfluxDB ingestion pipeline", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume continuously until interrupted
    Run,
    /// Consume from the oldest retained offsets up to the current end, then exit
    Backfill,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run) | None => run(cli.config, PipelineMode::Normal).await?,
        Some(Commands::Backfill) => run(cli.config, PipelineMode::Backfill).await?,
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                init_tracing("info");
                kandi::cli::config::init(stdout)?;
            }
        },
    }

    Ok(())
}

async fn run(
    explicit_path: Option<PathBuf>,
    mode: PipelineMode,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(config_path) = resolve_config_path(explicit_path.as_deref()) else {
        eprintln!("Error: config not found");
        eprintln!("Searched locations:");
        eprintln!("  $KANDI_CONFIG");
        eprintln!("  ~/.config/kandi/config.yml");
        eprintln!("  /etc/kandi/config.yml");
        eprintln!("\nUse --config <path> to specify a config file, or run 'kandi config init' to generate one.");
        std::process::exit(1);
    };

    let config = load_config(&config_path)?;
    init_tracing(&config.kandi.log_level);
    info!(config_path = %config_path.display(), "Loaded configuration");

    kandi::cli::run::run(config, mode).await?;
    Ok(())
}

/// RUST_LOG wins over the configured level
fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("kandi={}", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
