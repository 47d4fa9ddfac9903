use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(
    name = "bakery",
    version,
    about = "Network boot provisioning controller for single-board computer clusters",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides `logging.format`
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Configuration file (TOML); BAKERY_* environment variables otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the provisioning server
    Serve {
        /// Override the bind address (e.g. 0.0.0.0:8080)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// List node records
    Nodes {
        /// Only show nodes with this status (available, provisioning, ready)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// List template images
    Templates,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    let format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    setup_tracing(format, &config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::Serve { bind } => {
            tracing::info!(config = ?cli.config, bind = ?bind, "Starting serve command");
            commands::serve(commands::ServeParams { config, bind }).await?;
        }

        Commands::Nodes { status } => {
            commands::nodes(&config, status.as_deref())?;
        }

        Commands::Templates => {
            commands::templates(&config).await?;
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over `--verbose`, which wins over `logging.level`
fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            tracing_subscriber::EnvFilter::new("bakery=debug,tower_http=debug,info")
        } else {
            tracing_subscriber::EnvFilter::new(format!("bakery={level},warn"))
        }
    });

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
