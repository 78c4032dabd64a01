//! Live CRUD - Main Server
//!
//! Item CRUD API with change notifications over SSE and WebSocket.

use anyhow::Result;
use clap::{Parser, Subcommand};
use livecrud::LogFormat;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser)]
#[command(name = "livecrud")]
#[command(about = "Item CRUD server with live change streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Port to listen on (overrides config.yaml and SERVER_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to a YAML config file (default: ./config.yaml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = livecrud::env_filter();

    let fmt_layer = match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, config } => {
            let mut config = livecrud::load_config(config.as_deref())?;
            if let Some(port) = port {
                config.server_port = port;
            }
            init_tracing(config.log_format);
            livecrud::start_server(config).await
        }
    }
}
