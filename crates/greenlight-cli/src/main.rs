mod mcp_stdio;
mod serve;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use greenlight::Config;

#[derive(Parser)]
#[command(name = "greenlight", about = "Human-in-the-loop request broker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server, Telegram bot, and timeout scheduler
    Serve {
        /// Port to bind (overrides SERVER_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the MCP server over line-delimited stdio
    Mcp,
}

/// Initialize the fmt tracing subscriber. `RUST_LOG` takes precedence over
/// the LOG_LEVEL environment option. The stdio MCP transport owns stdout, so
/// its logs go to stderr.
fn init_tracing(log_level: &str, to_stderr: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    if to_stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("failed to load configuration")?;

    match cli.command {
        Some(Commands::Mcp) => {
            init_tracing(&config.log_level, true);
            mcp_stdio::run(config).await
        }
        Some(Commands::Serve { port }) => {
            init_tracing(&config.log_level, false);
            if let Some(port) = port {
                config.server_port = port;
            }
            serve::run(config).await
        }
        None => {
            init_tracing(&config.log_level, false);
            serve::run(config).await
        }
    }
}
