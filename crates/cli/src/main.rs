//! Switchboard CLI: the main entry point.
//!
//! Commands:
//! - `chat`    Single message or interactive chat with the agent
//! - `config`  Show the effective configuration, its path, or the defaults

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "switchboard",
    about = "Switchboard: a message-driven LLM agent runtime",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show configuration
    Config {
        /// Print the config file path only
        #[arg(long, conflicts_with = "defaults")]
        path: bool,

        /// Print a default config file
        #[arg(long)]
        defaults: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat { message } => commands::chat::run(message).await?,
        Commands::Config { path: true, .. } => commands::config_cmd::path()?,
        Commands::Config { defaults: true, .. } => commands::config_cmd::defaults()?,
        Commands::Config { .. } => commands::config_cmd::show()?,
    }

    Ok(())
}
