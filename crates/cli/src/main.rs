//! Ferrule CLI: the main entry point.
//!
//! Commands:
//! - `chat`: Interactive chat or single-message mode
//! - `tools`: List the tools the agent can call
//! - `config`: Show, locate or initialize the configuration

use clap::{Parser, Subcommand};
use ferrule_config::AppConfig;
use tracing_subscriber::EnvFilter;

mod commands;
mod event_log;

#[derive(Parser)]
#[command(
    name = "ferrule",
    about = "Ferrule: a tool-using LLM agent for your terminal",
    version,
    author
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

        /// Print the reply as it streams in
        #[arg(long)]
        stream: bool,

        /// Resume (and persist) a named session
        #[arg(long)]
        session: Option<String>,

        /// Try this provider first
        #[arg(long)]
        provider: Option<String>,
    },

    /// List available tools
    Tools,

    /// Show or initialize the configuration
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,

        /// Print the config file path only
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // `config --init` must work even when the existing file is broken
    if let Commands::Config { init: true, .. } = cli.command {
        init_tracing(cli.verbose, false);
        return commands::config_cmd::init().await;
    }

    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    init_tracing(cli.verbose, config.logging.json);

    match cli.command {
        Commands::Chat {
            message,
            stream,
            session,
            provider,
        } => {
            let args = commands::chat::ChatArgs {
                message,
                stream,
                session,
                provider,
            };
            commands::chat::run(config, args).await?
        }
        Commands::Tools => commands::tools::run(&config).await?,
        Commands::Config { path: true, .. } => commands::config_cmd::path().await?,
        Commands::Config { .. } => commands::config_cmd::show(&config).await?,
    }

    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
