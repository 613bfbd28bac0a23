//! Tidewire CLI: the main entry point.
//!
//! Commands:
//! - `chat`    : Interactive chat or single-message mode
//! - `models`  : List, select and plan fallbacks for backend models
//! - `context` : Show context usage and compress a chat's history
//! - `stop`    : Ask the backend to stop the running generation
//! - `init`    : Write a default config file
//! - `config`  : Validate, show or locate the config

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "tidewire",
    about = "Tidewire: streaming chat client for local inference backends",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the assistant
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Chat id the turns belong to
        #[arg(long, default_value = "default")]
        chat: String,

        /// Seed the chat with a JSON array of history entries
        #[arg(long)]
        history: Option<PathBuf>,

        /// Files to attach to the message
        #[arg(short, long)]
        attach: Vec<PathBuf>,
    },

    /// List backend models
    Models {
        /// Select this model and load it
        #[arg(long)]
        select: Option<String>,

        /// Show the fallback plan for the selected model
        #[arg(long)]
        plan: bool,
    },

    /// Show context window usage
    Context {
        /// Draft message to include in the estimate
        #[arg(short, long, default_value = "")]
        draft: String,

        /// Seed the chat with a JSON array of history entries
        #[arg(long)]
        history: Option<PathBuf>,

        /// Also compute a compressed history
        #[arg(long)]
        compress: bool,
    },

    /// Stop the backend's running generation
    Stop,

    /// Write a default config file
    Init,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the config file
    Validate,
    /// Print the effective config (secrets masked)
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for replies
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Chat {
            message,
            chat,
            history,
            attach,
        } => commands::chat::run(message, chat, history, attach).await?,
        Commands::Models { select, plan } => commands::models::run(select, plan).await?,
        Commands::Context {
            draft,
            history,
            compress,
        } => commands::context::run(draft, history, compress).await?,
        Commands::Stop => commands::stop::run().await?,
        Commands::Init => commands::init::run()?,
        Commands::Config { action } => match action {
            ConfigAction::Validate => commands::config_cmd::validate()?,
            ConfigAction::Show => commands::config_cmd::show()?,
            ConfigAction::Path => commands::config_cmd::path(),
        },
    }

    Ok(())
}
