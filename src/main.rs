//! Chatsync CLI
//!
//! Runs the relay server or a line-oriented chat client on top of
//! chatsync-core.
//!
//! ## Usage
//!
//! ```bash
//! # Start the relay on the default address
//! chatsync serve
//!
//! # Join the "team" conversation; every line typed is a message
//! chatsync connect --conversation team
//!
//! # Use a config file and debug logging
//! chatsync -vv --config chatsync.json connect
//! ```

mod client;
mod config;
mod cursor;
mod pending;
mod server;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Chatsync - offline-first chat sync
#[derive(Parser)]
#[command(name = "chatsync")]
#[command(version = "0.1.0")]
#[command(about = "Offline-first chat sync server and client")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        bind: Option<String>,

        /// Events kept for replay
        #[arg(long)]
        history_limit: Option<usize>,
    },

    /// Connect to a server and chat from stdin
    Connect {
        /// Server WebSocket URL
        #[arg(short, long)]
        url: Option<String>,

        /// Conversation to write into
        #[arg(short = 'C', long)]
        conversation: Option<String>,

        /// Data directory for the offline queue (default: ~/.chatsync)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let file = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            bind,
            history_limit,
        } => {
            let mut config = file.server;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(limit) = history_limit {
                config.history_limit = limit;
            }
            server::run(config).await
        }
        Commands::Connect {
            url,
            conversation,
            data_dir,
        } => {
            let mut config = file.client;
            if let Some(url) = url {
                config.url = url;
            }
            if let Some(conversation) = conversation {
                config.conversation_id = conversation;
            }
            if data_dir.is_some() {
                config.data_dir = data_dir;
            }
            client::run(config).await
        }
    }
}

/// Set up tracing; chat output owns stdout, so logs go to stderr
fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}
