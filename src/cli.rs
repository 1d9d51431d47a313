//! Command-line interface for the gammon server.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Gammon - backgammon session and match server
#[derive(Parser, Debug)]
#[command(name = "gammon")]
#[command(about = "Backgammon session and match server", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the server until Ctrl-C
    Serve {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Database file, overriding the configuration
        #[arg(long)]
        db_path: Option<String>,
    },

    /// Rebuild a stored game and print its position and history
    Replay {
        /// Game to replay
        #[arg(long)]
        game_id: String,

        /// Database file
        #[arg(long, default_value = "gammon.db")]
        db_path: String,
    },

    /// Apply pending database migrations
    Migrate {
        /// Database file
        #[arg(long, default_value = "gammon.db")]
        db_path: String,
    },
}
