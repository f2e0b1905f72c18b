//! CLI command definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// dashkit - terminal dashboard with hot-reloaded widget modules
#[derive(Parser)]
#[command(name = "dashkit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (yaml, toml or json)
    #[arg(short = 'c', long, global = true, env = "DASHKIT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Widget directory (overrides the configuration file)
    #[arg(short = 'w', long, global = true)]
    pub widgets: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the dashboard: read lines from stdin and publish them to every widget
    Run {
        /// Do not watch the widget directory for changes
        #[arg(long)]
        no_watch: bool,
    },

    /// Load the widget directory once and list the widgets it provides
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}
