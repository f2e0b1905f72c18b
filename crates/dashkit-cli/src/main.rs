//! dashkit CLI - terminal dashboard hosting hot-reloaded widget modules

mod cli;
mod commands;
mod render;

use clap::Parser;
use cli::{Cli, Commands};
use dashkit_host::HostConfig;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .with_writer(std::io::stderr)
            .init();
    }

    let config = load_config(&cli)?;

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command.unwrap_or(Commands::Run { no_watch: false }) {
        Commands::Run { no_watch } => rt.block_on(commands::run::run(config.with_watch(!no_watch))),
        Commands::List { json } => rt.block_on(commands::list::run(config.with_watch(false), json)),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<HostConfig> {
    let mut config = match &cli.config {
        Some(path) => HostConfig::from_file(path)?,
        None => HostConfig::from_env()?,
    };
    if let Some(dir) = &cli.widgets {
        config = config.with_widgets_dir(dir);
    }
    Ok(config)
}
