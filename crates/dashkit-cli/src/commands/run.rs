//! `dashkit run` command implementation

use colored::Colorize;
use dashkit_host::{HostConfig, ManagerEvent, WidgetManager, topics};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use super::build_manager;
use crate::render;

const QUIT: &str = ":q";
const RELOAD: &str = ":r";

/// Execute the `dashkit run` command
pub async fn run(config: HostConfig) -> anyhow::Result<()> {
    let manager = build_manager(config)?;

    manager.on_widgets_changed(|generation, report| {
        println!("{}", render::dashboard(generation));
        for error in report.errors() {
            println!("  {} {}", "✗".red(), error);
        }
    });

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ManagerEvent::ReloadFailed { generation, error } = event {
                warn!(generation, "Reload failed: {}", error);
            }
        }
    });

    manager.start().await?;
    println!(
        "{} Type text and press Enter to update the widgets ({} reloads, {} quits)",
        "→".green(),
        RELOAD.cyan(),
        QUIT.cyan()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match Input::parse(line) {
                    Input::Quit => break,
                    Input::Reload => {
                        manager.reload().await?;
                    }
                    Input::Blank => {}
                    Input::Text(text) => submit(&manager, text)?,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    let report = manager.shutdown().await?;
    info!(
        "Unloaded {} module(s), {} still referenced",
        report.collapsed,
        report.pinned.len()
    );
    Ok(())
}

/// One line read from stdin.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Quit,
    Reload,
    Blank,
    Text(String),
}

impl Input {
    fn parse(line: String) -> Self {
        match line.trim() {
            QUIT => Input::Quit,
            RELOAD => Input::Reload,
            "" => Input::Blank,
            _ => Input::Text(line),
        }
    }
}

/// Publish `text` on the UI thread and re-render the dashboard.
fn submit(manager: &WidgetManager, text: String) -> anyhow::Result<()> {
    let bus = manager.bus().clone();
    let view = manager.clone();
    manager.dispatcher().post(move || {
        bus.publish(topics::DATA_SUBMITTED, &text);
        view.with_widgets(|generation| println!("{}", render::dashboard(generation)));
    })?;
    Ok(())
}
