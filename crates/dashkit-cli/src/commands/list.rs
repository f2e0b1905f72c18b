//! `dashkit list` command implementation

use colored::Colorize;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use dashkit_host::{HostConfig, ReloadReport};
use serde::Serialize;

use super::build_manager;

#[derive(Debug, Clone, Serialize)]
struct WidgetInfo {
    name: String,
    type_id: String,
    module: String,
}

#[derive(Debug, Serialize)]
struct Listing {
    widgets_dir: String,
    widgets: Vec<WidgetInfo>,
    errors: Vec<String>,
}

/// Execute the `dashkit list` command
pub async fn run(config: HostConfig, json: bool) -> anyhow::Result<()> {
    let manager = build_manager(config)?;
    let report = manager.start().await?;

    let widgets: Vec<WidgetInfo> = manager.with_widgets(|generation| {
        generation
            .iter()
            .map(|w| WidgetInfo {
                name: w.name().to_string(),
                type_id: w.type_id().to_string(),
                module: w
                    .source_path()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            })
            .collect()
    });

    let listing = Listing {
        widgets_dir: manager.widgets_dir().display().to_string(),
        widgets,
        errors: report.errors(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        print_table(&listing, &report);
    }

    manager.shutdown().await?;
    Ok(())
}

fn print_table(listing: &Listing, report: &ReloadReport) {
    println!("{} Widgets in {}", "→".green(), listing.widgets_dir.cyan());
    println!();

    if listing.widgets.is_empty() {
        println!("  No widgets found.");
    } else {
        let mut table = Table::new();
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Type").fg(Color::Cyan),
            Cell::new("Module").fg(Color::Cyan),
        ]);
        for widget in &listing.widgets {
            table.add_row(vec![
                Cell::new(&widget.name),
                Cell::new(&widget.type_id),
                Cell::new(&widget.module),
            ]);
        }
        println!("{table}");
    }

    for error in &listing.errors {
        println!("  {} {}", "✗".red(), error);
    }
    if !listing.errors.is_empty() || report.staged_modules > 0 {
        println!();
        println!(
            "  {} module(s) staged, {} loaded, {} error(s)",
            report.staged_modules,
            report.loaded_modules.len(),
            report.error_count()
        );
    }
}
