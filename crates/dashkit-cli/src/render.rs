//! Plain-text dashboard rendering

use colored::Colorize;
use dashkit_host::manager::Generation;

/// Render every widget of `generation` as a titled panel.
pub fn dashboard(generation: &Generation) -> String {
    panels(generation.iter().map(|w| (w.name().to_string(), w.view().render())))
}

pub(crate) fn panels(widgets: impl IntoIterator<Item = (String, String)>) -> String {
    let mut out = String::new();
    let mut count = 0;
    for (name, body) in widgets {
        count += 1;
        out.push_str(&format!("{}\n", format!("== {name} ==").bold()));
        for line in body.lines() {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
    }
    if count == 0 {
        out.push_str(&format!("{}\n", "(no widgets loaded)".dimmed()));
    }
    out
}
