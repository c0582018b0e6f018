//! Terminal colors for notices printed by the CLI.

use std::io::IsTerminal;

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const CYAN: &str = "\x1b[36m";

/// Whether stderr should receive escape codes (honors `NO_COLOR`).
fn enabled() -> bool {
    std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal()
}

/// Wrap `text` in `color` when writing to a color terminal.
pub fn paint(color: &str, text: &str) -> String {
    if enabled() {
        format!("{}{}{}", color, text, RESET)
    } else {
        text.to_string()
    }
}
