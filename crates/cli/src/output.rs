//! Output formatting utilities

use colored::Colorize;
use std::io::IsTerminal;

/// Print a fatal error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Color only when the stream is a terminal and NO_COLOR is unset
fn color_enabled(stream: &impl IsTerminal) -> bool {
    std::env::var_os("NO_COLOR").is_none() && stream.is_terminal()
}

pub fn stdout_color() -> bool {
    color_enabled(&std::io::stdout())
}

pub fn stderr_color() -> bool {
    color_enabled(&std::io::stderr())
}
