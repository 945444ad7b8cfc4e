//! Text the session prints, with its ANSI styling.

use sandterm_protocol::{DirEntry, SandboxError};

use crate::commands::CommandMetadata;

const RESET: &str = "\x1b[0m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const BOLD_BLUE: &str = "\x1b[1;34m";

pub const PROMPT_MARKER: &str = " > ";

pub fn welcome_lines() -> [&'static str; 2] {
    [
        " Welcome to sandterm.",
        " Type 'help' to see the available commands.",
    ]
}

pub fn prompt_marker() -> String {
    format!("{GREEN}{PROMPT_MARKER}{RESET}")
}

pub fn error_line(error: &SandboxError) -> String {
    error_text(&error.to_string())
}

pub fn error_text(message: &str) -> String {
    let message = message.trim().replace(['\r', '\n'], " ");
    format!("{RED} error: {message}{RESET}")
}

pub fn reboot_hint() -> &'static str {
    " type 'reboot' to start a fresh sandbox"
}

pub fn preview_bound(url: &str) -> String {
    format!(" preview available at {url}")
}

pub fn preview_closed() -> String {
    " preview closed".to_owned()
}

pub fn unknown_command(line: &str) -> String {
    format!(" You entered: {line}")
}

pub fn help_line(metadata: &CommandMetadata) -> String {
    format!(
        " {GREEN}{:<24}{RESET}{}",
        metadata.usage, metadata.description
    )
}

/// Directories are bold blue with a trailing `/`; files are plain.
pub fn listing(entries: &[DirEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            if entry.is_directory {
                format!("{BOLD_BLUE}{}/{RESET}", entry.name)
            } else {
                entry.name.clone()
            }
        })
        .collect::<Vec<_>>()
        .join("  ")
}
