//! Terminal front end: configuration and logging bootstrap, raw-mode display,
//! key translation, and preview announcements.

pub mod bootstrap;
pub mod preview;
pub mod terminal;

pub use bootstrap::{
    host_sandbox_config, init_file_logging, load_config, parse_cli_flags, print_cli_help,
    server_chain, session_settings, spawn_event_logger, CliFlags,
};
pub use preview::TerminalPreview;
pub use terminal::{spawn_key_reader, translate_key, CrosstermDisplay, KeyReader, RawModeGuard};
