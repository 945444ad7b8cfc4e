use std::path::{Path, PathBuf};

use sandterm_config::{ConfigError, SandtermConfig};
use sandterm_eventbus::SessionEventSubscription;
use sandterm_host::HostSandboxConfig;
use sandterm_lifecycle::ServerChain;
use sandterm_protocol::{SpawnRequest, TerminalSize};
use sandterm_session::SessionSettings;
use tokio::task::JoinHandle;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CliFlags {
    pub config_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub show_help: bool,
}

pub fn parse_cli_flags<I>(args: I) -> Result<CliFlags, ConfigError>
where
    I: IntoIterator<Item = String>,
{
    let mut flags = CliFlags::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                flags.config_path = Some(read_cli_path(
                    &arg,
                    args.next().ok_or_else(|| {
                        ConfigError::Message(
                            "Missing value after --config. Use --config <path>.".to_owned(),
                        )
                    })?,
                )?);
            }
            "--log-path" => {
                flags.log_path = Some(read_cli_path(
                    &arg,
                    args.next().ok_or_else(|| {
                        ConfigError::Message(
                            "Missing value after --log-path. Use --log-path <path>.".to_owned(),
                        )
                    })?,
                )?);
            }
            "--help" | "-h" => flags.show_help = true,
            value if value.starts_with("--") => {
                return Err(ConfigError::Message(format!(
                    "Unknown flag '{value}'. Run with --help for valid flags."
                )));
            }
            unknown => {
                return Err(ConfigError::Message(format!(
                    "Unexpected argument '{unknown}'. Run with --help for valid flags."
                )));
            }
        }
    }

    Ok(flags)
}

pub fn print_cli_help() {
    println!("Usage: sandterm [--config <path>] [--log-path <path>]");
    println!();
    println!("  --config <path>     Read configuration from <path> instead of $SANDTERM_CONFIG");
    println!("  --log-path <path>   Append logs to <path> instead of the configured log file");
    println!("  --help              Show this help message");
}

fn read_cli_path(flag: &str, value: String) -> Result<PathBuf, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::Message(format!(
            "Flag '{flag}' requires a non-empty value."
        )));
    }
    Ok(PathBuf::from(value))
}

pub fn load_config(flags: &CliFlags) -> Result<SandtermConfig, ConfigError> {
    match &flags.config_path {
        Some(path) => sandterm_config::load_from_path(path),
        None => sandterm_config::load_from_env(),
    }
}

pub fn server_chain(config: &SandtermConfig) -> ServerChain {
    ServerChain::new(
        SpawnRequest::new(
            config.server.install_program.clone(),
            config.server.install_args.clone(),
        ),
        SpawnRequest::new(
            config.server.run_program.clone(),
            config.server.run_args.clone(),
        ),
    )
}

pub fn session_settings(config: &SandtermConfig) -> SessionSettings {
    let interactive = &config.interactive;
    SessionSettings {
        prompt_label: config.terminal.prompt_label.clone(),
        prompt_width: config.terminal.prompt_width,
        tab_width: config.terminal.tab_width,
        exit_token: config.terminal.exit_token.clone(),
        show_welcome: config.terminal.show_welcome,
        server_chain: server_chain(config),
        interactive: SpawnRequest::new(interactive.program.clone(), interactive.args.clone())
            .with_terminal(TerminalSize {
                cols: interactive.cols,
                rows: interactive.rows,
            }),
    }
}

pub fn host_sandbox_config(config: &SandtermConfig) -> HostSandboxConfig {
    HostSandboxConfig {
        root_parent: config.sandbox_root_parent(),
    }
}

pub fn init_file_logging(log_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|error| {
                anyhow::anyhow!(
                    "failed to create sandterm log directory '{}': {error}",
                    parent.display()
                )
            })?;
        }
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|error| {
            anyhow::anyhow!(
                "failed to open sandterm log file '{}': {error}",
                log_path.display()
            )
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .init();

    Ok(())
}

/// Records every session change notification in the log.
pub fn spawn_event_logger(mut events: SessionEventSubscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.next_event().await {
                Ok(Some(envelope)) => tracing::debug!(
                    sequence = envelope.sequence,
                    event = ?envelope.event,
                    "session event"
                ),
                Ok(None) => break,
                Err(error) => tracing::warn!(?error, "session event logger lagged"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use sandterm_config::SandtermConfig;
    use sandterm_protocol::TerminalSize;

    use super::{host_sandbox_config, parse_cli_flags, session_settings, CliFlags};

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    #[test]
    fn no_flags_parse_to_defaults() {
        assert_eq!(parse_cli_flags(args(&[])).expect("parse"), CliFlags::default());
    }

    #[test]
    fn path_flags_are_read() {
        let flags = parse_cli_flags(args(&[
            "--config",
            "/tmp/sandterm.toml",
            "--log-path",
            " /tmp/sandterm.log ",
        ]))
        .expect("parse");

        assert_eq!(flags.config_path, Some(PathBuf::from("/tmp/sandterm.toml")));
        assert_eq!(flags.log_path, Some(PathBuf::from("/tmp/sandterm.log")));
        assert!(!flags.show_help);
    }

    #[test]
    fn help_flag_is_recognized() {
        assert!(parse_cli_flags(args(&["-h"])).expect("parse").show_help);
        assert!(parse_cli_flags(args(&["--help"])).expect("parse").show_help);
    }

    #[test]
    fn missing_and_blank_values_are_rejected() {
        let error = parse_cli_flags(args(&["--config"])).expect_err("missing value");
        assert!(error.to_string().contains("Missing value after --config"));

        let error = parse_cli_flags(args(&["--log-path", "  "])).expect_err("blank value");
        assert!(error.to_string().contains("requires a non-empty value"));
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        let error = parse_cli_flags(args(&["--verbose"])).expect_err("unknown flag");
        assert!(error.to_string().starts_with("Unknown flag '--verbose'"));

        let error = parse_cli_flags(args(&["serve"])).expect_err("positional");
        assert!(error.to_string().starts_with("Unexpected argument 'serve'"));
    }

    #[test]
    fn settings_follow_the_configuration() {
        let mut config = SandtermConfig::default();
        config.terminal.exit_token = "quit".to_owned();
        config.server.run_program = "pnpm".to_owned();
        config.server.run_args = vec!["dev".to_owned()];
        config.interactive.program = "bash".to_owned();
        config.interactive.cols = 120;
        config.sandbox.root_parent = Some("/var/tmp/sandterm".to_owned());

        let settings = session_settings(&config);

        assert_eq!(settings.exit_token, "quit");
        assert_eq!(settings.prompt_width, 3);
        assert_eq!(settings.server_chain.install.display_command(), "npm install");
        assert_eq!(settings.server_chain.run.display_command(), "pnpm dev");
        assert_eq!(settings.interactive.command, "bash");
        assert_eq!(
            settings.interactive.terminal,
            Some(TerminalSize { cols: 120, rows: 24 })
        );
        assert_eq!(
            host_sandbox_config(&config).root_parent,
            Some(PathBuf::from("/var/tmp/sandterm"))
        );
    }
}
