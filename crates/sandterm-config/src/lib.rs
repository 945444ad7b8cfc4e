use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_SANDTERM_CONFIG: &str = "SANDTERM_CONFIG";

const DEFAULT_PROMPT_LABEL: &str = " Hello from sandterm $ ";
const DEFAULT_PROMPT_WIDTH: usize = 3;
const DEFAULT_TAB_WIDTH: usize = 4;
const DEFAULT_EXIT_TOKEN: &str = "exit";
const DEFAULT_SHOW_WELCOME: bool = true;
const DEFAULT_INSTALL_PROGRAM: &str = "npm";
const DEFAULT_INSTALL_ARGS: &[&str] = &["install"];
const DEFAULT_RUN_PROGRAM: &str = "npm";
const DEFAULT_RUN_ARGS: &[&str] = &["run", "dev"];
#[cfg(windows)]
const DEFAULT_INTERACTIVE_PROGRAM: &str = "cmd";
#[cfg(not(windows))]
const DEFAULT_INTERACTIVE_PROGRAM: &str = "sh";
const DEFAULT_INTERACTIVE_COLS: u16 = 80;
const DEFAULT_INTERACTIVE_ROWS: u16 = 24;
const LOG_FILE_NAME: &str = "sandterm.log";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandtermConfig {
    #[serde(default)]
    pub terminal: TerminalConfigToml,
    #[serde(default)]
    pub server: ServerConfigToml,
    #[serde(default)]
    pub interactive: InteractiveConfigToml,
    #[serde(default)]
    pub sandbox: SandboxConfigToml,
    #[serde(default)]
    pub logging: LoggingConfigToml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalConfigToml {
    #[serde(default = "default_prompt_label")]
    pub prompt_label: String,
    /// Columns the prompt marker occupies; tab stops are aligned past it.
    #[serde(default = "default_prompt_width")]
    pub prompt_width: usize,
    #[serde(default = "default_tab_width")]
    pub tab_width: usize,
    #[serde(default = "default_exit_token")]
    pub exit_token: String,
    #[serde(default = "default_show_welcome")]
    pub show_welcome: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfigToml {
    #[serde(default = "default_install_program")]
    pub install_program: String,
    #[serde(default = "default_install_args")]
    pub install_args: Vec<String>,
    #[serde(default = "default_run_program")]
    pub run_program: String,
    #[serde(default = "default_run_args")]
    pub run_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InteractiveConfigToml {
    #[serde(default = "default_interactive_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_interactive_cols")]
    pub cols: u16,
    #[serde(default = "default_interactive_rows")]
    pub rows: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxConfigToml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfigToml {
    #[serde(default = "default_log_path")]
    pub log_path: String,
}

impl SandtermConfig {
    pub fn log_path(&self) -> PathBuf {
        PathBuf::from(&self.logging.log_path)
    }

    pub fn sandbox_root_parent(&self) -> Option<PathBuf> {
        self.sandbox.root_parent.as_ref().map(PathBuf::from)
    }
}

pub fn load_from_env() -> Result<SandtermConfig, ConfigError> {
    let path = config_path_from_env()?;
    load_from_path(path)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<SandtermConfig, ConfigError> {
    load_or_create_config(path.as_ref())
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = resolve_home_dir().ok_or_else(|| {
        ConfigError::configuration("Unable to resolve home directory from HOME or USERPROFILE")
    })?;

    Ok(home.join(".config").join("sandterm").join("config.toml"))
}

fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_SANDTERM_CONFIG) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                default_config_path()
            } else {
                Ok(raw.into())
            }
        }
        Err(std::env::VarError::NotPresent) => default_config_path(),
        Err(_) => Err(ConfigError::configuration(
            "SANDTERM_CONFIG contained invalid UTF-8",
        )),
    }
}

fn default_sandterm_data_dir() -> PathBuf {
    resolve_data_local_dir().join("sandterm")
}

fn resolve_data_local_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(path) = std::env::var("LOCALAPPDATA") {
            let path = path.trim();
            if !path.is_empty() {
                return absolutize_path(PathBuf::from(path));
            }
        }
        if let Some(home) = resolve_home_dir() {
            return home.join("AppData").join("Local");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = resolve_home_dir() {
            return home.join("Library").join("Application Support");
        }
    }

    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        if let Ok(path) = std::env::var("XDG_DATA_HOME") {
            let path = path.trim();
            if !path.is_empty() {
                return absolutize_path(PathBuf::from(path));
            }
        }
        if let Some(home) = resolve_home_dir() {
            return home.join(".local").join("share");
        }
    }

    std::env::temp_dir()
}

fn resolve_home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("USERPROFILE")
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
}

fn absolutize_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }

    if let Ok(current) = std::env::current_dir() {
        return current.join(path);
    }

    std::env::temp_dir().join(path)
}

fn default_prompt_label() -> String {
    DEFAULT_PROMPT_LABEL.to_owned()
}

fn default_prompt_width() -> usize {
    DEFAULT_PROMPT_WIDTH
}

fn default_tab_width() -> usize {
    DEFAULT_TAB_WIDTH
}

fn default_exit_token() -> String {
    DEFAULT_EXIT_TOKEN.to_owned()
}

fn default_show_welcome() -> bool {
    DEFAULT_SHOW_WELCOME
}

fn default_install_program() -> String {
    DEFAULT_INSTALL_PROGRAM.to_owned()
}

fn default_install_args() -> Vec<String> {
    DEFAULT_INSTALL_ARGS.iter().map(|arg| (*arg).to_owned()).collect()
}

fn default_run_program() -> String {
    DEFAULT_RUN_PROGRAM.to_owned()
}

fn default_run_args() -> Vec<String> {
    DEFAULT_RUN_ARGS.iter().map(|arg| (*arg).to_owned()).collect()
}

fn default_interactive_program() -> String {
    DEFAULT_INTERACTIVE_PROGRAM.to_owned()
}

fn default_interactive_cols() -> u16 {
    DEFAULT_INTERACTIVE_COLS
}

fn default_interactive_rows() -> u16 {
    DEFAULT_INTERACTIVE_ROWS
}

fn default_log_path() -> String {
    default_sandterm_data_dir()
        .join(LOG_FILE_NAME)
        .to_string_lossy()
        .to_string()
}

impl Default for TerminalConfigToml {
    fn default() -> Self {
        Self {
            prompt_label: default_prompt_label(),
            prompt_width: default_prompt_width(),
            tab_width: default_tab_width(),
            exit_token: default_exit_token(),
            show_welcome: default_show_welcome(),
        }
    }
}

impl Default for ServerConfigToml {
    fn default() -> Self {
        Self {
            install_program: default_install_program(),
            install_args: default_install_args(),
            run_program: default_run_program(),
            run_args: default_run_args(),
        }
    }
}

impl Default for InteractiveConfigToml {
    fn default() -> Self {
        Self {
            program: default_interactive_program(),
            args: Vec::new(),
            cols: default_interactive_cols(),
            rows: default_interactive_rows(),
        }
    }
}

impl Default for LoggingConfigToml {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
        }
    }
}

fn persist_config(path: &Path, config: &SandtermConfig) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(config).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to serialize SANDTERM_CONFIG for {}: {err}",
            path.display()
        ))
    })?;

    std::fs::write(path, rendered.as_bytes()).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to write SANDTERM_CONFIG to {}: {err}",
            path.display()
        ))
    })
}

fn load_or_create_config(path: &Path) -> Result<SandtermConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|err| {
                        ConfigError::configuration(format!(
                            "Failed to create parent directory {} for SANDTERM_CONFIG: {err}",
                            parent.display()
                        ))
                    })?;
                }
            }

            let default_config = SandtermConfig::default();
            persist_config(path, &default_config)?;
            return Ok(default_config);
        }
        Err(err) => {
            return Err(ConfigError::configuration(format!(
                "Failed to read SANDTERM_CONFIG from {}: {err}",
                path.display()
            )));
        }
    };

    let mut config: SandtermConfig = toml::from_str(&raw).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to parse SANDTERM_CONFIG from {}: {err}",
            path.display()
        ))
    })?;

    if normalize_config(&mut config) {
        persist_config(path, &config)?;
    }

    Ok(config)
}

fn normalize_config(config: &mut SandtermConfig) -> bool {
    let mut changed = false;
    changed |= normalize_terminal_config(&mut config.terminal);
    changed |= normalize_server_config(&mut config.server);
    changed |= normalize_interactive_config(&mut config.interactive);

    if config
        .sandbox
        .root_parent
        .as_ref()
        .is_some_and(|value| value.trim().is_empty())
    {
        config.sandbox.root_parent = None;
        changed = true;
    }
    changed |= normalize_non_empty_string(&mut config.logging.log_path, default_log_path());
    changed
}

/// The prompt label keeps its surrounding spaces; only a blank label is replaced.
pub fn normalize_terminal_config(config: &mut TerminalConfigToml) -> bool {
    let mut changed = false;
    if config.prompt_label.trim().is_empty() && config.prompt_label != DEFAULT_PROMPT_LABEL {
        config.prompt_label = default_prompt_label();
        changed = true;
    }
    changed |= normalize_non_zero(&mut config.prompt_width, DEFAULT_PROMPT_WIDTH);
    changed |= normalize_non_zero(&mut config.tab_width, DEFAULT_TAB_WIDTH);
    changed |= normalize_non_empty_string(&mut config.exit_token, default_exit_token());
    changed
}

pub fn normalize_server_config(config: &mut ServerConfigToml) -> bool {
    let mut changed = false;
    changed |= normalize_non_empty_string(&mut config.install_program, default_install_program());
    changed |= normalize_string_vec(&mut config.install_args);
    changed |= normalize_non_empty_string(&mut config.run_program, default_run_program());
    changed |= normalize_string_vec(&mut config.run_args);
    changed
}

pub fn normalize_interactive_config(config: &mut InteractiveConfigToml) -> bool {
    let mut changed = false;
    changed |= normalize_non_empty_string(&mut config.program, default_interactive_program());
    changed |= normalize_string_vec(&mut config.args);
    changed |= normalize_non_zero(&mut config.cols, DEFAULT_INTERACTIVE_COLS);
    changed |= normalize_non_zero(&mut config.rows, DEFAULT_INTERACTIVE_ROWS);
    changed
}

fn normalize_non_zero<T>(value: &mut T, default: T) -> bool
where
    T: PartialEq + Default,
{
    if *value == T::default() {
        *value = default;
        return true;
    }
    false
}

fn normalize_non_empty_string(value: &mut String, default: String) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        if *value != default {
            *value = default;
            return true;
        }
        return false;
    }

    if trimmed != value {
        *value = trimmed.to_owned();
        return true;
    }
    false
}

fn normalize_string_vec(values: &mut Vec<String>) -> bool {
    let normalized = values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect::<Vec<_>>();
    if *values != normalized {
        *values = normalized;
        return true;
    }
    false
}
