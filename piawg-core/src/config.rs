//! Layered application configuration
//!
//! Options are resolved from four layers in increasing priority:
//! built-in defaults, a TOML config file, `PIAWG_*` environment
//! variables, and CLI flags. The password is deliberately never a CLI
//! flag so it cannot show up in process argument lists; it is held as a
//! [`SecretString`] and never logged.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;

/// Environment variable prefix for every recognized option
pub const ENV_PREFIX: &str = "PIAWG_";

/// Default config file location when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/piawg/config.toml";

/// Default directory for persisted state (token, keypair, lease)
pub const DEFAULT_STATE_DIR: &str = "/var/lib/piawg";

/// Strings treated as `false` when a boolean option comes from the
/// environment; anything else is `true`.
const FALSY_STRINGS: [&str; 4] = ["false", "f", "no", "0"];

/// Application log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "error" => Ok(Self::Error),
            "warning" => Ok(Self::Warning),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            _ => Err(ConfigError::InvalidLogLevel {
                value: value.to_string(),
            }),
        }
    }

    /// Map to a tracing level filter. `tracing` has no level above
    /// `error`, so `critical` collapses into it.
    pub fn to_filter(self) -> tracing_subscriber::filter::LevelFilter {
        use tracing_subscriber::filter::LevelFilter;
        match self {
            Self::Critical | Self::Error => LevelFilter::ERROR,
            Self::Warning => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
        }
    }
}

/// Fully resolved application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub username: String,
    pub password: SecretString,
    pub region: String,
    pub port_forward: bool,
    pub port_forward_command: Option<String>,
    pub log_level: LogLevel,
    pub state_dir: PathBuf,
}

/// Option values parsed from CLI flags; `None` means "not given"
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub username: Option<String>,
    pub region: Option<String>,
    pub port_forward: bool,
    pub port_forward_command: Option<String>,
    pub log_level: Option<String>,
    pub state_dir: Option<PathBuf>,
}

/// Raw TOML config file shape: every field optional so the file can
/// carry any subset of the options.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    username: Option<String>,
    password: Option<String>,
    region: Option<String>,
    port_forward: Option<bool>,
    port_forward_command: Option<String>,
    log_level: Option<String>,
    state_dir: Option<String>,
}

/// Accumulator for the layering pass
#[derive(Debug, Default)]
struct Layered {
    username: Option<String>,
    password: Option<String>,
    region: Option<String>,
    port_forward: Option<bool>,
    port_forward_command: Option<String>,
    log_level: Option<String>,
    state_dir: Option<String>,
}

impl Layered {
    fn apply_file(&mut self, file: FileConfig) {
        merge(&mut self.username, file.username);
        merge(&mut self.password, file.password);
        merge(&mut self.region, file.region);
        merge(&mut self.port_forward, file.port_forward);
        merge(&mut self.port_forward_command, file.port_forward_command);
        merge(&mut self.log_level, file.log_level);
        merge(&mut self.state_dir, file.state_dir);
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        merge(&mut self.username, var("USERNAME"));
        merge(&mut self.password, var("PASSWORD"));
        merge(&mut self.region, var("REGION"));
        if let Some(raw) = var("PORT_FORWARD") {
            self.port_forward = Some(!FALSY_STRINGS.contains(&raw.to_ascii_lowercase().as_str()));
        }
        merge(&mut self.port_forward_command, var("PORT_FORWARD_COMMAND"));
        merge(&mut self.log_level, var("LOG_LEVEL"));
        merge(&mut self.state_dir, var("STATE_DIR"));
    }

    fn apply_cli(&mut self, cli: &CliOverrides) {
        merge(&mut self.username, cli.username.clone());
        merge(&mut self.region, cli.region.clone());
        if cli.port_forward {
            self.port_forward = Some(true);
        }
        merge(&mut self.port_forward_command, cli.port_forward_command.clone());
        merge(&mut self.log_level, cli.log_level.clone());
        merge(
            &mut self.state_dir,
            cli.state_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        );
    }

    fn finish(self) -> Result<Config, ConfigError> {
        let required = |value: Option<String>, field: &str| {
            value
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::MissingField {
                    field: field.to_string(),
                })
        };

        let log_level = match self.log_level {
            Some(raw) => LogLevel::parse(&raw)?,
            None => LogLevel::default(),
        };

        Ok(Config {
            username: required(self.username, "username")?,
            password: SecretString::new(required(self.password, "password")?),
            region: required(self.region, "region")?,
            port_forward: self.port_forward.unwrap_or(false),
            port_forward_command: self.port_forward_command.filter(|c| !c.is_empty()),
            log_level,
            state_dir: PathBuf::from(
                self.state_dir
                    .unwrap_or_else(|| DEFAULT_STATE_DIR.to_string()),
            ),
        })
    }
}

fn merge<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

impl Config {
    /// Resolve the full configuration from all layers using the process
    /// environment.
    pub fn resolve(cli: &CliOverrides) -> Result<Self, ConfigError> {
        Self::resolve_with_env(cli, |name| std::env::var(name).ok())
    }

    /// Resolve with an explicit environment lookup. Tests use this to
    /// avoid mutating process-global state.
    pub fn resolve_with_env<F>(cli: &CliOverrides, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut layered = Layered::default();

        let config_path = cli
            .config
            .clone()
            .or_else(|| lookup(&format!("{ENV_PREFIX}CONFIG")).map(PathBuf::from));

        match config_path {
            // An explicitly named file must exist
            Some(path) => layered.apply_file(load_file(&path)?),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    layered.apply_file(load_file(default)?);
                } else {
                    debug!(path = DEFAULT_CONFIG_PATH, "no config file, using env/CLI only");
                }
            }
        }

        layered.apply_env(&lookup);
        layered.apply_cli(cli);
        layered.finish()
    }
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|_| ConfigError::LoadFailed {
        path: path.to_string_lossy().to_string(),
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::ValidationError {
        message: format!("failed to parse config file: {e}"),
    })
}
