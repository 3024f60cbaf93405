use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestration::RetentionOptions;
use crate::orchestration::retention::{
    DEFAULT_CLEANUP_INTERVAL_MS, DEFAULT_MAX_COMPLETED_TASKS, DEFAULT_MAX_FAILED_TASKS,
};
use crate::session::resolver::{
    DEFAULT_IP_SESSION_PREFIX, DEFAULT_SESSION_COOKIE, DEFAULT_SESSION_HEADER,
    DEFAULT_SESSION_KEY, DEFAULT_SESSION_QUERY_PARAM,
};
use crate::session::{
    DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TIMEOUT, ResolverConfig, SessionFactoryConfig,
};

pub const ENV_SCAFFOLD_CONFIG: &str = "SCAFFOLD_CONFIG";

const DEFAULT_LOG_LEVEL: &str = "debug";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Everything the scaffold reads at startup, resolved once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaffoldConfig {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub resolver: ResolverSection,
    #[serde(default)]
    pub retention: RetentionSection,
    #[serde(default)]
    pub profile: ProfileSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default)]
    pub persistence_path: Option<PathBuf>,
    #[serde(default)]
    pub load_on_startup: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            session_timeout_ms: default_session_timeout_ms(),
            persistence_path: None,
            load_on_startup: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverSection {
    #[serde(default = "default_session_header")]
    pub header_name: String,
    #[serde(default = "default_session_query_param")]
    pub query_param: String,
    #[serde(default = "default_session_cookie")]
    pub cookie_name: String,
    #[serde(default = "default_session_key")]
    pub default_session: String,
    #[serde(default = "default_ip_session_prefix")]
    pub ip_session_prefix: String,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            header_name: default_session_header(),
            query_param: default_session_query_param(),
            cookie_name: default_session_cookie(),
            default_session: default_session_key(),
            ip_session_prefix: default_ip_session_prefix(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSection {
    #[serde(default = "default_max_completed_tasks")]
    pub max_completed_tasks: usize,
    #[serde(default = "default_max_failed_tasks")]
    pub max_failed_tasks: usize,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            max_completed_tasks: default_max_completed_tasks(),
            max_failed_tasks: default_max_failed_tasks(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSection {
    #[serde(default = "default_true")]
    pub session_isolation: bool,
    #[serde(default = "default_true")]
    pub auto_map_session_by_ip: bool,
    #[serde(default)]
    pub full_auth: bool,
}

impl Default for ProfileSection {
    fn default() -> Self {
        Self {
            session_isolation: true,
            auto_map_session_by_ip: true,
            full_auth: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Simple,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::invalid(format!(
                "log format must be 'simple' or 'json', got '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Simple,
        }
    }
}

impl ScaffoldConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        parse_toml(raw, "<inline>")
    }

    /// Overlays environment values reported by `lookup` on top of `self`.
    /// Unset and blank variables leave the current value in place.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(raw) = read("MAX_SESSIONS") {
            self.session.max_sessions = parse_number("MAX_SESSIONS", &raw)?;
        }
        if let Some(raw) = read("SESSION_TIMEOUT") {
            self.session.session_timeout_ms = parse_number("SESSION_TIMEOUT", &raw)?;
        }
        if let Some(raw) = read("DB_PATH") {
            self.session.persistence_path = Some(PathBuf::from(raw.trim()));
        }
        if let Some(raw) = read("DB_LOAD_ON_STARTUP") {
            self.session.load_on_startup = parse_flag("DB_LOAD_ON_STARTUP", &raw)?;
        }

        if let Some(raw) = read("SESSION_HEADER") {
            self.resolver.header_name = raw;
        }
        if let Some(raw) = read("SESSION_QUERY_PARAM") {
            self.resolver.query_param = raw;
        }
        if let Some(raw) = read("SESSION_COOKIE") {
            self.resolver.cookie_name = raw;
        }
        if let Some(raw) = read("DEFAULT_SESSION") {
            self.resolver.default_session = raw;
        }
        if let Some(raw) = read("IP_SESSION_PREFIX") {
            self.resolver.ip_session_prefix = raw;
        }

        if let Some(raw) = read("MAX_COMPLETED_TASKS") {
            self.retention.max_completed_tasks = parse_number("MAX_COMPLETED_TASKS", &raw)?;
        }
        if let Some(raw) = read("MAX_FAILED_TASKS") {
            self.retention.max_failed_tasks = parse_number("MAX_FAILED_TASKS", &raw)?;
        }
        if let Some(raw) = read("TASK_CLEANUP_INTERVAL") {
            self.retention.cleanup_interval_ms = parse_number("TASK_CLEANUP_INTERVAL", &raw)?;
        }

        if let Some(raw) = read("ENABLE_SESSION_ISOLATION") {
            self.profile.session_isolation = parse_flag("ENABLE_SESSION_ISOLATION", &raw)?;
        }
        if let Some(raw) = read("AUTO_MAP_SESSION_BY_IP") {
            self.profile.auto_map_session_by_ip = parse_flag("AUTO_MAP_SESSION_BY_IP", &raw)?;
        }
        if let Some(raw) = read("AUTH_MODE") {
            self.profile.full_auth = raw.trim().eq_ignore_ascii_case("full");
        }

        if let Some(raw) = read("BE_LOG_LEVEL") {
            self.logging.level = raw.trim().to_string();
        }
        if let Some(raw) = read("BE_LOG_FORMAT") {
            self.logging.format = raw.parse()?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions == 0 {
            return Err(ConfigError::invalid("session.max_sessions must be at least 1"));
        }
        if self.session.session_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "session.session_timeout_ms must be greater than zero",
            ));
        }
        if self.retention.cleanup_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "retention.cleanup_interval_ms must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn session_factory(&self) -> SessionFactoryConfig {
        SessionFactoryConfig {
            max_sessions: self.session.max_sessions,
            session_timeout: Duration::from_millis(self.session.session_timeout_ms),
            persistence_path: self.session.persistence_path.clone(),
            load_on_startup: self.session.load_on_startup,
        }
    }

    pub fn resolver(&self) -> ResolverConfig {
        ResolverConfig {
            header_name: self.resolver.header_name.clone(),
            query_param: self.resolver.query_param.clone(),
            cookie_name: self.resolver.cookie_name.clone(),
            default_session: self.resolver.default_session.clone(),
            ip_session_prefix: self.resolver.ip_session_prefix.clone(),
            session_isolation: self.profile.session_isolation,
            auto_map_by_ip: self.profile.auto_map_session_by_ip,
            full_auth: self.profile.full_auth,
        }
    }

    pub fn retention(&self) -> RetentionOptions {
        RetentionOptions {
            max_completed_tasks: self.retention.max_completed_tasks,
            max_failed_tasks: self.retention.max_failed_tasks,
            cleanup_interval_ms: self.retention.cleanup_interval_ms,
        }
    }
}

/// Reads the file named by `SCAFFOLD_CONFIG` (if any), then overlays the
/// process environment.
pub fn load_from_env() -> Result<ScaffoldConfig, ConfigError> {
    let mut config = match config_path_from_env()? {
        Some(path) => read_config_file(&path)?,
        None => ScaffoldConfig::default(),
    };
    config.apply_env(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

/// Loads a TOML file. A missing file yields the defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<ScaffoldConfig, ConfigError> {
    let config = read_config_file(path.as_ref())?;
    config.validate()?;
    Ok(config)
}

fn config_path_from_env() -> Result<Option<PathBuf>, ConfigError> {
    match std::env::var(ENV_SCAFFOLD_CONFIG) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => Ok(Some(PathBuf::from(raw))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::invalid(format!(
            "{ENV_SCAFFOLD_CONFIG} contained invalid UTF-8"
        ))),
    }
}

fn read_config_file(path: &Path) -> Result<ScaffoldConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(ScaffoldConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            });
        }
    };
    parse_toml(&raw, &path.display().to_string())
}

fn parse_toml(raw: &str, origin: &str) -> Result<ScaffoldConfig, ConfigError> {
    toml::from_str(raw).map_err(|error| ConfigError::Parse {
        path: origin.to_string(),
        message: error.to_string(),
    })
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| {
        ConfigError::invalid(format!("{name} must be a non-negative integer, got '{raw}'"))
    })
}

fn parse_flag(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(format!(
            "{name} must be 'true' or 'false', got '{raw}'"
        ))),
    }
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

fn default_session_timeout_ms() -> u64 {
    DEFAULT_SESSION_TIMEOUT.as_millis() as u64
}

fn default_session_header() -> String {
    DEFAULT_SESSION_HEADER.to_string()
}

fn default_session_query_param() -> String {
    DEFAULT_SESSION_QUERY_PARAM.to_string()
}

fn default_session_cookie() -> String {
    DEFAULT_SESSION_COOKIE.to_string()
}

fn default_session_key() -> String {
    DEFAULT_SESSION_KEY.to_string()
}

fn default_ip_session_prefix() -> String {
    DEFAULT_IP_SESSION_PREFIX.to_string()
}

fn default_max_completed_tasks() -> usize {
    DEFAULT_MAX_COMPLETED_TASKS
}

fn default_max_failed_tasks() -> usize {
    DEFAULT_MAX_FAILED_TASKS
}

fn default_cleanup_interval_ms() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
