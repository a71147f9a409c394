use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub orchestrator: OrchestratorConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Flows picked per scan.
    pub batch_size: u32,
    /// Zero disables the background scanner.
    pub scan_interval_secs: u64,
    pub stage_timeout_secs: u64,
    pub retry_failed: bool,
    pub default_max_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub mode: ExecutorMode,
    pub base_url: Option<String>,
    pub api_token: Option<SecretString>,
    pub timeout_secs: u64,
    pub signature_probability: f64,
    pub payment_probability: f64,
    pub seed: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    Simulated,
    Http,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub scan_interval_secs: Option<u64>,
    pub batch_size: Option<u32>,
    pub executor_mode: Option<ExecutorMode>,
    pub executor_base_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub const DEFAULT_CONFIG_FILE: &str = "closeflow.toml";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://closeflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            orchestrator: OrchestratorConfig {
                batch_size: 10,
                scan_interval_secs: 60,
                stage_timeout_secs: 30,
                retry_failed: true,
                default_max_attempts: 3,
            },
            executor: ExecutorConfig {
                mode: ExecutorMode::Simulated,
                base_url: None,
                api_token: None,
                timeout_secs: 10,
                signature_probability: 0.5,
                payment_probability: 0.3,
                seed: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl ExecutorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::Http => "http",
        }
    }
}

impl std::str::FromStr for ExecutorMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simulated" => Ok(Self::Simulated),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::Validation(format!(
                "unsupported executor mode `{other}` (expected simulated|http)"
            ))),
        }
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(orchestrator) = patch.orchestrator {
            if let Some(batch_size) = orchestrator.batch_size {
                self.orchestrator.batch_size = batch_size;
            }
            if let Some(scan_interval_secs) = orchestrator.scan_interval_secs {
                self.orchestrator.scan_interval_secs = scan_interval_secs;
            }
            if let Some(stage_timeout_secs) = orchestrator.stage_timeout_secs {
                self.orchestrator.stage_timeout_secs = stage_timeout_secs;
            }
            if let Some(retry_failed) = orchestrator.retry_failed {
                self.orchestrator.retry_failed = retry_failed;
            }
            if let Some(default_max_attempts) = orchestrator.default_max_attempts {
                self.orchestrator.default_max_attempts = default_max_attempts;
            }
        }

        if let Some(executor) = patch.executor {
            if let Some(mode) = executor.mode {
                self.executor.mode = mode;
            }
            if let Some(base_url) = executor.base_url {
                self.executor.base_url = Some(base_url);
            }
            if let Some(executor_api_token_value) = executor.api_token {
                self.executor.api_token = Some(secret_value(executor_api_token_value));
            }
            if let Some(timeout_secs) = executor.timeout_secs {
                self.executor.timeout_secs = timeout_secs;
            }
            if let Some(signature_probability) = executor.signature_probability {
                self.executor.signature_probability = signature_probability;
            }
            if let Some(payment_probability) = executor.payment_probability {
                self.executor.payment_probability = payment_probability;
            }
            if let Some(seed) = executor.seed {
                self.executor.seed = Some(seed);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CLOSEFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CLOSEFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("CLOSEFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CLOSEFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CLOSEFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CLOSEFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CLOSEFLOW_SERVER_PORT") {
            self.server.port = parse_u16("CLOSEFLOW_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CLOSEFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CLOSEFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("CLOSEFLOW_ORCHESTRATOR_BATCH_SIZE") {
            self.orchestrator.batch_size = parse_u32("CLOSEFLOW_ORCHESTRATOR_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("CLOSEFLOW_ORCHESTRATOR_SCAN_INTERVAL_SECS") {
            self.orchestrator.scan_interval_secs =
                parse_u64("CLOSEFLOW_ORCHESTRATOR_SCAN_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("CLOSEFLOW_ORCHESTRATOR_STAGE_TIMEOUT_SECS") {
            self.orchestrator.stage_timeout_secs =
                parse_u64("CLOSEFLOW_ORCHESTRATOR_STAGE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CLOSEFLOW_ORCHESTRATOR_RETRY_FAILED") {
            self.orchestrator.retry_failed =
                parse_bool("CLOSEFLOW_ORCHESTRATOR_RETRY_FAILED", &value)?;
        }
        if let Some(value) = read_env("CLOSEFLOW_ORCHESTRATOR_DEFAULT_MAX_ATTEMPTS") {
            self.orchestrator.default_max_attempts =
                parse_u32("CLOSEFLOW_ORCHESTRATOR_DEFAULT_MAX_ATTEMPTS", &value)?;
        }

        if let Some(value) = read_env("CLOSEFLOW_EXECUTOR_MODE") {
            self.executor.mode = value.parse()?;
        }
        if let Some(value) = read_env("CLOSEFLOW_EXECUTOR_BASE_URL") {
            self.executor.base_url = Some(value);
        }
        if let Some(value) = read_env("CLOSEFLOW_EXECUTOR_API_TOKEN") {
            self.executor.api_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("CLOSEFLOW_EXECUTOR_TIMEOUT_SECS") {
            self.executor.timeout_secs = parse_u64("CLOSEFLOW_EXECUTOR_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CLOSEFLOW_EXECUTOR_SIGNATURE_PROBABILITY") {
            self.executor.signature_probability =
                parse_f64("CLOSEFLOW_EXECUTOR_SIGNATURE_PROBABILITY", &value)?;
        }
        if let Some(value) = read_env("CLOSEFLOW_EXECUTOR_PAYMENT_PROBABILITY") {
            self.executor.payment_probability =
                parse_f64("CLOSEFLOW_EXECUTOR_PAYMENT_PROBABILITY", &value)?;
        }
        if let Some(value) = read_env("CLOSEFLOW_EXECUTOR_SEED") {
            self.executor.seed = Some(parse_u64("CLOSEFLOW_EXECUTOR_SEED", &value)?);
        }

        let log_level =
            read_env("CLOSEFLOW_LOGGING_LEVEL").or_else(|| read_env("CLOSEFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CLOSEFLOW_LOGGING_FORMAT").or_else(|| read_env("CLOSEFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(scan_interval_secs) = overrides.scan_interval_secs {
            self.orchestrator.scan_interval_secs = scan_interval_secs;
        }
        if let Some(batch_size) = overrides.batch_size {
            self.orchestrator.batch_size = batch_size;
        }
        if let Some(mode) = overrides.executor_mode {
            self.executor.mode = mode;
        }
        if let Some(base_url) = overrides.executor_base_url {
            self.executor.base_url = Some(base_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_orchestrator(&self.orchestrator)?;
        validate_executor(&self.executor)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from("config/closeflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_orchestrator(orchestrator: &OrchestratorConfig) -> Result<(), ConfigError> {
    if orchestrator.batch_size == 0 || orchestrator.batch_size > 500 {
        return Err(ConfigError::Validation(
            "orchestrator.batch_size must be in range 1..=500".to_string(),
        ));
    }

    if orchestrator.stage_timeout_secs == 0 || orchestrator.stage_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "orchestrator.stage_timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if orchestrator.default_max_attempts == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.default_max_attempts must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_executor(executor: &ExecutorConfig) -> Result<(), ConfigError> {
    if executor.timeout_secs == 0 || executor.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "executor.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    for (key, value) in [
        ("executor.signature_probability", executor.signature_probability),
        ("executor.payment_probability", executor.payment_probability),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::Validation(format!("{key} must be in range 0.0..=1.0")));
        }
    }

    if executor.mode == ExecutorMode::Http {
        let base_url = executor.base_url.as_deref().map(str::trim).unwrap_or_default();
        if base_url.is_empty() {
            return Err(ConfigError::Validation(
                "executor.base_url is required when executor.mode is http".to_string(),
            ));
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "executor.base_url must start with http:// or https://".to_string(),
            ));
        }
        let blank_token = executor
            .api_token
            .as_ref()
            .map(|token| token.expose_secret().trim().is_empty())
            .unwrap_or(false);
        if blank_token {
            return Err(ConfigError::Validation(
                "executor.api_token must not be blank when set".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    orchestrator: Option<OrchestratorPatch>,
    executor: Option<ExecutorPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OrchestratorPatch {
    batch_size: Option<u32>,
    scan_interval_secs: Option<u64>,
    stage_timeout_secs: Option<u64>,
    retry_failed: Option<bool>,
    default_max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecutorPatch {
    mode: Option<ExecutorMode>,
    base_url: Option<String>,
    api_token: Option<String>,
    timeout_secs: Option<u64>,
    signature_probability: Option<f64>,
    payment_probability: Option<f64>,
    seed: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, ExecutorMode, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_match_documented_orchestrator_settings() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.orchestrator.batch_size == 10, "default batch size should be 10")?;
        ensure(config.orchestrator.scan_interval_secs == 60, "default scan interval is 60s")?;
        ensure(config.orchestrator.default_max_attempts == 3, "default max attempts is 3")?;
        ensure(config.orchestrator.retry_failed, "failed flows are retried by default")?;
        ensure(config.executor.mode == ExecutorMode::Simulated, "simulated executor by default")?;
        ensure(matches!(config.logging.format, LogFormat::Compact), "compact logs by default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_EXECUTOR_TOKEN", "token-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("closeflow.toml");
            fs::write(
                &path,
                r#"
[executor]
mode = "http"
base_url = "https://integrations.internal"
api_token = "${TEST_EXECUTOR_TOKEN}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.executor.mode == ExecutorMode::Http, "mode should come from file")?;
            ensure(
                config
                    .executor
                    .api_token
                    .as_ref()
                    .map(|token| token.expose_secret() == "token-from-env")
                    .unwrap_or(false),
                "api token should be interpolated from environment",
            )
        })();

        clear_vars(&["TEST_EXECUTOR_TOKEN"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLOSEFLOW_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CLOSEFLOW_ORCHESTRATOR_BATCH_SIZE", "25");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("closeflow.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[orchestrator]
batch_size = 5
scan_interval_secs = 30

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.orchestrator.batch_size == 25, "env batch size should beat the file")?;
            ensure(config.orchestrator.scan_interval_secs == 30, "file interval should apply")
        })();

        clear_vars(&["CLOSEFLOW_DATABASE_URL", "CLOSEFLOW_ORCHESTRATOR_BATCH_SIZE"]);
        result
    }

    #[test]
    fn http_mode_without_base_url_fails_validation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLOSEFLOW_EXECUTOR_MODE", "http");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("executor.base_url")
            );
            ensure(has_message, "validation failure should mention executor.base_url")
        })();

        clear_vars(&["CLOSEFLOW_EXECUTOR_MODE"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLOSEFLOW_ORCHESTRATOR_SCAN_INTERVAL_SECS", "soon");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected invalid override error".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(
                    error,
                    ConfigError::InvalidEnvOverride { ref key, .. }
                        if key == "CLOSEFLOW_ORCHESTRATOR_SCAN_INTERVAL_SECS"
                ),
                "error should name the offending variable",
            )
        })();

        clear_vars(&["CLOSEFLOW_ORCHESTRATOR_SCAN_INTERVAL_SECS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CLOSEFLOW_EXECUTOR_API_TOKEN", "executor-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("executor-secret-value"),
                "debug output should not contain the executor token",
            )
        })();

        clear_vars(&["CLOSEFLOW_EXECUTOR_API_TOKEN"]);
        result
    }
}
