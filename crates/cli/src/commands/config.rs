use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use closeflow_core::config::{AppConfig, LoadOptions, DEFAULT_CONFIG_FILE};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: &str| {
        field_source(key_path, Some(env_key), config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let api_token = match &config.executor.api_token {
        Some(token) => redact_token(token.expose_secret()),
        None => "<unset>".to_string(),
    };
    let seed = config.executor.seed.map(|seed| seed.to_string());

    let entries: Vec<(&str, String, &str)> = vec![
        ("database.url", config.database.url.clone(), "CLOSEFLOW_DATABASE_URL"),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            "CLOSEFLOW_DATABASE_MAX_CONNECTIONS",
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "CLOSEFLOW_DATABASE_TIMEOUT_SECS",
        ),
        ("server.bind_address", config.server.bind_address.clone(), "CLOSEFLOW_SERVER_BIND_ADDRESS"),
        ("server.port", config.server.port.to_string(), "CLOSEFLOW_SERVER_PORT"),
        (
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            "CLOSEFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS",
        ),
        (
            "orchestrator.batch_size",
            config.orchestrator.batch_size.to_string(),
            "CLOSEFLOW_ORCHESTRATOR_BATCH_SIZE",
        ),
        (
            "orchestrator.scan_interval_secs",
            config.orchestrator.scan_interval_secs.to_string(),
            "CLOSEFLOW_ORCHESTRATOR_SCAN_INTERVAL_SECS",
        ),
        (
            "orchestrator.stage_timeout_secs",
            config.orchestrator.stage_timeout_secs.to_string(),
            "CLOSEFLOW_ORCHESTRATOR_STAGE_TIMEOUT_SECS",
        ),
        (
            "orchestrator.retry_failed",
            config.orchestrator.retry_failed.to_string(),
            "CLOSEFLOW_ORCHESTRATOR_RETRY_FAILED",
        ),
        (
            "orchestrator.default_max_attempts",
            config.orchestrator.default_max_attempts.to_string(),
            "CLOSEFLOW_ORCHESTRATOR_DEFAULT_MAX_ATTEMPTS",
        ),
        ("executor.mode", config.executor.mode.as_str().to_string(), "CLOSEFLOW_EXECUTOR_MODE"),
        (
            "executor.base_url",
            config.executor.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            "CLOSEFLOW_EXECUTOR_BASE_URL",
        ),
        ("executor.api_token", api_token, "CLOSEFLOW_EXECUTOR_API_TOKEN"),
        (
            "executor.timeout_secs",
            config.executor.timeout_secs.to_string(),
            "CLOSEFLOW_EXECUTOR_TIMEOUT_SECS",
        ),
        (
            "executor.signature_probability",
            config.executor.signature_probability.to_string(),
            "CLOSEFLOW_EXECUTOR_SIGNATURE_PROBABILITY",
        ),
        (
            "executor.payment_probability",
            config.executor.payment_probability.to_string(),
            "CLOSEFLOW_EXECUTOR_PAYMENT_PROBABILITY",
        ),
        (
            "executor.seed",
            seed.unwrap_or_else(|| "<unset>".to_string()),
            "CLOSEFLOW_EXECUTOR_SEED",
        ),
        ("logging.level", config.logging.level.clone(), "CLOSEFLOW_LOGGING_LEVEL"),
        (
            "logging.format",
            config.logging.format.as_str().to_string(),
            "CLOSEFLOW_LOGGING_FORMAT",
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(
        entries
            .into_iter()
            .map(|(key, value, env_key)| render_line(key, &value, source(key, env_key))),
    );
    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from("config").join(DEFAULT_CONFIG_FILE)]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps at most a four-character prefix so operators can tell tokens apart.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    match trimmed.get(..4) {
        Some(prefix) if trimmed.len() > 8 => format!("{prefix}***"),
        _ => "<redacted>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, field_source, redact_token};

    #[test]
    fn tokens_are_never_echoed_in_full() {
        assert_eq!(redact_token("cf_live_0123456789"), "cf_l***");
        assert_eq!(redact_token("short"), "<redacted>");
        assert_eq!(redact_token("   "), "<empty>");
    }

    #[test]
    fn file_source_requires_the_full_key_path() {
        let doc: Value = "[executor]\nmode = \"http\"\n".parse().expect("toml");

        assert!(contains_path(&doc, "executor.mode"));
        assert!(!contains_path(&doc, "executor.base_url"));
        assert_eq!(
            field_source("executor.mode", None, Some(&doc), None),
            "file (config file)".to_string()
        );
        assert_eq!(field_source("server.port", None, Some(&doc), None), "default".to_string());
    }
}
