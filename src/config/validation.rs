use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream(config)?;
    validate_client_auth(config)?;
    validate_persistence(config)?;
    validate_request_log(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.port == 0 {
        return Err(validation_err("server.port must be greater than 0"));
    }
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(max_blocking_threads) = server.runtime_max_blocking_threads {
        if max_blocking_threads == 0 {
            return Err(validation_err(
                "server.runtime_max_blocking_threads must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    if !upstream.base_url.starts_with("http://") && !upstream.base_url.starts_with("https://") {
        return Err(validation_err(
            "upstream.base_url must start with http:// or https://",
        ));
    }
    if url::Url::parse(&upstream.base_url).is_err() {
        return Err(validation_err(format!(
            "upstream.base_url is not a valid URL: '{}'",
            upstream.base_url
        )));
    }
    if upstream.default_model.trim().is_empty() {
        return Err(validation_err("upstream.default_model cannot be empty"));
    }
    Ok(())
}

fn validate_client_auth(config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(key) = &config.client_authentication.proxy_api_key {
        if key.trim().is_empty() {
            return Err(validation_err(
                "client_authentication.proxy_api_key cannot be empty when set",
            ));
        }
    }
    Ok(())
}

fn validate_persistence(config: &AppConfig) -> Result<(), ConfigError> {
    if config.persistence.confirmation_window_ms == 0 {
        return Err(validation_err(
            "persistence.confirmation_window_ms must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_request_log(config: &AppConfig) -> Result<(), ConfigError> {
    let log = &config.request_log;
    if log.max_bytes == 0 {
        return Err(validation_err("request_log.max_bytes must be greater than 0"));
    }
    if !(log.trim_ratio > 0.0 && log.trim_ratio < 1.0) {
        return Err(validation_err(
            "request_log.trim_ratio must be between 0 and 1 (exclusive)",
        ));
    }
    if log.ring_capacity == 0 {
        return Err(validation_err(
            "request_log.ring_capacity must be greater than 0",
        ));
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "Invalid log_level '{}'. Must be one of: {}",
            config.features.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}
