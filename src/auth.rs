use crate::config::AppConfig;
use crate::error::ProxyError;
use http::header::AUTHORIZATION;

/// Pre-built `Authorization` value for the shared proxy key, compared byte
/// for byte on every request.
pub enum ProxyKey {
    Disabled,
    Bearer(Box<str>),
}

/// Authenticate an incoming request against the configured proxy key.
///
/// A disabled key lets everything through.
///
/// # Errors
///
/// Returns `ProxyError::Auth` when the API key is missing or invalid.
pub fn authenticate(headers: &http::HeaderMap, proxy_key: &ProxyKey) -> Result<(), ProxyError> {
    match proxy_key {
        ProxyKey::Disabled => Ok(()),
        ProxyKey::Bearer(bearer) => match headers.get(AUTHORIZATION) {
            Some(value) if value.as_bytes() == bearer.as_bytes() => Ok(()),
            Some(_) => Err(ProxyError::Auth("Invalid API key".to_string())),
            None => Err(ProxyError::Auth("Missing API key".to_string())),
        },
    }
}

#[must_use]
pub fn build_proxy_key(config: &AppConfig) -> ProxyKey {
    match config
        .client_authentication
        .proxy_api_key
        .as_deref()
        .map(str::trim)
    {
        Some(key) if !key.is_empty() => ProxyKey::Bearer(format!("Bearer {key}").into_boxed_str()),
        _ => ProxyKey::Disabled,
    }
}
