use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::HeaderValue;

use crate::config::{ServerConfig, UpstreamConfig};
use crate::error::ProxyError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn build_reqwest_client(server: &ServerConfig) -> Result<reqwest::Client, ProxyError> {
    let pool_idle_timeout = if server.http_pool_idle_timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(server.http_pool_idle_timeout_secs))
    };

    reqwest::Client::builder()
        .pool_max_idle_per_host(server.http_pool_max_idle_per_host.max(1))
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(server.timeout))
        .no_proxy()
        .build()
        .map_err(|err| ProxyError::Transport(format!("Failed to build HTTP client: {err}")))
}

fn endpoint(base_url: &str, suffix: &str) -> Result<url::Url, ProxyError> {
    let joined = format!("{}/{suffix}", base_url.trim_end_matches('/'));
    url::Url::parse(&joined)
        .map_err(|err| ProxyError::Config(format!("Invalid upstream URL '{joined}': {err}")))
}

/// Client for the single OpenAI-compatible upstream.
///
/// Both operations hand back the raw `reqwest::Response` on a success status
/// so the caller can choose between buffering and streaming the body. A
/// non-success status is turned into [`ProxyError::Upstream`] carrying the
/// upstream body untouched.
pub struct UpstreamClient {
    client: reqwest::Client,
    completions_url: url::Url,
    models_url: url::Url,
    authorization: Option<HeaderValue>,
}

impl UpstreamClient {
    /// # Errors
    ///
    /// Returns `ProxyError::Config` for an unusable base URL or API key and
    /// `ProxyError::Transport` when the HTTP client cannot be built.
    pub fn new(server: &ServerConfig, upstream: &UpstreamConfig) -> Result<Self, ProxyError> {
        let authorization = upstream
            .api_key()
            .map(|key| {
                let mut value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
                    ProxyError::Config("Upstream API key contains invalid characters".to_string())
                })?;
                value.set_sensitive(true);
                Ok::<_, ProxyError>(value)
            })
            .transpose()?;

        Ok(Self {
            client: build_reqwest_client(server)?,
            completions_url: endpoint(&upstream.base_url, "chat/completions")?,
            models_url: endpoint(&upstream.base_url, "models")?,
            authorization,
        })
    }

    #[must_use]
    pub fn has_api_key(&self) -> bool {
        self.authorization.is_some()
    }

    fn authorization(&self) -> Result<&HeaderValue, ProxyError> {
        self.authorization
            .as_ref()
            .ok_or_else(|| ProxyError::Config("Upstream API key is not configured".to_string()))
    }

    /// Forward a chat-completion body to the upstream as-is.
    ///
    /// # Errors
    ///
    /// `Config` without an API key, `Transport` when the request cannot be
    /// sent, `Upstream` for a non-success status.
    pub async fn send_completion(&self, body: Bytes) -> Result<reqwest::Response, ProxyError> {
        let authorization = self.authorization()?.clone();
        let response = self
            .client
            .post(self.completions_url.clone())
            .header(AUTHORIZATION, authorization)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body)
            .send()
            .await
            .map_err(|err| ProxyError::Transport(format!("Upstream request failed: {err}")))?;
        ensure_success(response).await
    }

    /// Fetch the upstream model listing.
    ///
    /// # Errors
    ///
    /// Same as [`UpstreamClient::send_completion`].
    pub async fn fetch_models(&self) -> Result<reqwest::Response, ProxyError> {
        let authorization = self.authorization()?.clone();
        let response = self
            .client
            .get(self.models_url.clone())
            .header(AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|err| ProxyError::Transport(format!("Upstream request failed: {err}")))?;
        ensure_success(response).await
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ProxyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let content_type = response.headers().get(CONTENT_TYPE).cloned();
    let body = response
        .bytes()
        .await
        .map_err(|err| ProxyError::Transport(format!("Failed to read error body: {err}")))?;
    tracing::warn!(status = status.as_u16(), body_len = body.len(), "upstream returned error status");
    Err(ProxyError::Upstream {
        status,
        body,
        content_type,
    })
}

/// Read a successful upstream body in full.
///
/// # Errors
///
/// Returns `ProxyError::Transport` when the body cannot be read.
pub async fn read_body(response: reqwest::Response) -> Result<Bytes, ProxyError> {
    response
        .bytes()
        .await
        .map_err(|err| ProxyError::Transport(format!("Failed to read upstream body: {err}")))
}
