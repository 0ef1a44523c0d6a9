use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use serde_json::json;

/// Error type for everything that can happen before or while a response is
/// delivered to the caller.
///
/// Anything that fails after delivery (saving a rescued reply, writing the
/// request log) is logged instead and never converted into this type.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Upstream error: status={status}")]
    Upstream {
        status: StatusCode,
        body: Bytes,
        content_type: Option<HeaderValue>,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ProxyError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Auth(_) => StatusCode::UNAUTHORIZED,
            ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::Transport(_) | ProxyError::Stream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Config(_) | ProxyError::Parse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Auth(_) => "authentication_error",
            ProxyError::MalformedRequest(_) => "invalid_request_error",
            ProxyError::Config(_) => "configuration_error",
            ProxyError::Upstream { .. } => "upstream_error",
            ProxyError::Transport(_) | ProxyError::Stream(_) => "upstream_unavailable",
            ProxyError::Parse(_) => "parse_error",
        }
    }
}

/// OpenAI-shaped error body used for every locally generated error.
#[must_use]
pub fn error_payload(err: &ProxyError) -> serde_json::Value {
    json!({
        "error": {
            "message": err.to_string(),
            "type": err.error_type(),
            "code": err.status().as_u16(),
        }
    })
}

impl axum::response::IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        use axum::response::IntoResponse as _;

        if let ProxyError::Upstream {
            status,
            body,
            content_type,
        } = self
        {
            // Upstream failures go back exactly as received.
            let mut response = axum::response::Response::new(axum::body::Body::from(body));
            *response.status_mut() = status;
            response.headers_mut().insert(
                http::header::CONTENT_TYPE,
                content_type.unwrap_or_else(|| HeaderValue::from_static("application/json")),
            );
            return response;
        }

        let status = self.status();
        (status, axum::Json(error_payload(&self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::Auth("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyError::MalformedRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Config("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyError::Parse("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_payload_shape() {
        let body = error_payload(&ProxyError::Auth("Invalid API key".into()));
        assert_eq!(body["error"]["type"], "authentication_error");
        assert_eq!(body["error"]["code"], 401);
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Invalid API key"));
    }

    #[tokio::test]
    async fn test_upstream_error_relayed_verbatim() {
        let raw = Bytes::from_static(br#"{"error":{"message":"slow down"}}"#);
        let response = ProxyError::Upstream {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: raw.clone(),
            content_type: None,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, raw);
    }
}
