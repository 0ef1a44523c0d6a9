use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::{chat, control, health, models};
use crate::state::AppState;

const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteMatch {
    Health,
    Models,
    ChatCompletions,
    Confirm,
    ChatContext,
    Requests,
    Preflight,
    MethodNotAllowed,
    NotFound,
}

impl RouteMatch {
    fn requires_auth(self) -> bool {
        !matches!(self, RouteMatch::Health | RouteMatch::Preflight)
    }
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// Every response, errors included, carries permissive CORS headers.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    base_path: Arc<str>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let route = match_route(&parts.method, parts.uri.path(), base_path.as_ref());

    if route.requires_auth() {
        if let Err(err) = state.authenticate(&parts.headers) {
            tracing::debug!(path = parts.uri.path(), "rejected unauthenticated request");
            return Ok(with_cors(err.into_response()));
        }
    }

    let response = match route {
        RouteMatch::Health => health::health_handler(State(state)).into_response(),
        RouteMatch::Models => models::handler(State(state)).await,
        RouteMatch::ChatCompletions => match read_request_body(body).await {
            Ok(bytes) => chat::handler(State(state), parts.headers, bytes).await,
            Err(response) => response,
        },
        RouteMatch::Confirm => match read_request_body(body).await {
            Ok(bytes) => control::confirm_handler(State(state), &bytes),
            Err(response) => response,
        },
        RouteMatch::ChatContext => match read_request_body(body).await {
            Ok(bytes) => control::chat_context_handler(State(state), &bytes),
            Err(response) => response,
        },
        RouteMatch::Requests => control::requests_handler(State(state)),
        RouteMatch::Preflight => StatusCode::NO_CONTENT.into_response(),
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    Ok(with_cors(response))
}

#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("/{}", trimmed.trim_end_matches('/'))
    }
}

fn with_cors(mut response: Response) -> Response {
    let headers: &mut HeaderMap = response.headers_mut();
    let any = HeaderValue::from_static("*");
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, any);
    response
}

async fn read_request_body(body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large (max 2MiB)",
            )
                .into_response()
        })
}

fn match_route(method: &Method, path: &str, base_path: &str) -> RouteMatch {
    if method == Method::OPTIONS {
        return RouteMatch::Preflight;
    }
    let Some(path) = strip_base_path(path, base_path) else {
        return RouteMatch::NotFound;
    };

    let (route, allowed) = match path {
        "/health" => (RouteMatch::Health, Method::GET),
        "/v1/models" | "/models" => (RouteMatch::Models, Method::GET),
        "/v1/chat/completions" => (RouteMatch::ChatCompletions, Method::POST),
        "/v1/proxy/confirm" => (RouteMatch::Confirm, Method::POST),
        "/v1/proxy/chat-context" => (RouteMatch::ChatContext, Method::POST),
        "/v1/proxy/requests" => (RouteMatch::Requests, Method::GET),
        _ => return RouteMatch::NotFound,
    };
    if method == allowed {
        route
    } else {
        RouteMatch::MethodNotAllowed
    }
}

fn strip_base_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    if base_path.is_empty() {
        return Some(path);
    }

    let remainder = path.strip_prefix(base_path)?;
    if remainder.is_empty() {
        Some("/")
    } else if remainder.starts_with('/') {
        Some(remainder)
    } else {
        None
    }
}
