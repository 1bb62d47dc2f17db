use std::time::{Duration, Instant as StdInstant};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::application::error::{ErrorReport, HttpError};

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

/// Instant by which the response must be produced; handlers cap their own
/// work to it.
#[derive(Debug, Clone, Copy)]
pub struct RequestDeadline(pub Instant);

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = StdInstant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;

    if !(status.is_client_error() || status.is_server_error()) {
        info!(
            target = "texshot::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            request_id = request_id,
            "request completed",
        );
        return response;
    }

    let report = response.extensions_mut().remove::<ErrorReport>();
    let (source, messages) = match report {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());

    if status.is_server_error() {
        error!(
            target = "texshot::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            source = source,
            detail = %detail,
            chain = ?messages,
            request_id = request_id,
            "request failed",
        );
    } else {
        warn!(
            target = "texshot::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            source = source,
            detail = %detail,
            chain = ?messages,
            request_id = request_id,
            "client request error",
        );
    }

    response
}

/// Bound the time spent producing a response. The deadline is exposed to
/// handlers as [`RequestDeadline`]; the inner future is dropped when it passes,
/// which kills any external tool still running.
pub async fn enforce_write_deadline(
    State(write_timeout): State<Duration>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let deadline = Instant::now() + write_timeout;
    request.extensions_mut().insert(RequestDeadline(deadline));

    match tokio::time::timeout_at(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_elapsed) => HttpError::new(
            "infra::http::middleware::enforce_write_deadline",
            StatusCode::SERVICE_UNAVAILABLE,
            "Request timed out",
            format!("no response within {write_timeout:?}"),
        )
        .into_response(),
    }
}
