use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};

/// Liveness probe; answers `ok` for any method.
pub(crate) async fn healthz() -> Response {
    (
        [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
        "ok",
    )
        .into_response()
}
