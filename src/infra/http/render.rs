use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};

use crate::application::{
    error::HttpError,
    render::{IoOp, RenderError, StageKind},
};

use super::{
    HttpState,
    auth::{authorize, is_plain_text},
    middleware::RequestDeadline,
};

const SOURCE: &str = "infra::http::render::render_latex";

/// `POST /render-latex`: typeset a plain-text LaTeX body and answer with the
/// first page as PNG.
pub(crate) async fn render_latex(State(state): State<HttpState>, request: Request) -> Response {
    match handle(&state, request).await {
        Ok(png) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static("image/png"))],
            png,
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle(state: &HttpState, request: Request) -> Result<Bytes, HttpError> {
    let (parts, body) = request.into_parts();

    if parts.method != Method::POST {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed",
            format!("{} is not accepted", parts.method),
        )
        .with_header(header::ALLOW, HeaderValue::from_static("POST")));
    }

    if !is_plain_text(&parts.headers) {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported Content-Type",
            format!(
                "content type {:?} is not text/plain",
                parts.headers.get(header::CONTENT_TYPE)
            ),
        ));
    }

    if !authorize(state.api_key.as_deref(), &parts.headers) {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::UNAUTHORIZED,
            "Unauthorized",
            "missing or mismatched API key",
        ));
    }

    let slot = state.renderer.try_admit().ok_or_else(|| {
        HttpError::new(
            SOURCE,
            StatusCode::TOO_MANY_REQUESTS,
            "Service busy",
            format!(
                "all {} render slots are in use",
                state.renderer.gate().capacity()
            ),
        )
    })?;

    let source = read_source(body, state.max_body_bytes, state.read_timeout).await?;

    let inherited = parts
        .extensions
        .get::<RequestDeadline>()
        .map(|deadline| deadline.0);
    let request = state.renderer.prepare(source, inherited).map_err(|err| {
        HttpError::from_error(
            SOURCE,
            StatusCode::BAD_REQUEST,
            "Empty LaTeX content",
            &err,
        )
    })?;

    let png = state
        .renderer
        .render(&slot, &request)
        .await
        .map_err(render_error_to_http)?;
    slot.release();
    Ok(png)
}

async fn read_source(
    body: Body,
    limit: usize,
    read_timeout: Duration,
) -> Result<Bytes, HttpError> {
    let collected = tokio::time::timeout(read_timeout, Limited::new(body, limit).collect()).await;
    match collected {
        Ok(Ok(collected)) => Ok(collected.to_bytes()),
        Ok(Err(err)) if err.downcast_ref::<LengthLimitError>().is_some() => {
            Err(HttpError::new(
                SOURCE,
                StatusCode::PAYLOAD_TOO_LARGE,
                "LaTeX content too large",
                format!("body exceeds {limit} bytes"),
            ))
        }
        Ok(Err(err)) => Err(HttpError::new(
            SOURCE,
            StatusCode::BAD_REQUEST,
            "Failed to read LaTeX content",
            err.to_string(),
        )),
        Err(_elapsed) => Err(HttpError::new(
            SOURCE,
            StatusCode::REQUEST_TIMEOUT,
            "Failed to read LaTeX content",
            format!("body not received within {read_timeout:?}"),
        )),
    }
}

fn render_error_to_http(err: RenderError) -> HttpError {
    let public_message = match &err {
        RenderError::Workspace(_) => "Failed to create temporary directory",
        RenderError::Io {
            op: IoOp::WriteInput,
            ..
        } => "Failed to write LaTeX file",
        RenderError::Io {
            op: IoOp::ReadOutput,
            ..
        } => "Failed to read PNG file",
        RenderError::Stage { stage, .. } => match stage {
            StageKind::Typeset => "pdflatex error",
            StageKind::Crop => "pdfcrop error",
            StageKind::Rasterize => "pdftoppm error",
        },
    };
    HttpError::from_error(
        SOURCE,
        StatusCode::INTERNAL_SERVER_ERROR,
        public_message,
        &err,
    )
}
