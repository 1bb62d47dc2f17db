mod auth;
mod health;
mod middleware;
mod render;
pub mod server;

use std::{sync::Arc, time::Duration};

use axum::{Router, middleware as axum_middleware, routing::any};

use crate::{application::render::RenderService, config::Settings};

pub use middleware::{RequestContext, RequestDeadline};

#[derive(Clone)]
pub struct HttpState {
    pub renderer: Arc<RenderService>,
    pub api_key: Option<Arc<str>>,
    pub max_body_bytes: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl HttpState {
    pub fn new(settings: &Settings, renderer: Arc<RenderService>) -> Self {
        Self {
            renderer,
            api_key: settings.auth.api_key.as_deref().map(Arc::from),
            // Checked to fit in usize while loading configuration.
            max_body_bytes: usize::try_from(settings.render.max_body_bytes.get())
                .unwrap_or(usize::MAX),
            read_timeout: settings.server.read_timeout,
            write_timeout: settings.server.write_timeout,
        }
    }
}

/// Routes accept any method; handlers answer 405 themselves so validation
/// order stays method, content type, authorization.
pub fn build_router(state: HttpState) -> Router {
    let write_timeout = state.write_timeout;
    Router::new()
        .route("/render-latex", any(render::render_latex))
        .route("/healthz", any(health::healthz))
        .with_state(state)
        .layer(axum_middleware::from_fn_with_state(
            write_timeout,
            middleware::enforce_write_deadline,
        ))
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
