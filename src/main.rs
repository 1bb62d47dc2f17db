use std::{process, sync::Arc};

use texshot::{
    application::{error::AppError, render::RenderService},
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState, server},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let renderer = Arc::new(RenderService::new(&settings.render));
    info!(
        target = "texshot::serve",
        worker_limit = renderer.gate().capacity(),
        max_body_bytes = settings.render.max_body_bytes.get(),
        command_timeout_ms = settings.render.command_timeout.as_millis() as u64,
        allow_shell_escape = settings.render.allow_shell_escape,
        dpi = settings.render.dpi,
        auth_enabled = settings.auth.api_key.is_some(),
        "render service configured"
    );

    let router = http::build_router(HttpState::new(&settings, renderer));
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;

    server::serve(listener, router, &settings.server, server::shutdown_signal()).await?;

    info!(target = "texshot::serve", "server stopped");
    Ok(())
}
