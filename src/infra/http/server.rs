use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{Router, extract::Request};
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto,
    service::TowerToHyperService,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Notify, watch},
    task::JoinSet,
};
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::{config::ServerSettings, infra::error::InfraError};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
struct ConnectionTimeouts {
    read_header: Duration,
    idle: Duration,
}

/// Serve `router` on `listener` until `signal` resolves, then drain open
/// connections for at most `settings.graceful_shutdown`.
pub async fn serve<F>(
    listener: TcpListener,
    router: Router,
    settings: &ServerSettings,
    signal: F,
) -> Result<(), InfraError>
where
    F: Future<Output = ()> + Send,
{
    let local_addr = listener.local_addr()?;
    info!(
        target = "texshot::http::server",
        addr = %local_addr,
        "listening"
    );

    let timeouts = ConnectionTimeouts {
        read_header: settings.read_header_timeout,
        idle: settings.idle_timeout,
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut connections = JoinSet::new();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        router.clone(),
                        timeouts,
                        shutdown_rx.clone(),
                    ));
                }
                Err(err) => {
                    warn!(
                        target = "texshot::http::server",
                        error = %err,
                        "failed to accept connection"
                    );
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    warn!(
                        target = "texshot::http::server",
                        error = %err,
                        "connection task failed"
                    );
                }
            }
        }
    }

    drop(listener);
    info!(
        target = "texshot::http::server",
        open_connections = connections.len(),
        "shutting down"
    );
    drop(shutdown_tx);

    let drained = tokio::time::timeout(settings.graceful_shutdown, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            target = "texshot::http::server",
            aborted = connections.len(),
            "graceful shutdown timed out; aborting remaining connections"
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    timeouts: ConnectionTimeouts,
    mut shutdown: watch::Receiver<()>,
) {
    let activity = Activity::default();
    let service = {
        let activity = activity.clone();
        tower::service_fn(move |request: Request<Incoming>| {
            let guard = activity.begin();
            let router = router.clone();
            async move {
                let response = router.oneshot(request).await;
                drop(guard);
                response
            }
        })
    };

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read_header);
    let connection =
        builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(service));
    tokio::pin!(connection);

    let mut closing = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(err) = result {
                    debug!(
                        target = "texshot::http::server",
                        peer = %peer,
                        error = %err,
                        "connection closed with error"
                    );
                }
                break;
            }
            _ = shutdown.changed(), if !closing => {
                closing = true;
                connection.as_mut().graceful_shutdown();
            }
            _ = activity.idle_for(timeouts.idle), if !closing => {
                debug!(
                    target = "texshot::http::server",
                    peer = %peer,
                    "closing idle connection"
                );
                closing = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Counts requests in flight on one connection so idle time can be measured
/// from the end of the last response.
#[derive(Clone, Default)]
struct Activity {
    inner: Arc<ActivityState>,
}

#[derive(Default)]
struct ActivityState {
    in_flight: AtomicUsize,
    changed: Notify,
}

struct ActivityGuard {
    inner: Arc<ActivityState>,
}

impl Activity {
    fn begin(&self) -> ActivityGuard {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
        ActivityGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Resolves once no request has been in flight for `timeout`.
    async fn idle_for(&self, timeout: Duration) {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.inner.in_flight.load(Ordering::SeqCst) > 0 {
                changed.await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(timeout) => return,
                _ = changed => {}
            }
        }
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(
                target = "texshot::http::server",
                error = %err,
                "failed to listen for SIGINT"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(
                    target = "texshot::http::server",
                    error = %err,
                    "failed to listen for SIGTERM"
                );
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    info!(target = "texshot::http::server", "shutdown signal received");
}
