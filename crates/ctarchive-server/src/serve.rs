//! Connection loop
//!
//! Serves the router over hyper's low-level connection API instead of
//! `axum::serve` so the configured header-read timeout and header size cap
//! apply per connection. Shutdown cancels the accept loop, asks in-flight
//! connections to finish, and drains them within a fixed deadline.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt as _;
use tracing::{debug, info};

use ctarchive_common::Config;

use crate::server::ClientAddr;

/// In-flight requests get this long to complete after a shutdown signal.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Accept connections on `addr` and serve `router` until `shutdown` fires.
pub async fn serve(
    router: Router,
    addr: SocketAddr,
    cfg: &Config,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "http server listening");

    let read_header_timeout = cfg.http_read_header_timeout;
    // hyper enforces a floor of 8 KiB on its header buffer.
    let max_buf_size = cfg.http_max_header_bytes.max(8192);

    let tracker = TaskTracker::new();
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let router = router.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            serve_connection(
                router,
                stream,
                remote,
                read_header_timeout,
                max_buf_size,
                shutdown,
            )
            .await;
        });
    }

    info!("draining in-flight connections");
    tracker.close();
    let _ = tokio::time::timeout(SHUTDOWN_DEADLINE, tracker.wait()).await;
    Ok(())
}

async fn serve_connection(
    router: Router,
    stream: tokio::net::TcpStream,
    remote: SocketAddr,
    read_header_timeout: Duration,
    max_buf_size: usize,
    shutdown: CancellationToken,
) {
    // Tag every request with the connection's source address; handlers need
    // it for the trusted-proxy decision.
    let service = TowerToHyperService::new(router.map_request(
        move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(ClientAddr(remote));
            req.map(Body::new)
        },
    ));

    let mut builder = ConnBuilder::new(TokioExecutor::new());
    {
        let mut http1 = builder.http1();
        http1.timer(TokioTimer::new()).max_buf_size(max_buf_size);
        if !read_header_timeout.is_zero() {
            http1.header_read_timeout(read_header_timeout);
        }
    }

    let io = TokioIo::new(stream);
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(remote = %remote, error = %e, "connection closed with error");
            }
        }
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(SHUTDOWN_DEADLINE, conn).await;
        }
    }
}
