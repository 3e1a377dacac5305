//! HTTP dispatch and handlers
//!
//! All routing goes through a single fallback service: the route parser is
//! total and its rejections map to 404, supported routes accept only GET and
//! HEAD (405 with `Allow: GET, HEAD` otherwise), and handler errors map to
//! fixed opaque bodies. HEAD responses carry the same status and headers as
//! GET with an empty body.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};

use ctarchive_common::{Config, Error, Metrics};
use ctarchive_index::{routing, ArchiveIndex, ArchiveLog, Route};
use ctarchive_zip::ZipStore;

use crate::loglist::LogListBuilder;
use crate::proxy;

const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_PKIX_CERT: &str = "application/pkix-cert";
const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";
const CONTENT_TYPE_METRICS: &str = "text/plain; version=0.0.4";

/// Shared state behind every handler.
pub struct App {
    pub cfg: Config,
    pub metrics: Arc<Metrics>,
    pub index: Arc<ArchiveIndex>,
    pub store: Arc<ZipStore>,
    pub loglist: Arc<LogListBuilder>,
    /// Log 2xx responses too.
    pub verbose: bool,
}

/// Source address of the connection, injected as a request extension by the
/// serve loop (and by tests).
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Build the router: one fallback service, plus the request deadline when a
/// write timeout is configured.
pub fn router(app: Arc<App>) -> Router {
    let write_timeout = app.cfg.http_write_timeout;
    let router = Router::new().fallback(dispatch).with_state(app);
    if write_timeout.is_zero() {
        router
    } else {
        router.layer(TimeoutLayer::new(write_timeout))
    }
}

async fn dispatch(State(app): State<Arc<App>>, req: Request<Body>) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let remote = req
        .extensions()
        .get::<ClientAddr>()
        .map(|addr| addr.0.ip());
    let headers = req.headers().clone();

    let Some(route) = routing::parse(&path) else {
        // Unknown paths are 404 regardless of method.
        let resp = plain(StatusCode::NOT_FOUND, "not found");
        log_request(&app, &method, &path, None, resp.status(), start.elapsed(), &headers);
        return finish(&method, resp);
    };

    if method != Method::GET && method != Method::HEAD {
        let mut resp = plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        resp.headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        log_request(&app, &method, &path, route.log(), resp.status(), start.elapsed(), &headers);
        return finish(&method, resp);
    }

    let resp = match &route {
        Route::Metrics => handle_metrics(&app),
        Route::LogList => handle_log_list(&app, remote, &headers).await,
        Route::Checkpoint { log } => {
            serve_metadata_entry(&app, log, "checkpoint", CONTENT_TYPE_TEXT).await
        }
        Route::LogInfo { log } => {
            serve_metadata_entry(&app, log, "log.v3.json", CONTENT_TYPE_JSON).await
        }
        Route::Issuer { log, fingerprint } => {
            let entry = format!("issuer/{fingerprint}");
            serve_metadata_entry(&app, log, &entry, CONTENT_TYPE_PKIX_CERT).await
        }
        Route::HashTile {
            log,
            level,
            index,
            entry_path,
            ..
        } => serve_tile(&app, log, *level, *index, false, entry_path).await,
        Route::DataTile {
            log,
            index,
            entry_path,
            ..
        } => serve_tile(&app, log, 0, *index, true, entry_path).await,
    };

    let elapsed = start.elapsed();
    observe(&app, &route, elapsed);
    log_request(&app, &method, &path, route.log(), resp.status(), elapsed, &headers);
    finish(&method, resp)
}

fn observe(app: &App, route: &Route, elapsed: Duration) {
    match route {
        Route::LogList => app.metrics.observe_loglist_request(elapsed),
        Route::Metrics => {}
        _ => {
            if let Some(log) = route.log() {
                app.metrics.observe_log_request(log, elapsed);
            }
        }
    }
}

fn handle_metrics(app: &App) -> Response {
    body_response(
        StatusCode::OK,
        CONTENT_TYPE_METRICS,
        Bytes::from(app.metrics.render()),
    )
}

async fn handle_log_list(app: &App, remote: Option<IpAddr>, headers: &HeaderMap) -> Response {
    let base_url = proxy::public_base_url(remote, headers, &app.cfg.http_trusted_sources);

    let snap = match app.loglist.snapshot_for_request(&base_url) {
        Some(snap) if snap.last_error.is_none() => snap,
        // Not built yet, or the last refresh failed: unavailable.
        _ => {
            return body_response(
                StatusCode::SERVICE_UNAVAILABLE,
                CONTENT_TYPE_JSON,
                Bytes::from_static(br#"{"error":"temporarily unavailable"}"#),
            );
        }
    };

    match serde_json::to_vec(&snap) {
        Ok(body) => body_response(StatusCode::OK, CONTENT_TYPE_JSON, Bytes::from(body)),
        Err(e) => {
            error!(error = %e, "failed to encode log list");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

/// Serve an entry that lives in the shared-metadata part (`000.zip`).
async fn serve_metadata_entry(
    app: &App,
    log: &str,
    entry_name: &str,
    content_type: &'static str,
) -> Response {
    let Some(archive_log) = app.index.lookup(log) else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    if !archive_log.has_part(0) {
        return plain(StatusCode::NOT_FOUND, "not found");
    }

    serve_entry(app, &archive_log, 0, entry_name, content_type).await
}

async fn serve_tile(
    app: &App,
    log: &str,
    level: u8,
    index: u64,
    data_tile: bool,
    entry_path: &str,
) -> Response {
    let Some(archive_log) = app.index.lookup(log) else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let Some(part) = archive_log.select_zip_part(level, index, data_tile) else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };

    serve_entry(app, &archive_log, part, entry_path, CONTENT_TYPE_OCTET_STREAM).await
}

async fn serve_entry(
    app: &App,
    archive_log: &ArchiveLog,
    part: u32,
    entry_name: &str,
    content_type: &'static str,
) -> Response {
    let zip_path = archive_log.zip_part_path(part);
    match app.store.open_entry(&zip_path, entry_name).await {
        Ok(data) => body_response(StatusCode::OK, content_type, data),
        Err(e) => error_response(&e, archive_log, entry_name),
    }
}

/// Map store errors to fixed opaque responses; detail stays in the logs.
fn error_response(err: &Error, archive_log: &ArchiveLog, entry_name: &str) -> Response {
    match err.http_status_code() {
        404 => plain(StatusCode::NOT_FOUND, "not found"),
        503 => {
            warn!(log = %archive_log.name, entry = %entry_name, error = %err, "zip temporarily unavailable");
            plain(
                StatusCode::SERVICE_UNAVAILABLE,
                "service temporarily unavailable",
            )
        }
        _ => {
            error!(log = %archive_log.name, entry = %entry_name, error = %err, "request failed");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

fn plain(status: StatusCode, msg: &'static str) -> Response {
    body_response(status, CONTENT_TYPE_TEXT, Bytes::from_static(msg.as_bytes()))
}

fn body_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .expect("static response parts are valid")
}

/// HEAD responses keep status and headers but carry no body bytes.
fn finish(method: &Method, resp: Response) -> Response {
    if method == Method::HEAD {
        let (parts, _) = resp.into_parts();
        Response::from_parts(parts, Body::empty())
    } else {
        resp
    }
}

fn log_request(
    app: &App,
    method: &Method,
    path: &str,
    log: Option<&str>,
    status: StatusCode,
    elapsed: Duration,
    headers: &HeaderMap,
) {
    let code = status.as_u16();
    if (200..300).contains(&code) && !app.verbose {
        return;
    }

    let duration_ms = elapsed.as_millis() as u64;
    let log = log.unwrap_or("");
    // Forwarded headers are recorded for audit even when untrusted.
    let x_forwarded_host = headers
        .get("x-forwarded-host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let x_forwarded_proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if code >= 500 {
        error!(%method, path, status = code, duration_ms, log, x_forwarded_host, x_forwarded_proto, "http request");
    } else if code >= 400 {
        warn!(%method, path, status = code, duration_ms, log, x_forwarded_host, x_forwarded_proto, "http request");
    } else {
        info!(%method, path, status = code, duration_ms, log, x_forwarded_host, x_forwarded_proto, "http request");
    }
}
