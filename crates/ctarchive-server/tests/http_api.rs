//! End-to-end tests over the full router: archive fixtures on disk, real zip
//! parts, every layer of the stack wired the way the binary wires it.

use std::io::Write as _;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use tempfile::TempDir;
use tower::ServiceExt as _;

use ctarchive_common::config::parse_trusted_sources;
use ctarchive_common::{Config, Metrics};
use ctarchive_index::ArchiveIndex;
use ctarchive_server::{router, App, ClientAddr, LogListBuilder};
use ctarchive_zip::{EntryContentCache, IntegrityGate, ZipPartCache, ZipStore};

fn make_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zw = zip::ZipWriter::new(file);
    for (name, data) in entries {
        zw.start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zw.write_all(data).unwrap();
    }
    zw.finish().unwrap();
}

fn log_v3_json(description: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "description": description,
        "log_id": "abc123",
        "key": "BASE64KEY",
        "mmd": 86400,
        "log_type": "prod",
        "state": {"usable": {"timestamp": "2024-01-01T00:00:00Z"}},
        "url": "https://origin.example/",
    }))
    .unwrap()
}

struct Fixture {
    _root: TempDir,
    router: Router,
    metrics: Arc<Metrics>,
}

async fn fixture(build: impl FnOnce(&Path), trusted: &str) -> Fixture {
    let root = TempDir::new().unwrap();
    build(root.path());

    let mut cfg = Config::default();
    cfg.archive_path = root.path().to_path_buf();
    cfg.http_trusted_sources = parse_trusted_sources(trusted).unwrap();

    let metrics = Arc::new(Metrics::new());
    let index = Arc::new(ArchiveIndex::new(&cfg, Arc::clone(&metrics)).unwrap());
    let integrity = Arc::new(IntegrityGate::new(
        cfg.zip_integrity_fail_ttl,
        Arc::clone(&metrics),
    ));
    let store = Arc::new(
        ZipStore::new(integrity)
            .with_part_cache(Arc::new(ZipPartCache::new(
                cfg.zip_cache_max_open,
                cfg.zip_cache_max_concurrent_opens,
                Arc::clone(&metrics),
            )))
            .with_entry_cache(Arc::new(EntryContentCache::new(
                cfg.entry_cache_max_bytes,
                Arc::clone(&metrics),
            ))),
    );
    let loglist = Arc::new(LogListBuilder::new(&cfg, Arc::clone(&index)));
    loglist.refresh_once().await;

    let app = Arc::new(App {
        cfg,
        metrics: Arc::clone(&metrics),
        index,
        store,
        loglist,
        verbose: false,
    });

    Fixture {
        _root: root,
        router: router(app),
        metrics,
    }
}

/// A typical mirror: two healthy logs, one of them with issuers and a
/// second zip part.
fn standard_archive(root: &Path) {
    let sirius = root.join("ct_sirius");
    std::fs::create_dir(&sirius).unwrap();
    make_zip(
        &sirius.join("000.zip"),
        &[
            ("checkpoint", b"checkpoint-data"),
            ("log.v3.json", &log_v3_json("Sirius")),
            ("tile/0/x000", &[0xAAu8; 256]),
            ("tile/0/x001.p/128", &[0xBBu8; 128]),
            ("tile/data/x000", b"data-tile-zero"),
            ("tile/8/x000", b"high-level-tile"),
        ],
    );
    make_zip(
        &sirius.join("001.zip"),
        &[("tile/0/x065/536", b"second-part-tile")],
    );

    let vega = root.join("ct_vega");
    std::fs::create_dir(&vega).unwrap();
    make_zip(
        &vega.join("000.zip"),
        &[
            ("checkpoint", b"vega-checkpoint"),
            ("log.v3.json", &log_v3_json("Vega")),
            ("issuer/0a1b2c", b"issuer-cert-bytes"),
        ],
    );
}

async fn send(
    router: &Router,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    remote: &str,
) -> (StatusCode, HeaderMap, Bytes) {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let addr: SocketAddr = format!("{remote}:51234").parse().unwrap();
    let req = builder
        .extension(ClientAddr(addr))
        .body(Body::empty())
        .unwrap();

    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

#[tokio::test]
async fn test_checkpoint_served_from_metadata_part() {
    let fx = fixture(standard_archive, "").await;
    let (status, headers, body) = send(&fx.router, "GET", "/sirius/checkpoint", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type(&headers), "text/plain; charset=utf-8");
    assert_eq!(body.as_ref(), b"checkpoint-data");
}

#[tokio::test]
async fn test_log_info_and_issuer_content_types() {
    let fx = fixture(standard_archive, "").await;

    let (status, headers, body) = send(&fx.router, "GET", "/vega/log.v3.json", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type(&headers), "application/json");
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["description"], "Vega");

    let (status, headers, body) =
        send(&fx.router, "GET", "/vega/issuer/0a1b2c", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type(&headers), "application/pkix-cert");
    assert_eq!(body.as_ref(), b"issuer-cert-bytes");

    // Issuer absent from the zip: 404, not 503.
    let (status, _, _) = send(&fx.router, "GET", "/vega/issuer/ffff", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_head_matches_get_with_empty_body() {
    let fx = fixture(standard_archive, "").await;
    for path in ["/sirius/checkpoint", "/logs.v3.json", "/metrics", "/sirius/tile/0/x000"] {
        let (get_status, get_headers, get_body) =
            send(&fx.router, "GET", path, &[("host", "m.example")], "10.0.0.1").await;
        let (head_status, head_headers, head_body) =
            send(&fx.router, "HEAD", path, &[("host", "m.example")], "10.0.0.1").await;

        assert_eq!(get_status, head_status, "path {path}");
        assert_eq!(
            content_type(&get_headers),
            content_type(&head_headers),
            "path {path}"
        );
        assert!(!get_body.is_empty(), "path {path}");
        assert!(head_body.is_empty(), "path {path}");
    }
}

#[tokio::test]
async fn test_method_policy() {
    let fx = fixture(standard_archive, "").await;

    for (method, path) in [
        ("POST", "/sirius/checkpoint"),
        ("PUT", "/logs.v3.json"),
        ("DELETE", "/sirius/tile/0/x000"),
        ("PATCH", "/metrics"),
    ] {
        let (status, headers, _) = send(&fx.router, method, path, &[], "10.0.0.1").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED, "{method} {path}");
        let allow = headers.get("allow").unwrap().to_str().unwrap();
        assert!(allow.contains("GET") && allow.contains("HEAD"), "{method} {path}");
    }

    // Unknown paths are 404 regardless of method.
    let (status, _, _) = send(&fx.router, "POST", "/no/such/route", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_traversal_and_percent_rejected() {
    let fx = fixture(standard_archive, "").await;
    for path in [
        "/sirius/../checkpoint",
        "/sirius/%2e%2e/checkpoint",
        "/sirius/tile/0/%78000",
        "/../sirius/checkpoint",
    ] {
        let (status, _, _) = send(&fx.router, "GET", path, &[], "10.0.0.1").await;
        assert_eq!(status, StatusCode::NOT_FOUND, "path {path}");
    }
}

#[tokio::test]
async fn test_tiles_round_trip() {
    let fx = fixture(standard_archive, "").await;

    let (status, headers, body) =
        send(&fx.router, "GET", "/sirius/tile/0/x000", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type(&headers), "application/octet-stream");
    assert_eq!(body.as_ref(), &[0xAAu8; 256]);

    // Partial tile entry is looked up verbatim.
    let (status, _, body) =
        send(&fx.router, "GET", "/sirius/tile/0/x001.p/128", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), &[0xBBu8; 128]);

    // Partial width out of range never reaches the zip layer.
    let (status, _, _) =
        send(&fx.router, "GET", "/sirius/tile/0/x001.p/256", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) =
        send(&fx.router, "GET", "/sirius/tile/data/x000", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"data-tile-zero");

    // Level >= 3 tiles come from the shared-metadata part.
    let (status, _, body) =
        send(&fx.router, "GET", "/sirius/tile/8/x000", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"high-level-tile");
}

#[tokio::test]
async fn test_zip_part_selection() {
    let fx = fixture(standard_archive, "").await;

    // Index 65536 maps to part 1, which exists for sirius.
    let (status, _, body) =
        send(&fx.router, "GET", "/sirius/tile/0/x065/536", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"second-part-tile");

    // Index 131072 maps to part 2, which does not exist: 404 without I/O.
    let (status, _, _) =
        send(&fx.router, "GET", "/sirius/tile/0/x131/072", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // vega has no 001.zip at all.
    let (status, _, _) =
        send(&fx.router, "GET", "/vega/tile/0/x065/536", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_log_404() {
    let fx = fixture(standard_archive, "").await;
    let (status, _, _) = send(&fx.router, "GET", "/betelgeuse/checkpoint", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_log_list_document() {
    let fx = fixture(standard_archive, "").await;
    let (status, headers, body) = send(
        &fx.router,
        "GET",
        "/logs.v3.json",
        &[("host", "example.org")],
        "10.0.0.1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type(&headers), "application/json");

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["version"], "3.0");
    let tiled = json["operators"][0]["tiled_logs"].as_array().unwrap();
    assert_eq!(tiled.len(), 2);
    // Sorted by log name: sirius before vega.
    assert_eq!(tiled[0]["description"], "Sirius");
    assert_eq!(tiled[1]["description"], "Vega");
    assert_eq!(tiled[0]["has_issuers"], false);
    assert_eq!(tiled[1]["has_issuers"], true);
    for entry in tiled {
        let url = entry["submission_url"].as_str().unwrap();
        assert!(url.starts_with("http://example.org/"), "url {url}");
        assert_eq!(entry["monitoring_url"], entry["submission_url"]);
    }
}

#[tokio::test]
async fn test_trusted_proxy_headers() {
    let fx = fixture(standard_archive, "127.0.0.1/32").await;
    let forwarded = [
        ("host", "mirror.internal"),
        ("x-forwarded-host", "proxy.example, other.example"),
        ("x-forwarded-proto", "HTTPS, http"),
    ];

    // From a trusted source the forwarded headers win (first element,
    // lowercased scheme).
    let (status, _, body) =
        send(&fx.router, "GET", "/logs.v3.json", &forwarded, "127.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let url = json["operators"][0]["tiled_logs"][0]["submission_url"]
        .as_str()
        .unwrap();
    assert!(url.starts_with("https://proxy.example/"), "url {url}");

    // From anywhere else the same headers are ignored.
    let (_, _, body) =
        send(&fx.router, "GET", "/logs.v3.json", &forwarded, "10.9.8.7").await;
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let url = json["operators"][0]["tiled_logs"][0]["submission_url"]
        .as_str()
        .unwrap();
    assert!(url.starts_with("http://mirror.internal/"), "url {url}");
}

#[tokio::test]
async fn test_truncated_zip_is_503_with_cached_failure() {
    let fx = fixture(
        |root| {
            let good = root.join("good.zip");
            make_zip(&good, &[("checkpoint", b"checkpoint-data")]);
            let bytes = std::fs::read(&good).unwrap();
            std::fs::remove_file(&good).unwrap();

            let broken = root.join("ct_broken");
            std::fs::create_dir(&broken).unwrap();
            std::fs::write(broken.join("000.zip"), &bytes[..bytes.len() - 9]).unwrap();
        },
        "",
    )
    .await;

    let (status, _, _) = send(&fx.router, "GET", "/broken/checkpoint", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // Within the failure TTL the zip is not re-verified.
    let (status, _, _) = send(&fx.router, "GET", "/broken/checkpoint", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(fx
        .metrics
        .render()
        .contains("ctarchive_zip_integrity_failed_total 1"));
}

#[tokio::test]
async fn test_log_list_unhealthy_is_503() {
    // The only log's 000.zip is unreadable, so the initial refresh fails and
    // the endpoint serves 503 until a refresh succeeds.
    let fx = fixture(
        |root| {
            let broken = root.join("ct_broken");
            std::fs::create_dir(&broken).unwrap();
            std::fs::write(broken.join("000.zip"), b"junk").unwrap();
        },
        "",
    )
    .await;

    let (status, headers, _) = send(
        &fx.router,
        "GET",
        "/logs.v3.json",
        &[("host", "example.org")],
        "10.0.0.1",
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(content_type(&headers), "application/json");

    // Other endpoints are unaffected by log-list health.
    let (status, _, _) = send(&fx.router, "GET", "/metrics", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let fx = fixture(standard_archive, "").await;

    send(&fx.router, "GET", "/sirius/checkpoint", &[], "10.0.0.1").await;
    send(&fx.router, "GET", "/sirius/tile/0/x000", &[], "10.0.0.1").await;
    send(
        &fx.router,
        "GET",
        "/logs.v3.json",
        &[("host", "m.example")],
        "10.0.0.1",
    )
    .await;

    let (status, headers, body) = send(&fx.router, "GET", "/metrics", &[], "10.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type(&headers), "text/plain; version=0.0.4");

    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("ctarchive_http_log_requests_total{log=\"sirius\"} 2"));
    assert!(text.contains("ctarchive_http_loglist_requests_total 1"));
    assert!(text.contains("ctarchive_archive_logs_discovered 2"));
    assert!(text.contains("ctarchive_archive_zip_parts_discovered 3"));
}
