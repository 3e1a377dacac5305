//! Service metrics with Prometheus text exposition
//!
//! All series are low-cardinality by construction: request metrics exist as
//! one unlabeled pair for the log-list document and one pair labeled only by
//! `log` for everything under `/<log>/...`. No label encodes status codes,
//! paths, tile coordinates, or fingerprints.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Histogram bucket boundaries: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms,
/// 500ms, 1s, 5s, 10s.
const DURATION_BUCKET_BOUNDS_MS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

/// Fixed-bucket duration histogram over atomics.
#[derive(Debug, Default)]
struct DurationHistogram {
    /// Per-bucket (non-cumulative) counts; rendered cumulatively.
    buckets: [AtomicU64; 11],
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, d: Duration) {
        let us = u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);

        let ms = us / 1000;
        for (i, &bound) in DURATION_BUCKET_BOUNDS_MS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Above the last boundary: counted in +Inf only (via count).
    }

    /// Append `_bucket`/`_sum`/`_count` sample lines for this histogram.
    fn render(&self, out: &mut String, name: &str, labels: &str) {
        let mut cumulative = 0u64;
        for (i, &bound_ms) in DURATION_BUCKET_BOUNDS_MS.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            let le = bound_ms as f64 / 1000.0;
            if labels.is_empty() {
                let _ = writeln!(out, "{name}_bucket{{le=\"{le}\"}} {cumulative}");
            } else {
                let _ = writeln!(out, "{name}_bucket{{{labels},le=\"{le}\"}} {cumulative}");
            }
        }
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_us.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        if labels.is_empty() {
            let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
            let _ = writeln!(out, "{name}_sum {sum}");
            let _ = writeln!(out, "{name}_count {count}");
        } else {
            let _ = writeln!(out, "{name}_bucket{{{labels},le=\"+Inf\"}} {count}");
            let _ = writeln!(out, "{name}_sum{{{labels}}} {sum}");
            let _ = writeln!(out, "{name}_count{{{labels}}} {count}");
        }
    }
}

/// Per-log request series (the only labeled metrics in the service).
#[derive(Debug, Default)]
struct LogSeries {
    requests_total: AtomicU64,
    request_duration: DurationHistogram,
}

/// Metrics registry for ct-archive-serve.
#[derive(Debug, Default)]
pub struct Metrics {
    loglist_requests_total: AtomicU64,
    loglist_request_duration: DurationHistogram,

    per_log: RwLock<HashMap<String, Arc<LogSeries>>>,

    archive_logs_discovered: AtomicU64,
    archive_zip_parts_discovered: AtomicU64,

    zip_cache_open: AtomicU64,
    zip_cache_evictions_total: AtomicU64,

    entry_cache_bytes: AtomicU64,
    entry_cache_items: AtomicU64,
    entry_cache_hits_total: AtomicU64,
    entry_cache_misses_total: AtomicU64,
    entry_cache_evictions_total: AtomicU64,

    zip_integrity_passed_total: AtomicU64,
    zip_integrity_failed_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `/logs.v3.json` request.
    pub fn observe_loglist_request(&self, d: Duration) {
        self.loglist_requests_total.fetch_add(1, Ordering::Relaxed);
        self.loglist_request_duration.observe(d);
    }

    /// Record a request under `/<log>/...`, aggregated by log only.
    pub fn observe_log_request(&self, log: &str, d: Duration) {
        let series = {
            let map = self.per_log.read();
            map.get(log).cloned()
        };
        let series = match series {
            Some(s) => s,
            None => self
                .per_log
                .write()
                .entry(log.to_string())
                .or_default()
                .clone(),
        };
        series.requests_total.fetch_add(1, Ordering::Relaxed);
        series.request_duration.observe(d);
    }

    pub fn set_archive_discovered(&self, logs: usize, zip_parts: usize) {
        self.archive_logs_discovered
            .store(logs as u64, Ordering::Relaxed);
        self.archive_zip_parts_discovered
            .store(zip_parts as u64, Ordering::Relaxed);
    }

    pub fn set_zip_cache_open(&self, n: u64) {
        self.zip_cache_open.store(n, Ordering::Relaxed);
    }

    pub fn inc_zip_cache_evictions(&self) {
        self.zip_cache_evictions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_entry_cache_usage(&self, bytes: u64, items: u64) {
        self.entry_cache_bytes.store(bytes, Ordering::Relaxed);
        self.entry_cache_items.store(items, Ordering::Relaxed);
    }

    pub fn inc_entry_cache_hits(&self) {
        self.entry_cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_entry_cache_misses(&self) {
        self.entry_cache_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_entry_cache_evictions(&self) {
        self.entry_cache_evictions_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_zip_integrity_passed(&self) {
        self.zip_integrity_passed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_zip_integrity_failed(&self) {
        self.zip_integrity_failed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Export all metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(8 * 1024);

        let _ = writeln!(
            out,
            "# HELP ctarchive_http_loglist_requests_total Total number of /logs.v3.json requests."
        );
        let _ = writeln!(out, "# TYPE ctarchive_http_loglist_requests_total counter");
        let _ = writeln!(
            out,
            "ctarchive_http_loglist_requests_total {}",
            self.loglist_requests_total.load(Ordering::Relaxed)
        );

        let _ = writeln!(
            out,
            "# HELP ctarchive_http_loglist_request_duration_seconds Duration of /logs.v3.json requests."
        );
        let _ = writeln!(
            out,
            "# TYPE ctarchive_http_loglist_request_duration_seconds histogram"
        );
        self.loglist_request_duration.render(
            &mut out,
            "ctarchive_http_loglist_request_duration_seconds",
            "",
        );

        // Per-log series, rendered in sorted order for deterministic output.
        let per_log = self.per_log.read();
        let mut logs: Vec<&String> = per_log.keys().collect();
        logs.sort();

        let _ = writeln!(
            out,
            "# HELP ctarchive_http_log_requests_total Total requests under /<log>/... aggregated by log."
        );
        let _ = writeln!(out, "# TYPE ctarchive_http_log_requests_total counter");
        for log in &logs {
            let series = &per_log[*log];
            let _ = writeln!(
                out,
                "ctarchive_http_log_requests_total{{log=\"{}\"}} {}",
                escape_label(log),
                series.requests_total.load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(
            out,
            "# HELP ctarchive_http_log_request_duration_seconds Duration of requests under /<log>/... aggregated by log."
        );
        let _ = writeln!(
            out,
            "# TYPE ctarchive_http_log_request_duration_seconds histogram"
        );
        for log in &logs {
            let series = &per_log[*log];
            let labels = format!("log=\"{}\"", escape_label(log));
            series.request_duration.render(
                &mut out,
                "ctarchive_http_log_request_duration_seconds",
                &labels,
            );
        }
        drop(per_log);

        for (name, kind, help, value) in [
            (
                "ctarchive_archive_logs_discovered",
                "gauge",
                "Number of archive logs currently discovered.",
                self.archive_logs_discovered.load(Ordering::Relaxed),
            ),
            (
                "ctarchive_archive_zip_parts_discovered",
                "gauge",
                "Number of zip parts currently discovered across all logs.",
                self.archive_zip_parts_discovered.load(Ordering::Relaxed),
            ),
            (
                "ctarchive_zip_cache_open",
                "gauge",
                "Current number of open zip parts held by the zip cache.",
                self.zip_cache_open.load(Ordering::Relaxed),
            ),
            (
                "ctarchive_zip_cache_evictions_total",
                "counter",
                "Total number of zip cache evictions.",
                self.zip_cache_evictions_total.load(Ordering::Relaxed),
            ),
            (
                "ctarchive_entry_cache_bytes",
                "gauge",
                "Current decompressed bytes held by the entry content cache.",
                self.entry_cache_bytes.load(Ordering::Relaxed),
            ),
            (
                "ctarchive_entry_cache_items",
                "gauge",
                "Current number of items in the entry content cache.",
                self.entry_cache_items.load(Ordering::Relaxed),
            ),
            (
                "ctarchive_entry_cache_hits_total",
                "counter",
                "Total entry content cache hits.",
                self.entry_cache_hits_total.load(Ordering::Relaxed),
            ),
            (
                "ctarchive_entry_cache_misses_total",
                "counter",
                "Total entry content cache misses.",
                self.entry_cache_misses_total.load(Ordering::Relaxed),
            ),
            (
                "ctarchive_entry_cache_evictions_total",
                "counter",
                "Total entry content cache evictions.",
                self.entry_cache_evictions_total.load(Ordering::Relaxed),
            ),
            (
                "ctarchive_zip_integrity_passed_total",
                "counter",
                "Total zip parts that passed structural integrity checks.",
                self.zip_integrity_passed_total.load(Ordering::Relaxed),
            ),
            (
                "ctarchive_zip_integrity_failed_total",
                "counter",
                "Total zip parts that failed structural integrity checks.",
                self.zip_integrity_failed_total.load(Ordering::Relaxed),
            ),
        ] {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            let _ = writeln!(out, "{name} {value}");
        }

        out
    }
}

/// Escape a label value per the Prometheus text format.
fn escape_label(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for c in v.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}
