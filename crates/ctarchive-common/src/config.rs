//! Runtime configuration for ct-archive-serve
//!
//! All values are read from `CT_*` environment variables with defaults that
//! suit a torrent-mirrored archive of 100+ logs. Parsing is driven by an
//! injectable lookup closure so tests never touch the process environment.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;

use crate::error::{Error, Result};

/// Runtime configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory containing per-log archive folders.
    pub archive_path: PathBuf,
    /// Folder pattern of the form `<prefix>*`.
    pub folder_pattern: String,
    /// Literal prefix derived from `folder_pattern`.
    pub folder_prefix: String,

    /// Period of the log-list document rebuild.
    pub log_list_refresh_interval: Duration,
    /// Period of the archive directory rescan.
    pub archive_refresh_interval: Duration,

    /// Total open-zip budget across all cache shards.
    pub zip_cache_max_open: usize,
    /// Global cap on concurrent zip open-and-parse operations.
    pub zip_cache_max_concurrent_opens: usize,
    /// Decompressed-bytes budget for the entry content cache; 0 disables it.
    pub entry_cache_max_bytes: u64,
    /// Cooldown before a failed zip part is re-verified.
    pub zip_integrity_fail_ttl: Duration,

    pub http_read_header_timeout: Duration,
    pub http_idle_timeout: Duration,
    pub http_max_header_bytes: usize,
    pub http_write_timeout: Duration,
    /// 0 disables the read timeout.
    pub http_read_timeout: Duration,

    /// Source prefixes whose `X-Forwarded-*` headers are honored.
    pub http_trusted_sources: Vec<IpNet>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            archive_path: PathBuf::from("/var/log/ct/archive"),
            folder_pattern: "ct_*".to_string(),
            folder_prefix: "ct_".to_string(),
            log_list_refresh_interval: Duration::from_secs(10 * 60),
            archive_refresh_interval: Duration::from_secs(5 * 60),
            zip_cache_max_open: 2048,
            zip_cache_max_concurrent_opens: 64,
            entry_cache_max_bytes: 256 * 1024 * 1024,
            zip_integrity_fail_ttl: Duration::from_secs(5 * 60),
            http_read_header_timeout: Duration::from_secs(5),
            http_idle_timeout: Duration::from_secs(60),
            http_max_header_bytes: 8192,
            http_write_timeout: Duration::from_secs(60),
            http_read_timeout: Duration::ZERO,
            http_trusted_sources: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an explicit lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("CT_ARCHIVE_PATH") {
            if !v.is_empty() {
                cfg.archive_path = PathBuf::from(v);
            }
        }

        if let Some(v) = lookup("CT_ARCHIVE_FOLDER_PATTERN") {
            if v.is_empty() {
                return Err(Error::config(
                    "CT_ARCHIVE_FOLDER_PATTERN: empty value is invalid",
                ));
            }
            cfg.folder_pattern = v;
        }
        cfg.folder_prefix = folder_prefix(&cfg.folder_pattern)
            .map_err(|e| Error::config(format!("CT_ARCHIVE_FOLDER_PATTERN: {e}")))?;

        cfg.log_list_refresh_interval = duration_var(
            &lookup,
            "CT_LOG_LIST_REFRESH_INTERVAL",
            cfg.log_list_refresh_interval,
            ZeroPolicy::Reject,
        )?;
        cfg.archive_refresh_interval = duration_var(
            &lookup,
            "CT_ARCHIVE_REFRESH_INTERVAL",
            cfg.archive_refresh_interval,
            ZeroPolicy::Reject,
        )?;
        cfg.zip_integrity_fail_ttl = duration_var(
            &lookup,
            "CT_ZIP_INTEGRITY_FAIL_TTL",
            cfg.zip_integrity_fail_ttl,
            ZeroPolicy::Reject,
        )?;

        cfg.zip_cache_max_open =
            count_var(&lookup, "CT_ZIP_CACHE_MAX_OPEN", cfg.zip_cache_max_open)?;
        cfg.zip_cache_max_concurrent_opens = count_var(
            &lookup,
            "CT_ZIP_CACHE_MAX_CONCURRENT_OPENS",
            cfg.zip_cache_max_concurrent_opens,
        )?;

        if let Some(v) = lookup("CT_ENTRY_CACHE_MAX_BYTES") {
            if !v.is_empty() {
                cfg.entry_cache_max_bytes = v
                    .parse::<u64>()
                    .map_err(|e| Error::config(format!("CT_ENTRY_CACHE_MAX_BYTES: {e}")))?;
            }
        }

        cfg.http_read_header_timeout = duration_var(
            &lookup,
            "CT_HTTP_READ_HEADER_TIMEOUT",
            cfg.http_read_header_timeout,
            ZeroPolicy::Allow,
        )?;
        cfg.http_idle_timeout = duration_var(
            &lookup,
            "CT_HTTP_IDLE_TIMEOUT",
            cfg.http_idle_timeout,
            ZeroPolicy::Allow,
        )?;
        cfg.http_write_timeout = duration_var(
            &lookup,
            "CT_HTTP_WRITE_TIMEOUT",
            cfg.http_write_timeout,
            ZeroPolicy::Allow,
        )?;
        cfg.http_read_timeout = duration_var(
            &lookup,
            "CT_HTTP_READ_TIMEOUT",
            cfg.http_read_timeout,
            ZeroPolicy::Allow,
        )?;
        cfg.http_max_header_bytes = count_var(
            &lookup,
            "CT_HTTP_MAX_HEADER_BYTES",
            cfg.http_max_header_bytes,
        )?;

        if let Some(v) = lookup("CT_HTTP_TRUSTED_SOURCES") {
            cfg.http_trusted_sources = parse_trusted_sources(&v)
                .map_err(|e| Error::config(format!("CT_HTTP_TRUSTED_SOURCES: {e}")))?;
        }

        Ok(cfg)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum ZeroPolicy {
    Allow,
    Reject,
}

fn duration_var<F>(lookup: &F, key: &str, default: Duration, zero: ZeroPolicy) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(v) = lookup(key) else {
        return Ok(default);
    };
    if v.is_empty() {
        return Ok(default);
    }

    // A bare "0" disables a timeout where that is allowed.
    let d = if v.trim() == "0" {
        Duration::ZERO
    } else {
        humantime::parse_duration(v.trim())
            .map_err(|e| Error::config(format!("{key}: {e}")))?
    };

    if zero == ZeroPolicy::Reject && d.is_zero() {
        return Err(Error::config(format!("{key}: must be > 0")));
    }
    Ok(d)
}

fn count_var<F>(lookup: &F, key: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(v) = lookup(key) else {
        return Ok(default);
    };
    if v.is_empty() {
        return Ok(default);
    }
    let n = v
        .trim()
        .parse::<usize>()
        .map_err(|e| Error::config(format!("{key}: {e}")))?;
    if n == 0 {
        return Err(Error::config(format!("{key}: must be > 0")));
    }
    Ok(n)
}

/// Extract the literal prefix from a `<prefix>*` pattern.
fn folder_prefix(pattern: &str) -> std::result::Result<String, String> {
    if !pattern.ends_with('*') {
        return Err("pattern must be of the form <prefix>* (missing trailing '*')".to_string());
    }
    if pattern.matches('*').count() != 1 {
        return Err(
            "pattern must contain exactly one '*' and it must be the final character".to_string(),
        );
    }
    Ok(pattern[..pattern.len() - 1].to_string())
}

/// Parse a CSV of IP addresses and CIDR networks into prefixes.
///
/// Bare addresses become full-length prefixes (/32 or /128).
pub fn parse_trusted_sources(csv: &str) -> std::result::Result<Vec<IpNet>, String> {
    let csv = csv.trim();
    if csv.is_empty() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for raw in csv.split(',') {
        let s = raw.trim();
        if s.is_empty() {
            continue;
        }

        if s.contains('/') {
            let net: IpNet = s.parse().map_err(|e| format!("invalid CIDR {s:?}: {e}"))?;
            out.push(net);
            continue;
        }

        let addr: IpAddr = s.parse().map_err(|e| format!("invalid IP {s:?}: {e}"))?;
        let prefix_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let net =
            IpNet::new(addr, prefix_len).map_err(|e| format!("invalid IP {s:?}: {e}"))?;
        out.push(net);
    }

    Ok(out)
}
