//! Log-list v3 discovery document
//!
//! Periodically rebuilds a deterministic snapshot of every discovered log's
//! metadata from its `000.zip`: one pass per zip extracts `log.v3.json` and
//! detects `issuer/` entries. Snapshots store bare log names; submission and
//! monitoring URLs are templated per request from the derived public base
//! URL. A failed rebuild publishes its error and the handler serves 503
//! until the next success.

use std::collections::{HashMap, HashSet};
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use ctarchive_common::{Config, Error, Result};
use ctarchive_index::ArchiveIndex;

pub const LOG_LIST_VERSION: &str = "3.0";
pub const OPERATOR_NAME: &str = "ct-archive-serve";

/// Parsed subset of a log's own `log.v3.json`. Any `url` field the log
/// carries is dropped; URLs are always rewritten to this mirror.
#[derive(Debug, Clone, Deserialize)]
pub struct LogInfo {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub log_id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub mmd: u64,
    #[serde(default)]
    pub log_type: String,
    #[serde(default)]
    pub state: serde_json::Value,
}

/// One tiled log record in the published document.
#[derive(Debug, Clone, Serialize)]
pub struct TiledLog {
    pub description: String,
    pub log_id: String,
    pub key: String,
    pub mmd: u64,
    pub log_type: String,
    pub state: serde_json::Value,
    pub submission_url: String,
    pub monitoring_url: String,
    pub has_issuers: bool,
    /// Bare log name used to template the URLs per request.
    #[serde(skip)]
    pub log_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Operator {
    pub name: String,
    pub email: Vec<String>,
    pub logs: Vec<serde_json::Value>,
    pub tiled_logs: Vec<TiledLog>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogListSnapshot {
    pub version: String,
    pub log_list_timestamp: String,
    pub operators: Vec<Operator>,
    /// Set when the last refresh failed; drives 503 from the handler.
    #[serde(skip)]
    pub last_error: Option<String>,
}

impl LogListSnapshot {
    fn healthy(tiled_logs: Vec<TiledLog>) -> Self {
        Self {
            version: LOG_LIST_VERSION.to_string(),
            log_list_timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            operators: vec![Operator {
                name: OPERATOR_NAME.to_string(),
                email: Vec::new(),
                logs: Vec::new(),
                tiled_logs,
            }],
            last_error: None,
        }
    }

    fn failed(err: String) -> Self {
        let mut snap = Self::healthy(Vec::new());
        snap.last_error = Some(err);
        snap
    }

    /// Clone with submission and monitoring URLs templated from `base`.
    pub fn with_base_url(&self, base: &str) -> Self {
        let mut clone = self.clone();
        for op in &mut clone.operators {
            for tiled in &mut op.tiled_logs {
                let url = format!("{base}/{}", tiled.log_name);
                tiled.submission_url = url.clone();
                tiled.monitoring_url = url;
            }
        }
        clone
    }
}

/// Cached extraction result for one `000.zip`, keyed by modification time.
struct MetaCacheEntry {
    mtime: Option<SystemTime>,
    info: LogInfo,
    has_issuers: bool,
}

pub struct LogListBuilder {
    index: Arc<ArchiveIndex>,
    refresh_interval: Duration,

    snap: RwLock<Option<Arc<LogListSnapshot>>>,

    // Serializes refreshes and owns the per-zip extraction cache.
    refresh_state: tokio::sync::Mutex<HashMap<PathBuf, MetaCacheEntry>>,
}

impl LogListBuilder {
    pub fn new(cfg: &Config, index: Arc<ArchiveIndex>) -> Self {
        Self {
            index,
            refresh_interval: cfg.log_list_refresh_interval,
            snap: RwLock::new(None),
            refresh_state: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Last published snapshot, if any.
    pub fn snapshot(&self) -> Option<Arc<LogListSnapshot>> {
        self.snap.read().clone()
    }

    /// Snapshot with URLs templated for this request. Unhealthy snapshots
    /// are returned as-is so the handler can map them to 503.
    pub fn snapshot_for_request(&self, base_url: &str) -> Option<LogListSnapshot> {
        let snap = self.snapshot()?;
        if snap.last_error.is_some() {
            return Some((*snap).clone());
        }
        Some(snap.with_base_url(base_url))
    }

    /// Run the initial synchronous refresh, then spawn the ticker.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        debug!("building initial log list");
        self.refresh_once().await;

        let builder = Arc::clone(self);
        let mut interval = tokio::time::interval(builder.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => builder.refresh_once().await,
                }
            }
        });
    }

    /// Rebuild and publish one snapshot. Failures publish the error state.
    pub async fn refresh_once(&self) {
        let mut cache = self.refresh_state.lock().await;
        match self.build_snapshot(&mut cache).await {
            Ok(snap) => {
                debug!(
                    tiled_logs = snap.operators[0].tiled_logs.len(),
                    "log list rebuilt"
                );
                *self.snap.write() = Some(Arc::new(snap));
            }
            Err(e) => {
                error!(error = %e, "log list refresh failed");
                *self.snap.write() = Some(Arc::new(LogListSnapshot::failed(e.to_string())));
            }
        }
    }

    async fn build_snapshot(
        &self,
        cache: &mut HashMap<PathBuf, MetaCacheEntry>,
    ) -> Result<LogListSnapshot> {
        let archive = self.index.snapshot();

        let mut names: Vec<&String> = archive.logs.keys().collect();
        names.sort();

        let mut tiled_logs = Vec::with_capacity(names.len());
        for name in names {
            let log = &archive.logs[name];
            let zip_path = log.metadata_zip_path();

            let (info, has_issuers) = match extract_log_info(cache, &zip_path).await {
                Ok(extracted) => extracted,
                Err(e) => {
                    // Still downloading or malformed: omit, don't stub.
                    warn!(log = %name, error = %e, "omitting log from log list");
                    continue;
                }
            };

            tiled_logs.push(TiledLog {
                description: info.description,
                log_id: info.log_id,
                key: info.key,
                mmd: info.mmd,
                log_type: info.log_type,
                state: info.state,
                submission_url: String::new(),
                monitoring_url: String::new(),
                has_issuers,
                log_name: name.clone(),
            });
        }

        // Drop extraction cache entries for zips no longer in the archive.
        let live: HashSet<PathBuf> = archive
            .logs
            .values()
            .map(|l| l.metadata_zip_path())
            .collect();
        cache.retain(|path, _| live.contains(path));

        if tiled_logs.is_empty() && !archive.logs.is_empty() {
            return Err(Error::internal(
                "no log metadata could be read from the archive",
            ));
        }

        Ok(LogListSnapshot::healthy(tiled_logs))
    }
}

/// Extract `log.v3.json` and the issuer flag from a zip, via the mtime cache.
async fn extract_log_info(
    cache: &mut HashMap<PathBuf, MetaCacheEntry>,
    zip_path: &Path,
) -> Result<(LogInfo, bool)> {
    let mtime = tokio::fs::metadata(zip_path)
        .await
        .map_err(|e| Error::internal(format!("stat {}: {e}", zip_path.display())))?
        .modified()
        .ok();

    if let Some(cached) = cache.get(zip_path) {
        if cached.mtime.is_some() && cached.mtime == mtime {
            return Ok((cached.info.clone(), cached.has_issuers));
        }
    }

    let owned = zip_path.to_path_buf();
    let (info, has_issuers) = tokio::task::spawn_blocking(move || read_log_info(&owned))
        .await
        .map_err(|e| Error::internal(format!("extraction task failed: {e}")))??;

    cache.insert(
        zip_path.to_path_buf(),
        MetaCacheEntry {
            mtime,
            info: info.clone(),
            has_issuers,
        },
    );
    Ok((info, has_issuers))
}

/// Single pass over the zip: find `log.v3.json` and any `issuer/` entry.
fn read_log_info(zip_path: &Path) -> Result<(LogInfo, bool)> {
    let file = std::fs::File::open(zip_path)
        .map_err(|e| Error::internal(format!("open {}: {e}", zip_path.display())))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| Error::internal(format!("parse {}: {e}", zip_path.display())))?;

    let mut info_index = None;
    let mut has_issuers = false;
    for i in 0..archive.len() {
        let Some(name) = archive.name_for_index(i) else {
            continue;
        };
        if name == "log.v3.json" {
            info_index = Some(i);
        } else if name.starts_with("issuer/") {
            has_issuers = true;
        }
    }

    let Some(index) = info_index else {
        return Err(Error::internal(format!(
            "log.v3.json not found in {}",
            zip_path.display()
        )));
    };

    let mut raw = Vec::new();
    archive
        .by_index(index)
        .map_err(|e| Error::internal(format!("open log.v3.json: {e}")))?
        .read_to_end(&mut raw)
        .map_err(|e| Error::internal(format!("read log.v3.json: {e}")))?;

    let info: LogInfo = serde_json::from_slice(&raw)
        .map_err(|e| Error::internal(format!("parse log.v3.json: {e}")))?;
    Ok((info, has_issuers))
}
