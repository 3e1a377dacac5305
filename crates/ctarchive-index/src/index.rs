//! Archive discovery and zip-part selection
//!
//! The index scans the archive root for `<prefix><log>` folders and their
//! `NNN.zip` parts, publishing the result as an immutable snapshot. Request
//! handlers only ever read snapshots; disk is touched exclusively by the
//! startup build and the background refresh ticker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use ctarchive_common::{Config, Error, Metrics, Result};

/// Log names longer than this are truncated before deduplication.
pub const MAX_LOG_NAME_LEN: usize = 256;

/// One discovered log folder under the archive root.
#[derive(Debug, Clone)]
pub struct ArchiveLog {
    /// Folder name with the configured prefix stripped (and truncated).
    pub name: String,
    /// Original folder name, kept for collision diagnostics.
    pub folder_name: String,
    pub folder_path: PathBuf,
    /// Discovered `NNN.zip` indices, sorted ascending.
    pub zip_parts: Vec<u32>,
    /// When this log was first observed with a `000.zip` present.
    pub first_discovered: Option<SystemTime>,
}

impl ArchiveLog {
    pub fn has_part(&self, part: u32) -> bool {
        self.zip_parts.binary_search(&part).is_ok()
    }

    pub fn zip_part_path(&self, part: u32) -> PathBuf {
        self.folder_path.join(format!("{part:03}.zip"))
    }

    /// Path of the shared-metadata part (`000.zip`).
    pub fn metadata_zip_path(&self) -> PathBuf {
        self.zip_part_path(0)
    }

    /// Select the zip part holding a tile.
    ///
    /// The archiver shards logs into subtree zips aligned to level-2 tiles
    /// (tile height 8, width 256, so each part covers 256^3 leaves):
    ///
    /// - data tiles and level-0 hash tiles: `N / 65536`
    /// - level 1: `N / 256`
    /// - level 2: `N`
    /// - level >= 3: shared metadata, prefer part 0, else the lowest part
    ///
    /// Returns `None` when the computed part is not in this log's part set.
    pub fn select_zip_part(&self, level: u8, index: u64, data_tile: bool) -> Option<u32> {
        let part = if data_tile || level == 0 {
            u32::try_from(index / 65536).ok()?
        } else if level == 1 {
            u32::try_from(index / 256).ok()?
        } else if level == 2 {
            u32::try_from(index).ok()?
        } else {
            return if self.has_part(0) {
                Some(0)
            } else {
                self.zip_parts.first().copied()
            };
        };
        self.has_part(part).then_some(part)
    }
}

/// Immutable view of the discovered archive state.
#[derive(Debug, Default)]
pub struct ArchiveSnapshot {
    pub logs: HashMap<String, ArchiveLog>,
}

impl ArchiveSnapshot {
    pub fn zip_part_total(&self) -> usize {
        self.logs.values().map(|l| l.zip_parts.len()).sum()
    }
}

/// In-memory view of discovered logs and zip parts.
pub struct ArchiveIndex {
    archive_path: PathBuf,
    folder_prefix: String,
    refresh_interval: Duration,
    metrics: Arc<Metrics>,

    snap: RwLock<Arc<ArchiveSnapshot>>,

    // Serializes refreshes so a slow scan cannot overlap another.
    refresh_mu: Mutex<()>,
}

impl ArchiveIndex {
    /// Build the initial snapshot. An unreadable archive root or a log-name
    /// collision is a startup error.
    pub fn new(cfg: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        debug!(
            archive_path = %cfg.archive_path.display(),
            folder_pattern = %cfg.folder_pattern,
            "building initial archive snapshot"
        );
        let snap = build_snapshot(&cfg.archive_path, &cfg.folder_prefix, None)?;
        debug!(log_count = snap.logs.len(), "archive snapshot built");

        metrics.set_archive_discovered(snap.logs.len(), snap.zip_part_total());

        Ok(Self {
            archive_path: cfg.archive_path.clone(),
            folder_prefix: cfg.folder_prefix.clone(),
            refresh_interval: cfg.archive_refresh_interval,
            metrics,
            snap: RwLock::new(Arc::new(snap)),
            refresh_mu: Mutex::new(()),
        })
    }

    /// Current snapshot. Cheap; safe to hold across the whole request.
    pub fn snapshot(&self) -> Arc<ArchiveSnapshot> {
        self.snap.read().clone()
    }

    pub fn lookup(&self, log: &str) -> Option<ArchiveLog> {
        self.snapshot().logs.get(log).cloned()
    }

    /// Spawn the periodic rescan ticker; exits on shutdown.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let index = Arc::clone(self);
        let mut interval = tokio::time::interval(index.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            // The first tick fires immediately; the startup build already ran.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {
                        let index = Arc::clone(&index);
                        let _ = tokio::task::spawn_blocking(move || index.refresh_once()).await;
                    }
                }
            }
        });
    }

    /// Rescan the archive root once. On failure the previous snapshot stays
    /// in effect.
    pub fn refresh_once(&self) {
        let _guard = self.refresh_mu.lock();

        let prev = self.snapshot();
        match build_snapshot(&self.archive_path, &self.folder_prefix, Some(&prev)) {
            Ok(snap) => {
                self.metrics
                    .set_archive_discovered(snap.logs.len(), snap.zip_part_total());
                *self.snap.write() = Arc::new(snap);
            }
            Err(e) => error!(error = %e, "archive refresh failed"),
        }
    }
}

/// One folder found during the disk scan, before name dedup.
struct DiscoveredFolder {
    folder_name: String,
    folder_path: PathBuf,
    zip_parts: Vec<u32>,
}

fn build_snapshot(
    archive_path: &Path,
    folder_prefix: &str,
    prev: Option<&ArchiveSnapshot>,
) -> Result<ArchiveSnapshot> {
    let entries = std::fs::read_dir(archive_path)
        .map_err(|e| Error::internal(format!("read archive path {archive_path:?}: {e}")))?;

    let mut folders = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|e| Error::internal(format!("read archive path {archive_path:?}: {e}")))?;
        let file_type = entry
            .file_type()
            .map_err(|e| Error::internal(format!("stat {:?}: {e}", entry.path())))?;
        if !file_type.is_dir() {
            continue;
        }

        let folder_name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                debug!(folder = ?raw, "skipping non-UTF-8 archive folder");
                continue;
            }
        };
        if !folder_name.starts_with(folder_prefix) {
            debug!(folder = %folder_name, "skipping folder outside pattern");
            continue;
        }

        let folder_path = archive_path.join(&folder_name);
        let zip_parts = discover_zip_parts(&folder_path)?;
        debug!(folder = %folder_name, parts = ?zip_parts, "discovered zip parts");

        folders.push(DiscoveredFolder {
            folder_name,
            folder_path,
            zip_parts,
        });
    }

    assemble_snapshot(folders, folder_prefix, prev, SystemTime::now())
}

/// Turn scanned folders into a snapshot: strip the prefix, truncate, dedup,
/// and carry discovery timestamps forward.
fn assemble_snapshot(
    folders: Vec<DiscoveredFolder>,
    folder_prefix: &str,
    prev: Option<&ArchiveSnapshot>,
    now: SystemTime,
) -> Result<ArchiveSnapshot> {
    let mut logs: HashMap<String, ArchiveLog> = HashMap::new();

    for folder in folders {
        let Some(log_name) = folder.folder_name.strip_prefix(folder_prefix) else {
            continue;
        };
        if log_name.is_empty() {
            continue;
        }
        let log_name = truncate_log_name(log_name);

        if let Some(existing) = logs.get(&log_name) {
            return Err(Error::LogNameCollision {
                log: log_name,
                first: existing.folder_name.clone(),
                second: folder.folder_name,
            });
        }

        let mut first_discovered = prev
            .and_then(|p| p.logs.get(&log_name))
            .and_then(|l| l.first_discovered);
        if first_discovered.is_none() && folder.zip_parts.first() == Some(&0) {
            first_discovered = Some(now);
        }

        logs.insert(
            log_name.clone(),
            ArchiveLog {
                name: log_name,
                folder_name: folder.folder_name,
                folder_path: folder.folder_path,
                zip_parts: folder.zip_parts,
                first_discovered,
            },
        );
    }

    Ok(ArchiveSnapshot { logs })
}

/// Enumerate `NNN.zip` part indices in a log folder, sorted ascending.
fn discover_zip_parts(folder_path: &Path) -> Result<Vec<u32>> {
    let entries = std::fs::read_dir(folder_path)
        .map_err(|e| Error::internal(format!("read zip parts of {folder_path:?}: {e}")))?;

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|e| Error::internal(format!("read zip parts of {folder_path:?}: {e}")))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        // Exactly NNN.zip, three decimal digits.
        if name.len() != 7 || !name.ends_with(".zip") {
            continue;
        }
        let digits = &name[..3];
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(n) = digits.parse::<u32>() {
            out.push(n);
        }
    }

    out.sort_unstable();
    Ok(out)
}

/// Truncate a log name to [`MAX_LOG_NAME_LEN`] bytes on a char boundary.
fn truncate_log_name(name: &str) -> String {
    if name.len() <= MAX_LOG_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_LOG_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::write(path, b"").unwrap();
    }

    fn archive_with(logs: &[(&str, &[&str])]) -> TempDir {
        let root = TempDir::new().unwrap();
        for (folder, files) in logs {
            let dir = root.path().join(folder);
            fs::create_dir(&dir).unwrap();
            for f in *files {
                touch(&dir.join(f));
            }
        }
        root
    }

    #[test]
    fn test_discovers_logs_and_zip_parts() {
        let root = archive_with(&[
            ("ct_sirius", &["000.zip", "001.zip", "002.zip"]),
            ("ct_vega", &["000.zip"]),
            ("unrelated", &["000.zip"]),
        ]);
        // A stray file at the root is ignored.
        touch(&root.path().join("ct_not_a_dir"));

        let snap = build_snapshot(root.path(), "ct_", None).unwrap();
        assert_eq!(snap.logs.len(), 2);
        assert_eq!(snap.logs["sirius"].zip_parts, vec![0, 1, 2]);
        assert_eq!(snap.logs["vega"].zip_parts, vec![0]);
        assert!(snap.logs["sirius"].first_discovered.is_some());
        assert_eq!(snap.zip_part_total(), 4);
    }

    #[test]
    fn test_zip_part_name_filtering() {
        let root = archive_with(&[(
            "ct_a",
            &[
                "000.zip", "010.zip", "0.zip", "0000.zip", "abc.zip", "123.txt", "12a.zip",
                "001.ZIP",
            ],
        )]);
        let snap = build_snapshot(root.path(), "ct_", None).unwrap();
        assert_eq!(snap.logs["a"].zip_parts, vec![0, 10]);
    }

    fn folder(name: &str, parts: &[u32]) -> DiscoveredFolder {
        DiscoveredFolder {
            folder_name: name.to_string(),
            folder_path: PathBuf::from("/archive").join(name),
            zip_parts: parts.to_vec(),
        }
    }

    #[test]
    fn test_log_name_truncation_causes_collision() {
        // Names longer than the cap are truncated before dedup; two folders
        // that agree on the first 256 chars collide.
        let long_a = format!("ct_{}1", "a".repeat(MAX_LOG_NAME_LEN));
        let long_b = format!("ct_{}2", "a".repeat(MAX_LOG_NAME_LEN));
        let err = assemble_snapshot(
            vec![folder(&long_a, &[0]), folder(&long_b, &[])],
            "ct_",
            None,
            SystemTime::now(),
        )
        .unwrap_err();
        match err {
            Error::LogNameCollision { log, first, second } => {
                assert_eq!(log.len(), MAX_LOG_NAME_LEN);
                assert_eq!(first, long_a);
                assert_eq!(second, long_b);
            }
            other => panic!("expected collision, got {other:?}"),
        }
    }

    #[test]
    fn test_truncate_log_name_respects_char_boundaries() {
        assert_eq!(truncate_log_name("short"), "short");
        let exact = "a".repeat(MAX_LOG_NAME_LEN);
        assert_eq!(truncate_log_name(&exact), exact);

        let long = "a".repeat(MAX_LOG_NAME_LEN + 10);
        assert_eq!(truncate_log_name(&long).len(), MAX_LOG_NAME_LEN);

        // A multibyte char straddling the cap is dropped whole.
        let tricky = format!("{}é", "a".repeat(MAX_LOG_NAME_LEN - 1));
        let truncated = truncate_log_name(&tricky);
        assert_eq!(truncated.len(), MAX_LOG_NAME_LEN - 1);
        assert!(truncated.chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_empty_log_name_skipped() {
        let snap = assemble_snapshot(
            vec![folder("ct_", &[0]), folder("ct_a", &[0])],
            "ct_",
            None,
            SystemTime::now(),
        )
        .unwrap();
        assert_eq!(snap.logs.len(), 1);
        assert!(snap.logs.contains_key("a"));
    }

    #[test]
    fn test_first_discovered_preserved_across_refreshes() {
        let root = archive_with(&[("ct_a", &["000.zip"]), ("ct_b", &["001.zip"])]);

        let first = build_snapshot(root.path(), "ct_", None).unwrap();
        let stamp = first.logs["a"].first_discovered.unwrap();
        // No 000.zip yet: no discovery stamp.
        assert!(first.logs["b"].first_discovered.is_none());

        touch(&root.path().join("ct_b").join("000.zip"));
        let second = build_snapshot(root.path(), "ct_", Some(&first)).unwrap();
        assert_eq!(second.logs["a"].first_discovered.unwrap(), stamp);
        assert!(second.logs["b"].first_discovered.is_some());
    }

    #[test]
    fn test_select_zip_part_data_tiles() {
        let log = ArchiveLog {
            name: "a".into(),
            folder_name: "ct_a".into(),
            folder_path: PathBuf::from("/archive/ct_a"),
            zip_parts: vec![0, 1, 2],
            first_discovered: None,
        };
        assert_eq!(log.select_zip_part(0, 0, true), Some(0));
        assert_eq!(log.select_zip_part(0, 65535, true), Some(0));
        assert_eq!(log.select_zip_part(0, 65536, true), Some(1));
        assert_eq!(log.select_zip_part(0, 131072, true), Some(2));
        // Computed part 3 is absent.
        assert_eq!(log.select_zip_part(0, 3 * 65536, true), None);
    }

    #[test]
    fn test_select_zip_part_hash_tiles_low_levels() {
        let log = ArchiveLog {
            name: "a".into(),
            folder_name: "ct_a".into(),
            folder_path: PathBuf::from("/archive/ct_a"),
            zip_parts: vec![0, 1, 2],
            first_discovered: None,
        };
        assert_eq!(log.select_zip_part(0, 65535, false), Some(0));
        assert_eq!(log.select_zip_part(0, 65536, false), Some(1));
        assert_eq!(log.select_zip_part(1, 255, false), Some(0));
        assert_eq!(log.select_zip_part(1, 256, false), Some(1));
        assert_eq!(log.select_zip_part(2, 2, false), Some(2));
        assert_eq!(log.select_zip_part(2, 3, false), None);
    }

    #[test]
    fn test_select_zip_part_high_levels_prefer_part_zero() {
        let with_zero = ArchiveLog {
            name: "a".into(),
            folder_name: "ct_a".into(),
            folder_path: PathBuf::from("/archive/ct_a"),
            zip_parts: vec![0, 1, 2],
            first_discovered: None,
        };
        assert_eq!(with_zero.select_zip_part(3, 0, false), Some(0));
        assert_eq!(with_zero.select_zip_part(200, 12345, false), Some(0));

        let without_zero = ArchiveLog {
            zip_parts: vec![4, 7],
            ..with_zero.clone()
        };
        assert_eq!(without_zero.select_zip_part(3, 0, false), Some(4));

        let empty = ArchiveLog {
            zip_parts: vec![],
            ..with_zero
        };
        assert_eq!(empty.select_zip_part(3, 0, false), None);
    }

    #[test]
    fn test_refresh_keeps_previous_snapshot_on_error() {
        let root = archive_with(&[("ct_a", &["000.zip"])]);
        let mut cfg = Config::default();
        cfg.archive_path = root.path().to_path_buf();

        let index = ArchiveIndex::new(&cfg, Arc::new(Metrics::new())).unwrap();
        assert!(index.lookup("a").is_some());

        // Make the root unreadable by removing it; the old snapshot survives.
        drop(root);
        index.refresh_once();
        assert!(index.lookup("a").is_some());
    }

    #[test]
    fn test_refresh_picks_up_new_logs() {
        let root = archive_with(&[("ct_a", &["000.zip"])]);
        let mut cfg = Config::default();
        cfg.archive_path = root.path().to_path_buf();

        let index = ArchiveIndex::new(&cfg, Arc::new(Metrics::new())).unwrap();
        assert!(index.lookup("b").is_none());

        let dir = root.path().join("ct_b");
        fs::create_dir(&dir).unwrap();
        touch(&dir.join("000.zip"));
        index.refresh_once();

        let b = index.lookup("b").unwrap();
        assert_eq!(b.zip_parts, vec![0]);
        assert_eq!(b.metadata_zip_path(), dir.join("000.zip"));
    }
}
