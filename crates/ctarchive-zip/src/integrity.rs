//! Zip structural integrity gate
//!
//! Before any read from a zip part, the gate decides whether the file is
//! structurally usable. Passes are cached for the process lifetime (until a
//! later read failure invalidates them); failures are cached with a TTL so a
//! part that is still downloading gets re-tested once it completes.
//!
//! Invariant: a path is never in both sets; a successful verification moves
//! it from `failed` to `passed`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use ctarchive_common::{Error, Metrics, Result};

use crate::flight::FlightGroup;

/// Injectable verification function (tests count calls / force failures).
pub type Verifier = dyn Fn(&Path) -> std::result::Result<(), String> + Send + Sync;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Passed,
    Failed,
}

struct GateState {
    passed: HashSet<PathBuf>,
    /// path -> expiry instant
    failed: HashMap<PathBuf, Instant>,
}

pub struct IntegrityGate {
    fail_ttl: Duration,
    metrics: Arc<Metrics>,
    verify: Arc<Verifier>,

    state: RwLock<GateState>,
    flights: FlightGroup<Verdict>,
}

impl IntegrityGate {
    pub fn new(fail_ttl: Duration, metrics: Arc<Metrics>) -> Self {
        Self::with_verifier(fail_ttl, metrics, Arc::new(verify_zip_structural))
    }

    pub fn with_verifier(fail_ttl: Duration, metrics: Arc<Metrics>, verify: Arc<Verifier>) -> Self {
        Self {
            fail_ttl,
            metrics,
            verify,
            state: RwLock::new(GateState {
                passed: HashSet::new(),
                failed: HashMap::new(),
            }),
            flights: FlightGroup::new(),
        }
    }

    /// Check that the zip part at `path` is structurally usable.
    ///
    /// Returns `Ok` for cached or fresh passes and
    /// [`Error::TemporarilyUnavailable`] for cached (unexpired) or fresh
    /// failures.
    pub async fn check(&self, path: &Path) -> Result<()> {
        // Fast path under the read lock.
        {
            let state = self.state.read();
            if state.passed.contains(path) {
                return Ok(());
            }
            if let Some(expires) = state.failed.get(path) {
                if Instant::now() < *expires {
                    return Err(Error::unavailable("zip failed integrity check"));
                }
            }
        }

        // Delete an expired failure. Upgrade to the write lock only when the
        // path is actually present in the failed set, which keeps the common
        // never-failed path free of exclusive locking.
        let in_failed = self.state.read().failed.contains_key(path);
        if in_failed {
            let mut state = self.state.write();
            if let Some(expires) = state.failed.get(path) {
                if Instant::now() >= *expires {
                    state.failed.remove(path);
                }
            }
        }

        // Slow path: verify, deduplicated per path.
        let verdict = self
            .flights
            .run(path, || async {
                // Another task may have completed while we queued.
                if self.state.read().passed.contains(path) {
                    return Verdict::Passed;
                }

                let verify = Arc::clone(&self.verify);
                let owned = path.to_path_buf();
                let outcome = match tokio::task::spawn_blocking(move || verify(&owned)).await {
                    Ok(res) => res,
                    Err(e) => Err(format!("verification task failed: {e}")),
                };

                match outcome {
                    Ok(()) => {
                        let mut state = self.state.write();
                        state.passed.insert(path.to_path_buf());
                        state.failed.remove(path);
                        drop(state);
                        self.metrics.inc_zip_integrity_passed();
                        Verdict::Passed
                    }
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "zip failed structural verification");
                        self.state
                            .write()
                            .failed
                            .insert(path.to_path_buf(), Instant::now() + self.fail_ttl);
                        self.metrics.inc_zip_integrity_failed();
                        Verdict::Failed
                    }
                }
            })
            .await;

        match verdict {
            Verdict::Passed => Ok(()),
            Verdict::Failed => Err(Error::unavailable("zip failed integrity check")),
        }
    }

    /// Drop a previously-passed zip part from the passed set. Called when a
    /// later read against the part fails.
    pub fn invalidate_passed(&self, path: &Path) {
        self.state.write().passed.remove(path);
    }
}

/// Default structural verification: parse the end-of-central-directory record
/// and central directory, and require at least one entry. Entries are not
/// decompressed (zips routinely hold 65k+ entries); per-entry corruption
/// surfaces at read time and triggers [`IntegrityGate::invalidate_passed`].
pub fn verify_zip_structural(path: &Path) -> std::result::Result<(), String> {
    let file = std::fs::File::open(path).map_err(|e| format!("open zip: {e}"))?;
    let archive =
        zip::ZipArchive::new(file).map_err(|e| format!("parse central directory: {e}"))?;
    if archive.len() == 0 {
        return Err("zip has no entries".to_string());
    }
    Ok(())
}
