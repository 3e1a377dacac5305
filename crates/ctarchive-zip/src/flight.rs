//! Keyed singleflight
//!
//! Concurrent callers for the same key observe exactly one underlying
//! computation and all receive its result. Completed flights are retired so
//! a later call starts fresh (needed for re-verification after
//! invalidation).

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

pub(crate) struct FlightGroup<T: Clone> {
    inflight: Mutex<HashMap<PathBuf, Arc<OnceCell<T>>>>,
}

impl<T: Clone> FlightGroup<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `init` for `key`, sharing one execution among concurrent callers.
    pub async fn run<F, Fut>(&self, key: &Path, init: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = self
            .inflight
            .lock()
            .entry(key.to_path_buf())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let out = cell.get_or_init(init).await.clone();

        // Retire this flight, but never a newer one registered under the
        // same key by a caller that raced ahead.
        let mut map = self.inflight.lock();
        if let Some(current) = map.get(key) {
            if Arc::ptr_eq(current, &cell) {
                map.remove(key);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let group = Arc::new(FlightGroup::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = PathBuf::from("/archive/ct_a/000.zip");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let group = Arc::clone(&group);
            let calls = Arc::clone(&calls);
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                group
                    .run(&key, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        42u64
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completed_flights_are_retired() {
        let group = FlightGroup::<u64>::new();
        let key = PathBuf::from("/archive/ct_a/000.zip");

        let first = group.run(&key, || async { 1 }).await;
        let second = group.run(&key, || async { 2 }).await;
        assert_eq!(first, 1);
        // A fresh computation runs after the first one retired.
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_share() {
        let group = FlightGroup::<u64>::new();
        let a = group.run(Path::new("a"), || async { 1 }).await;
        let b = group.run(Path::new("b"), || async { 2 }).await;
        assert_eq!((a, b), (1, 2));
    }
}
