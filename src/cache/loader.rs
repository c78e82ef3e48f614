//! Single-flight load coordination.
//!
//! The first caller to miss on a key installs a pending slot and runs the
//! value loader; concurrent callers for the same key join the slot and wait
//! for its outcome. The slot is cleared when the load finishes, fails or is
//! cancelled, so the next miss starts a fresh load.

use crate::error::Error;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Failure shared by every caller of one load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    /// The loader returned an error.
    Failed(String),
    /// The loader exceeded its deadline.
    TimedOut,
}

impl From<LoadFailure> for Error {
    fn from(failure: LoadFailure) -> Self {
        match failure {
            LoadFailure::Failed(cause) => Error::LoaderFailed(cause),
            LoadFailure::TimedOut => Error::LoaderTimeout,
        }
    }
}

/// Outcome published to joiners.
pub type LoadOutcome = Result<Bytes, LoadFailure>;

type Slot = Arc<watch::Sender<Option<LoadOutcome>>>;

/// Role of a caller that missed on a key.
pub enum Acquired {
    /// The caller must run the loader and complete the guard.
    Installer(LoadGuard),
    /// Another caller is loading; wait on the slot.
    Joiner(LoadWaiter),
}

/// Held by the installer; clears the slot when dropped.
pub struct LoadGuard {
    key: String,
    slot: Slot,
    inflight: Arc<DashMap<String, Slot>>,
    completed: bool,
}

impl LoadGuard {
    /// Key being loaded.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish the outcome to every joiner and release the slot.
    pub fn complete(mut self, outcome: LoadOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: LoadOutcome) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.slot.send_replace(Some(outcome));
        let slot = self.slot.clone();
        self.inflight
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, &slot));
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        // Installer cancelled before completing.
        self.finish(Err(LoadFailure::Failed("load cancelled".to_string())));
    }
}

/// Held by a joiner.
pub struct LoadWaiter {
    rx: watch::Receiver<Option<LoadOutcome>>,
}

impl LoadWaiter {
    /// Wait up to `timeout` for the in-flight load. A timeout here does not
    /// affect the load itself.
    pub async fn wait(mut self, timeout: Duration) -> Result<Bytes, Error> {
        let waited = tokio::time::timeout(timeout, self.rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(outcome)) => match outcome.clone() {
                Some(Ok(value)) => Ok(value),
                Some(Err(failure)) => Err(failure.into()),
                None => Err(Error::Internal("load slot published nothing".into())),
            },
            Ok(Err(_)) => Err(Error::LoaderFailed("load abandoned".to_string())),
            Err(_) => Err(Error::LoaderTimeout),
        }
    }
}

/// Table of in-flight loads.
#[derive(Default)]
pub struct LoadCoordinator {
    inflight: Arc<DashMap<String, Slot>>,
}

impl LoadCoordinator {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a slot for `key`, or join the one already there.
    pub fn acquire(&self, key: &str) -> Acquired {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(existing) => Acquired::Joiner(LoadWaiter {
                rx: existing.get().subscribe(),
            }),
            Entry::Vacant(vacant) => {
                let (tx, _rx) = watch::channel(None);
                let slot = Arc::new(tx);
                vacant.insert(slot.clone());
                Acquired::Installer(LoadGuard {
                    key: key.to_string(),
                    slot,
                    inflight: self.inflight.clone(),
                    completed: false,
                })
            }
        }
    }

    /// Number of loads in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

impl std::fmt::Debug for LoadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadCoordinator")
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn installer(acquired: Acquired) -> LoadGuard {
        match acquired {
            Acquired::Installer(guard) => guard,
            Acquired::Joiner(_) => panic!("expected installer"),
        }
    }

    fn joiner(acquired: Acquired) -> LoadWaiter {
        match acquired {
            Acquired::Joiner(waiter) => waiter,
            Acquired::Installer(_) => panic!("expected joiner"),
        }
    }

    #[tokio::test]
    async fn test_joiners_share_installer_result() {
        let loads = LoadCoordinator::new();
        let guard = installer(loads.acquire("Paris"));
        let waiters: Vec<_> = (0..5).map(|_| joiner(loads.acquire("Paris"))).collect();
        assert_eq!(loads.in_flight(), 1);

        guard.complete(Ok(Bytes::from_static(b"sunny")));
        assert_eq!(loads.in_flight(), 0);

        for waiter in waiters {
            let value = waiter.wait(Duration::from_secs(1)).await.unwrap();
            assert_eq!(&value[..], b"sunny");
        }
    }

    #[tokio::test]
    async fn test_failure_reaches_all_joiners_and_clears_slot() {
        let loads = LoadCoordinator::new();
        let guard = installer(loads.acquire("k"));
        let a = joiner(loads.acquire("k"));
        let b = joiner(loads.acquire("k"));

        guard.complete(Err(LoadFailure::Failed("backend down".into())));
        for waiter in [a, b] {
            match waiter.wait(Duration::from_secs(1)).await {
                Err(Error::LoaderFailed(cause)) => assert_eq!(cause, "backend down"),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }

        // The next miss retries.
        assert!(matches!(loads.acquire("k"), Acquired::Installer(_)));
    }

    #[tokio::test]
    async fn test_loader_timeout_is_shared() {
        let loads = LoadCoordinator::new();
        let guard = installer(loads.acquire("k"));
        let waiter = joiner(loads.acquire("k"));
        guard.complete(Err(LoadFailure::TimedOut));
        assert!(matches!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(Error::LoaderTimeout)
        ));
    }

    #[tokio::test]
    async fn test_joiner_timeout_leaves_load_running() {
        let loads = LoadCoordinator::new();
        let guard = installer(loads.acquire("k"));
        let impatient = joiner(loads.acquire("k"));
        let patient = joiner(loads.acquire("k"));

        assert!(matches!(
            impatient.wait(Duration::from_millis(20)).await,
            Err(Error::LoaderTimeout)
        ));
        assert_eq!(loads.in_flight(), 1);

        guard.complete(Ok(Bytes::from_static(b"v")));
        assert!(patient.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_installer_releases_slot() {
        let loads = LoadCoordinator::new();
        let guard = installer(loads.acquire("k"));
        let waiter = joiner(loads.acquire("k"));
        drop(guard);

        assert_eq!(loads.in_flight(), 0);
        assert!(matches!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(Error::LoaderFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_at_most_one_installer_under_contention() {
        let loads = Arc::new(LoadCoordinator::new());
        let installers = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..50 {
            let loads = loads.clone();
            let installers = installers.clone();
            handles.push(tokio::spawn(async move {
                match loads.acquire("hot") {
                    Acquired::Installer(guard) => {
                        installers.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        guard.complete(Ok(Bytes::from_static(b"v")));
                        Ok(Bytes::from_static(b"v"))
                    }
                    Acquired::Joiner(waiter) => waiter.wait(Duration::from_secs(5)).await,
                }
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(installers.load(Ordering::SeqCst), 1);
    }
}
