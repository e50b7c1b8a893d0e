//! Coalesces concurrent fetches of the same key into one task.
//!
//! The first caller for a key spawns the fetch; later callers subscribe to the
//! same watch channel. The fetch runs to completion even if every waiter gives
//! up, and the key is released before its outcome is published, or when the
//! fetch panics.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

pub struct SingleFlight<K, T> {
    inflight: Mutex<HashMap<K, watch::Receiver<Option<T>>>>,
}

/// Handle on an in-flight fetch
pub struct Flight<T> {
    rx: watch::Receiver<Option<T>>,
    leader: bool,
}

impl<T: Clone> Flight<T> {
    /// True for the caller whose join started the fetch
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Waits for the shared outcome. `None` means the fetch task died.
    pub async fn wait(mut self) -> Option<T> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Joins the fetch for `key`, spawning `fetch()` if none is running
    pub async fn join<F, Fut>(self: &Arc<Self>, key: K, fetch: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut inflight = self.inflight.lock().await;
        if let Some(rx) = inflight.get(&key) {
            return Flight {
                rx: rx.clone(),
                leader: false,
            };
        }

        let (tx, rx) = watch::channel(None);
        inflight.insert(key.clone(), rx.clone());
        drop(inflight);

        let this = Arc::clone(self);
        let fetch = tokio::spawn(fetch());
        tokio::spawn(async move {
            // A panicked fetch still releases the key; waiters then see `None`.
            let outcome = fetch.await.ok();
            this.inflight.lock().await.remove(&key);
            if let Some(outcome) = outcome {
                // Nobody may be listening any more; the outcome is then dropped.
                let _ = tx.send(Some(outcome));
            }
        });

        Flight { rx, leader: true }
    }

    pub async fn is_in_flight(&self, key: &K) -> bool {
        self.inflight.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_joins_share_one_fetch() {
        let flights: Arc<SingleFlight<&'static str, u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                let flight = flights
                    .join("info", || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            7
                        }
                    })
                    .await;
                flight.wait().await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_survives_abandoned_waiters() {
        let flights: Arc<SingleFlight<u8, u32>> = Arc::new(SingleFlight::new());
        let done = Arc::new(AtomicUsize::new(0));

        let flight = {
            let done = Arc::clone(&done);
            flights
                .join(1, move || async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    1
                })
                .await
        };
        assert!(flight.is_leader());

        let waited = tokio::time::timeout(Duration::from_millis(100), flight.wait()).await;
        assert!(waited.is_err());
        assert!(flights.is_in_flight(&1).await);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight(&1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_flight_after_completion() {
        let flights: Arc<SingleFlight<u8, u32>> = Arc::new(SingleFlight::new());

        let first = flights.join(1, || async { 1 }).await;
        assert_eq!(first.wait().await, Some(1));

        let second = flights.join(1, || async { 2 }).await;
        assert!(second.is_leader());
        assert_eq!(second.wait().await, Some(2));
    }

    #[tokio::test]
    async fn test_panicked_fetch_releases_key() {
        let flights: Arc<SingleFlight<u8, u32>> = Arc::new(SingleFlight::new());

        let failed = flights
            .join(1, || async {
                if true {
                    panic!("fetch blew up");
                }
                0
            })
            .await;
        assert_eq!(failed.wait().await, None);

        tokio::task::yield_now().await;
        assert!(!flights.is_in_flight(&1).await);

        let retry = flights.join(1, || async { 5 }).await;
        assert!(retry.is_leader());
        assert_eq!(retry.wait().await, Some(5));
    }
}
