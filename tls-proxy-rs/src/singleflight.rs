//! Keyed single-flight execution
//!
//! Concurrent callers asking for the same key share one execution of the
//! underlying work. The work runs on its own task, so it completes even if
//! every caller gives up waiting (for example a handshake that timed out),
//! and its outcome is broadcast to everyone who joined while it ran.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::watch;

/// Collapses concurrent calls for the same key into one
pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
{
    calls: Arc<DashMap<K, watch::Receiver<Option<V>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty group
    pub fn new() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
        }
    }

    /// Run `work` for `key` unless a call for `key` is already in flight, in
    /// which case wait for that call's result instead.
    ///
    /// Returns `None` only if the in-flight work panicked.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Option<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut rx = match self.calls.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx.clone());

                let guard = FlightGuard {
                    calls: Arc::clone(&self.calls),
                    key,
                };
                let fut = work();
                tokio::spawn(async move {
                    let value = fut.await;
                    // Unregister before publishing so a caller arriving after
                    // the result starts a fresh flight
                    drop(guard);
                    let _ = tx.send(Some(value));
                });
                rx
            }
        };

        let result = rx.wait_for(Option::is_some).await.ok()?;
        result.clone()
    }

    /// Whether a call for `key` is currently running
    pub fn in_flight(&self, key: &K) -> bool {
        self.calls.contains_key(key)
    }

    /// Number of keys with a call in flight
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// Removes the key when the flight finishes or its task panics
struct FlightGuard<K, V>
where
    K: Eq + Hash,
{
    calls: Arc<DashMap<K, watch::Receiver<Option<V>>>>,
    key: K,
}

impl<K, V> Drop for FlightGuard<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        self.calls.remove(&self.key);
    }
}
