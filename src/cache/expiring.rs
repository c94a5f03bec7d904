//! Concurrent key/value store with per-entry time-to-live.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default period between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

type Storage<V> = DashMap<String, Entry<V>>;

/// A stored value together with its absolute expiration time.
struct Entry<V> {
    expires_at: Instant,
    value: Arc<V>,
}

impl<V> Entry<V> {
    /// An entry is expired once `now` reaches `expires_at`.
    /// Both lookups and the sweeper use this predicate.
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Key/value store where every entry expires a fixed TTL after it was written.
///
/// Expired entries are hidden from [`load`](Self::load) immediately, whether or
/// not a sweep has physically removed them yet. Values are handed out as
/// `Arc<V>`, so repeated hits on the same entry return the same instance.
///
/// Cloning the map is cheap; clones share the same storage.
pub struct ExpiringMap<V> {
    ttl: Duration,
    data: Arc<Storage<V>>,
}

impl<V> Clone for ExpiringMap<V> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            data: Arc::clone(&self.data),
        }
    }
}

impl<V> ExpiringMap<V> {
    /// Creates an empty map whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            data: Arc::new(DashMap::new()),
        }
    }

    /// Returns the configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Inserts or replaces the entry for `key`, expiring `ttl` from now.
    pub fn store(&self, key: impl Into<String>, value: V) {
        self.store_arc(key, Arc::new(value));
    }

    /// Same as [`store`](Self::store) for a value that is already shared.
    pub fn store_arc(&self, key: impl Into<String>, value: Arc<V>) {
        let entry = Entry {
            expires_at: Instant::now() + self.ttl,
            value,
        };
        self.data.insert(key.into(), entry);
    }

    /// Returns the value for `key` unless it is missing or expired.
    pub fn load(&self, key: &str) -> Option<Arc<V>> {
        let entry = self.data.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(Arc::clone(&entry.value))
    }

    /// Number of physically stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Removes every entry that is expired at `now`.
    /// Returns the number of removed entries.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        sweep(&self.data, now)
    }
}

impl<V: Send + Sync + 'static> ExpiringMap<V> {
    /// Spawns a task that sweeps expired entries every `period`.
    ///
    /// The task holds only a weak reference to the storage and exits on its
    /// own once every handle to the map is dropped. Use the returned
    /// [`SweepTask`] to stop it earlier. Must be called within a Tokio runtime.
    pub fn spawn_sweeper(&self, period: Duration) -> SweepTask {
        let data = Arc::downgrade(&self.data);
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(data, period, token.clone()));

        SweepTask {
            token,
            handle: Some(handle),
        }
    }
}

async fn run_sweeper<V>(data: Weak<Storage<V>>, period: Duration, token: CancellationToken) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let Some(data) = data.upgrade() else {
                    break;
                };

                let removed = sweep(&data, Instant::now());
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = data.len(),
                        "certificate cache sweep completed"
                    );
                }
            }
        }
    }

    debug!("certificate cache sweeper stopped");
}

fn sweep<V>(data: &Storage<V>, now: Instant) -> usize {
    let mut removed = 0;
    data.retain(|_, entry| {
        let expired = entry.is_expired(now);
        if expired {
            removed += 1;
        }
        !expired
    });
    removed
}

/// Handle to a running background sweeper.
///
/// Dropping the handle cancels the task; [`shutdown`](Self::shutdown) also
/// waits for it to finish.
#[derive(Debug)]
pub struct SweepTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SweepTask {
    /// Stops the sweeper and waits for it to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Returns true once the sweeper task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for SweepTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
