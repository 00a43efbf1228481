//! Single-flight cache of traceroute results keyed by remote IP.
//!
//! The first close event for a remote IP reserves the entry and owns the
//! measurement; everyone else arriving before the entry expires gets a
//! waiter bound to the same entry. Entries move from pending to exactly
//! one terminal state and are removed only by the TTL sweep, never while
//! still pending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CacheConfig;

/// Terminal state of a trace cache entry.
#[derive(Debug, Clone)]
pub enum TraceOutcome {
    /// The measurement succeeded; `payload` is the full artifact bytes
    /// and `uuid` identifies the flow that ran it.
    Ready { payload: Arc<[u8]>, uuid: String },
    /// The measurement failed; waiters should not re-run it.
    Failed,
}

#[derive(Debug, Clone)]
enum EntryState {
    Pending,
    Done(TraceOutcome),
}

struct Entry {
    created: Instant,
    state: watch::Sender<EntryState>,
}

/// Result of reserving a remote IP in the cache.
pub enum Reservation {
    /// The caller won the reservation and must publish exactly once.
    Owner(Owner),
    /// Someone else owns the measurement; wait for their result.
    Waiter(Waiter),
}

/// Exclusive right to publish the result for one remote IP.
///
/// Consumed by [`FingerprintCache::publish`]; the type system makes a
/// second publish for the same reservation impossible.
pub struct Owner {
    key: String,
}

impl Owner {
    /// The remote IP this reservation covers.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Handle bound to an in-progress entry.
pub struct Waiter {
    rx: watch::Receiver<EntryState>,
}

impl Waiter {
    /// Block until the bound entry reaches a terminal state.
    ///
    /// Returns `None` if the entry vanished without ever being
    /// published, which only happens on shutdown.
    pub async fn wait(mut self) -> Option<TraceOutcome> {
        let state = self
            .rx
            .wait_for(|s| matches!(s, EntryState::Done(_)))
            .await
            .ok()?;
        match &*state {
            EntryState::Done(outcome) => Some(outcome.clone()),
            EntryState::Pending => None,
        }
    }
}

/// Map from remote IP to the state of its most recent measurement.
pub struct FingerprintCache {
    cfg: CacheConfig,
    entries: parking_lot::Mutex<HashMap<String, Entry>>,
}

impl FingerprintCache {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            cfg,
            entries: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Atomically insert a pending entry for `remote_ip` if none exists.
    ///
    /// Exactly one caller per key wins [`Reservation::Owner`]; every
    /// concurrent and subsequent caller receives a waiter until the
    /// entry is evicted.
    pub fn reserve(&self, remote_ip: &str) -> Reservation {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(remote_ip) {
            return Reservation::Waiter(Waiter {
                rx: entry.state.subscribe(),
            });
        }

        let (tx, _rx) = watch::channel(EntryState::Pending);
        entries.insert(
            remote_ip.to_string(),
            Entry {
                created: Instant::now(),
                state: tx,
            },
        );

        Reservation::Owner(Owner {
            key: remote_ip.to_string(),
        })
    }

    /// Set the terminal state for an owned entry and wake all waiters.
    pub fn publish(&self, owner: Owner, outcome: TraceOutcome) {
        let entries = self.entries.lock();
        if let Some(entry) = entries.get(&owner.key) {
            let _ = entry.state.send(EntryState::Done(outcome));
        }
    }

    /// Number of live entries, pending included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove terminal entries older than the configured entry timeout.
    /// Pending entries are never removed regardless of age.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let ttl = self.cfg.entry_timeout;

        entries.retain(|_, entry| {
            let terminal = matches!(&*entry.state.borrow(), EntryState::Done(_));
            !(terminal && entry.created.elapsed() > ttl)
        });

        before - entries.len()
    }

    /// Spawn the periodic sweep task, stopped by `cancel`.
    pub fn start_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let cache = Arc::clone(self);
        let period = cache.cfg.scan_period;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = cache.len(), "swept trace cache");
                        }
                    }
                }
            }
        });
    }
}
