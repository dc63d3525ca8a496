//! Sharded keyed pool with fixed, sliding or scope-bound entry lifetimes.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::once::Once;

/// How long an entry stays in its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Deadline measured from first insertion and never refreshed.
    Fixed(Duration),
    /// Deadline pushed back on every access.
    Sliding(Duration),
    /// Entry lives until removed or its scope is cancelled.
    Never,
}

struct Slot<V> {
    cell: Arc<Once<V>>,
    deadline: Option<Instant>,
    scope: Option<CancellationToken>,
}

impl<V> Slot<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
            || self.scope.as_ref().is_some_and(|scope| scope.is_cancelled())
    }
}

/// Keyed map of memoized cells.
///
/// Locking is per shard, so unrelated keys never contend. Expired entries
/// are treated as absent on access and physically removed by
/// [`Pool::purge_expired`], normally driven by [`spawn_reaper`].
pub struct Pool<K, V> {
    name: &'static str,
    entries: DashMap<K, Slot<V>>,
    expiry: Expiry,
    clock: Arc<dyn Clock>,
    discard: Option<fn(&V) -> bool>,
}

impl<K, V> Pool<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty pool using the system clock.
    pub fn new(name: &'static str, expiry: Expiry) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            expiry,
            clock: Arc::new(SystemClock),
            discard: None,
        }
    }

    /// Replaces the time source used for deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Values matching `predicate` are dropped from the pool right after
    /// they are produced, so the next caller loads again.
    pub fn discard_when(mut self, predicate: fn(&V) -> bool) -> Self {
        self.discard = Some(predicate);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn expiry(&self) -> Expiry {
        self.expiry
    }

    fn new_slot(&self, cell: Arc<Once<V>>, now: Instant, scope: Option<&CancellationToken>) -> Slot<V> {
        let deadline = match self.expiry {
            Expiry::Fixed(ttl) | Expiry::Sliding(ttl) => Some(now + ttl),
            Expiry::Never => None,
        };
        Slot {
            cell,
            deadline,
            scope: scope.cloned(),
        }
    }

    fn refresh(&self, slot: &mut Slot<V>, now: Instant) {
        if let Expiry::Sliding(ttl) = self.expiry {
            slot.deadline = Some(now + ttl);
        }
    }

    /// Returns the cell for `key`, creating it when absent or expired.
    ///
    /// Sliding entries have their deadline refreshed. A new entry created
    /// with `scope` expires as soon as the scope is cancelled.
    pub fn slot(&self, key: &K, scope: Option<&CancellationToken>) -> Arc<Once<V>> {
        let now = self.clock.now();
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                self.refresh(occupied.get_mut(), now);
                Arc::clone(&occupied.get().cell)
            }
            Entry::Occupied(mut occupied) => {
                let cell = Arc::new(Once::new());
                occupied.insert(self.new_slot(Arc::clone(&cell), now, scope));
                cell
            }
            Entry::Vacant(vacant) => {
                let cell = Arc::new(Once::new());
                vacant.insert(self.new_slot(Arc::clone(&cell), now, scope));
                cell
            }
        }
    }

    /// Returns the memoized value for `key`, running `load` on a miss.
    ///
    /// Concurrent callers for the same key share one `load`.
    pub async fn get_or_load<F, Fut>(&self, key: &K, scope: Option<&CancellationToken>, load: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = self.slot(key, scope);
        let value = cell.get_or_init(load).await;
        if self.discard.is_some_and(|discard| discard(&value)) {
            self.remove_cell(key, &cell);
        }
        value
    }

    /// Returns the value for `key`, creating it synchronously on a miss.
    pub fn get_or_insert_with<F>(&self, key: &K, create: F) -> V
    where
        F: FnOnce() -> V,
    {
        let now = self.clock.now();
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                self.refresh(occupied.get_mut(), now);
                if let Some(value) = occupied.get().cell.get() {
                    return value;
                }
                let value = create();
                occupied.insert(self.new_slot(Arc::new(Once::ready(value.clone())), now, None));
                value
            }
            Entry::Occupied(mut occupied) => {
                let value = create();
                occupied.insert(self.new_slot(Arc::new(Once::ready(value.clone())), now, None));
                value
            }
            Entry::Vacant(vacant) => {
                let value = create();
                vacant.insert(self.new_slot(Arc::new(Once::ready(value.clone())), now, None));
                value
            }
        }
    }

    /// Returns the live cell for `key` without creating or refreshing it.
    pub fn peek(&self, key: &K) -> Option<Arc<Once<V>>> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| Arc::clone(&slot.cell))
    }

    /// Refreshes the deadline of a live sliding entry.
    ///
    /// Returns `false` when the key is absent or expired.
    pub fn touch(&self, key: &K) -> bool {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(mut slot) if !slot.is_expired(now) => {
                self.refresh(slot.value_mut(), now);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    /// Whether `key` is still present, including expired entries the reaper
    /// has not removed yet.
    pub fn is_registered(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes `key` regardless of its deadline.
    pub fn remove(&self, key: &K) -> Option<Arc<Once<V>>> {
        self.entries.remove(key).map(|(_, slot)| slot.cell)
    }

    /// Removes `key` only if it still maps to `cell`.
    fn remove_cell(&self, key: &K, cell: &Arc<Once<V>>) -> bool {
        self.entries
            .remove_if(key, |_, slot| Arc::ptr_eq(&slot.cell, cell))
            .is_some()
    }

    /// Removes every expired entry and returns what was removed.
    ///
    /// Each shard is swept under its own lock, so a concurrent access either
    /// refreshes an entry before the sweep sees it or creates a fresh one
    /// after the stale entry is gone.
    pub fn purge_expired(&self) -> Vec<(K, Arc<Once<V>>)> {
        let now = self.clock.now();
        let mut removed = Vec::new();
        self.entries.retain(|key, slot| {
            if slot.is_expired(now) {
                removed.push((key.clone(), Arc::clone(&slot.cell)));
                false
            } else {
                true
            }
        });
        removed
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<(K, Arc<Once<V>>)> {
        let mut removed = Vec::new();
        self.entries.retain(|key, slot| {
            removed.push((key.clone(), Arc::clone(&slot.cell)));
            false
        });
        removed
    }

    /// Keys of all entries, expired or not.
    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Spawns the single reaper task of a pool.
///
/// Every `period` the reaper purges expired entries and hands each one to
/// `on_expired`. The task holds only a weak reference and exits once the
/// pool is dropped.
pub fn spawn_reaper<K, V, F>(pool: &Arc<Pool<K, V>>, period: Duration, on_expired: F) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(K, Arc<Once<V>>) + Send + 'static,
{
    let pool = Arc::downgrade(pool);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };

            let expired = pool.purge_expired();
            if !expired.is_empty() {
                debug!("Pool {} expired {} entries", pool.name(), expired.len());
            }
            drop(pool);

            for (key, cell) in expired {
                on_expired(key, cell);
            }
        }
    })
}
