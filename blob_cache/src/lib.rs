//! A bounded, byte-weighted cache of expensively decoded values that
//! coalesces concurrent fills for the same key, see [`SharedCache`].

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use lru::LruCache;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, future::Future, sync::Arc};
use tokio::sync::oneshot;

/// Size of a cached value in bytes, for cache accounting.
///
/// The weight of an entry is computed once, when the fill completes, and must
/// not change afterwards: cached values are immutable.
pub trait Weigh {
    /// Number of bytes this value occupies.
    fn weight(&self) -> usize;
}

/// Marker for a fill whose driving caller went away before completion.
///
/// Not exposed: waiters observing this retry the lookup and one of them
/// becomes the next filler.
#[derive(Debug, Clone, Copy)]
struct Aborted;

/// Completion handle for an in-flight fill. Cloneable so that any number of
/// waiters can await the same outcome.
type SharedFill<V, E> = Shared<BoxFuture<'static, Result<Result<Arc<V>, E>, Aborted>>>;

struct RunningFill<V, E> {
    recv: SharedFill<V, E>,

    /// Distinguishes fills for the same key across abandon/retry cycles so a
    /// stale guard cannot deregister its successor.
    tag: u64,
}

struct CacheEntry<V> {
    value: Arc<V>,
    weight: usize,
}

struct CacheState<V, E> {
    /// Completed fills, most recently used first.
    entries: LruCache<String, CacheEntry<V>>,

    /// Sum of the weights of all `entries`.
    total_weight: usize,

    /// In-flight fills indexed by cache key.
    running: HashMap<String, RunningFill<V, E>>,

    /// Tag source for `RunningFill::tag`.
    tag_counter: u64,
}

/// A keyed cache of decoded values with single-flight fills and weighted LRU
/// eviction.
///
/// The single primitive is [`SharedCache::get_or_create`]: a hit returns the
/// stored value, a miss runs the supplied fill at most once per key no matter
/// how many callers race, and every concurrent caller observes the same
/// outcome. Successful values are installed with their [`Weigh`] weight and
/// least-recently-used entries are dropped once the total exceeds `capacity`.
/// Errors are returned to all current waiters but never memoized.
///
/// Keys are plain strings; callers namespace them (`"<filename>::<subkey>"`)
/// so that entries of distinct origins cannot collide and so that
/// [`SharedCache::invalidate_prefix`] can drop everything belonging to one
/// origin at once.
pub struct SharedCache<V, E> {
    name: &'static str,
    capacity: usize,
    state: Mutex<CacheState<V, E>>,
}

impl<V, E> fmt::Debug for SharedCache<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCache")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

enum Action<V, E> {
    /// Someone else is filling this key; await their outcome.
    Wait(SharedFill<V, E>),

    /// This caller owns the fill for this key.
    Fill {
        tx: oneshot::Sender<Result<Arc<V>, E>>,
        tag: u64,
    },
}

impl<V, E> SharedCache<V, E>
where
    V: Weigh + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty cache holding at most `capacity` bytes of decoded
    /// values. `name` shows up in log output.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                total_weight: 0,
                running: HashMap::new(),
                tag_counter: 0,
            }),
        }
    }

    /// Return the value stored under `key`, filling it via `fill` on a miss.
    ///
    /// Concurrent callers for the same key share a single fill: exactly one
    /// caller runs its closure, the rest await the broadcast outcome. Fill
    /// errors propagate to every waiting caller and are not cached; the next
    /// lookup runs a fresh fill. If the filling caller is cancelled before
    /// the fill completes, nothing is installed and the remaining waiters
    /// race to restart the fill themselves.
    pub async fn get_or_create<F, Fut>(&self, key: &str, fill: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut fill = Some(fill);

        loop {
            let action = {
                let mut state = self.state.lock();

                if let Some(entry) = state.entries.get(key) {
                    debug!(cache = self.name, key, "hit");
                    return Ok(Arc::clone(&entry.value));
                }

                if let Some(running) = state.running.get(key) {
                    debug!(cache = self.name, key, "joining in-flight fill");
                    Action::Wait(running.recv.clone())
                } else {
                    let (tx, rx) = oneshot::channel();
                    let recv = rx.map(|r| r.map_err(|_| Aborted)).boxed().shared();

                    let tag = state.tag_counter;
                    state.tag_counter += 1;

                    state
                        .running
                        .insert(key.to_string(), RunningFill { recv, tag });

                    Action::Fill { tx, tag }
                }
            };

            match action {
                Action::Wait(recv) => match recv.await {
                    Ok(result) => return result,
                    // The filler was cancelled mid-fill; take over.
                    Err(Aborted) => continue,
                },
                Action::Fill { tx, tag } => {
                    let guard = FillGuard {
                        cache: self,
                        key,
                        tag,
                        armed: true,
                    };

                    // The fill runs without holding the state lock so that
                    // waiters can subscribe and unrelated keys stay usable.
                    // Dropping this future at the await point leaves the
                    // guard to deregister the fill and wake the waiters.
                    let fill = fill.take().expect("fill ran twice");
                    let result = guard.complete(fill().await);

                    // Waiters may have gone away; that is fine.
                    tx.send(result.clone()).ok();

                    return result;
                }
            }
        }
    }

    /// Drop every installed entry whose key starts with `prefix` and detach
    /// matching in-flight fills so they cannot install afterwards (their
    /// waiters still receive the outcome).
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut state = self.state.lock();

        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();

        let removed = doomed.len();
        for key in doomed {
            if let Some(entry) = state.entries.pop(&key) {
                state.total_weight -= entry.weight;
            }
        }

        state.running.retain(|key, _| !key.starts_with(prefix));

        debug!(cache = self.name, prefix, removed, "invalidated entries");
    }

    /// Number of installed entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache holds no installed entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the weights of all installed entries, in bytes.
    pub fn total_weight(&self) -> usize {
        self.state.lock().total_weight
    }

    /// Configured weight budget in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `key` is installed. Does not count as a use for recency.
    pub fn contains_key(&self, key: &str) -> bool {
        self.state.lock().entries.peek(key).is_some()
    }

    /// Install `value` under `key` and evict least-recently-used entries
    /// until the cache is back within budget. A value heavier than the whole
    /// budget is not installed at all; installing it would only wipe the
    /// cache without ever fitting.
    fn install(&self, state: &mut CacheState<V, E>, key: &str, value: &Arc<V>) {
        let weight = value.weight();
        if weight > self.capacity {
            debug!(
                cache = self.name,
                key,
                weight,
                capacity = self.capacity,
                "value exceeds cache capacity, returning uncached"
            );
            return;
        }

        if let Some(previous) = state.entries.pop(key) {
            state.total_weight -= previous.weight;
        }

        state.entries.put(
            key.to_string(),
            CacheEntry {
                value: Arc::clone(value),
                weight,
            },
        );
        state.total_weight += weight;

        while state.total_weight > self.capacity {
            match state.entries.pop_lru() {
                Some((evicted_key, entry)) => {
                    state.total_weight -= entry.weight;
                    debug!(
                        cache = self.name,
                        key = evicted_key.as_str(),
                        weight = entry.weight,
                        "evicted"
                    );
                }
                None => break,
            }
        }
    }
}

/// Keeps the running-fill registration of a single fill consistent with the
/// fill's fate: completion installs and deregisters, cancellation (drop)
/// deregisters only. The `tag` comparison makes stale guards harmless.
struct FillGuard<'a, V, E>
where
    V: Weigh + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    cache: &'a SharedCache<V, E>,
    key: &'a str,
    tag: u64,
    armed: bool,
}

impl<V, E> FillGuard<'_, V, E>
where
    V: Weigh + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Deregister the fill and, on success, install the value. If the fill
    /// was detached by [`SharedCache::invalidate_prefix`] in the meantime,
    /// the value is returned without being cached.
    fn complete(mut self, result: Result<V, E>) -> Result<Arc<V>, E> {
        self.armed = false;

        let mut state = self.cache.state.lock();

        let still_registered = match state.running.get(self.key) {
            Some(running) if running.tag == self.tag => {
                state.running.remove(self.key);
                true
            }
            _ => false,
        };

        match result {
            Ok(value) => {
                let value = Arc::new(value);
                if still_registered {
                    self.cache.install(&mut state, self.key, &value);
                }
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }
}

impl<V, E> Drop for FillGuard<'_, V, E>
where
    V: Weigh + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        // The fill future was dropped before completing. Deregister so the
        // next caller can fill; dropping the oneshot sender wakes waiters.
        let mut state = self.cache.state.lock();
        if let Some(running) = state.running.get(self.key) {
            if running.tag == self.tag {
                state.running.remove(self.key);
            }
        }
    }
}
