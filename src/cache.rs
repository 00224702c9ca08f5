//! Bounded LRU cache with single-flight deduplication of in-flight rewrites.
//!
//! Concurrent callers asking for the same (content, instruction) key share
//! one upstream model call: the first caller through becomes the *owner* and
//! performs the call, everyone else becomes a *waiter* on the owner's
//! completion signal. One mutex guards the value map, the recency order and
//! the pending-marker table together, and is only ever held for O(1)
//! bookkeeping, never across the model call.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

/// Default maximum number of cached rewrites.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Counter snapshot, readable at any time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum PendingState {
    Pending,
    /// The owner finished. `None` means its call failed and nothing was
    /// cached; waiters degrade the same way the owner does.
    Done(Option<String>),
    /// The cache was cleared while the call was in flight.
    Cancelled,
}

type Marker = Arc<watch::Sender<PendingState>>;

enum Role {
    Owner(Marker),
    Waiter(watch::Receiver<PendingState>),
}

/// Releases an owner's pending marker if the owning future is dropped before
/// it could signal completion, waking any waiters with a cancellation instead
/// of leaving them to time out against a channel nobody will ever close.
struct OwnerGuard<'a> {
    cache: &'a SingleFlightCache,
    key: String,
    marker: Marker,
    completed: bool,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut inner = self.cache.inner.lock();
        let still_ours = inner
            .pending
            .get(&self.key)
            .is_some_and(|m| Arc::ptr_eq(m, &self.marker));
        if still_ours {
            inner.pending.remove(&self.key);
            drop(inner);
            let _ = self.marker.send(PendingState::Cancelled);
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, String>,
    /// Keys from least to most recently used.
    order: VecDeque<String>,
    pending: HashMap<String, Marker>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// The deduplicating rewrite cache. One instance is shared by every request
/// in a batch; construct and inject it explicitly rather than holding it in
/// process-wide state, so independent pipelines get independent caches.
#[derive(Debug)]
pub struct SingleFlightCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl Default for SingleFlightCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl SingleFlightCache {
    pub fn new(capacity: usize) -> Self {
        SingleFlightCache {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Builds the composite cache key: content is trimmed, lower-cased and
    /// stripped of all whitespace so cosmetic differences share an entry; the
    /// instruction identifier, when present, is appended so the same content
    /// under different instructions caches independently.
    pub fn normalize_key(content: &str, instruction_id: Option<&str>) -> String {
        let mut key: String = content
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if let Some(id) = instruction_id {
            let id = id.trim();
            if !id.is_empty() {
                key.push('|');
                key.push_str(&id.to_lowercase());
            }
        }
        key
    }

    /// Returns the cached rewrite for the key, or resolves it via `resolve`.
    ///
    /// Exactly one concurrent caller per key runs `resolve`; the rest wait up
    /// to `wait_timeout` for its outcome. Returns `None` when the resolution
    /// failed (`resolve` yielded `None`), the wait timed out, or the cache
    /// was cleared mid-flight. The caller is expected to fall back to its
    /// unrewritten content.
    pub async fn get_or_resolve<F, Fut>(
        &self,
        content: &str,
        instruction_id: Option<&str>,
        resolve: F,
        wait_timeout: Duration,
    ) -> Option<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<String>>,
    {
        let key = Self::normalize_key(content, instruction_id);
        let role = {
            let mut inner = self.inner.lock();
            if let Some(value) = inner.entries.get(&key).cloned() {
                inner.hits += 1;
                Self::bump(&mut inner.order, &key);
                return Some(value);
            }
            inner.misses += 1;
            match inner.pending.get(&key) {
                Some(marker) => Role::Waiter(marker.subscribe()),
                None => {
                    let (tx, _rx) = watch::channel(PendingState::Pending);
                    let marker = Arc::new(tx);
                    inner.pending.insert(key.clone(), Arc::clone(&marker));
                    Role::Owner(marker)
                }
            }
        };

        match role {
            Role::Owner(marker) => {
                // If this future is dropped mid-call (task cancellation), the
                // guard releases the marker so the key is not poisoned until
                // the next clear(). A marker must never outlive its call.
                let mut guard = OwnerGuard {
                    cache: self,
                    key,
                    marker,
                    completed: false,
                };
                // The model call happens with no lock held.
                let outcome = resolve().await;
                guard.completed = true;
                let mut inner = self.inner.lock();
                let still_ours = inner
                    .pending
                    .get(&guard.key)
                    .is_some_and(|m| Arc::ptr_eq(m, &guard.marker));
                if still_ours {
                    inner.pending.remove(&guard.key);
                    if let Some(value) = &outcome {
                        self.insert_locked(&mut inner, guard.key.clone(), value.clone());
                    }
                    let _ = guard.marker.send(PendingState::Done(outcome.clone()));
                } else {
                    // Cleared out from under us mid-flight. The waiters were
                    // already cancelled; the result is only for this caller.
                    debug!("cache was cleared during an in-flight rewrite; skipping insertion");
                }
                outcome
            }
            Role::Waiter(mut rx) => {
                let waited = timeout(
                    wait_timeout,
                    rx.wait_for(|state| !matches!(state, PendingState::Pending)),
                )
                .await;
                match waited {
                    Ok(Ok(state)) => match &*state {
                        PendingState::Done(value) => value.clone(),
                        _ => None,
                    },
                    // Owner dropped without signalling; treat like a failure.
                    Ok(Err(_)) => None,
                    Err(_) => {
                        warn!(
                            "gave up waiting for an in-flight rewrite after {:?}; the owner may still populate the cache later",
                            wait_timeout
                        );
                        None
                    }
                }
            }
        }
    }

    /// Drops every cached entry and cancels every pending marker. Waiters
    /// wake promptly with no result; owners mid-flight run to completion and
    /// skip their now-stale insertion.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        let pending: Vec<Marker> = inner.pending.drain().map(|(_, m)| m).collect();
        drop(inner);
        for marker in pending {
            let _ = marker.send(PendingState::Cancelled);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.entries.len(),
        }
    }

    fn bump(order: &mut VecDeque<String>, key: &str) {
        if let Some(position) = order.iter().position(|k| k == key) {
            if let Some(key) = order.remove(position) {
                order.push_back(key);
            }
        }
    }

    fn insert_locked(&self, inner: &mut CacheInner, key: String, value: String) {
        if self.capacity == 0 {
            return;
        }
        if inner.entries.contains_key(&key) {
            inner.entries.insert(key.clone(), value);
            Self::bump(&mut inner.order, &key);
            return;
        }
        if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(key, value);
    }
}

#[cfg(test)]
mod test_cache {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    async fn warm(cache: &SingleFlightCache, content: &str, value: &str) {
        let value = value.to_string();
        let out = cache
            .get_or_resolve(content, None, || async move { Some(value) }, Duration::from_secs(1))
            .await;
        assert!(out.is_some());
    }

    #[tokio::test]
    async fn test_hit_returns_cached_value_without_resolving() {
        let cache = SingleFlightCache::new(10);
        warm(&cache, "a red fox", "rewritten").await;
        let out = cache
            .get_or_resolve(
                "a red fox",
                None,
                || async { panic!("resolver must not run on a hit") },
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(out.as_deref(), Some("rewritten"));
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_key_normalization_shares_entries() {
        let cache = SingleFlightCache::new(10);
        warm(&cache, "  A Red   Fox ", "rewritten").await;
        let out = cache
            .get_or_resolve(
                "a red fox",
                None,
                || async { panic!("case/whitespace variants must share one entry") },
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(out.as_deref(), Some("rewritten"));
    }

    #[tokio::test]
    async fn test_instruction_id_keys_independently() {
        let cache = SingleFlightCache::new(10);
        let calls = AtomicUsize::new(0);
        for id in [Some("artsy"), Some("ARTSY"), Some("photo"), None] {
            cache
                .get_or_resolve(
                    "a fox",
                    id,
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Some("x".to_string())
                    },
                    Duration::from_secs(1),
                )
                .await;
        }
        // "artsy" and "ARTSY" share a key; "photo" and no-id do not
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache = SingleFlightCache::new(10);
        let out = cache
            .get_or_resolve("a fox", None, || async { None }, Duration::from_secs(1))
            .await;
        assert!(out.is_none());
        assert_eq!(cache.len(), 0);
        // a later caller gets a fresh attempt
        warm(&cache, "a fox", "second try").await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_coalesces_concurrent_callers() {
        let cache = Arc::new(SingleFlightCache::new(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_resolve(
                        "same content",
                        Some("same-id"),
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Some("shared".to_string())
                        },
                        Duration::from_secs(5),
                    )
                    .await
            }));
        }
        let results = futures::future::join_all(handles).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap().as_deref(), Some("shared"));
        }
    }

    #[tokio::test]
    async fn test_lru_eviction_order() {
        let cache = SingleFlightCache::new(2);
        warm(&cache, "a", "va").await;
        warm(&cache, "b", "vb").await;
        // touch "a" so "b" is now the eviction candidate
        let out = cache
            .get_or_resolve("a", None, || async { panic!("hit expected") }, Duration::from_secs(1))
            .await;
        assert_eq!(out.as_deref(), Some("va"));
        warm(&cache, "c", "vc").await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        // "a" survived the insert of "c", and this hit makes it most
        // recently used again
        let out = cache
            .get_or_resolve("a", None, || async { panic!("hit expected") }, Duration::from_secs(1))
            .await;
        assert_eq!(out.as_deref(), Some("va"));
        // "b" was evicted: resolving it again calls the resolver and pushes
        // out "c", now the oldest untouched key
        let calls = AtomicUsize::new(0);
        cache
            .get_or_resolve(
                "b",
                None,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Some("vb2".to_string())
                },
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().evictions, 2);
        // "a" is still resident after "c" went
        let out = cache
            .get_or_resolve("a", None, || async { panic!("hit expected") }, Duration::from_secs(1))
            .await;
        assert_eq!(out.as_deref(), Some("va"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_clear_cancels_waiters_promptly() {
        let cache = Arc::new(SingleFlightCache::new(10));
        let owner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_resolve(
                        "slow",
                        None,
                        || async {
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            Some("late".to_string())
                        },
                        Duration::from_secs(30),
                    )
                    .await
            })
        };
        // let the owner claim the marker
        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let started = Instant::now();
                let out = cache
                    .get_or_resolve(
                        "slow",
                        None,
                        || async { panic!("a waiter must not resolve") },
                        Duration::from_secs(30),
                    )
                    .await;
                (out, started.elapsed())
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.clear();
        let (out, elapsed) = waiter.await.unwrap();
        assert!(out.is_none());
        assert!(elapsed < Duration::from_secs(2), "waiter should wake on clear, not time out");
        owner.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_owner_completes_after_clear_without_inserting() {
        let cache = Arc::new(SingleFlightCache::new(10));
        let owner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_resolve(
                        "slow",
                        None,
                        || async {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Some("done".to_string())
                        },
                        Duration::from_secs(5),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.clear();
        // the owner still gets its own result, but nothing is cached
        assert_eq!(owner.await.unwrap().as_deref(), Some("done"));
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_aborted_owner_releases_marker() {
        let cache = Arc::new(SingleFlightCache::new(10));
        let owner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_resolve(
                        "slow",
                        None,
                        || async {
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            Some("never".to_string())
                        },
                        Duration::from_secs(30),
                    )
                    .await
            })
        };
        // let the owner claim the marker, then cancel it mid-call
        tokio::time::sleep(Duration::from_millis(50)).await;
        owner.abort();
        let _ = owner.await;
        // a fresh caller must not inherit the dead owner's marker: it becomes
        // the new owner and resolves the key itself, well within its wait
        let calls = AtomicUsize::new(0);
        let started = Instant::now();
        let out = cache
            .get_or_resolve(
                "slow",
                None,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Some("fresh".to_string())
                },
                Duration::from_millis(500),
            )
            .await;
        assert_eq!(out.as_deref(), Some("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_aborted_owner_wakes_waiters() {
        let cache = Arc::new(SingleFlightCache::new(10));
        let owner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_resolve(
                        "slow",
                        None,
                        || async {
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            Some("never".to_string())
                        },
                        Duration::from_secs(30),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let started = Instant::now();
                let out = cache
                    .get_or_resolve(
                        "slow",
                        None,
                        || async { panic!("a waiter must not resolve") },
                        Duration::from_secs(30),
                    )
                    .await;
                (out, started.elapsed())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        owner.abort();
        let (out, elapsed) = waiter.await.unwrap();
        assert!(out.is_none());
        assert!(elapsed < Duration::from_secs(2), "waiter should wake on owner cancellation, not time out");
    }

    #[tokio::test]
    async fn test_waiter_timeout_returns_none() {
        let cache = Arc::new(SingleFlightCache::new(10));
        let owner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_resolve(
                        "slow",
                        None,
                        || async {
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            Some("late".to_string())
                        },
                        Duration::from_secs(30),
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;
        let out = cache
            .get_or_resolve(
                "slow",
                None,
                || async { panic!("a waiter must not resolve") },
                Duration::from_millis(100),
            )
            .await;
        assert!(out.is_none());
        owner.abort();
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(
            SingleFlightCache::normalize_key(" A  Red\tFox ", None),
            SingleFlightCache::normalize_key("aredfox", None)
        );
        assert_ne!(
            SingleFlightCache::normalize_key("a fox", Some("artsy")),
            SingleFlightCache::normalize_key("a fox", None)
        );
        assert_eq!(
            SingleFlightCache::normalize_key("a fox", Some("Artsy")),
            SingleFlightCache::normalize_key("a fox", Some("artsy"))
        );
    }
}
