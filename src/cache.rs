//! Fingerprint → result cache with single-flight semantics (spec §4.G).
//! Internally synchronized (§5 "Cache... single-flight uses a per-fingerprint
//! wait-handle"); eviction is LRU under a byte budget via the `lru` crate,
//! the same dependency `seanchatmangpt-knhk` in the retrieval pack reaches
//! for to bound an in-memory index.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};

struct Entry<T> {
    value: T,
    expires_at: Instant,
    bytes: usize,
}

struct InFlight<T> {
    notify: Notify,
    result: RwLock<Option<T>>,
}

struct Inner<T> {
    entries: LruCache<String, Entry<T>>,
    total_bytes: usize,
    in_flight: HashMap<String, Arc<InFlight<T>>>,
}

pub struct Cache<T: Clone + Send + Sync + 'static> {
    inner: Mutex<Inner<T>>,
    ttl: Duration,
    byte_budget: usize,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

pub enum Lookup<T> {
    Hit(T),
    Miss,
}

impl<T: Clone + Send + Sync + 'static> Cache<T> {
    pub fn new(ttl_ms: u64, byte_budget_mb: u64) -> Self {
        Cache {
            inner: Mutex::new(Inner {
                entries: LruCache::new(NonZeroUsize::new(4096).unwrap()),
                total_bytes: 0,
                in_flight: HashMap::new(),
            }),
            ttl: Duration::from_millis(ttl_ms),
            byte_budget: (byte_budget_mb as usize) * 1024 * 1024,
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(std::sync::atomic::Ordering::Relaxed) as f64;
        let misses = self.misses.load(std::sync::atomic::Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    pub async fn peek(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock().await;
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            _ => None,
        }
    }

    /// Looks up `key`; on miss, becomes the sole builder (single-flight) and
    /// runs `build`, or waits on whoever already is one, up to `deadline`.
    /// Returns `(value, degraded)`: `degraded=true` means the deadline hit
    /// before a build completed and an empty fallback was used.
    pub async fn get_or_build<F, Fut>(
        &self,
        key: &str,
        bytes_hint: usize,
        deadline: Instant,
        empty: T,
        build: F,
    ) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get(key) {
            if entry.expires_at > Instant::now() {
                self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return (entry.value.clone(), false);
            }
        }

        if let Some(in_flight) = inner.in_flight.get(key).cloned() {
            drop(inner);
            return self.wait_for(in_flight, deadline, empty).await;
        }

        let in_flight = Arc::new(InFlight {
            notify: Notify::new(),
            result: RwLock::new(None),
        });
        inner.in_flight.insert(key.to_string(), in_flight.clone());
        drop(inner);
        self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let value = build().await;

        {
            let mut result = in_flight.result.write().await;
            *result = Some(value.clone());
        }
        in_flight.notify.notify_waiters();

        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(key);
        self.insert(&mut inner, key, value.clone(), bytes_hint);

        (value, false)
    }

    async fn wait_for(&self, in_flight: Arc<InFlight<T>>, deadline: Instant, empty: T) -> (T, bool) {
        self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let waited = tokio::time::timeout(remaining, in_flight.notify.notified()).await;
        if waited.is_err() {
            let partial = in_flight.result.read().await.clone();
            return (partial.unwrap_or(empty), true);
        }
        let result = in_flight.result.read().await.clone();
        (result.unwrap_or(empty), false)
    }

    fn insert(&self, inner: &mut Inner<T>, key: &str, value: T, bytes: usize) {
        inner.entries.put(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
                bytes,
            },
        );
        inner.total_bytes += bytes;

        while inner.total_bytes > self.byte_budget {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.total_bytes = inner.total_bytes.saturating_sub(evicted.bytes),
                None => break,
            }
        }
    }

    pub async fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.pop(key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn single_flight_runs_builder_once() {
        let cache: Arc<Cache<u32>> = Arc::new(Cache::new(5_000, 32));
        let build_count = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let build_count = build_count.clone();
            handles.push(tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_millis(500);
                cache
                    .get_or_build("fp1", 8, deadline, 0, || async move {
                        build_count.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        42
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert!(results.iter().all(|(v, _)| *v == 42));
        assert_eq!(build_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_expiry_triggers_rebuild() {
        let cache: Cache<u32> = Cache::new(1, 32);
        let deadline = Instant::now() + Duration::from_millis(200);
        let (v1, _) = cache.get_or_build("fp1", 8, deadline, 0, || async { 1 }).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let deadline = Instant::now() + Duration::from_millis(200);
        let (v2, _) = cache.get_or_build("fp1", 8, deadline, 0, || async { 2 }).await;
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);
    }
}
