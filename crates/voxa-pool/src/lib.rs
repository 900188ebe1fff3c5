// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pre-warmed client pools.
//!
//! Each session leases one STT, TTS and LLM handle for its lifetime.  A
//! leased handle is exclusive to that session; dropping the lease returns it
//! to the warm set, while [`Lease::discard`] removes an errored handle so a
//! fresh one is built on the next acquire.  Internal state is serialised
//! through a single mutex per pool.

use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use voxa_config::PoolConfig;

#[derive(Debug, Error)]
pub enum PoolError {
    /// All handles leased and the wait timed out.  Surfaces at session
    /// connect only; existing sessions are unaffected.
    #[error("pool {pool:?} exhausted")]
    Exhausted { pool: String },
}

struct State<T> {
    /// Warm handles with the instant they were returned.
    idle: Vec<(T, Instant)>,
    /// Warm + leased handles currently alive.
    total: usize,
}

struct PoolInner<T> {
    name: String,
    state: Mutex<State<T>>,
    returned: Notify,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    max: usize,
    lease_timeout: Duration,
    idle_evict: Duration,
}

pub struct ResourcePool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Send + 'static> ResourcePool<T> {
    /// Build a pool and eagerly construct the warm set.
    pub fn new(
        name: impl Into<String>,
        cfg: &PoolConfig,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        let warm = cfg.warm.min(cfg.max);
        let now = Instant::now();
        let idle: Vec<(T, Instant)> = (0..warm).map(|_| (factory(), now)).collect();
        let total = idle.len();
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                state: Mutex::new(State { idle, total }),
                returned: Notify::new(),
                factory: Box::new(factory),
                max: cfg.max,
                lease_timeout: Duration::from_millis(cfg.lease_timeout_ms),
                idle_evict: Duration::from_secs(cfg.idle_evict_secs),
            }),
        }
    }

    /// Lease a handle for `session_id`, waiting up to the configured lease
    /// timeout for one to free up.
    pub async fn acquire(&self, session_id: &str) -> Result<Lease<T>, PoolError> {
        let deadline = Instant::now() + self.inner.lease_timeout;
        loop {
            if let Some(value) = self.try_take() {
                debug!(pool = %self.inner.name, session_id, "pool handle leased");
                return Ok(Lease {
                    value: Some(value),
                    pool: Arc::clone(&self.inner),
                });
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => {
                    warn!(pool = %self.inner.name, session_id, "pool exhausted");
                    return Err(PoolError::Exhausted { pool: self.inner.name.clone() });
                }
            };
            if tokio::time::timeout(remaining, self.inner.returned.notified())
                .await
                .is_err()
            {
                warn!(pool = %self.inner.name, session_id, "pool exhausted");
                return Err(PoolError::Exhausted { pool: self.inner.name.clone() });
            }
        }
    }

    fn try_take(&self) -> Option<T> {
        let mut state = self.inner.state.lock().unwrap();
        // Evict warm handles past the idle age before handing anything out.
        let evict_before = Instant::now().checked_sub(self.inner.idle_evict);
        if let Some(cutoff) = evict_before {
            let before = state.idle.len();
            state.idle.retain(|(_, since)| *since > cutoff);
            state.total -= before - state.idle.len();
        }
        if let Some((value, _)) = state.idle.pop() {
            return Some(value);
        }
        if state.total < self.inner.max {
            state.total += 1;
            drop(state);
            return Some((self.inner.factory)());
        }
        None
    }

    /// Warm handles currently available.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().unwrap().idle.len()
    }

    /// Handles alive (warm + leased).
    pub fn total_count(&self) -> usize {
        self.inner.state.lock().unwrap().total
    }
}

/// An exclusive lease on one pool handle.  Dropping returns the handle to
/// the warm set; [`Lease::discard`] removes it instead.
pub struct Lease<T: Send + 'static> {
    value: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T: Send + 'static + std::fmt::Debug> std::fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("value", &self.value).finish()
    }
}

impl<T: Send + 'static> Lease<T> {
    /// Drop an errored handle instead of returning it to warm.  The pool's
    /// capacity is freed so a replacement is built on demand.
    pub fn discard(mut self) {
        self.value.take();
        let mut state = self.pool.state.lock().unwrap();
        state.total -= 1;
        drop(state);
        self.pool.returned.notify_one();
        warn!(pool = %self.pool.name, "pool handle discarded");
    }
}

impl<T: Send + 'static> std::ops::Deref for Lease<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("lease already discarded")
    }
}

impl<T: Send + 'static> std::ops::DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("lease already discarded")
    }
}

impl<T: Send + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let mut state = self.pool.state.lock().unwrap();
            state.idle.push((value, Instant::now()));
            drop(state);
            self.pool.returned.notify_one();
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cfg(warm: usize, max: usize, lease_timeout_ms: u64) -> PoolConfig {
        PoolConfig { warm, max, lease_timeout_ms, idle_evict_secs: 3600 }
    }

    fn counting_pool(warm: usize, max: usize, timeout_ms: u64) -> (ResourcePool<usize>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let b = Arc::clone(&built);
        let pool = ResourcePool::new("test", &cfg(warm, max, timeout_ms), move || {
            b.fetch_add(1, Ordering::SeqCst)
        });
        (pool, built)
    }

    #[tokio::test]
    async fn warm_handles_are_prebuilt() {
        let (pool, built) = counting_pool(2, 4, 100);
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.total_count(), 2);
    }

    #[tokio::test]
    async fn leases_are_exclusive() {
        let (pool, _) = counting_pool(2, 2, 100);
        let a = pool.acquire("s1").await.unwrap();
        let b = pool.acquire("s2").await.unwrap();
        assert_ne!(*a, *b, "no two live sessions may hold the same handle");
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let (pool, _) = counting_pool(0, 2, 50);
        let _a = pool.acquire("s1").await.unwrap();
        let _b = pool.acquire("s2").await.unwrap();
        let err = pool.acquire("s3").await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn existing_leases_survive_exhaustion() {
        let (pool, _) = counting_pool(0, 2, 50);
        let a = pool.acquire("s1").await.unwrap();
        let b = pool.acquire("s2").await.unwrap();
        let _ = pool.acquire("s3").await.unwrap_err();
        // The two existing sessions still hold valid handles.
        assert_eq!(*a + *b, 1, "handles 0 and 1 remain leased");
    }

    #[tokio::test]
    async fn dropped_lease_returns_to_warm() {
        let (pool, built) = counting_pool(1, 1, 100);
        {
            let _lease = pool.acquire("s1").await.unwrap();
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 1);
        let _again = pool.acquire("s2").await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1, "handle is reused, not rebuilt");
    }

    #[tokio::test]
    async fn release_wakes_a_waiter() {
        let (pool, _) = counting_pool(0, 1, 2_000);
        let lease = pool.acquire("s1").await.unwrap();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire("s2").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);
        let result = waiter.await.unwrap();
        assert!(result.is_ok(), "waiter must get the released handle");
    }

    #[tokio::test]
    async fn discard_removes_and_replaces() {
        let (pool, built) = counting_pool(1, 1, 100);
        let lease = pool.acquire("s1").await.unwrap();
        lease.discard();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.total_count(), 0);
        // Next acquire builds a fresh handle.
        let _fresh = pool.acquire("s2").await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_eviction_drops_stale_warm_handles() {
        let built = Arc::new(AtomicUsize::new(0));
        let b = Arc::clone(&built);
        let cfg = PoolConfig { warm: 1, max: 2, lease_timeout_ms: 100, idle_evict_secs: 0 };
        let pool = ResourcePool::new("test", &cfg, move || b.fetch_add(1, Ordering::SeqCst));
        // idle_evict_secs = 0 makes every warm handle immediately stale.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _lease = pool.acquire("s1").await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2, "stale warm handle replaced");
    }

    #[tokio::test]
    async fn warm_is_capped_by_max() {
        let (pool, built) = counting_pool(8, 2, 100);
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(pool.total_count(), 2);
    }
}
