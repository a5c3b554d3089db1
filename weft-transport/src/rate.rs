//! Per-source ingress rate limiting.
//!
//! Every source endpoint gets its own token bucket; exceeding sources have
//! their packets dropped silently before any protocol processing, blunting
//! amplification and flood attacks. Buckets live in a sharded concurrent map
//! so ingress filtering never contends with mesh state.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

// Stop tracking sources beyond this count; the map is pruned of full,
// long-idle buckets before new inserts once the cap is reached.
const MAX_TRACKED_SOURCES: usize = 4096;

/// Token bucket with fractional refill.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket that starts full.
    pub fn new(capacity: u32, rate_per_sec: u32, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            tokens: f64::from(capacity),
            rate: f64::from(rate_per_sec),
            last_refill: now,
        }
    }

    /// Take one token if available.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_idle_full(&self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.rate) >= self.capacity
    }
}

/// Sharded per-source-endpoint rate limiter.
#[derive(Debug)]
pub struct SourceRateLimiter {
    pps: u32,
    burst: u32,
    buckets: DashMap<SocketAddr, TokenBucket>,
    dropped: AtomicU64,
}

impl SourceRateLimiter {
    /// `pps` steady packets per second with `burst` headroom per source.
    pub fn new(pps: u32, burst: u32) -> Self {
        Self {
            pps,
            burst,
            buckets: DashMap::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Whether a packet from `src` may be processed right now.
    pub fn allow(&self, src: SocketAddr, now: Instant) -> bool {
        if self.buckets.len() >= MAX_TRACKED_SOURCES && !self.buckets.contains_key(&src) {
            self.prune(now);
        }
        let mut bucket = self
            .buckets
            .entry(src)
            .or_insert_with(|| TokenBucket::new(self.burst, self.pps, now));
        let ok = bucket.try_consume(now);
        drop(bucket);
        if !ok {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(%src, "rate limit exceeded, dropping packet");
        }
        ok
    }

    /// Packets dropped by the limiter since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // Evict sources whose buckets have refilled to capacity; they have been
    // quiet for at least burst/pps seconds and carry no state worth keeping.
    fn prune(&self, now: Instant) {
        self.buckets.retain(|_, b| !b.is_idle_full(now));
    }
}
