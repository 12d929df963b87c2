use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic counter that is safe to increment concurrently.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Named counters incremented by the handler and the forwarder, shared via `Arc`.
#[derive(Debug, Default)]
pub struct Stats {
    pub forward_count: Counter,
    pub stub_forward_count: Counter,
    pub lookup_count: Counter,
    pub request_count: Counter,
    pub dnssec_ok_count: Counter,
    pub name_error_count: Counter,
    pub no_data_count: Counter,
    pub dnssec_cache_miss: Counter,
    pub cache_miss: Counter,
    pub cache_hit: Counter,
    pub stale_cache_hit: Counter,
    pub request_fail: Counter,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// `cache_hit / (cache_hit + cache_miss)`, 0 when no lookups happened yet.
    pub fn cache_hit_rate(&self) -> f64 {
        let hit = self.cache_hit.count();
        let miss = self.cache_miss.count();
        if hit + miss == 0 {
            return 0.0;
        }
        hit as f64 / (hit + miss) as f64
    }
}
