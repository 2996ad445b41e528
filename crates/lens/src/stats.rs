use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Proxy-wide counters, passed explicitly into the pool, interceptor, and
/// cache instead of living in a process-wide singleton.
#[derive(Debug, Default)]
pub struct ProxyStats {
    inner: Arc<ProxyStatsInner>,
}

#[derive(Debug, Default)]
struct ProxyStatsInner {
    tool_calls: AtomicU64,
    tool_call_failures: AtomicU64,
    responses_truncated: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    proxy_tool_calls: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStatsSnapshot {
    pub tool_calls: u64,
    pub tool_call_failures: u64,
    pub responses_truncated: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub proxy_tool_calls: u64,
}

impl Clone for ProxyStats {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tool_call(&self) {
        self.inner.tool_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_call_failure(&self) {
        self.inner.tool_call_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_truncation(&self) {
        self.inner
            .responses_truncated
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_eviction(&self) {
        self.inner.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proxy_tool_call(&self) {
        self.inner.proxy_tool_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            tool_calls: self.inner.tool_calls.load(Ordering::Relaxed),
            tool_call_failures: self.inner.tool_call_failures.load(Ordering::Relaxed),
            responses_truncated: self.inner.responses_truncated.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.inner.cache_evictions.load(Ordering::Relaxed),
            proxy_tool_calls: self.inner.proxy_tool_calls.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counts() {
        let stats = ProxyStats::new();
        stats.record_tool_call();
        stats.record_tool_call();
        stats.record_cache_hit();
        stats.record_truncation();

        let snap = stats.snapshot();
        assert_eq!(snap.tool_calls, 2);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.responses_truncated, 1);
        assert_eq!(snap.cache_misses, 0);
    }

    #[test]
    fn clones_share_counters() {
        let stats = ProxyStats::new();
        let clone = stats.clone();
        clone.record_cache_miss();
        assert_eq!(stats.snapshot().cache_misses, 1);
    }
}
