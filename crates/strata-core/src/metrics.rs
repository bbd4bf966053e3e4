//! Atomic counters for one build.
//!
//! Owned by the coordinator and shared by reference; there is no process-wide
//! instance. Call [`BuildMetrics::flush`] to emit the values as one event.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BuildMetrics {
    cache_hits: AtomicU64,
    modules_rebuilt: AtomicU64,
    modules_failed: AtomicU64,
    state_files_written: AtomicU64,
    broker_requests: AtomicU64,
}

impl BuildMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cache_hits(&self, n: u64) {
        self.cache_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_rebuilt(&self) {
        self.modules_rebuilt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.modules_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_state_files(&self) {
        self.state_files_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_broker_requests(&self) {
        self.broker_requests.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "broker_requests", "counter incremented");
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn modules_rebuilt(&self) -> u64 {
        self.modules_rebuilt.load(Ordering::Relaxed)
    }

    pub fn modules_failed(&self) -> u64 {
        self.modules_failed.load(Ordering::Relaxed)
    }

    pub fn state_files_written(&self) -> u64 {
        self.state_files_written.load(Ordering::Relaxed)
    }

    pub fn broker_requests(&self) -> u64 {
        self.broker_requests.load(Ordering::Relaxed)
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            cache_hits = self.cache_hits(),
            modules_rebuilt = self.modules_rebuilt(),
            modules_failed = self.modules_failed(),
            state_files_written = self.state_files_written(),
            broker_requests = self.broker_requests(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        let m = BuildMetrics::new();
        m.add_cache_hits(3);
        m.inc_rebuilt();
        m.inc_rebuilt();
        m.inc_failed();
        m.inc_state_files();
        m.inc_broker_requests();
        assert_eq!(m.cache_hits(), 3);
        assert_eq!(m.modules_rebuilt(), 2);
        assert_eq!(m.modules_failed(), 1);
        assert_eq!(m.state_files_written(), 1);
        assert_eq!(m.broker_requests(), 1);
        m.flush();
    }
}
