use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight counters for matching and dispatch behavior.
///
/// # Example
/// ```rust
/// use charon_core::metrics::MatchCounters;
///
/// let counters = MatchCounters::default();
/// counters.frame();
/// assert_eq!(counters.frames(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MatchCounters {
    frames: AtomicU64,
    matched: AtomicU64,
    dropped_unmatched: AtomicU64,
    dropped_stale: AtomicU64,
    events: AtomicU64,
}

impl MatchCounters {
    /// Count a buffer arriving from a stream.
    pub fn frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a completed super-buffer match.
    pub fn matched(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a bundle evicted before completing.
    pub fn dropped_unmatched(&self) {
        self.dropped_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a buffer discarded for arriving below the expected index.
    pub fn dropped_stale(&self) {
        self.dropped_stale.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a dispatched event.
    pub fn event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of stream buffers seen.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Snapshot of completed matches.
    pub fn matches(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    /// Snapshot of evicted incomplete bundles.
    pub fn unmatched_drops(&self) -> u64 {
        self.dropped_unmatched.load(Ordering::Relaxed)
    }

    /// Snapshot of stale-frame discards.
    pub fn stale_drops(&self) -> u64 {
        self.dropped_stale.load(Ordering::Relaxed)
    }

    /// Snapshot of dispatched events.
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

impl Clone for MatchCounters {
    fn clone(&self) -> Self {
        let cloned = MatchCounters::default();
        cloned.frames.store(self.frames(), Ordering::Relaxed);
        cloned.matched.store(self.matches(), Ordering::Relaxed);
        cloned
            .dropped_unmatched
            .store(self.unmatched_drops(), Ordering::Relaxed);
        cloned
            .dropped_stale
            .store(self.stale_drops(), Ordering::Relaxed);
        cloned.events.store(self.events(), Ordering::Relaxed);
        cloned
    }
}
