//! Super-buffer matching: assembling one buffer per bundled stream for a
//! common frame index.
//!
//! Each bundled stream delivers buffers tagged with a non-decreasing frame
//! index. The queue keeps pending bundles ordered by index; a bundle
//! completes once every stream has contributed, at which point older
//! incomplete bundles are released and the expected index advances by the
//! configured post-frame skip. Incomplete bundles are bounded by
//! `max_unmatched_frames`; matched history kept for burst look-back is
//! bounded by `look_back`; matched depth in burst steady-state is bounded
//! by `water_mark`. Matching across streams is best-effort — out-of-order
//! and missing contributions are tolerated and bounded, never globally
//! ordered.

use std::collections::VecDeque;
use std::sync::Arc;

use charon_core::format::StreamType;
use charon_core::handle::Handle;
use charon_core::metrics::MatchCounters;
use charon_mem::MemoryHandle;
use smallvec::SmallVec;
use tracing::{debug, warn};

/// How matched super-buffers reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NotifyMode {
    /// Every matched super-buffer is delivered as soon as it completes.
    Continuous,
    /// Matched super-buffers are held (up to the water mark) and delivered
    /// in bursts of the requested count.
    Burst,
}

/// Bundle tuning. The eviction and burst parameters are policy knobs set
/// per stream-type by the caller; snapshot and preview tolerate drops
/// differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BundleAttr {
    pub notify_mode: NotifyMode,
    /// Matched bundles retained in burst steady-state before the oldest
    /// are returned to the hardware.
    pub water_mark: usize,
    /// Matched history kept for a following burst request, so a capture
    /// can return frames from before the trigger.
    pub look_back: usize,
    /// Frames skipped after each match before the next expected index.
    pub post_frame_skip: u64,
    /// Most incomplete bundles tolerated before the oldest is evicted.
    pub max_unmatched_frames: usize,
}

impl Default for BundleAttr {
    fn default() -> Self {
        BundleAttr {
            notify_mode: NotifyMode::Continuous,
            water_mark: 2,
            look_back: 2,
            post_frame_skip: 0,
            max_unmatched_frames: 8,
        }
    }
}

/// One stream's contribution to a super-buffer.
///
/// Ownership: a `StreamBuf` delivered through a callback is client-owned
/// until returned through the channel's buffer-return path.
#[derive(Debug, Clone)]
pub struct StreamBuf {
    pub stream: Handle,
    pub stream_type: StreamType,
    pub buf_index: u32,
    pub frame_idx: u64,
    pub ts_nanos: u64,
    /// Zero-copy view of the underlying mapped buffer.
    pub memory: MemoryHandle,
}

/// A matched set: one buffer per bundled stream, common frame index.
#[derive(Debug, Clone)]
pub struct SuperBuf {
    pub session: Handle,
    pub channel: Handle,
    pub frame_idx: u64,
    pub bufs: SmallVec<[StreamBuf; 4]>,
}

/// Bundle callback, invoked on the channel's dispatch thread with no
/// channel lock held.
pub type SuperBufNotify = Arc<dyn Fn(SuperBuf) + Send + Sync>;

struct PendingBundle {
    frame_idx: u64,
    matched: bool,
    slots: SmallVec<[Option<StreamBuf>; 4]>,
}

impl PendingBundle {
    fn new(num_streams: usize, frame_idx: u64) -> Self {
        let mut slots = SmallVec::with_capacity(num_streams);
        slots.resize_with(num_streams, || None);
        PendingBundle {
            frame_idx,
            matched: false,
            slots,
        }
    }

    fn drain_into(mut self, rejects: &mut Vec<StreamBuf>) {
        for slot in self.slots.drain(..) {
            if let Some(buf) = slot {
                rejects.push(buf);
            }
        }
    }
}

/// The matching queue. Callers hand every rejected/evicted buffer in
/// `rejects` straight back to the hardware.
pub struct MatchQueue {
    attr: BundleAttr,
    streams: SmallVec<[Handle; 4]>,
    pending: VecDeque<PendingBundle>,
    expected_frame_id: u64,
    match_cnt: usize,
    counters: Arc<MatchCounters>,
}

impl MatchQueue {
    pub fn new(
        attr: BundleAttr,
        streams: SmallVec<[Handle; 4]>,
        counters: Arc<MatchCounters>,
    ) -> Self {
        MatchQueue {
            attr,
            streams,
            pending: VecDeque::new(),
            expected_frame_id: 0,
            match_cnt: 0,
            counters,
        }
    }

    pub fn attr(&self) -> &BundleAttr {
        &self.attr
    }

    /// Swap the steady-state notify mode.
    pub fn set_notify_mode(&mut self, mode: NotifyMode) {
        self.attr.notify_mode = mode;
    }

    /// Reset the expected frame index (flush path).
    pub fn set_expected(&mut self, frame_idx: u64) {
        self.expected_frame_id = frame_idx;
    }

    pub fn expected(&self) -> u64 {
        self.expected_frame_id
    }

    /// Matched bundles currently queued.
    pub fn match_cnt(&self) -> usize {
        self.match_cnt
    }

    /// Incomplete bundles currently queued.
    pub fn unmatched_cnt(&self) -> usize {
        self.pending.iter().filter(|n| !n.matched).count()
    }

    /// Feed one stream buffer through the matching logic.
    ///
    /// Returns `true` when the buffer was absorbed; buffers to hand back
    /// to the hardware (stale, evicted, displaced) are appended to
    /// `rejects`.
    pub fn feed(&mut self, buf: StreamBuf, rejects: &mut Vec<StreamBuf>) -> bool {
        let Some(slot_idx) = self.streams.iter().position(|h| *h == buf.stream) else {
            warn!(stream = buf.stream.raw(), "buffer from unbundled stream");
            rejects.push(buf);
            return false;
        };
        if buf.frame_idx < self.expected_frame_id {
            // Older than the expected index: discard.
            rejects.push(buf);
            return false;
        }

        let mut found: Option<usize> = None;
        let mut unmatched = 0usize;
        let mut has_older_unmatched = false;
        let mut insert_before: Option<usize> = None;
        for (at, node) in self.pending.iter().enumerate() {
            if node.matched {
                continue;
            }
            if node.frame_idx == buf.frame_idx {
                found = Some(at);
                break;
            }
            unmatched += 1;
            if node.frame_idx < buf.frame_idx {
                has_older_unmatched = true;
            }
            if insert_before.is_none() && node.frame_idx > buf.frame_idx {
                insert_before = Some(at);
            }
        }

        if let Some(at) = found {
            let frame_idx = buf.frame_idx;
            let node = &mut self.pending[at];
            if let Some(previous) = node.slots[slot_idx].replace(buf) {
                warn!(
                    frame_idx,
                    stream = previous.stream.raw(),
                    "stream contributed twice for one frame index"
                );
                rejects.push(previous);
            }
            node.matched = node.slots.iter().all(Option::is_some);
            if node.matched {
                self.expected_frame_id = frame_idx + self.attr.post_frame_skip;
                self.match_cnt += 1;
                self.release_older_unmatched(frame_idx, rejects);
            }
            return true;
        }

        if unmatched > self.attr.max_unmatched_frames && !has_older_unmatched {
            // Window full and the incoming frame is older than every
            // pending bundle: it can never complete in time.
            rejects.push(buf);
            return false;
        }
        if unmatched > self.attr.max_unmatched_frames {
            if let Some(oldest) = self.pending.iter().position(|n| !n.matched) {
                if let Some(evicted) = self.pending.remove(oldest) {
                    debug!(frame_idx = evicted.frame_idx, "evicting unmatched bundle");
                    self.counters.dropped_unmatched();
                    evicted.drain_into(rejects);
                }
                if let Some(before) = insert_before.as_mut() {
                    if *before > oldest {
                        *before -= 1;
                    }
                }
            }
        }

        let frame_idx = buf.frame_idx;
        let mut node = PendingBundle::new(self.streams.len(), frame_idx);
        node.slots[slot_idx] = Some(buf);
        if self.streams.len() == 1 {
            node.matched = true;
            self.expected_frame_id = frame_idx + self.attr.post_frame_skip;
            self.match_cnt += 1;
        }
        match insert_before {
            Some(at) => self.pending.insert(at, node),
            None => self.pending.push_back(node),
        }
        true
    }

    /// Pop the oldest bundle if it has matched.
    pub fn dequeue_matched(&mut self) -> Option<(u64, SmallVec<[StreamBuf; 4]>)> {
        if !self.pending.front()?.matched {
            return None;
        }
        let node = self.pending.pop_front()?;
        self.match_cnt -= 1;
        let bufs = node.slots.into_iter().flatten().collect();
        Some((node.frame_idx, bufs))
    }

    /// Return matched bundles beyond `keep` to the hardware, oldest first.
    ///
    /// Used both for the burst water mark and for look-back trimming on a
    /// burst request; continuous mode never trims.
    pub fn trim_matched_to(&mut self, keep: usize, rejects: &mut Vec<StreamBuf>) {
        if matches!(self.attr.notify_mode, NotifyMode::Continuous) {
            return;
        }
        while self.match_cnt > keep {
            match self.dequeue_matched() {
                Some((_, bufs)) => rejects.extend(bufs),
                // Oldest bundle is unmatched; nothing more to trim from
                // the front.
                None => break,
            }
        }
    }

    /// Discard everything, optionally resetting the expected index first.
    pub fn flush(&mut self, expected: Option<u64>, rejects: &mut Vec<StreamBuf>) {
        if let Some(frame_idx) = expected {
            self.expected_frame_id = frame_idx;
        }
        for node in self.pending.drain(..) {
            node.drain_into(rejects);
        }
        self.match_cnt = 0;
    }

    /// Discard matched bundles from the front of the queue.
    pub fn flush_matched(&mut self, rejects: &mut Vec<StreamBuf>) {
        while let Some((_, bufs)) = self.dequeue_matched() {
            rejects.extend(bufs);
        }
    }

    fn release_older_unmatched(&mut self, matched_idx: u64, rejects: &mut Vec<StreamBuf>) {
        let mut at = 0;
        while at < self.pending.len() {
            if !self.pending[at].matched && self.pending[at].frame_idx < matched_idx {
                if let Some(node) = self.pending.remove(at) {
                    debug!(
                        frame_idx = node.frame_idx,
                        "releasing unmatched bundle older than a match"
                    );
                    self.counters.dropped_unmatched();
                    node.drain_into(rejects);
                }
            } else {
                at += 1;
            }
        }
    }
}
