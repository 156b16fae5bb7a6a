//! Timestamp-ordered playout buffer.
//!
//! Frames are held until `now >= base_local + target_delay + (ts - base_ts)`,
//! where the base pair is anchored by the first pushed frame. Frames at or
//! behind the last released timestamp are late and dropped; overflow evicts
//! the oldest buffered frame.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::frame::MediaFrame;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MediaJitterStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    pub late: u64,
}

struct FrameEntry {
    ts: u64,
    frame: MediaFrame,
}

// Min-heap on timestamp.
impl Ord for FrameEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.ts.cmp(&self.ts)
    }
}

impl PartialOrd for FrameEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FrameEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts
    }
}

impl Eq for FrameEntry {}

pub struct MediaJitterBuffer {
    frames: BinaryHeap<FrameEntry>,
    target_delay_ms: u64,
    max_frames: usize,
    base_timestamp_ms: u64,
    base_local_ms: u64,
    last_pop_ts: u64,
    has_base: bool,
    stats: MediaJitterStats,
}

impl Default for MediaJitterBuffer {
    fn default() -> Self {
        Self::new(60, 256)
    }
}

impl MediaJitterBuffer {
    pub fn new(target_delay_ms: u64, max_frames: usize) -> Self {
        Self {
            frames: BinaryHeap::new(),
            target_delay_ms: target_delay_ms.max(1),
            max_frames: max_frames.max(1),
            base_timestamp_ms: 0,
            base_local_ms: 0,
            last_pop_ts: 0,
            has_base: false,
            stats: MediaJitterStats::default(),
        }
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.base_timestamp_ms = 0;
        self.base_local_ms = 0;
        self.last_pop_ts = 0;
        self.has_base = false;
        self.stats = MediaJitterStats::default();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn stats(&self) -> MediaJitterStats {
        self.stats
    }

    pub fn push(&mut self, frame: MediaFrame, now_ms: u64) {
        if !self.has_base {
            self.has_base = true;
            self.base_timestamp_ms = frame.timestamp_ms;
            self.base_local_ms = now_ms;
        }
        if frame.timestamp_ms <= self.last_pop_ts {
            self.stats.late += 1;
            return;
        }
        self.frames.push(FrameEntry {
            ts: frame.timestamp_ms,
            frame,
        });
        self.stats.pushed += 1;
        while self.frames.len() > self.max_frames {
            self.frames.pop();
            self.stats.dropped += 1;
        }
    }

    /// Release the earliest frame once its scheduled playout time passed.
    pub fn pop_ready(&mut self, now_ms: u64) -> Option<MediaFrame> {
        if !self.has_base {
            return None;
        }
        let ts = self.frames.peek()?.ts;
        let mut expected = self.base_local_ms + self.target_delay_ms;
        if ts >= self.base_timestamp_ms {
            expected += ts - self.base_timestamp_ms;
        }
        if now_ms < expected {
            return None;
        }
        let entry = self.frames.pop()?;
        self.last_pop_ts = entry.ts;
        self.stats.popped += 1;
        Some(entry.frame)
    }
}
