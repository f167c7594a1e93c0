//! # Frame Queue - Display-Order Reorder Buffer
//!
//! Hardware decoders complete frames in decode order (or in whatever order
//! their pipeline finishes them). This queue puts them back in presentation
//! order:
//! - Ordered insertion by `(sort_time, sort_key)`
//! - Depth accounting against a reference-window budget
//! - Flush for seek/reset/teardown, releasing every held buffer once
//! - Epoch fencing so a retired decoder session cannot push late frames
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  push   ┌──────────────┐ pop_head ┌──────────┐
//! │ Decoder      │────────►│ ReorderQueue │─────────►│ Consumer │
//! │ callback thr │         │ (mutex)      │          │ thread   │
//! └──────────────┘         └──────────────┘          └──────────┘
//! ```
//!
//! The mutex only covers list manipulation. Buffer releases from `flush`
//! happen after it is dropped.

use crate::buffer::{BufferHandle, NativeFormat};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

// ============================================================================
// Frame
// ============================================================================

/// A decoded frame waiting for display
#[derive(Debug)]
pub struct Frame {
    /// Decode timestamp (microseconds), `None` if unknown
    pub dts_us: Option<i64>,
    /// Presentation timestamp (microseconds), `None` if unknown
    pub pts_us: Option<i64>,
    /// Frame duration (microseconds)
    pub duration_us: Option<i64>,
    pub width: u32,
    pub height: u32,
    /// Primary ordering time
    pub sort_time: i64,
    /// Delivery sequence number, breaks `sort_time` ties
    pub sort_key: u64,
    /// Native layout of `buffer`
    pub format: NativeFormat,
    /// The one reference this frame owns
    pub buffer: BufferHandle,
}

impl Frame {
    /// Wrap a buffer; dimensions and format are taken from it
    pub fn new(buffer: BufferHandle, sort_time: i64, sort_key: u64) -> Self {
        Self {
            dts_us: None,
            pts_us: None,
            duration_us: None,
            width: buffer.width(),
            height: buffer.height(),
            sort_time,
            sort_key,
            format: buffer.pixel_format(),
            buffer,
        }
    }

    pub fn with_timestamps(mut self, dts_us: Option<i64>, pts_us: Option<i64>) -> Self {
        self.dts_us = dts_us;
        self.pts_us = pts_us;
        self
    }

    pub fn with_duration(mut self, duration_us: Option<i64>) -> Self {
        self.duration_us = duration_us;
        self
    }

    fn order_key(&self) -> (i64, u64) {
        (self.sort_time, self.sort_key)
    }
}

// ============================================================================
// Reorder Queue
// ============================================================================

struct QueueInner {
    /// Front is the next frame to display
    frames: VecDeque<Frame>,
    epoch: u64,
}

/// Presentation-ordered frame queue shared between decoder and consumer
pub struct ReorderQueue {
    inner: Mutex<QueueInner>,

    /// Mirrors `frames.len()`, readable without the lock
    depth: AtomicUsize,

    /// Reference-window budget
    max_depth: AtomicUsize,

    /// Set while depth is above budget, so the warning fires once per excursion
    over_budget: AtomicBool,

    frames_pushed: AtomicU64,
    frames_popped: AtomicU64,
    frames_flushed: AtomicU64,
    frames_rejected: AtomicU64,
}

impl ReorderQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(max_depth + 1),
                epoch: 0,
            }),
            depth: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(max_depth),
            over_budget: AtomicBool::new(false),
            frames_pushed: AtomicU64::new(0),
            frames_popped: AtomicU64::new(0),
            frames_flushed: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Producer API (Decoder Callback Thread)
    // ========================================================================

    /// Insert a frame at its presentation position. Never fails.
    pub fn push(&self, frame: Frame) {
        let mut inner = self.inner.lock();
        self.insert_ordered(&mut inner, frame);
        drop(inner);
        self.check_budget();
    }

    /// Insert only if `epoch` is still current; otherwise hand the frame back
    pub fn push_from(&self, epoch: u64, frame: Frame) -> Result<(), Frame> {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            self.frames_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(frame);
        }
        self.insert_ordered(&mut inner, frame);
        drop(inner);
        self.check_budget();
        Ok(())
    }

    fn insert_ordered(&self, inner: &mut QueueInner, frame: Frame) {
        let key = frame.order_key();
        // Equal keys land after existing entries
        let pos = inner.frames.partition_point(|f| f.order_key() <= key);
        inner.frames.insert(pos, frame);
        self.depth.store(inner.frames.len(), Ordering::SeqCst);
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
    }

    fn check_budget(&self) {
        let depth = self.depth();
        let max_depth = self.max_depth();
        if depth > max_depth {
            if !self.over_budget.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "Reorder queue depth {} exceeds budget {}; consumer is not draining",
                    depth,
                    max_depth
                );
            }
        } else {
            self.over_budget.store(false, Ordering::Relaxed);
        }
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Remove the next frame in presentation order, `None` when empty
    pub fn pop_head(&self) -> Option<Frame> {
        let mut inner = self.inner.lock();
        let frame = inner.frames.pop_front()?;
        self.depth.store(inner.frames.len(), Ordering::SeqCst);
        drop(inner);

        self.frames_popped.fetch_add(1, Ordering::Relaxed);
        if self.depth() <= self.max_depth() {
            self.over_budget.store(false, Ordering::Relaxed);
        }
        Some(frame)
    }

    /// Presentation timestamp and sort key of the head, if any
    pub fn peek_head(&self) -> Option<(Option<i64>, u64)> {
        self.inner.lock().frames.front().map(|f| (f.pts_us, f.sort_key))
    }

    // ========================================================================
    // Control API
    // ========================================================================

    /// Drop every queued frame. Returns how many were released.
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock();
        let drained = std::mem::take(&mut inner.frames);
        self.depth.store(0, Ordering::SeqCst);
        drop(inner);

        self.release_drained(drained)
    }

    /// Advance the epoch and flush in one critical section.
    ///
    /// Frames pushed with an older epoch afterwards are rejected.
    pub fn retire(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        let epoch = inner.epoch;
        let drained = std::mem::take(&mut inner.frames);
        self.depth.store(0, Ordering::SeqCst);
        drop(inner);

        let released = self.release_drained(drained);
        tracing::debug!("Queue retired to epoch {}, released {} frames", epoch, released);
        epoch
    }

    fn release_drained(&self, drained: VecDeque<Frame>) -> usize {
        let count = drained.len();
        drop(drained);
        self.frames_flushed.fetch_add(count as u64, Ordering::Relaxed);
        self.over_budget.store(false, Ordering::Relaxed);
        count
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn set_max_depth(&self, max_depth: usize) {
        self.max_depth.store(max_depth, Ordering::SeqCst);
    }

    // ========================================================================
    // Status API
    // ========================================================================

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Depth has reached the reference-window budget
    pub fn is_full(&self) -> bool {
        self.depth() >= self.max_depth()
    }

    pub fn is_over_budget(&self) -> bool {
        self.depth() > self.max_depth()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            depth: inner.frames.len(),
            max_depth: self.max_depth(),
            epoch: inner.epoch,
            head_pts_us: inner.frames.front().and_then(|f| f.pts_us),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_popped: self.frames_popped.load(Ordering::Relaxed),
            frames_flushed: self.frames_flushed.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub max_depth: usize,
    pub epoch: u64,
    pub head_pts_us: Option<i64>,
    pub frames_pushed: u64,
    pub frames_popped: u64,
    pub frames_flushed: u64,
    pub frames_rejected: u64,
}

// ============================================================================
// Tests
// ============================================================================
