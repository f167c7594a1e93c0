//! # Decode Session Adapter
//!
//! Bridges an asynchronous hardware decoder into the reorder queue.
//!
//! ```text
//!  AccessUnit ──submit──► DecoderSession ···(any thread)···► FrameSink::on_frame_ready
//!                                                                  │ push_from(epoch)
//!                                                                  ▼
//!                                                            ReorderQueue
//! ```
//!
//! Each session gets its own `FrameSink` stamped with the queue epoch at
//! creation. Destroying a session retires that epoch, so completions that
//! arrive late are released instead of queued.

use crate::buffer::{BufferHandle, NativeFormat};
use crate::codec::CodecControl;
use crate::frame_queue::{Frame, ReorderQueue};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Types
// ============================================================================

/// Video codec types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HwCodec {
    H264,
    H265,
    MPEG4,
    VP9,
    AV1,
}

/// Rational timestamp as reported by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: i32,
    pub valid: bool,
}

impl MediaTime {
    pub const INVALID: Self = Self {
        value: 0,
        timescale: 0,
        valid: false,
    };

    pub fn new(value: i64, timescale: i32) -> Self {
        Self {
            value,
            timescale,
            valid: timescale > 0,
        }
    }

    pub fn from_micros(us: Option<i64>) -> Self {
        match us {
            Some(us) => Self::new(us, 1_000_000),
            None => Self::INVALID,
        }
    }

    /// Microseconds, `None` when invalid
    pub fn to_micros(&self) -> Option<i64> {
        if !self.valid || self.timescale <= 0 {
            return None;
        }
        let us = self.value as i128 * 1_000_000 / self.timescale as i128;
        i64::try_from(us).ok()
    }
}

/// Per-submission context handed back with the completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub dts_us: Option<i64>,
    pub pts_us: Option<i64>,
    pub keyframe: bool,
}

/// Completion status reported by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Ok,
    Failed(i32),
}

/// One compressed access unit
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub dts_us: Option<i64>,
    pub pts_us: Option<i64>,
    pub keyframe: bool,
}

impl AccessUnit {
    pub fn context(&self) -> FrameContext {
        FrameContext {
            dts_us: self.dts_us,
            pts_us: self.pts_us,
            keyframe: self.keyframe,
        }
    }
}

/// Everything a backend needs to create a session
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub codec: HwCodec,
    /// Negotiated output layout
    pub format: NativeFormat,
    pub width: u32,
    pub height: u32,
    pub extradata: Bytes,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Decoder backend unavailable: {0}")]
    Unavailable(String),
    #[error("Codec {0:?} not supported by backend")]
    UnsupportedCodec(HwCodec),
    #[error("Session creation failed with status {0}")]
    CreateFailed(i32),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Decoder session invalidated")]
    InvalidSession,
    #[error("Submission failed with status {0}")]
    Failed(i32),
}

// ============================================================================
// Backend Traits
// ============================================================================

/// Factory for hardware decode sessions
pub trait DecoderBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Create a session that reports every completion to `sink`
    fn create_session(
        &self,
        params: &SessionParams,
        sink: Arc<FrameSink>,
    ) -> Result<Box<dyn DecoderSession>, SessionError>;
}

/// A live decoder session. Dropping it destroys the session.
pub trait DecoderSession: Send {
    /// Queue one access unit for asynchronous decode
    fn submit(
        &mut self,
        unit: &AccessUnit,
        context: FrameContext,
        control: CodecControl,
    ) -> Result<(), SubmitError>;

    /// Block until every submitted unit has completed
    fn wait_for_async_frames(&mut self);
}

// ============================================================================
// Frame Sink
// ============================================================================

/// Delivery counters and the sort clock, shared across sessions
#[derive(Debug)]
pub struct DeliveryState {
    next_sort_key: AtomicU64,
    last_sort_time: AtomicI64,
    delivered: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl Default for DeliveryState {
    fn default() -> Self {
        Self {
            next_sort_key: AtomicU64::new(0),
            last_sort_time: AtomicI64::new(i64::MIN),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }
}

impl DeliveryState {
    /// Next `(sort_time, sort_key)`.
    ///
    /// pts if known, else dts, else the last assigned time.
    fn assign(&self, pts_us: Option<i64>, dts_us: Option<i64>) -> (i64, u64) {
        let key = self.next_sort_key.fetch_add(1, Ordering::SeqCst);
        let time = match pts_us.or(dts_us) {
            Some(t) => {
                self.last_sort_time.store(t, Ordering::SeqCst);
                t
            }
            None => self.last_sort_time.load(Ordering::SeqCst),
        };
        (time, key)
    }

    fn reset_clock(&self) {
        self.next_sort_key.store(0, Ordering::SeqCst);
        self.last_sort_time.store(i64::MIN, Ordering::SeqCst);
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    /// Frames pushed into the queue
    pub delivered: u64,
    /// Completions that carried an error or no image
    pub failed: u64,
    /// Completions from a retired session
    pub rejected: u64,
}

/// Completion target for one decoder session. Callable from any thread.
pub struct FrameSink {
    queue: Arc<ReorderQueue>,
    epoch: u64,
    state: Arc<DeliveryState>,
}

impl FrameSink {
    pub fn new(queue: Arc<ReorderQueue>, epoch: u64, state: Arc<DeliveryState>) -> Self {
        Self { queue, epoch, state }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Decoder completion.
    ///
    /// `image` carries the one reference the frame will own. On failure it
    /// is released here and nothing is queued.
    pub fn on_frame_ready(
        &self,
        context: FrameContext,
        status: FrameStatus,
        image: Option<BufferHandle>,
        presentation_time: MediaTime,
        duration: MediaTime,
    ) {
        if let FrameStatus::Failed(code) = status {
            drop(image);
            self.state.failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Decode failed with status {} (dts {:?})", code, context.dts_us);
            return;
        }

        let Some(buffer) = image else {
            self.state.failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Decoder dropped frame (dts {:?})", context.dts_us);
            return;
        };

        let pts_us = presentation_time.to_micros();
        let (sort_time, sort_key) = self.state.assign(pts_us, context.dts_us);
        let frame = Frame::new(buffer, sort_time, sort_key)
            .with_timestamps(context.dts_us, pts_us)
            .with_duration(duration.to_micros());

        match self.queue.push_from(self.epoch, frame) {
            Ok(()) => {
                self.state.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(stale) => {
                self.state.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Dropping frame from retired session (pts {:?})", stale.pts_us);
            }
        }
    }
}

// ============================================================================
// Session Adapter
// ============================================================================

/// Owns the current decoder session and its sink
pub struct SessionAdapter {
    backend: Arc<dyn DecoderBackend>,
    queue: Arc<ReorderQueue>,
    state: Arc<DeliveryState>,
    session: Option<Box<dyn DecoderSession>>,
    params: Option<SessionParams>,
}

impl SessionAdapter {
    pub fn new(backend: Arc<dyn DecoderBackend>, queue: Arc<ReorderQueue>) -> Self {
        Self {
            backend,
            queue,
            state: Arc::new(DeliveryState::default()),
            session: None,
            params: None,
        }
    }

    /// Create a session, replacing any existing one
    pub fn create_session(&mut self, params: SessionParams) -> Result<(), SessionError> {
        self.destroy_session();

        let sink = Arc::new(FrameSink::new(
            self.queue.clone(),
            self.queue.epoch(),
            self.state.clone(),
        ));
        let session = self.backend.create_session(&params, sink)?;

        tracing::info!(
            "{} session created: {:?} {}x{} output {}",
            self.backend.name(),
            params.codec,
            params.width,
            params.height,
            params.format
        );
        self.session = Some(session);
        self.params = Some(params);
        Ok(())
    }

    /// Recreate the session from the last parameters
    pub fn recreate_session(&mut self) -> Result<(), SessionError> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| SessionError::Unavailable("no previous session".into()))?;
        self.create_session(params)
    }

    /// Wait for in-flight frames, retire the queue, then drop the session
    pub fn destroy_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.wait_for_async_frames();
            self.queue.retire();
            drop(session);
            tracing::debug!("{} session destroyed", self.backend.name());
        }
    }

    pub fn submit(&mut self, unit: &AccessUnit, control: CodecControl) -> Result<(), SubmitError> {
        let session = self.session.as_mut().ok_or(SubmitError::InvalidSession)?;
        session.submit(unit, unit.context(), control)
    }

    pub fn wait_for_async_frames(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.wait_for_async_frames();
        }
    }

    /// Restart `sort_key` numbering and forget the last sort time
    pub fn reset_sort_clock(&self) {
        self.state.reset_clock();
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn params(&self) -> Option<&SessionParams> {
        self.params.as_ref()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        self.state.stats()
    }
}

impl Drop for SessionAdapter {
    fn drop(&mut self) {
        self.destroy_session();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HostBuffer;
    use parking_lot::Mutex;

    fn sink_for(queue: &Arc<ReorderQueue>) -> FrameSink {
        FrameSink::new(queue.clone(), queue.epoch(), Arc::new(DeliveryState::default()))
    }

    fn context(dts: Option<i64>) -> FrameContext {
        FrameContext {
            dts_us: dts,
            pts_us: None,
            keyframe: false,
        }
    }

    fn image(host: &Arc<HostBuffer>) -> Option<BufferHandle> {
        Some(BufferHandle::retain(host.clone()))
    }

    #[test]
    fn test_media_time_conversion() {
        assert_eq!(MediaTime::new(90_000, 90_000).to_micros(), Some(1_000_000));
        assert_eq!(MediaTime::new(1001, 30_000).to_micros(), Some(33_366));
        assert_eq!(MediaTime::INVALID.to_micros(), None);
        assert_eq!(MediaTime::new(5, 0).to_micros(), None);
        assert_eq!(MediaTime::from_micros(Some(42)).to_micros(), Some(42));
    }

    #[test]
    fn test_failed_completion_releases_and_skips() {
        let queue = Arc::new(ReorderQueue::new(4));
        let sink = sink_for(&queue);
        let host = HostBuffer::flat_nv12(16, 16, 0, 128, 128, 128);

        sink.on_frame_ready(context(Some(0)), FrameStatus::Failed(-12909), image(&host), MediaTime::new(0, 1000), MediaTime::INVALID);
        sink.on_frame_ready(context(Some(1)), FrameStatus::Ok, None, MediaTime::new(1, 1000), MediaTime::INVALID);

        assert_eq!(queue.depth(), 0);
        assert_eq!(host.ref_count(), 1);
        assert_eq!(sink.state.stats().failed, 2);
    }

    #[test]
    fn test_success_assigns_timestamps_and_keys() {
        let queue = Arc::new(ReorderQueue::new(4));
        let sink = sink_for(&queue);
        let host = HostBuffer::flat_nv12(16, 16, 0, 128, 128, 128);

        sink.on_frame_ready(context(Some(0)), FrameStatus::Ok, image(&host), MediaTime::new(2, 1000), MediaTime::new(1, 1000));
        sink.on_frame_ready(context(Some(1000)), FrameStatus::Ok, image(&host), MediaTime::new(1, 1000), MediaTime::INVALID);

        let first = queue.pop_head().unwrap();
        assert_eq!(first.pts_us, Some(1000));
        assert_eq!(first.dts_us, Some(1000));
        assert_eq!(first.sort_key, 1);
        let second = queue.pop_head().unwrap();
        assert_eq!(second.pts_us, Some(2000));
        assert_eq!(second.duration_us, Some(1000));
        assert_eq!(second.sort_key, 0);
        assert_eq!((second.width, second.height), (16, 16));
    }

    #[test]
    fn test_invalid_presentation_time_falls_back() {
        let queue = Arc::new(ReorderQueue::new(4));
        let sink = sink_for(&queue);
        let host = HostBuffer::flat_nv12(16, 16, 0, 128, 128, 128);

        sink.on_frame_ready(context(Some(5000)), FrameStatus::Ok, image(&host), MediaTime::INVALID, MediaTime::INVALID);
        sink.on_frame_ready(context(None), FrameStatus::Ok, image(&host), MediaTime::INVALID, MediaTime::INVALID);

        let first = queue.pop_head().unwrap();
        assert_eq!(first.pts_us, None);
        assert_eq!(first.sort_time, 5000);
        let second = queue.pop_head().unwrap();
        assert_eq!(second.sort_time, 5000);
        assert_eq!(second.sort_key, 1);
    }

    #[test]
    fn test_retired_sink_releases_late_frames() {
        let queue = Arc::new(ReorderQueue::new(4));
        let sink = sink_for(&queue);
        let host = HostBuffer::flat_nv12(16, 16, 0, 128, 128, 128);

        queue.retire();
        sink.on_frame_ready(context(Some(0)), FrameStatus::Ok, image(&host), MediaTime::new(0, 1000), MediaTime::INVALID);

        assert_eq!(queue.depth(), 0);
        assert_eq!(host.ref_count(), 1);
        assert_eq!(sink.state.stats().rejected, 1);
    }

    /// Session that completes nothing until told to, and keeps its sink
    struct ParkedBackend {
        sinks: Mutex<Vec<Arc<FrameSink>>>,
        waits: Arc<AtomicU64>,
        fail_create: bool,
    }

    struct ParkedSession {
        waits: Arc<AtomicU64>,
    }

    impl DecoderBackend for ParkedBackend {
        fn name(&self) -> &str {
            "parked"
        }

        fn create_session(
            &self,
            params: &SessionParams,
            sink: Arc<FrameSink>,
        ) -> Result<Box<dyn DecoderSession>, SessionError> {
            if self.fail_create {
                return Err(SessionError::UnsupportedCodec(params.codec));
            }
            self.sinks.lock().push(sink);
            Ok(Box::new(ParkedSession {
                waits: self.waits.clone(),
            }))
        }
    }

    impl DecoderSession for ParkedSession {
        fn submit(&mut self, _: &AccessUnit, _: FrameContext, _: CodecControl) -> Result<(), SubmitError> {
            Ok(())
        }

        fn wait_for_async_frames(&mut self) {
            self.waits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn params() -> SessionParams {
        SessionParams {
            codec: HwCodec::H264,
            format: NativeFormat::Nv12VideoRange,
            width: 16,
            height: 16,
            extradata: Bytes::new(),
        }
    }

    fn parked(fail_create: bool) -> Arc<ParkedBackend> {
        Arc::new(ParkedBackend {
            sinks: Mutex::new(Vec::new()),
            waits: Arc::new(AtomicU64::new(0)),
            fail_create,
        })
    }

    #[test]
    fn test_destroy_waits_then_retires() {
        let backend = parked(false);
        let queue = Arc::new(ReorderQueue::new(4));
        let mut adapter = SessionAdapter::new(backend.clone(), queue.clone());
        let host = HostBuffer::flat_nv12(16, 16, 0, 128, 128, 128);

        adapter.create_session(params()).unwrap();
        let sink = backend.sinks.lock()[0].clone();
        sink.on_frame_ready(context(Some(0)), FrameStatus::Ok, image(&host), MediaTime::new(0, 1000), MediaTime::INVALID);
        assert_eq!(queue.depth(), 1);

        adapter.destroy_session();
        assert!(!adapter.has_session());
        assert_eq!(backend.waits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.depth(), 0);

        // Late completion from the destroyed session
        sink.on_frame_ready(context(Some(1)), FrameStatus::Ok, image(&host), MediaTime::new(1, 1000), MediaTime::INVALID);
        assert_eq!(queue.depth(), 0);
        assert_eq!(host.ref_count(), 1);
        assert_eq!(adapter.delivery_stats().rejected, 1);
    }

    #[test]
    fn test_recreate_uses_new_epoch() {
        let backend = parked(false);
        let queue = Arc::new(ReorderQueue::new(4));
        let mut adapter = SessionAdapter::new(backend.clone(), queue.clone());

        adapter.create_session(params()).unwrap();
        adapter.recreate_session().unwrap();

        let sinks = backend.sinks.lock();
        assert_eq!(sinks.len(), 2);
        assert!(sinks[1].epoch() > sinks[0].epoch());
        assert_eq!(sinks[1].epoch(), queue.epoch());
    }

    #[test]
    fn test_create_failure_leaves_no_session() {
        let backend = parked(true);
        let queue = Arc::new(ReorderQueue::new(4));
        let mut adapter = SessionAdapter::new(backend, queue);

        assert!(adapter.create_session(params()).is_err());
        assert!(!adapter.has_session());
        let unit = AccessUnit {
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            dts_us: None,
            pts_us: None,
            keyframe: true,
        };
        assert_eq!(adapter.submit(&unit, CodecControl::empty()), Err(SubmitError::InvalidSession));
    }

    #[test]
    fn test_sort_clock_reset() {
        let state = DeliveryState::default();
        assert_eq!(state.assign(None, None), (i64::MIN, 0));
        assert_eq!(state.assign(Some(7), None), (7, 1));
        state.reset_clock();
        assert_eq!(state.assign(None, None), (i64::MIN, 0));
    }
}
