//! # Hardware Video Codec
//!
//! The consumer-facing decoder: feed compressed access units in decode
//! order, take pictures out in presentation order.
//!
//! ```text
//!              open()                decode()
//!   Closed ───────────► Opened ─────────────► Decoding ◄──DRAIN──► Draining
//!     ▲                                          │
//!     │ dispose()                 invalid session│
//!     └──────────────── (any) ◄── RestartPending ◄┘
//! ```
//!
//! `decode` never waits for the hardware (except while draining). It reports
//! `BufferedAndPicture` once the reorder queue holds a full reference window.

use crate::buffer::{BufferHandle, NativeFormat};
use crate::config::{CodecConfig, ConfigError, PictureDelivery};
use crate::frame_queue::{Frame, QueueStats, ReorderQueue};
use crate::h264_utils::{BitstreamError, H264Inspector, StreamInspector, StreamParams};
use crate::pixel_convert::{ConvertOutcome, PixelConverter, PlanarImage, SourceImage};
use crate::session::{
    AccessUnit, DecoderBackend, DeliveryStats, HwCodec, SessionAdapter, SessionError, SessionParams,
    SubmitError,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Codec is not open")]
    NotOpen,
    #[error("Codec {0:?} has no hardware path")]
    UnsupportedCodec(HwCodec),
    #[error("Interlaced content is not supported by the hardware path")]
    Interlaced,
    #[error("Bitstream error: {0}")]
    Bitstream(#[from] BitstreamError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type CodecResult<T> = Result<T, CodecError>;

// ============================================================================
// Public Types
// ============================================================================

bitflags::bitflags! {
    /// Codec control bitmask, forwarded to the session with every submission
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CodecControl: u32 {
        const SKIP_DEINTERLACE = 0x01;
        const NO_POSTPROC = 0x02;
        const DRAIN = 0x04;
    }
}

impl Default for CodecControl {
    fn default() -> Self {
        Self::empty()
    }
}

/// What the demuxer knows about the stream
#[derive(Debug, Clone)]
pub struct StreamHints {
    pub codec: HwCodec,
    /// Coded size; 0 means take it from the parameter sets
    pub width: u32,
    pub height: u32,
    /// avcC or Annex B parameter sets
    pub extradata: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CodecState {
    Closed,
    Opened,
    Decoding,
    Draining,
    RestartPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Input consumed, no picture ready yet
    Buffered,
    /// Input consumed and `get_picture` will return a picture
    BufferedAndPicture,
}

/// Image payload of a picture
#[derive(Debug)]
pub enum PictureData {
    /// Released (cleared or dropped)
    None,
    /// Decoder surface, zero-copy
    BufferRef(BufferHandle),
    /// Converted planar 4:2:0 copy
    Planar(PlanarImage),
    /// Packed 4:2:2 surface with its native row stride
    Packed { buffer: BufferHandle, stride: usize },
}

/// A decoded picture in presentation order
#[derive(Debug)]
pub struct Picture {
    pub dts_us: Option<i64>,
    pub pts_us: Option<i64>,
    pub duration_us: Option<i64>,
    pub width: u32,
    pub height: u32,
    /// Layout of the decoder surface this came from
    pub native_format: NativeFormat,
    /// Released without conversion because drop state was set
    pub dropped: bool,
    pub data: PictureData,
}

impl Picture {
    fn from_frame(frame: &Frame, dropped: bool) -> Self {
        Self {
            dts_us: frame.dts_us,
            pts_us: frame.pts_us,
            duration_us: frame.duration_us,
            width: frame.width,
            height: frame.height,
            native_format: frame.format,
            dropped,
            data: PictureData::None,
        }
    }

    /// Decoder surface held by this picture, if any
    pub fn buffer(&self) -> Option<&BufferHandle> {
        match &self.data {
            PictureData::BufferRef(buffer) | PictureData::Packed { buffer, .. } => Some(buffer),
            _ => None,
        }
    }

    pub fn planar(&self) -> Option<&PlanarImage> {
        match &self.data {
            PictureData::Planar(image) => Some(image),
            _ => None,
        }
    }
}

/// Codec statistics
#[derive(Debug, Clone, Serialize)]
pub struct CodecStats {
    pub name: String,
    pub state: CodecState,
    pub units_submitted: u64,
    pub units_skipped: u64,
    pub submit_failures: u64,
    pub session_restarts: u64,
    pub pictures_out: u64,
    pub pictures_dropped: u64,
    pub converge_count: u32,
    pub delivery: DeliveryStats,
    pub queue: QueueStats,
}

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct RestartPoint {
    dts_us: Option<i64>,
    pts_us: Option<i64>,
}

/// Per-open decoding state
#[derive(Debug, Default)]
struct SessionState {
    /// First keyframe seen since open/reset
    started: bool,
    drop_pictures: bool,
    control: CodecControl,
    /// Access units since the last keyframe
    last_keyframe: u32,
    restart: Option<RestartPoint>,
}

/// What `open` negotiated, kept for `reopen`
#[derive(Debug, Clone)]
struct OpenedStream {
    hints: StreamHints,
    config: CodecConfig,
    params: StreamParams,
    name: String,
}

#[derive(Debug, Default)]
struct Counters {
    units_submitted: u64,
    units_skipped: u64,
    submit_failures: u64,
    session_restarts: u64,
    pictures_out: u64,
    pictures_dropped: u64,
}

// ============================================================================
// Codec
// ============================================================================

pub struct HwVideoCodec {
    inspector: Arc<dyn StreamInspector>,
    converter: PixelConverter,
    queue: Arc<ReorderQueue>,
    adapter: SessionAdapter,
    state: CodecState,
    session: SessionState,
    stream: Option<OpenedStream>,
    counters: Counters,
}

impl HwVideoCodec {
    pub fn new(backend: Arc<dyn DecoderBackend>) -> Self {
        let queue = Arc::new(ReorderQueue::new(1));
        Self {
            inspector: Arc::new(H264Inspector),
            converter: PixelConverter::new(),
            adapter: SessionAdapter::new(backend, queue.clone()),
            queue,
            state: CodecState::Closed,
            session: SessionState::default(),
            stream: None,
            counters: Counters::default(),
        }
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn StreamInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Inspect the stream and create a decoder session.
    ///
    /// On any failure the codec stays `Closed` with no session.
    pub fn open(&mut self, hints: StreamHints, config: CodecConfig) -> CodecResult<()> {
        if self.state != CodecState::Closed {
            self.dispose();
        }
        config.validate()?;

        if hints.codec != HwCodec::H264 {
            tracing::info!("No hardware path for {:?}", hints.codec);
            return Err(CodecError::UnsupportedCodec(hints.codec));
        }

        let params = self.inspector.inspect(&hints.extradata)?;
        if params.interlaced {
            tracing::info!("Possible interlaced content, refusing hardware decode");
            return Err(CodecError::Interlaced);
        }

        let width = if hints.width > 0 { hints.width } else { params.width };
        let height = if hints.height > 0 { hints.height } else { params.height };

        self.adapter.create_session(SessionParams {
            codec: hints.codec,
            format: config.output_format,
            width,
            height,
            extradata: hints.extradata.clone(),
        })?;

        let max_depth = config.reorder_depth(params.max_num_ref_frames);
        self.queue.flush();
        self.queue.set_max_depth(max_depth);
        self.adapter.reset_sort_clock();

        let name = format!(
            "{}-{}",
            self.adapter.backend_name(),
            format!("{:?}", hints.codec).to_lowercase()
        );
        tracing::info!(
            "Opened {} {}x{} refs {} reorder depth {} delivery {:?}",
            name,
            width,
            height,
            params.max_num_ref_frames,
            max_depth,
            config.delivery
        );

        self.session = SessionState::default();
        self.counters = Counters::default();
        self.stream = Some(OpenedStream {
            hints,
            config,
            params,
            name,
        });
        self.state = CodecState::Opened;
        Ok(())
    }

    /// Destroy the session and release every queued frame
    pub fn dispose(&mut self) {
        self.adapter.destroy_session();
        self.queue.flush();
        if self.state != CodecState::Closed {
            tracing::debug!("Codec disposed");
        }
        self.state = CodecState::Closed;
        self.session = SessionState::default();
        self.stream = None;
    }

    /// Tear down and recreate the session with the same hints and config.
    ///
    /// The reorder budget survives.
    pub fn reopen(&mut self) -> CodecResult<()> {
        let stream = self.stream.clone().ok_or(CodecError::NotOpen)?;
        let max_depth = self.queue.max_depth();

        self.dispose();
        self.open(stream.hints, stream.config)?;
        self.queue.set_max_depth(max_depth);
        Ok(())
    }

    /// Drop everything in flight and start over at the next keyframe
    pub fn reset(&mut self) {
        if self.state == CodecState::Closed {
            return;
        }
        self.adapter.wait_for_async_frames();
        let flushed = self.queue.flush();
        self.adapter.reset_sort_clock();

        self.session.started = false;
        self.session.last_keyframe = 0;
        self.session.restart = None;
        if self.state != CodecState::Opened {
            self.state = self.running_state();
        }
        tracing::debug!("Codec reset, flushed {} frames", flushed);
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    /// Submit one access unit in decode order
    pub fn decode(&mut self, data: Bytes, dts_us: Option<i64>, pts_us: Option<i64>) -> CodecResult<DecodeStatus> {
        let stream = self.stream.as_ref().ok_or(CodecError::NotOpen)?;
        let wait_for_keyframe = stream.config.wait_for_keyframe;

        // End of stream: nothing to submit, but a drain still collects stragglers
        if data.is_empty() {
            if self.state == CodecState::Draining {
                self.adapter.wait_for_async_frames();
            }
            return Ok(self.picture_status());
        }

        let keyframe = self.inspector.is_keyframe(&stream.params, &data);
        if keyframe {
            self.session.last_keyframe = 0;
        } else {
            self.session.last_keyframe = self.session.last_keyframe.saturating_add(1);
        }

        match self.state {
            CodecState::Closed => return Err(CodecError::NotOpen),
            CodecState::Opened => self.state = self.running_state(),
            CodecState::RestartPending if !keyframe => {
                self.counters.units_skipped += 1;
                tracing::trace!("Skipping non-keyframe while session restarts");
                return Ok(self.picture_status());
            }
            CodecState::RestartPending => {
                if let Some(point) = self.session.restart.take() {
                    tracing::debug!(
                        "Resuming after session restart (invalidated at dts {:?} pts {:?})",
                        point.dts_us,
                        point.pts_us
                    );
                }
                self.state = self.running_state();
            }
            CodecState::Decoding | CodecState::Draining => {}
        }

        if !self.session.started {
            if keyframe || !wait_for_keyframe {
                self.session.started = true;
            } else {
                self.counters.units_skipped += 1;
                return Ok(self.picture_status());
            }
        }

        let unit = AccessUnit {
            data,
            dts_us,
            pts_us,
            keyframe,
        };
        self.submit(unit)?;

        if self.state == CodecState::Draining {
            self.adapter.wait_for_async_frames();
        }
        Ok(self.picture_status())
    }

    fn submit(&mut self, unit: AccessUnit) -> CodecResult<()> {
        match self.adapter.submit(&unit, self.session.control) {
            Ok(()) => {
                self.counters.units_submitted += 1;
                Ok(())
            }
            Err(SubmitError::InvalidSession) => self.restart_session(unit),
            Err(SubmitError::Failed(code)) => {
                self.counters.submit_failures += 1;
                tracing::debug!("Submit failed with status {} (dts {:?})", code, unit.dts_us);
                Ok(())
            }
        }
    }

    /// The hardware session was invalidated underneath us
    fn restart_session(&mut self, unit: AccessUnit) -> CodecResult<()> {
        tracing::warn!("Decoder session invalidated, restarting");
        self.counters.session_restarts += 1;
        let restart = RestartPoint {
            dts_us: unit.dts_us,
            pts_us: unit.pts_us,
        };
        self.session.restart = Some(restart);

        if let Err(e) = self.adapter.recreate_session() {
            tracing::warn!("Session restart failed: {}", e);
            self.dispose();
            return Err(e.into());
        }

        if !unit.keyframe {
            self.state = CodecState::RestartPending;
            return Ok(());
        }

        let retry = AccessUnit {
            dts_us: restart.dts_us,
            pts_us: restart.pts_us,
            ..unit
        };
        self.session.restart = None;
        self.state = self.running_state();
        match self.adapter.submit(&retry, self.session.control) {
            Ok(()) => self.counters.units_submitted += 1,
            Err(e) => {
                self.counters.submit_failures += 1;
                tracing::warn!("Resubmit after restart failed: {}", e);
                self.state = CodecState::RestartPending;
            }
        }
        Ok(())
    }

    fn running_state(&self) -> CodecState {
        if self.session.control.contains(CodecControl::DRAIN) {
            CodecState::Draining
        } else {
            CodecState::Decoding
        }
    }

    fn picture_status(&self) -> DecodeStatus {
        let ready = match self.state {
            CodecState::Draining => !self.queue.is_empty(),
            _ => self.queue.is_full(),
        };
        if ready {
            DecodeStatus::BufferedAndPicture
        } else {
            DecodeStatus::Buffered
        }
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Next picture in presentation order, `None` when nothing is ready
    pub fn get_picture(&mut self) -> CodecResult<Option<Picture>> {
        let stream = self.stream.as_ref().ok_or(CodecError::NotOpen)?;
        let delivery = stream.config.delivery;
        let accept_packed_422 = stream.config.accept_packed_422;

        let Some(frame) = self.queue.pop_head() else {
            return Ok(None);
        };

        if self.session.drop_pictures {
            self.counters.pictures_dropped += 1;
            return Ok(Some(Picture::from_frame(&frame, true)));
        }

        let mut picture = Picture::from_frame(&frame, false);
        picture.data = match delivery {
            PictureDelivery::BufferRef => PictureData::BufferRef(frame.buffer),
            PictureDelivery::CopyToPlanar => {
                if frame.format == NativeFormat::Uyvy422 && accept_packed_422 {
                    match packed_stride(&frame.buffer) {
                        Some(stride) => PictureData::Packed {
                            buffer: frame.buffer,
                            stride,
                        },
                        None => PictureData::BufferRef(frame.buffer),
                    }
                } else {
                    match self.convert(&frame) {
                        Some(image) => PictureData::Planar(image),
                        None => PictureData::BufferRef(frame.buffer),
                    }
                }
            }
        };

        self.counters.pictures_out += 1;
        Ok(Some(picture))
    }

    /// Planar copy of a frame, `None` to pass the surface through
    fn convert(&self, frame: &Frame) -> Option<PlanarImage> {
        let lock = match frame.buffer.lock() {
            Ok(lock) => lock,
            Err(e) => {
                tracing::warn!("Cannot map {} surface ({}), passing it through", frame.format, e);
                return None;
            }
        };
        let Some(source) = SourceImage::from_lock(frame.format, &lock) else {
            tracing::warn!("{} surface has no planes, passing it through", frame.format);
            return None;
        };

        let mut image = PlanarImage::new(frame.width, frame.height);
        match self.converter.convert(&source, frame.width, frame.height, &mut image) {
            ConvertOutcome::Converted => Some(image),
            ConvertOutcome::Unsupported | ConvertOutcome::Malformed => {
                tracing::debug!("Passing {} surface through unconverted", frame.format);
                None
            }
        }
    }

    /// Release whatever surface the picture still holds
    pub fn clear_picture(&mut self, picture: &mut Picture) {
        picture.data = PictureData::None;
    }

    // ========================================================================
    // Control
    // ========================================================================

    pub fn set_drop_state(&mut self, drop_pictures: bool) {
        self.session.drop_pictures = drop_pictures;
    }

    pub fn set_codec_control(&mut self, flags: CodecControl) {
        self.session.control = flags;
        self.state = match self.state {
            CodecState::Decoding | CodecState::Draining => self.running_state(),
            other => other,
        };
    }

    pub fn codec_control(&self) -> CodecControl {
        self.session.control
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Pictures the consumer may hold at once without starving the decoder
    pub fn allowed_references(&self) -> u32 {
        let delivery = self
            .stream
            .as_ref()
            .map(|s| s.config.delivery)
            .unwrap_or_default();
        match delivery {
            PictureDelivery::BufferRef => 5,
            PictureDelivery::CopyToPlanar => 0,
        }
    }

    /// Access units since the last keyframe
    pub fn converge_count(&self) -> u32 {
        self.session.last_keyframe
    }

    pub fn name(&self) -> String {
        match &self.stream {
            Some(stream) => stream.name.clone(),
            None => self.adapter.backend_name().to_string(),
        }
    }

    pub fn state(&self) -> CodecState {
        self.state
    }

    pub fn queue(&self) -> &ReorderQueue {
        &self.queue
    }

    pub fn stats(&self) -> CodecStats {
        CodecStats {
            name: self.name(),
            state: self.state,
            units_submitted: self.counters.units_submitted,
            units_skipped: self.counters.units_skipped,
            submit_failures: self.counters.submit_failures,
            session_restarts: self.counters.session_restarts,
            pictures_out: self.counters.pictures_out,
            pictures_dropped: self.counters.pictures_dropped,
            converge_count: self.converge_count(),
            delivery: self.adapter.delivery_stats(),
            queue: self.queue.stats(),
        }
    }
}

impl Drop for HwVideoCodec {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn packed_stride(buffer: &BufferHandle) -> Option<usize> {
    let stride = match buffer.lock() {
        Ok(lock) => lock.plane(0).map(|plane| plane.stride),
        Err(e) => {
            tracing::warn!("Cannot map packed surface ({}), passing it through", e);
            return None;
        }
    };
    if stride.is_none() {
        tracing::warn!("Packed surface has no base address, passing it through");
    }
    stride
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{self, SimulatedBackend, SyntheticStream};

    fn hints(ref_frames: u32, interlaced: bool) -> StreamHints {
        StreamHints {
            codec: HwCodec::H264,
            width: 0,
            height: 0,
            extradata: simulated::avcc_extradata(64, 48, ref_frames, interlaced),
        }
    }

    fn open_codec(backend: &Arc<SimulatedBackend>, config: CodecConfig) -> HwVideoCodec {
        let mut codec = HwVideoCodec::new(backend.clone());
        codec.open(hints(2, false), config).unwrap();
        codec
    }

    fn drain(codec: &mut HwVideoCodec) -> Vec<Picture> {
        std::iter::from_fn(|| codec.get_picture().unwrap()).collect()
    }

    #[test]
    fn test_interlaced_open_fails_without_session() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = HwVideoCodec::new(backend.clone());

        let result = codec.open(hints(2, true), CodecConfig::default());
        assert!(matches!(result, Err(CodecError::Interlaced)));
        assert_eq!(codec.state(), CodecState::Closed);
        assert_eq!(backend.control().sessions_created(), 0);
        assert!(matches!(codec.decode(Bytes::from_static(&[1]), None, None), Err(CodecError::NotOpen)));
    }

    #[test]
    fn test_open_rejects_bad_streams() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = HwVideoCodec::new(backend.clone());

        let mut vp9 = hints(2, false);
        vp9.codec = HwCodec::VP9;
        assert!(matches!(codec.open(vp9, CodecConfig::default()), Err(CodecError::UnsupportedCodec(HwCodec::VP9))));

        let mut garbage = hints(2, false);
        garbage.extradata = Bytes::from_static(&[1, 2, 3]);
        assert!(matches!(codec.open(garbage, CodecConfig::default()), Err(CodecError::Bitstream(_))));

        backend.control().fail_session_creation(true);
        assert!(matches!(codec.open(hints(2, false), CodecConfig::default()), Err(CodecError::Session(_))));
        assert_eq!(codec.state(), CodecState::Closed);
        assert_eq!(backend.control().sessions_alive(), 0);
    }

    #[test]
    fn test_open_sets_reorder_depth() {
        let backend = Arc::new(SimulatedBackend::inline());
        let codec = open_codec(&backend, CodecConfig::default());

        assert_eq!(codec.state(), CodecState::Opened);
        assert_eq!(codec.queue().max_depth(), 3);
        assert_eq!(codec.name(), "simulated-h264");
    }

    #[test]
    fn test_ibbp_stream_comes_out_in_presentation_order() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = open_codec(&backend, CodecConfig::default());

        let mut out = Vec::new();
        for unit in SyntheticStream::ibbp(13, 40_000).units() {
            if codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap() == DecodeStatus::BufferedAndPicture {
                out.push(codec.get_picture().unwrap().unwrap());
            }
        }
        out.extend(drain(&mut codec));

        let pts: Vec<i64> = out.iter().map(|p| p.pts_us.unwrap()).collect();
        let expected: Vec<i64> = (0..13).map(|i| i * 40_000).collect();
        assert_eq!(pts, expected);
        assert!(out.iter().all(|p| p.buffer().is_some()));
    }

    #[test]
    fn test_picture_reported_at_full_window() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = open_codec(&backend, CodecConfig::default());
        let units = SyntheticStream::ibbp(6, 40_000).units();

        let statuses: Vec<DecodeStatus> = units
            .into_iter()
            .take(3)
            .map(|u| codec.decode(u.data, u.dts_us, u.pts_us).unwrap())
            .collect();
        assert_eq!(
            statuses,
            vec![DecodeStatus::Buffered, DecodeStatus::Buffered, DecodeStatus::BufferedAndPicture]
        );
        assert_eq!(codec.state(), CodecState::Decoding);
    }

    #[test]
    fn test_drop_state_skips_conversion() {
        let backend = Arc::new(SimulatedBackend::inline());
        let config = CodecConfig {
            delivery: PictureDelivery::CopyToPlanar,
            ..Default::default()
        };
        let mut codec = open_codec(&backend, config);

        for unit in SyntheticStream::ibbp(2, 40_000).units() {
            codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap();
        }
        assert_eq!(codec.queue().depth(), 2);
        codec.set_drop_state(true);

        let first = codec.get_picture().unwrap().unwrap();
        let second = codec.get_picture().unwrap().unwrap();
        assert!(codec.get_picture().unwrap().is_none());

        for (picture, pts) in [(&first, 0), (&second, 40_000)] {
            assert!(picture.dropped);
            assert!(matches!(picture.data, PictureData::None));
            assert_eq!(picture.pts_us, Some(pts));
        }
        assert_eq!(codec.stats().pictures_dropped, 2);
        assert_eq!(backend.control().lock_calls(), 0);
        assert_eq!(backend.control().outstanding_references(), 0);
        assert!(!backend.control().any_over_released());
    }

    #[test]
    fn test_drop_state_can_be_cleared() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = open_codec(&backend, CodecConfig::default());
        for unit in SyntheticStream::ibbp(4, 40_000).units() {
            codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap();
        }

        codec.set_drop_state(true);
        assert!(codec.get_picture().unwrap().unwrap().dropped);
        codec.set_drop_state(false);
        let next = codec.get_picture().unwrap().unwrap();
        assert!(!next.dropped);
        assert!(next.buffer().is_some());
        drop(next);

        codec.dispose();
        assert_eq!(backend.control().outstanding_references(), 0);
    }

    #[test]
    fn test_unmappable_surface_passes_through() {
        let backend = Arc::new(SimulatedBackend::inline());
        let config = CodecConfig {
            delivery: PictureDelivery::CopyToPlanar,
            ..Default::default()
        };
        let mut codec = open_codec(&backend, config);
        backend.control().unmappable_next_frames(1);

        for unit in SyntheticStream::ibbp(3, 40_000).units() {
            codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap();
        }

        let first = codec.get_picture().unwrap().unwrap();
        assert_eq!(first.pts_us, Some(0));
        assert!(!first.dropped);
        assert!(first.planar().is_none());
        assert!(first.buffer().is_some());

        let second = codec.get_picture().unwrap().unwrap();
        assert!(second.planar().is_some());
        assert_eq!(codec.stats().pictures_out, 2);

        drop(first);
        drop(second);
        codec.dispose();
        assert_eq!(backend.control().outstanding_references(), 0);
    }

    #[test]
    fn test_unmappable_packed_surface_passes_through() {
        let backend = Arc::new(SimulatedBackend::inline());
        let config = CodecConfig {
            delivery: PictureDelivery::CopyToPlanar,
            accept_packed_422: true,
            output_format: NativeFormat::Uyvy422,
            ..Default::default()
        };
        let mut codec = open_codec(&backend, config);
        backend.control().unmappable_next_frames(1);
        for unit in SyntheticStream::ibbp(3, 40_000).units() {
            codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap();
        }

        let picture = codec.get_picture().unwrap().unwrap();
        assert!(matches!(picture.data, PictureData::BufferRef(_)));
        let next = codec.get_picture().unwrap().unwrap();
        assert!(matches!(next.data, PictureData::Packed { .. }));
    }

    #[test]
    fn test_clear_picture_releases_surface() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = open_codec(&backend, CodecConfig::default());
        for unit in SyntheticStream::ibbp(3, 40_000).units() {
            codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap();
        }

        let mut picture = codec.get_picture().unwrap().unwrap();
        assert_eq!(backend.control().outstanding_references(), 3);
        codec.clear_picture(&mut picture);
        codec.clear_picture(&mut picture);
        assert_eq!(backend.control().outstanding_references(), 2);
        assert!(picture.buffer().is_none());
    }

    #[test]
    fn test_copy_delivery_converts_to_planar() {
        let backend = Arc::new(SimulatedBackend::inline());
        let config = CodecConfig {
            delivery: PictureDelivery::CopyToPlanar,
            ..Default::default()
        };
        let mut codec = open_codec(&backend, config);
        assert_eq!(codec.allowed_references(), 0);

        for unit in SyntheticStream::ibbp(3, 40_000).units() {
            codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap();
        }
        let picture = codec.get_picture().unwrap().unwrap();
        let image = picture.planar().unwrap();

        assert_eq!((image.width, image.height), (64, 48));
        assert_eq!(image.strides, [64, 32, 32]);
        assert_eq!(image.row(1, 0)[0], 128);
        // Converted pictures do not pin the surface
        assert_eq!(backend.control().outstanding_references(), 2);
    }

    #[test]
    fn test_packed_422_passthrough_when_accepted() {
        let backend = Arc::new(SimulatedBackend::inline());
        let config = CodecConfig {
            delivery: PictureDelivery::CopyToPlanar,
            accept_packed_422: true,
            output_format: NativeFormat::Uyvy422,
            ..Default::default()
        };
        let mut codec = open_codec(&backend, config);
        for unit in SyntheticStream::ibbp(3, 40_000).units() {
            codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap();
        }

        let picture = codec.get_picture().unwrap().unwrap();
        match &picture.data {
            PictureData::Packed { buffer, stride } => {
                assert_eq!(buffer.pixel_format(), NativeFormat::Uyvy422);
                assert_eq!(*stride, simulated::padded_stride(NativeFormat::Uyvy422.min_stride(0, 64)));
            }
            other => panic!("expected packed picture, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_format_passes_through() {
        let backend = Arc::new(SimulatedBackend::inline());
        let config = CodecConfig {
            delivery: PictureDelivery::CopyToPlanar,
            output_format: NativeFormat::from_fourcc(u32::from_be_bytes(*b"v210")),
            ..Default::default()
        };
        let mut codec = open_codec(&backend, config);
        for unit in SyntheticStream::ibbp(3, 40_000).units() {
            codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap();
        }

        let picture = codec.get_picture().unwrap().unwrap();
        assert!(matches!(picture.data, PictureData::BufferRef(_)));
    }

    #[test]
    fn test_waits_for_first_keyframe() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = open_codec(&backend, CodecConfig::default());

        codec.decode(simulated::slice_unit(4), Some(0), Some(0)).unwrap();
        codec.decode(simulated::slice_unit(4), Some(1), Some(1)).unwrap();
        assert_eq!(backend.control().units_submitted(), 0);
        assert_eq!(codec.stats().units_skipped, 2);
        assert_eq!(codec.converge_count(), 2);

        codec.decode(simulated::idr_unit(4), Some(2), Some(2)).unwrap();
        codec.decode(simulated::slice_unit(4), Some(3), Some(3)).unwrap();
        assert_eq!(backend.control().units_submitted(), 2);
        assert_eq!(codec.converge_count(), 1);
    }

    #[test]
    fn test_reset_flushes_and_restarts_sort_keys() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = open_codec(&backend, CodecConfig::default());
        for unit in SyntheticStream::ibbp(5, 40_000).units() {
            codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap();
        }
        assert!(codec.queue().depth() > 0);

        codec.reset();
        assert_eq!(codec.queue().depth(), 0);
        assert!(codec.get_picture().unwrap().is_none());
        assert_eq!(backend.control().outstanding_references(), 0);

        // Keyframe gating applies again
        codec.decode(simulated::slice_unit(4), None, None).unwrap();
        assert_eq!(codec.queue().depth(), 0);
        codec.decode(simulated::idr_unit(4), None, None).unwrap();
        codec.decode(simulated::slice_unit(4), None, None).unwrap();
        codec.decode(simulated::slice_unit(4), None, None).unwrap();

        let keys: Vec<Option<i64>> = drain(&mut codec).iter().map(|p| p.pts_us).collect();
        assert_eq!(keys, vec![None, None, None]);
    }

    #[test]
    fn test_unknown_timestamps_keep_submission_order() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = open_codec(&backend, CodecConfig::default());

        codec.decode(simulated::idr_unit(4), None, None).unwrap();
        codec.decode(simulated::slice_unit(4), None, None).unwrap();
        codec.decode(simulated::slice_unit(4), None, None).unwrap();

        let dts: Vec<_> = drain(&mut codec).iter().map(|p| (p.pts_us, p.dts_us)).collect();
        assert_eq!(dts, vec![(None, None); 3]);
        let queue = codec.stats().queue;
        assert_eq!(queue.frames_popped, 3);
    }

    #[test]
    fn test_invalid_session_on_keyframe_resubmits() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = open_codec(&backend, CodecConfig::default());
        codec.decode(simulated::idr_unit(4), Some(0), Some(0)).unwrap();

        backend.control().invalidate_next_submit();
        codec.decode(simulated::idr_unit(4), Some(40_000), Some(40_000)).unwrap();

        assert_eq!(codec.state(), CodecState::Decoding);
        assert_eq!(codec.stats().session_restarts, 1);
        assert_eq!(backend.control().sessions_created(), 2);
        assert_eq!(backend.control().sessions_alive(), 1);
        // The first session's frame went with it; the resubmitted one survives
        let pts: Vec<_> = drain(&mut codec).iter().map(|p| p.pts_us).collect();
        assert_eq!(pts, vec![Some(40_000)]);
    }

    #[test]
    fn test_invalid_session_skips_until_keyframe() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = open_codec(&backend, CodecConfig::default());
        codec.decode(simulated::idr_unit(4), Some(0), Some(0)).unwrap();

        backend.control().invalidate_next_submit();
        codec.decode(simulated::slice_unit(4), Some(1), Some(1)).unwrap();
        assert_eq!(codec.state(), CodecState::RestartPending);

        codec.decode(simulated::slice_unit(4), Some(2), Some(2)).unwrap();
        assert_eq!(codec.state(), CodecState::RestartPending);
        assert_eq!(backend.control().units_submitted(), 1);

        codec.decode(simulated::idr_unit(4), Some(3), Some(3)).unwrap();
        assert_eq!(codec.state(), CodecState::Decoding);
        assert_eq!(backend.control().units_submitted(), 2);
    }

    #[test]
    fn test_failed_frames_are_dropped_and_counted() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = open_codec(&backend, CodecConfig::default());

        backend.control().fail_next_frames(1);
        backend.control().drop_next_frames(1);
        for unit in SyntheticStream::ibbp(4, 40_000).units() {
            codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap();
        }

        assert_eq!(codec.stats().delivery.failed, 2);
        assert_eq!(drain(&mut codec).len(), 2);
        assert_eq!(backend.control().outstanding_references(), 0);
    }

    #[test]
    fn test_reopen_preserves_reorder_depth() {
        let backend = Arc::new(SimulatedBackend::inline());
        let mut codec = open_codec(&backend, CodecConfig::default());
        codec.queue().set_max_depth(9);

        codec.reopen().unwrap();
        assert_eq!(codec.state(), CodecState::Opened);
        assert_eq!(codec.queue().max_depth(), 9);
        assert_eq!(backend.control().sessions_created(), 2);
        assert_eq!(backend.control().sessions_alive(), 1);

        codec.dispose();
        assert!(matches!(codec.reopen(), Err(CodecError::NotOpen)));
    }

    #[test]
    fn test_drain_waits_for_threaded_delivery() {
        let backend = Arc::new(SimulatedBackend::threaded());
        let mut codec = open_codec(&backend, CodecConfig::default());
        codec.set_codec_control(CodecControl::DRAIN | CodecControl::NO_POSTPROC);

        let status = codec.decode(simulated::idr_unit(4), Some(0), Some(0)).unwrap();
        assert_eq!(codec.state(), CodecState::Draining);
        assert_eq!(status, DecodeStatus::BufferedAndPicture);
        assert_eq!(backend.control().last_control(), CodecControl::DRAIN | CodecControl::NO_POSTPROC);

        codec.set_codec_control(CodecControl::empty());
        assert_eq!(codec.state(), CodecState::Decoding);
    }

    #[test]
    fn test_end_of_stream_drain_collects_everything() {
        let backend = Arc::new(SimulatedBackend::threaded());
        let mut codec = open_codec(&backend, CodecConfig::default());
        for unit in SyntheticStream::ibbp(10, 40_000).units() {
            codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap();
        }

        codec.set_codec_control(CodecControl::DRAIN);
        assert_eq!(codec.decode(Bytes::new(), None, None).unwrap(), DecodeStatus::BufferedAndPicture);
        assert_eq!(drain(&mut codec).len(), 10);
        assert_eq!(codec.decode(Bytes::new(), None, None).unwrap(), DecodeStatus::Buffered);
    }

    #[test]
    fn test_dispose_with_threaded_delivery_releases_everything() {
        let backend = Arc::new(SimulatedBackend::threaded());
        let mut codec = open_codec(&backend, CodecConfig::default());
        for unit in SyntheticStream::ibbp(30, 40_000).units() {
            codec.decode(unit.data, unit.dts_us, unit.pts_us).unwrap();
            if unit.dts_us == Some(0) {
                let _ = codec.get_picture().unwrap();
            }
        }

        codec.dispose();
        assert_eq!(codec.state(), CodecState::Closed);
        assert_eq!(backend.control().sessions_alive(), 0);
        assert_eq!(backend.control().outstanding_references(), 0);
        assert!(!backend.control().any_over_released());
    }

    #[test]
    fn test_control_flags() {
        let mut flags = CodecControl::empty();
        flags |= CodecControl::SKIP_DEINTERLACE;
        flags.insert(CodecControl::DRAIN);
        assert!(flags.contains(CodecControl::DRAIN));
        flags.remove(CodecControl::DRAIN);
        assert_eq!(flags, CodecControl::SKIP_DEINTERLACE);
        assert_eq!(CodecControl::from_bits_truncate(0xff).bits(), 0x07);
        assert_eq!(CodecControl::default(), CodecControl::empty());

        let both = CodecControl::DRAIN | CodecControl::NO_POSTPROC;
        let json = serde_json::to_string(&both).unwrap();
        assert_eq!(serde_json::from_str::<CodecControl>(&json).unwrap(), both);
    }

    #[test]
    fn test_allowed_references_default() {
        let backend = Arc::new(SimulatedBackend::inline());
        let codec = HwVideoCodec::new(backend);
        assert_eq!(codec.allowed_references(), 5);
    }
}
