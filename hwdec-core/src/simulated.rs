//! # Simulated Decoder Backend
//!
//! Software stand-in for a hardware decode session. Completes every
//! submission in decode order with a flat synthetic surface, either inline
//! on the submitting thread or from a delivery worker thread, the way real
//! hardware callbacks arrive.
//!
//! Failure injection (`SimulatedControl`) covers the paths a real session
//! hits: failed completions, dropped frames, invalidated sessions and
//! creation failures. Every surface handed out is tracked so tests can
//! check that each reference is released exactly once.

use crate::buffer::{BufferHandle, HostBuffer, NativeFormat};
use crate::codec::CodecControl;
use crate::h264_utils::{to_avcc, AvcConfig, BitWriter};
use crate::session::{
    AccessUnit, DecoderBackend, DecoderSession, FrameContext, FrameSink, FrameStatus, HwCodec,
    MediaTime, SessionError, SessionParams, SubmitError,
};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Status codes reported by injected failures
pub const STATUS_DECODE_FAILED: i32 = -12909;
pub const STATUS_CREATE_FAILED: i32 = -12911;

// ============================================================================
// Control / Fault Injection
// ============================================================================

/// Shared knobs and counters for every session of one backend
#[derive(Default)]
pub struct SimulatedControl {
    sessions_created: AtomicU32,
    sessions_alive: AtomicU32,
    units_submitted: AtomicU64,
    fail_create: AtomicBool,
    invalidate_next: AtomicBool,
    fail_frames: AtomicU32,
    drop_frames: AtomicU32,
    unmappable_frames: AtomicU32,
    last_control: AtomicU32,
    buffers: Mutex<Vec<Arc<HostBuffer>>>,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl SimulatedControl {
    pub fn fail_session_creation(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Next submit reports an invalidated session
    pub fn invalidate_next_submit(&self) {
        self.invalidate_next.store(true, Ordering::SeqCst);
    }

    /// Next `count` completions carry an error status
    pub fn fail_next_frames(&self, count: u32) {
        self.fail_frames.fetch_add(count, Ordering::SeqCst);
    }

    /// Next `count` completions carry no image
    pub fn drop_next_frames(&self, count: u32) {
        self.drop_frames.fetch_add(count, Ordering::SeqCst);
    }

    /// Next `count` surfaces refuse to be locked
    pub fn unmappable_next_frames(&self, count: u32) {
        self.unmappable_frames.fetch_add(count, Ordering::SeqCst);
    }

    pub fn sessions_created(&self) -> u32 {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn sessions_alive(&self) -> u32 {
        self.sessions_alive.load(Ordering::SeqCst)
    }

    /// Successful submissions across all sessions
    pub fn units_submitted(&self) -> u64 {
        self.units_submitted.load(Ordering::SeqCst)
    }

    /// Flags seen on the most recent submission
    pub fn last_control(&self) -> CodecControl {
        CodecControl::from_bits_truncate(self.last_control.load(Ordering::SeqCst))
    }

    /// References still held on surfaces this backend produced
    pub fn outstanding_references(&self) -> isize {
        self.buffers.lock().iter().map(|b| b.ref_count()).sum()
    }

    /// Base-address locks taken on surfaces this backend produced
    pub fn lock_calls(&self) -> usize {
        self.buffers.lock().iter().map(|b| b.lock_calls()).sum()
    }

    pub fn any_over_released(&self) -> bool {
        self.buffers.lock().iter().any(|b| b.over_released())
    }

    fn make_surface(&self, params: &SessionParams, pts_us: Option<i64>) -> BufferHandle {
        let luma = match pts_us {
            Some(pts) => 16 + (pts / 1000).rem_euclid(220) as u8,
            None => 128,
        };
        let (w, h) = (params.width, params.height);
        let host = match params.format {
            NativeFormat::Nv12VideoRange => {
                HostBuffer::flat_nv12(w, h, padded_stride(params.format.min_stride(0, w)), luma, 128, 128)
            }
            NativeFormat::Uyvy422 => {
                HostBuffer::flat_uyvy(w, h, padded_stride(params.format.min_stride(0, w)), luma, 128, 128)
            }
            NativeFormat::Bgra32 => {
                HostBuffer::flat_bgra(w, h, padded_stride(params.format.min_stride(0, w)), luma, luma, luma)
            }
            other => {
                let stride = padded_stride(other.min_stride(0, w));
                HostBuffer::from_planes(other, w, h, vec![(vec![luma; stride * h as usize], stride)])
            }
        };
        if take_one(&self.unmappable_frames) {
            host.set_unmappable(true);
        }
        self.buffers.lock().push(host.clone());
        BufferHandle::adopt(host)
    }

    fn complete(&self, params: &SessionParams, context: FrameContext) -> Completion {
        let (status, image) = if take_one(&self.fail_frames) {
            let status = FrameStatus::Failed(STATUS_DECODE_FAILED);
            (status, Some(self.make_surface(params, context.pts_us)))
        } else if take_one(&self.drop_frames) {
            (FrameStatus::Ok, None)
        } else {
            (FrameStatus::Ok, Some(self.make_surface(params, context.pts_us)))
        };
        Completion {
            context,
            status,
            image,
            presentation_time: MediaTime::from_micros(context.pts_us),
        }
    }
}

/// Row stride the simulated surfaces use: 64-byte aligned plus padding
pub fn padded_stride(row_bytes: usize) -> usize {
    ((row_bytes + 63) & !63) + 32
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Completion runs inside `submit`
    Inline,
    /// Completion runs on a per-session worker thread
    Threaded,
}

pub struct SimulatedBackend {
    delivery: Delivery,
    control: Arc<SimulatedControl>,
}

impl SimulatedBackend {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            control: Arc::new(SimulatedControl::default()),
        }
    }

    pub fn inline() -> Self {
        Self::new(Delivery::Inline)
    }

    pub fn threaded() -> Self {
        Self::new(Delivery::Threaded)
    }

    pub fn control(&self) -> &Arc<SimulatedControl> {
        &self.control
    }
}

impl DecoderBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn create_session(
        &self,
        params: &SessionParams,
        sink: Arc<FrameSink>,
    ) -> Result<Box<dyn DecoderSession>, SessionError> {
        if !matches!(params.codec, HwCodec::H264 | HwCodec::H265) {
            return Err(SessionError::UnsupportedCodec(params.codec));
        }
        if self.control.fail_create.load(Ordering::SeqCst) {
            return Err(SessionError::CreateFailed(STATUS_CREATE_FAILED));
        }

        let worker = match self.delivery {
            Delivery::Inline => None,
            Delivery::Threaded => Some(Worker::spawn(sink.clone())),
        };

        self.control.sessions_created.fetch_add(1, Ordering::SeqCst);
        self.control.sessions_alive.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedSession {
            params: params.clone(),
            sink,
            control: self.control.clone(),
            worker,
        }))
    }
}

// ============================================================================
// Session
// ============================================================================

struct Completion {
    context: FrameContext,
    status: FrameStatus,
    image: Option<BufferHandle>,
    presentation_time: MediaTime,
}

impl Completion {
    fn deliver(self, sink: &FrameSink) {
        sink.on_frame_ready(
            self.context,
            self.status,
            self.image,
            self.presentation_time,
            MediaTime::INVALID,
        );
    }
}

/// Delivery thread plus an in-flight counter for `wait_for_async_frames`
struct Worker {
    tx: Option<mpsc::Sender<Completion>>,
    handle: Option<JoinHandle<()>>,
    in_flight: Arc<(Mutex<usize>, Condvar)>,
}

impl Worker {
    fn spawn(sink: Arc<FrameSink>) -> Self {
        let (tx, rx) = mpsc::channel::<Completion>();
        let in_flight = Arc::new((Mutex::new(0usize), Condvar::new()));
        let pending = in_flight.clone();

        let handle = thread::spawn(move || {
            for completion in rx {
                completion.deliver(&sink);
                let (count, done) = &*pending;
                let mut count = count.lock();
                *count = count.saturating_sub(1);
                done.notify_all();
            }
        });

        Self {
            tx: Some(tx),
            handle: Some(handle),
            in_flight,
        }
    }

    fn send(&self, completion: Completion) -> Result<(), SubmitError> {
        let tx = self.tx.as_ref().ok_or(SubmitError::InvalidSession)?;
        *self.in_flight.0.lock() += 1;
        if tx.send(completion).is_err() {
            *self.in_flight.0.lock() -= 1;
            tracing::warn!("Simulated delivery thread is gone");
            return Err(SubmitError::InvalidSession);
        }
        Ok(())
    }

    fn wait_idle(&self) {
        let (count, done) = &*self.in_flight;
        let mut count = count.lock();
        while *count > 0 {
            done.wait(&mut count);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Closing the channel ends the thread after it drains
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Simulated delivery thread panicked");
            }
        }
    }
}

struct SimulatedSession {
    params: SessionParams,
    sink: Arc<FrameSink>,
    control: Arc<SimulatedControl>,
    worker: Option<Worker>,
}

impl DecoderSession for SimulatedSession {
    fn submit(
        &mut self,
        _unit: &AccessUnit,
        context: FrameContext,
        control: CodecControl,
    ) -> Result<(), SubmitError> {
        if self.control.invalidate_next.swap(false, Ordering::SeqCst) {
            return Err(SubmitError::InvalidSession);
        }
        self.control.last_control.store(control.bits(), Ordering::SeqCst);

        let completion = self.control.complete(&self.params, context);
        match &self.worker {
            Some(worker) => worker.send(completion)?,
            None => completion.deliver(&self.sink),
        }
        self.control.units_submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait_for_async_frames(&mut self) {
        if let Some(worker) = &self.worker {
            worker.wait_idle();
        }
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        self.worker.take();
        self.control.sessions_alive.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Synthetic Bitstream
// ============================================================================

/// avcC record with one High-profile SPS describing the given stream
pub fn avcc_extradata(width: u32, height: u32, ref_frames: u32, interlaced: bool) -> Bytes {
    let field = if interlaced { 2 } else { 1 };
    let width_mbs = (width + 15) / 16;
    let height_map_units = (height + 16 * field - 1) / (16 * field);
    let crop_right = (width_mbs * 16 - width) / 2;
    let crop_bottom = (height_map_units * 16 * field - height) / (2 * field);

    let mut bw = BitWriter::new();
    bw.write_bits(100, 8); // profile_idc
    bw.write_bits(0, 8); // constraint flags
    bw.write_bits(31, 8); // level_idc
    bw.write_ue(0); // sps id
    bw.write_ue(1); // chroma 4:2:0
    bw.write_ue(0); // luma bit depth - 8
    bw.write_ue(0); // chroma bit depth - 8
    bw.write_bool(false); // qpprime_y_zero_transform_bypass
    bw.write_bool(false); // no scaling matrix
    bw.write_ue(0); // log2_max_frame_num - 4
    bw.write_ue(0); // poc type 0
    bw.write_ue(2); // log2_max_poc_lsb - 4
    bw.write_ue(ref_frames);
    bw.write_bool(false); // gaps_in_frame_num
    bw.write_ue(width_mbs - 1);
    bw.write_ue(height_map_units - 1);
    bw.write_bool(!interlaced); // frame_mbs_only
    if interlaced {
        bw.write_bool(true); // mb_adaptive_frame_field
    }
    bw.write_bool(true); // direct_8x8_inference
    let cropped = crop_right > 0 || crop_bottom > 0;
    bw.write_bool(cropped);
    if cropped {
        bw.write_ue(0);
        bw.write_ue(crop_right);
        bw.write_ue(0);
        bw.write_ue(crop_bottom);
    }
    bw.write_bool(false); // no VUI

    let mut sps = vec![0x67];
    sps.extend(bw.finish());

    let config = AvcConfig {
        profile: 100,
        compatibility: 0,
        level: 31,
        nal_length_size: 4,
        sps: vec![sps],
        pps: vec![vec![0x68, 0xEB, 0xE3, 0xCB, 0x22, 0xC0]],
    };
    Bytes::from(config.to_bytes())
}

/// Length-prefixed access unit holding one IDR slice
pub fn idr_unit(nal_length_size: usize) -> Bytes {
    Bytes::from(to_avcc(&[&[0x65, 0x88, 0x84, 0x00, 0x21]], nal_length_size))
}

/// Length-prefixed access unit holding one non-IDR slice
pub fn slice_unit(nal_length_size: usize) -> Bytes {
    Bytes::from(to_avcc(&[&[0x41, 0x9a, 0x02, 0x1f]], nal_length_size))
}

/// I/P/B access units in decode order with presentation timestamps
#[derive(Debug, Clone)]
pub struct SyntheticStream {
    count: usize,
    frame_duration_us: i64,
    idr_interval: Option<usize>,
    nal_length_size: usize,
}

impl SyntheticStream {
    /// `I B B P B B P ...` in display order, one IDR at the start
    pub fn ibbp(count: usize, frame_duration_us: i64) -> Self {
        Self {
            count,
            frame_duration_us,
            idr_interval: None,
            nal_length_size: 4,
        }
    }

    /// Make every anchor whose display index is a multiple of `interval` an IDR
    pub fn with_idr_interval(mut self, interval: usize) -> Self {
        self.idr_interval = (interval > 0).then_some(interval);
        self
    }

    /// Display indices in decode order
    fn decode_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.count);
        if self.count == 0 {
            return order;
        }
        order.push(0);
        let mut anchor = 3;
        while anchor < self.count {
            order.extend([anchor, anchor - 2, anchor - 1]);
            anchor += 3;
        }
        // Trailing frames after the last anchor are coded as P frames
        order.extend((anchor - 2)..self.count);
        order
    }

    pub fn units(&self) -> Vec<AccessUnit> {
        let dur = self.frame_duration_us;
        self.decode_order()
            .into_iter()
            .enumerate()
            .map(|(decode_index, display)| {
                let anchor = display % 3 == 0;
                let keyframe = display == 0
                    || (anchor && self.idr_interval.is_some_and(|n| display % n == 0));
                AccessUnit {
                    data: if keyframe {
                        idr_unit(self.nal_length_size)
                    } else {
                        slice_unit(self.nal_length_size)
                    },
                    dts_us: Some((decode_index as i64 - 1) * dur),
                    pts_us: Some(display as i64 * dur),
                    keyframe,
                }
            })
            .collect()
    }
}
