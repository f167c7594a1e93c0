//! # Image Buffers - Externally Owned Decoder Surfaces
//!
//! Hardware decoders hand out reference-counted image buffers whose memory
//! they own. This module wraps them:
//! - `ImageBuffer`: the decoder-side surface (retain/release, lock/unlock)
//! - `BufferHandle`: one owned reference, released exactly once on drop
//! - `BufferLock`: scoped base-address lock; plane data is only reachable
//!   through the guard
//! - `HostBuffer`: system-memory surface with reference accounting
//!
//! ```text
//! decoder ──adopt──► BufferHandle ──lock()──► BufferLock ──plane(i)──► &[u8]
//!                        │                        │
//!                      drop                     drop
//!                        ▼                        ▼
//!                    release()           unlock_base_address()
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer is already locked")]
    AlreadyLocked,
    #[error("Buffer base address unavailable")]
    NoBaseAddress,
}

// ============================================================================
// Native Pixel Formats
// ============================================================================

/// Layout tag of a decoder surface (FourCC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NativeFormat {
    /// '420v' - Y plane + interleaved CbCr plane, video range
    Nv12VideoRange,
    /// '2vuy' - packed 4:2:2, Cb Y0 Cr Y1
    Uyvy422,
    /// 'BGRA' - packed 32-bit
    Bgra32,
    /// Anything else the decoder produced
    Other(u32),
}

impl NativeFormat {
    pub const FOURCC_NV12: u32 = u32::from_be_bytes(*b"420v");
    pub const FOURCC_UYVY: u32 = u32::from_be_bytes(*b"2vuy");
    pub const FOURCC_BGRA: u32 = u32::from_be_bytes(*b"BGRA");

    pub fn from_fourcc(code: u32) -> Self {
        match code {
            Self::FOURCC_NV12 => Self::Nv12VideoRange,
            Self::FOURCC_UYVY => Self::Uyvy422,
            Self::FOURCC_BGRA => Self::Bgra32,
            other => Self::Other(other),
        }
    }

    pub fn fourcc(&self) -> u32 {
        match self {
            Self::Nv12VideoRange => Self::FOURCC_NV12,
            Self::Uyvy422 => Self::FOURCC_UYVY,
            Self::Bgra32 => Self::FOURCC_BGRA,
            Self::Other(code) => *code,
        }
    }

    /// Number of planes the decoder exposes for this layout
    pub fn plane_count(&self) -> usize {
        match self {
            Self::Nv12VideoRange => 2,
            _ => 1,
        }
    }

    /// Minimum bytes per row of `plane` for a `width` wide image
    pub fn min_stride(&self, plane: usize, width: u32) -> usize {
        let w = width as usize;
        match (self, plane) {
            (Self::Nv12VideoRange, 0) => w,
            (Self::Nv12VideoRange, _) => (w + 1) / 2 * 2,
            (Self::Uyvy422, _) => (w + 1) / 2 * 4,
            (Self::Bgra32, _) => w * 4,
            (Self::Other(_), _) => w,
        }
    }

    /// Rows in `plane` for a `height` tall image
    pub fn plane_rows(&self, plane: usize, height: u32) -> usize {
        let h = height as usize;
        match (self, plane) {
            (Self::Nv12VideoRange, 1) => (h + 1) / 2,
            _ => h,
        }
    }
}

impl fmt::Display for NativeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.fourcc().to_be_bytes();
        let printable = bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ');
        if printable {
            write!(f, "'{}'", String::from_utf8_lossy(&bytes))
        } else {
            write!(f, "0x{:08x}", self.fourcc())
        }
    }
}

// ============================================================================
// Decoder Surface Interface
// ============================================================================

/// A single plane, valid while the owning buffer is locked
#[derive(Debug, Clone, Copy)]
pub struct PlaneView<'a> {
    pub data: &'a [u8],
    pub stride: usize,
}

/// Reference-counted image memory owned by the decoder
pub trait ImageBuffer: Send + Sync {
    /// Take one more reference
    fn retain(&self);

    /// Drop one reference
    fn release(&self);

    fn pixel_format(&self) -> NativeFormat;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Map the surface for CPU access
    fn lock_base_address(&self) -> Result<(), BufferError>;

    fn unlock_base_address(&self);

    /// Plane data; implementations return `None` while unlocked
    fn plane(&self, index: usize) -> Option<PlaneView<'_>>;
}

// ============================================================================
// Buffer Handle
// ============================================================================

/// Owns exactly one reference to an `ImageBuffer`
pub struct BufferHandle {
    buffer: Arc<dyn ImageBuffer>,
}

impl BufferHandle {
    /// Take over a reference the caller already holds (no retain)
    pub fn adopt(buffer: Arc<dyn ImageBuffer>) -> Self {
        Self { buffer }
    }

    /// Acquire a new reference
    pub fn retain(buffer: Arc<dyn ImageBuffer>) -> Self {
        buffer.retain();
        Self { buffer }
    }

    pub fn pixel_format(&self) -> NativeFormat {
        self.buffer.pixel_format()
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    /// Lock the base address for the lifetime of the returned guard
    pub fn lock(&self) -> Result<BufferLock<'_>, BufferError> {
        self.buffer.lock_base_address()?;
        Ok(BufferLock {
            buffer: self.buffer.as_ref(),
        })
    }

    pub fn buffer(&self) -> &Arc<dyn ImageBuffer> {
        &self.buffer
    }
}

impl Clone for BufferHandle {
    fn clone(&self) -> Self {
        Self::retain(self.buffer.clone())
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.buffer.release();
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("format", &self.pixel_format())
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// Scoped base-address lock
pub struct BufferLock<'a> {
    buffer: &'a dyn ImageBuffer,
}

impl BufferLock<'_> {
    pub fn plane(&self, index: usize) -> Option<PlaneView<'_>> {
        self.buffer.plane(index)
    }
}

impl Drop for BufferLock<'_> {
    fn drop(&mut self) {
        self.buffer.unlock_base_address();
    }
}

// ============================================================================
// Host Memory Buffer
// ============================================================================

/// System-memory image with reference accounting.
///
/// Starts with one reference owned by its creator. Over-release is recorded
/// instead of wrapping so tests can assert on it.
pub struct HostBuffer {
    format: NativeFormat,
    width: u32,
    height: u32,
    planes: Vec<(Vec<u8>, usize)>,
    refs: AtomicIsize,
    retains: AtomicUsize,
    releases: AtomicUsize,
    over_released: AtomicBool,
    locked: AtomicBool,
    locks: AtomicUsize,
    unmappable: AtomicBool,
}

impl HostBuffer {
    /// Build from explicit `(data, stride)` planes
    pub fn from_planes(
        format: NativeFormat,
        width: u32,
        height: u32,
        planes: Vec<(Vec<u8>, usize)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            format,
            width,
            height,
            planes,
            refs: AtomicIsize::new(1),
            retains: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            over_released: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            locks: AtomicUsize::new(0),
            unmappable: AtomicBool::new(false),
        })
    }

    /// Flat NV12 image; `stride` of 0 means tightly packed
    pub fn flat_nv12(width: u32, height: u32, stride: usize, y: u8, cb: u8, cr: u8) -> Arc<Self> {
        let format = NativeFormat::Nv12VideoRange;
        let stride = stride.max(format.min_stride(1, width));
        let luma = vec![y; stride * format.plane_rows(0, height)];
        let row_bytes = format.min_stride(1, width);
        let mut chroma = vec![0u8; stride * format.plane_rows(1, height)];
        for row in chroma.chunks_exact_mut(stride) {
            for pair in row[..row_bytes].chunks_exact_mut(2) {
                pair[0] = cb;
                pair[1] = cr;
            }
        }
        Self::from_planes(format, width, height, vec![(luma, stride), (chroma, stride)])
    }

    /// Flat packed 4:2:2 image
    pub fn flat_uyvy(width: u32, height: u32, stride: usize, y: u8, cb: u8, cr: u8) -> Arc<Self> {
        let format = NativeFormat::Uyvy422;
        let stride = stride.max(format.min_stride(0, width));
        let row_bytes = format.min_stride(0, width);
        let mut data = vec![0u8; stride * height as usize];
        for row in data.chunks_exact_mut(stride) {
            for quad in row[..row_bytes].chunks_exact_mut(4) {
                quad.copy_from_slice(&[cb, y, cr, y]);
            }
        }
        Self::from_planes(format, width, height, vec![(data, stride)])
    }

    /// Flat packed BGRA image
    pub fn flat_bgra(width: u32, height: u32, stride: usize, b: u8, g: u8, r: u8) -> Arc<Self> {
        let format = NativeFormat::Bgra32;
        let stride = stride.max(format.min_stride(0, width));
        let row_bytes = format.min_stride(0, width);
        let mut data = vec![0u8; stride * height as usize];
        for row in data.chunks_exact_mut(stride) {
            for px in row[..row_bytes].chunks_exact_mut(4) {
                px.copy_from_slice(&[b, g, r, 0xff]);
            }
        }
        Self::from_planes(format, width, height, vec![(data, stride)])
    }

    /// Outstanding references
    pub fn ref_count(&self) -> isize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn retain_calls(&self) -> usize {
        self.retains.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn over_released(&self) -> bool {
        self.over_released.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn lock_calls(&self) -> usize {
        self.locks.load(Ordering::SeqCst)
    }

    /// Make every later lock fail with `NoBaseAddress`
    pub fn set_unmappable(&self, unmappable: bool) {
        self.unmappable.store(unmappable, Ordering::SeqCst);
    }
}

impl ImageBuffer for HostBuffer {
    fn retain(&self) {
        self.retains.fetch_add(1, Ordering::SeqCst);
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.refs.fetch_sub(1, Ordering::SeqCst) <= 0 {
            self.over_released.store(true, Ordering::SeqCst);
            tracing::error!("HostBuffer {} released below zero references", self.format);
        }
    }

    fn pixel_format(&self) -> NativeFormat {
        self.format
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn lock_base_address(&self) -> Result<(), BufferError> {
        if self.unmappable.load(Ordering::SeqCst) {
            return Err(BufferError::NoBaseAddress);
        }
        if self.locked.swap(true, Ordering::SeqCst) {
            return Err(BufferError::AlreadyLocked);
        }
        self.locks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unlock_base_address(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    fn plane(&self, index: usize) -> Option<PlaneView<'_>> {
        if !self.is_locked() {
            return None;
        }
        self.planes.get(index).map(|(data, stride)| PlaneView {
            data: data.as_slice(),
            stride: *stride,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(NativeFormat::from_fourcc(u32::from_be_bytes(*b"420v")), NativeFormat::Nv12VideoRange);
        assert_eq!(NativeFormat::from_fourcc(u32::from_be_bytes(*b"2vuy")), NativeFormat::Uyvy422);
        assert_eq!(NativeFormat::Bgra32.fourcc(), u32::from_be_bytes(*b"BGRA"));
        assert_eq!(NativeFormat::from_fourcc(7), NativeFormat::Other(7));
        assert_eq!(NativeFormat::Uyvy422.to_string(), "'2vuy'");
    }

    #[test]
    fn test_adopt_releases_once() {
        let host = HostBuffer::flat_nv12(16, 16, 0, 128, 128, 128);
        let handle = BufferHandle::adopt(host.clone());
        assert_eq!(host.ref_count(), 1);
        drop(handle);
        assert_eq!(host.ref_count(), 0);
        assert_eq!(host.release_calls(), 1);
        assert!(!host.over_released());
    }

    #[test]
    fn test_clone_retains() {
        let host = HostBuffer::flat_bgra(4, 4, 0, 1, 2, 3);
        let a = BufferHandle::adopt(host.clone());
        let b = a.clone();
        assert_eq!(host.ref_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(host.ref_count(), 0);
        assert_eq!(host.retain_calls(), 1);
        assert_eq!(host.release_calls(), 2);
    }

    #[test]
    fn test_lock_scope() {
        let host = HostBuffer::flat_uyvy(8, 2, 0, 50, 60, 70);
        let handle = BufferHandle::adopt(host.clone());
        assert!(host.plane(0).is_none());
        {
            let lock = handle.lock().unwrap();
            let plane = lock.plane(0).unwrap();
            assert_eq!(plane.stride, 16);
            assert_eq!(&plane.data[..4], &[60, 50, 70, 50]);
            assert!(host.is_locked());
            assert_eq!(handle.lock().err(), Some(BufferError::AlreadyLocked));
        }
        assert!(!host.is_locked());
        assert_eq!(host.lock_calls(), 1);
    }

    #[test]
    fn test_unmappable_lock_fails() {
        let host = HostBuffer::flat_nv12(4, 4, 0, 16, 128, 128);
        let handle = BufferHandle::adopt(host.clone());
        host.set_unmappable(true);
        assert_eq!(handle.lock().err(), Some(BufferError::NoBaseAddress));
        assert!(!host.is_locked());
        assert_eq!(host.lock_calls(), 0);

        host.set_unmappable(false);
        assert!(handle.lock().is_ok());
    }

    #[test]
    fn test_over_release_recorded() {
        let host = HostBuffer::flat_nv12(2, 2, 0, 0, 0, 0);
        host.release();
        assert!(!host.over_released());
        host.release();
        assert!(host.over_released());
    }
}
