//! # hwdec Core
//!
//! Display-order reconstruction and pixel normalization for hardware video
//! decode. Decoder sessions complete frames asynchronously and out of
//! presentation order; this crate puts them back in order and converts the
//! decoder's native surfaces to planar 4:2:0 when asked to.

// ============================================================================
// Decoder Surfaces
// ============================================================================
pub mod buffer;
pub mod pixel_convert;

// ============================================================================
// Reordering / Session Bridge
// ============================================================================
pub mod frame_queue;
pub mod session;

// ============================================================================
// Bitstream
// ============================================================================
pub mod h264_utils;

// ============================================================================
// Codec Facade
// ============================================================================
pub mod codec;
pub mod config;

// ============================================================================
// Software Backend
// ============================================================================
#[cfg(any(test, feature = "simulated"))]
pub mod simulated;

pub use codec::{CodecControl, CodecError, CodecState, DecodeStatus, HwVideoCodec, Picture, PictureData, StreamHints};
pub use config::{CodecConfig, PictureDelivery};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
