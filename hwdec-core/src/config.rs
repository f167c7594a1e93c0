// CODEC CONFIG - Delivery and Reorder Settings
//
// Loaded once when the codec is built. JSON on disk, every field optional.

use crate::buffer::NativeFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Largest accepted `reorder_margin`
pub const MAX_REORDER_MARGIN: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// How decoded pictures reach the consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PictureDelivery {
    /// Hand out the decoder surface itself (zero-copy)
    #[default]
    BufferRef,
    /// Convert into a freshly allocated planar 4:2:0 image
    CopyToPlanar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub delivery: PictureDelivery,
    /// Consumer takes packed 4:2:2 as-is in copy mode
    pub accept_packed_422: bool,
    /// Output layout requested from the decoder session
    pub output_format: NativeFormat,
    /// Frames kept beyond the reference window before a picture is reported
    pub reorder_margin: usize,
    /// Upper bound on the reference window taken from the stream
    pub max_reorder_depth: usize,
    /// Submit nothing until the first keyframe after open/reset
    pub wait_for_keyframe: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            delivery: PictureDelivery::BufferRef,
            accept_packed_422: false,
            output_format: NativeFormat::Nv12VideoRange,
            reorder_margin: 1,
            max_reorder_depth: 16,
            wait_for_keyframe: true,
        }
    }
}

impl CodecConfig {
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&content)?;
        tracing::debug!("Loaded codec config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_reorder_depth == 0 {
            return Err(ConfigError::Invalid("max_reorder_depth must be at least 1".into()));
        }
        if self.reorder_margin > MAX_REORDER_MARGIN {
            return Err(ConfigError::Invalid(format!(
                "reorder_margin {} exceeds {}",
                self.reorder_margin, MAX_REORDER_MARGIN
            )));
        }
        Ok(())
    }

    /// Queue budget for a stream with `ref_frames` reference frames
    pub fn reorder_depth(&self, ref_frames: u32) -> usize {
        (ref_frames as usize)
            .clamp(1, self.max_reorder_depth.max(1))
            .saturating_add(self.reorder_margin)
    }
}
