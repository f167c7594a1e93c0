//! H.264 bitstream utilities
//!
//! Just enough of the syntax to decide whether a stream can go to the
//! hardware session and how deep its reorder window is:
//! - avcC extradata parsing (NAL length size, SPS/PPS lists)
//! - SPS decoding (profile, reference count, interlacing, cropped size)
//! - AVCC (length-prefixed) and Annex B (start code) NAL iteration
//! - IDR detection for keyframe gating

use thiserror::Error;

/// Annex B start code (4-byte version)
const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

pub const NAL_IDR_SLICE: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BitstreamError {
    #[error("Bitstream truncated")]
    Truncated,
    #[error("Invalid extradata: {0}")]
    InvalidExtradata(&'static str),
    #[error("No sequence parameter set in extradata")]
    MissingSps,
    #[error("Invalid SPS: {0}")]
    InvalidSps(&'static str),
}

pub type BitstreamResult<T> = Result<T, BitstreamError>;

// ============================================================================
// Bit Reader
// ============================================================================

/// MSB-first reader over an RBSP
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn bits_left(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.pos)
    }

    pub fn read_bool(&mut self) -> BitstreamResult<bool> {
        let byte = *self.data.get(self.pos >> 3).ok_or(BitstreamError::Truncated)?;
        let bit = (byte >> (7 - (self.pos & 7))) & 1;
        self.pos += 1;
        Ok(bit != 0)
    }

    pub fn read_bits(&mut self, count: u32) -> BitstreamResult<u32> {
        debug_assert!(count <= 32);
        if self.bits_left() < count as usize {
            return Err(BitstreamError::Truncated);
        }
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bool()? as u32;
        }
        Ok(value)
    }

    pub fn skip_bits(&mut self, count: usize) -> BitstreamResult<()> {
        if self.bits_left() < count {
            return Err(BitstreamError::Truncated);
        }
        self.pos += count;
        Ok(())
    }
}

/// Exp-Golomb codes
pub trait ReadUE {
    fn read_ue(&mut self) -> BitstreamResult<u32>;

    fn read_ue_lim(&mut self, max_val: u32, what: &'static str) -> BitstreamResult<u32> {
        let val = self.read_ue()?;
        if val > max_val {
            return Err(BitstreamError::InvalidSps(what));
        }
        Ok(val)
    }

    fn read_se(&mut self) -> BitstreamResult<i32> {
        let val = self.read_ue()?;
        if (val & 1) != 0 {
            Ok(((val >> 1) as i32) + 1)
        } else {
            Ok(-((val >> 1) as i32))
        }
    }
}

impl ReadUE for BitReader<'_> {
    fn read_ue(&mut self) -> BitstreamResult<u32> {
        let mut leading_zeros = 0u32;
        while !self.read_bool()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(BitstreamError::InvalidSps("exp-golomb code too long"));
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + suffix as u64) as u32)
    }
}

// ============================================================================
// Bit Writer
// ============================================================================

/// MSB-first writer producing escaped NAL payloads
#[derive(Debug, Default)]
pub struct BitWriter {
    data: Vec<u8>,
    bits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bool(&mut self, bit: bool) {
        if self.bits % 8 == 0 {
            self.data.push(0);
        }
        if bit {
            if let Some(last) = self.data.last_mut() {
                *last |= 0x80 >> (self.bits % 8);
            }
        }
        self.bits += 1;
    }

    pub fn write_bits(&mut self, value: u32, count: u32) {
        for i in (0..count).rev() {
            self.write_bool((value >> i) & 1 != 0);
        }
    }

    pub fn write_ue(&mut self, value: u32) {
        let coded = value as u64 + 1;
        let len = 64 - coded.leading_zeros();
        self.write_bits(0, len - 1);
        for i in (0..len).rev() {
            self.write_bool((coded >> i) & 1 != 0);
        }
    }

    pub fn write_se(&mut self, value: i32) {
        let mapped = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.write_ue(mapped);
    }

    /// Append the RBSP stop bit, pad, and insert emulation-prevention bytes
    pub fn finish(mut self) -> Vec<u8> {
        self.write_bool(true);
        escape_rbsp(&self.data)
    }
}

// ============================================================================
// Emulation Prevention
// ============================================================================

/// Strip emulation-prevention bytes (`00 00 03` → `00 00`)
pub fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

/// Insert emulation-prevention bytes where the payload would mimic a start code
pub fn escape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64);
    let mut zeros = 0;
    for &byte in data {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

// ============================================================================
// avcC Extradata
// ============================================================================

/// Decoded avcC (AVCDecoderConfigurationRecord)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    pub nal_length_size: usize,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

impl AvcConfig {
    pub fn parse(extradata: &[u8]) -> BitstreamResult<Self> {
        // [0]: version (always 1)
        // [1..4]: profile, compatibility, level
        // [4]: 0xFC | (nal_length_size - 1)
        // [5]: 0xE0 | num_sps
        // Then SPS entries, then PPS count and entries
        if extradata.len() < 7 {
            return Err(BitstreamError::InvalidExtradata("avcC shorter than 7 bytes"));
        }
        if extradata[0] != 1 {
            return Err(BitstreamError::InvalidExtradata("unknown avcC version"));
        }

        let nal_length_size = ((extradata[4] & 0x03) + 1) as usize;
        if nal_length_size == 3 {
            return Err(BitstreamError::InvalidExtradata("3-byte NAL lengths"));
        }

        let mut offset = 5;
        let num_sps = (extradata[offset] & 0x1F) as usize;
        offset += 1;
        let sps = read_parameter_sets(extradata, &mut offset, num_sps)?;

        let pps = match extradata.get(offset) {
            Some(&count) => {
                offset += 1;
                read_parameter_sets(extradata, &mut offset, count as usize)?
            }
            None => Vec::new(),
        };

        Ok(Self {
            profile: extradata[1],
            compatibility: extradata[2],
            level: extradata[3],
            nal_length_size,
            sps,
            pps,
        })
    }

    /// SPS/PPS with start codes, ready to feed to an Annex B decoder
    pub fn to_annexb(&self) -> Vec<u8> {
        let mut result = Vec::new();
        for nal in self.sps.iter().chain(self.pps.iter()) {
            result.extend_from_slice(&ANNEX_B_START_CODE);
            result.extend_from_slice(nal);
        }
        result
    }

    /// Serialize back into an avcC record
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![
            1,
            self.profile,
            self.compatibility,
            self.level,
            0xFC | (self.nal_length_size.saturating_sub(1) as u8 & 0x03),
            0xE0 | (self.sps.len() as u8 & 0x1F),
        ];
        for nal in &self.sps {
            out.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            out.extend_from_slice(nal);
        }
        out.push(self.pps.len() as u8);
        for nal in &self.pps {
            out.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            out.extend_from_slice(nal);
        }
        out
    }
}

fn read_parameter_sets(data: &[u8], offset: &mut usize, count: usize) -> BitstreamResult<Vec<Vec<u8>>> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        if *offset + 2 > data.len() {
            return Err(BitstreamError::InvalidExtradata("parameter set length past end"));
        }
        let len = u16::from_be_bytes([data[*offset], data[*offset + 1]]) as usize;
        *offset += 2;
        if *offset + len > data.len() {
            return Err(BitstreamError::InvalidExtradata("parameter set past end"));
        }
        sets.push(data[*offset..*offset + len].to_vec());
        *offset += len;
    }
    Ok(sets)
}

// ============================================================================
// Sequence Parameter Set
// ============================================================================

/// The SPS fields the hardware path cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub sps_id: u32,
    pub chroma_format_idc: u32,
    pub bit_depth_luma: u32,
    pub pic_order_cnt_type: u32,
    pub max_num_ref_frames: u32,
    pub frame_mbs_only: bool,
    pub width: u32,
    pub height: u32,
}

impl SpsInfo {
    /// Field or MBAFF coding
    pub fn interlaced(&self) -> bool {
        !self.frame_mbs_only
    }
}

fn has_chroma_info(profile_idc: u8) -> bool {
    matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135)
}

fn skip_scaling_list(br: &mut BitReader<'_>, size: usize) -> BitstreamResult<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = br.read_se()?;
            if !(-128..=127).contains(&delta) {
                return Err(BitstreamError::InvalidSps("scaling list delta"));
            }
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Parse an SPS NAL unit (header byte included, escaped payload)
pub fn parse_sps(nal: &[u8]) -> BitstreamResult<SpsInfo> {
    let header = *nal.first().ok_or(BitstreamError::Truncated)?;
    if header & 0x1F != NAL_SPS {
        return Err(BitstreamError::InvalidSps("not an SPS NAL unit"));
    }

    let rbsp = unescape_rbsp(&nal[1..]);
    let mut br = BitReader::new(&rbsp);

    let profile_idc = br.read_bits(8)? as u8;
    br.skip_bits(8)?; // constraint flags
    let level_idc = br.read_bits(8)? as u8;
    let sps_id = br.read_ue_lim(31, "sps id")?;

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    let mut bit_depth_luma = 8;
    if has_chroma_info(profile_idc) {
        chroma_format_idc = br.read_ue_lim(3, "chroma format")?;
        if chroma_format_idc == 3 {
            separate_colour_plane = br.read_bool()?;
        }
        bit_depth_luma = br.read_ue_lim(6, "luma bit depth")? + 8;
        br.read_ue_lim(6, "chroma bit depth")?;
        br.read_bool()?; // qpprime_y_zero_transform_bypass
        if br.read_bool()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if br.read_bool()? {
                    skip_scaling_list(&mut br, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    br.read_ue_lim(12, "log2 max frame num")?;
    let pic_order_cnt_type = br.read_ue_lim(2, "pic order count type")?;
    match pic_order_cnt_type {
        0 => {
            br.read_ue_lim(12, "log2 max poc lsb")?;
        }
        1 => {
            br.read_bool()?; // delta_pic_order_always_zero
            br.read_se()?; // offset_for_non_ref_pic
            br.read_se()?; // offset_for_top_to_bottom_field
            let cycle = br.read_ue_lim(255, "ref frames in poc cycle")?;
            for _ in 0..cycle {
                br.read_se()?;
            }
        }
        _ => {}
    }

    let max_num_ref_frames = br.read_ue_lim(16, "max num ref frames")?;
    br.read_bool()?; // gaps_in_frame_num_allowed
    let width_mbs = br.read_ue_lim(1023, "picture width")? + 1;
    let height_map_units = br.read_ue_lim(1023, "picture height")? + 1;
    let frame_mbs_only = br.read_bool()?;
    if !frame_mbs_only {
        br.read_bool()?; // mb_adaptive_frame_field
    }
    br.read_bool()?; // direct_8x8_inference

    let field_factor = if frame_mbs_only { 1 } else { 2 };
    let mut width = width_mbs * 16;
    let mut height = height_map_units * 16 * field_factor;

    if br.read_bool()? {
        let left = br.read_ue()?;
        let right = br.read_ue()?;
        let top = br.read_ue()?;
        let bottom = br.read_ue()?;

        let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
        let (crop_x, crop_y) = match chroma_array_type {
            0 => (1, field_factor),
            1 => (2, 2 * field_factor),
            2 => (2, field_factor),
            _ => (1, field_factor),
        };
        let crop_w = left
            .checked_add(right)
            .and_then(|v| v.checked_mul(crop_x))
            .filter(|&v| v < width);
        let crop_h = top
            .checked_add(bottom)
            .and_then(|v| v.checked_mul(crop_y))
            .filter(|&v| v < height);
        let (Some(crop_w), Some(crop_h)) = (crop_w, crop_h) else {
            return Err(BitstreamError::InvalidSps("cropping exceeds picture"));
        };
        width -= crop_w;
        height -= crop_h;
    }

    Ok(SpsInfo {
        profile_idc,
        level_idc,
        sps_id,
        chroma_format_idc,
        bit_depth_luma,
        pic_order_cnt_type,
        max_num_ref_frames,
        frame_mbs_only,
        width,
        height,
    })
}

// ============================================================================
// NAL Framing
// ============================================================================

/// How access units delimit their NAL units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalFraming {
    /// Big-endian length prefix of the given size
    Avcc(usize),
    /// Start codes
    AnnexB,
}

/// Split an access unit into NAL units (without prefixes)
pub fn nal_units(data: &[u8], framing: NalFraming) -> Vec<&[u8]> {
    match framing {
        NalFraming::Avcc(size) => avcc_nal_units(data, size),
        NalFraming::AnnexB => annexb_nal_units(data),
    }
}

fn avcc_nal_units(data: &[u8], nal_length_size: usize) -> Vec<&[u8]> {
    let mut units = Vec::new();
    if nal_length_size == 0 || nal_length_size > 4 {
        return units;
    }
    let mut offset = 0;
    while offset + nal_length_size <= data.len() {
        let nal_len = read_be_uint(&data[offset..], nal_length_size);
        offset += nal_length_size;
        if nal_len == 0 || offset + nal_len > data.len() {
            break;
        }
        units.push(&data[offset..offset + nal_len]);
        offset += nal_len;
    }
    units
}

fn annexb_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let mut end = match starts.get(n + 1) {
            Some(&next) => next - 3,
            None => data.len(),
        };
        // Trailing zeros belong to the next 4-byte start code
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        if end > start {
            units.push(&data[start..end]);
        }
    }
    units
}

/// Access unit contains an IDR slice
pub fn contains_idr(data: &[u8], framing: NalFraming) -> bool {
    nal_units(data, framing)
        .iter()
        .any(|nal| nal.first().map(|h| h & 0x1F) == Some(NAL_IDR_SLICE))
}

/// Convert AVCC format NAL units to Annex B format
///
/// AVCC: [4-byte length][NAL][4-byte length][NAL]...
/// Annex B: [0x00 0x00 0x00 0x01][NAL][0x00 0x00 0x00 0x01][NAL]...
pub fn avcc_to_annexb(data: &[u8], nal_length_size: usize) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len() + 64);
    for nal in avcc_nal_units(data, nal_length_size) {
        result.extend_from_slice(&ANNEX_B_START_CODE);
        result.extend_from_slice(nal);
    }
    result
}

/// Length-prefix NAL units
pub fn to_avcc(nals: &[&[u8]], nal_length_size: usize) -> Vec<u8> {
    let mut result = Vec::new();
    for nal in nals {
        let len = (nal.len() as u32).to_be_bytes();
        result.extend_from_slice(&len[4 - nal_length_size.clamp(1, 4)..]);
        result.extend_from_slice(nal);
    }
    result
}

/// Check if data already has Annex B start codes
pub fn is_annexb(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    // Check for 4-byte or 3-byte start code
    (data[0] == 0 && data[1] == 0 && data[2] == 0 && data[3] == 1)
        || (data[0] == 0 && data[1] == 0 && data[2] == 1)
}

/// Read big-endian unsigned integer of variable size (1-4 bytes)
fn read_be_uint(data: &[u8], size: usize) -> usize {
    data.iter().take(size).fold(0usize, |val, &b| (val << 8) | b as usize)
}

// ============================================================================
// Stream Inspection
// ============================================================================

/// What the decoder needs to know about a stream before opening a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub profile: u8,
    pub level: u8,
    pub width: u32,
    pub height: u32,
    pub max_num_ref_frames: u32,
    pub interlaced: bool,
    pub framing: NalFraming,
}

/// Codec-specific parameter-set and keyframe inspection
pub trait StreamInspector: Send + Sync {
    /// Decode codec extradata
    fn inspect(&self, extradata: &[u8]) -> BitstreamResult<StreamParams>;

    /// Access unit starts a decodable sequence
    fn is_keyframe(&self, params: &StreamParams, data: &[u8]) -> bool;
}

/// H.264 inspector, accepts avcC or Annex B extradata
#[derive(Debug, Default, Clone, Copy)]
pub struct H264Inspector;

impl StreamInspector for H264Inspector {
    fn inspect(&self, extradata: &[u8]) -> BitstreamResult<StreamParams> {
        let (sps_nal, framing) = if extradata.first() == Some(&1) {
            let config = AvcConfig::parse(extradata)?;
            let sps = config.sps.into_iter().next().ok_or(BitstreamError::MissingSps)?;
            (sps, NalFraming::Avcc(config.nal_length_size))
        } else if is_annexb(extradata) {
            let sps = annexb_nal_units(extradata)
                .into_iter()
                .find(|nal| nal.first().map(|h| h & 0x1F) == Some(NAL_SPS))
                .ok_or(BitstreamError::MissingSps)?;
            (sps.to_vec(), NalFraming::AnnexB)
        } else if extradata.is_empty() {
            return Err(BitstreamError::MissingSps);
        } else {
            return Err(BitstreamError::InvalidExtradata("neither avcC nor Annex B"));
        };

        let sps = parse_sps(&sps_nal)?;
        tracing::debug!(
            "H.264 SPS: profile {} level {} {}x{} refs {} poc type {}{}",
            sps.profile_idc,
            sps.level_idc,
            sps.width,
            sps.height,
            sps.max_num_ref_frames,
            sps.pic_order_cnt_type,
            if sps.interlaced() { " interlaced" } else { "" }
        );

        Ok(StreamParams {
            profile: sps.profile_idc,
            level: sps.level_idc,
            width: sps.width,
            height: sps.height,
            max_num_ref_frames: sps.max_num_ref_frames,
            interlaced: sps.interlaced(),
            framing,
        })
    }

    fn is_keyframe(&self, params: &StreamParams, data: &[u8]) -> bool {
        contains_idr(data, params.framing)
    }
}
