// PIXEL CONVERT - Native Decoder Surfaces to Planar 4:2:0
//
// Hardware decoders hand back surfaces in whatever layout the session was
// negotiated with: biplanar NV12, packed 4:2:2 or packed BGRA.
// The pipeline downstream wants one layout: three-plane YUV 4:2:0 (I420).
// This module converts to it, dimension-preserving, on the CPU.
//
// RGB sources go through BT.601 video-range fixed-point tables.

use crate::buffer::{BufferLock, NativeFormat, PlaneView};

// ============================================================================
// Planar Destination
// ============================================================================

/// Three-plane 4:2:0 image (Y, Cb, Cr) with caller-chosen strides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanarImage {
    pub width: u32,
    pub height: u32,
    pub planes: [Vec<u8>; 3],
    pub strides: [usize; 3],
}

impl PlanarImage {
    /// Tightly packed planes
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_strides(width, height, [0, 0, 0])
    }

    /// Planes with at least the given strides; too-small strides are widened
    pub fn with_strides(width: u32, height: u32, strides: [usize; 3]) -> Self {
        let (cw, ch) = chroma_size(width, height);
        let strides = [
            strides[0].max(width as usize),
            strides[1].max(cw),
            strides[2].max(cw),
        ];
        let planes = [
            vec![0u8; strides[0] * height as usize],
            vec![0u8; strides[1] * ch],
            vec![0u8; strides[2] * ch],
        ];
        Self {
            width,
            height,
            planes,
            strides,
        }
    }

    pub fn plane(&self, index: usize) -> &[u8] {
        self.planes.get(index).map(|p| p.as_slice()).unwrap_or(&[])
    }

    /// Visible bytes of one row of one plane
    pub fn row(&self, plane: usize, row: usize) -> &[u8] {
        let width = if plane == 0 {
            self.width as usize
        } else {
            chroma_size(self.width, self.height).0
        };
        let start = row * self.strides[plane];
        &self.planes[plane][start..start + width]
    }

    fn fits(&self, width: u32, height: u32) -> bool {
        let (cw, ch) = chroma_size(width, height);
        self.strides[0] >= width as usize
            && self.strides[1] >= cw
            && self.strides[2] >= cw
            && self.planes[0].len() >= self.strides[0] * height as usize
            && self.planes[1].len() >= self.strides[1] * ch
            && self.planes[2].len() >= self.strides[2] * ch
    }
}

/// Chroma plane dimensions for a 4:2:0 image
pub fn chroma_size(width: u32, height: u32) -> (usize, usize) {
    ((width as usize + 1) / 2, (height as usize + 1) / 2)
}

// ============================================================================
// Source
// ============================================================================

/// Borrowed native planes of a locked decoder surface
#[derive(Debug, Clone, Copy)]
pub struct SourceImage<'a> {
    pub format: NativeFormat,
    pub primary: PlaneView<'a>,
    /// Second plane for biplanar layouts
    pub secondary: Option<PlaneView<'a>>,
}

impl<'a> SourceImage<'a> {
    /// Gather the planes of a locked buffer
    pub fn from_lock(format: NativeFormat, lock: &'a BufferLock<'_>) -> Option<Self> {
        let primary = lock.plane(0)?;
        let secondary = if format.plane_count() > 1 {
            Some(lock.plane(1)?)
        } else {
            None
        };
        Some(Self {
            format,
            primary,
            secondary,
        })
    }

    fn plane_fits(&self, view: &PlaneView<'_>, plane: usize, width: u32, height: u32) -> bool {
        let row_bytes = self.format.min_stride(plane, width);
        let rows = self.format.plane_rows(plane, height);
        view.stride >= row_bytes
            && (rows == 0 || view.data.len() >= view.stride * (rows - 1) + row_bytes)
    }
}

// ============================================================================
// Converter
// ============================================================================

/// Result of a conversion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOutcome {
    /// Destination fully written
    Converted,
    /// Layout has no conversion path; destination untouched
    Unsupported,
    /// Source or destination planes too small for the stated size; destination untouched
    Malformed,
}

/// Native → I420 converter.
///
/// Holds only the precomputed RGB → YUV tables; `convert` never mutates it.
pub struct PixelConverter {
    // 8.8 fixed-point contributions, indexed by component value
    y_table: [[i32; 256]; 3],
    u_table: [[i32; 256]; 3],
    v_table: [[i32; 256]; 3],
}

impl Default for PixelConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelConverter {
    // BT.601 video range, rows are (R, G, B) weights scaled by 256
    const Y_COEFFS: [i32; 3] = [66, 129, 25];
    const U_COEFFS: [i32; 3] = [-38, -74, 112];
    const V_COEFFS: [i32; 3] = [112, -94, -18];

    pub fn new() -> Self {
        let mut converter = Self {
            y_table: [[0; 256]; 3],
            u_table: [[0; 256]; 3],
            v_table: [[0; 256]; 3],
        };
        converter.build_tables();
        converter
    }

    fn build_tables(&mut self) {
        for i in 0..256 {
            for c in 0..3 {
                self.y_table[c][i] = Self::Y_COEFFS[c] * i as i32;
                self.u_table[c][i] = Self::U_COEFFS[c] * i as i32;
                self.v_table[c][i] = Self::V_COEFFS[c] * i as i32;
            }
        }
    }

    /// Whether `format` has a conversion path
    pub fn supports(format: NativeFormat) -> bool {
        matches!(
            format,
            NativeFormat::Nv12VideoRange | NativeFormat::Uyvy422 | NativeFormat::Bgra32
        )
    }

    /// Convert `source` (`width` x `height`) into `dest`
    pub fn convert(
        &self,
        source: &SourceImage<'_>,
        width: u32,
        height: u32,
        dest: &mut PlanarImage,
    ) -> ConvertOutcome {
        if !Self::supports(source.format) {
            tracing::debug!("No conversion path for {}", source.format);
            return ConvertOutcome::Unsupported;
        }
        if !dest.fits(width, height) || !source.plane_fits(&source.primary, 0, width, height) {
            tracing::warn!(
                "Conversion of {} {}x{} rejected: plane sizes do not cover the image",
                source.format,
                width,
                height
            );
            return ConvertOutcome::Malformed;
        }

        match source.format {
            NativeFormat::Nv12VideoRange => {
                let Some(chroma) = source.secondary else {
                    return ConvertOutcome::Malformed;
                };
                if !source.plane_fits(&chroma, 1, width, height) {
                    return ConvertOutcome::Malformed;
                }
                self.nv12_to_i420(&source.primary, &chroma, width, height, dest);
            }
            NativeFormat::Uyvy422 => self.uyvy_to_i420(&source.primary, width, height, dest),
            NativeFormat::Bgra32 => self.bgra_to_i420(&source.primary, width, height, dest),
            NativeFormat::Other(_) => return ConvertOutcome::Unsupported,
        }

        ConvertOutcome::Converted
    }

    fn nv12_to_i420(
        &self,
        luma: &PlaneView<'_>,
        chroma: &PlaneView<'_>,
        width: u32,
        height: u32,
        dest: &mut PlanarImage,
    ) {
        let w = width as usize;
        let (cw, ch) = chroma_size(width, height);
        let strides = dest.strides;
        let [y_plane, u_plane, v_plane] = &mut dest.planes;

        for row in 0..height as usize {
            let src = &luma.data[row * luma.stride..row * luma.stride + w];
            y_plane[row * strides[0]..row * strides[0] + w].copy_from_slice(src);
        }

        for row in 0..ch {
            let src = &chroma.data[row * chroma.stride..];
            let u_row = &mut u_plane[row * strides[1]..row * strides[1] + cw];
            let v_row = &mut v_plane[row * strides[2]..row * strides[2] + cw];
            for x in 0..cw {
                u_row[x] = src[x * 2];
                v_row[x] = src[x * 2 + 1];
            }
        }
    }

    fn uyvy_to_i420(&self, packed: &PlaneView<'_>, width: u32, height: u32, dest: &mut PlanarImage) {
        let w = width as usize;
        let h = height as usize;
        let (cw, ch) = chroma_size(width, height);
        let strides = dest.strides;
        let [y_plane, u_plane, v_plane] = &mut dest.planes;

        // Cb Y0 Cr Y1
        for row in 0..h {
            let src = &packed.data[row * packed.stride..];
            let dst = &mut y_plane[row * strides[0]..row * strides[0] + w];
            for (x, out) in dst.iter_mut().enumerate() {
                *out = src[x * 2 + 1];
            }
        }

        // 4:2:2 → 4:2:0: average vertically adjacent chroma rows
        for row in 0..ch {
            let top = &packed.data[(row * 2) * packed.stride..];
            let bottom = &packed.data[(row * 2 + 1).min(h - 1) * packed.stride..];
            for x in 0..cw {
                let cb = (top[x * 4] as u16 + bottom[x * 4] as u16 + 1) >> 1;
                let cr = (top[x * 4 + 2] as u16 + bottom[x * 4 + 2] as u16 + 1) >> 1;
                u_plane[row * strides[1] + x] = cb as u8;
                v_plane[row * strides[2] + x] = cr as u8;
            }
        }
    }

    fn bgra_to_i420(&self, packed: &PlaneView<'_>, width: u32, height: u32, dest: &mut PlanarImage) {
        let w = width as usize;
        let h = height as usize;
        let (cw, ch) = chroma_size(width, height);
        let strides = dest.strides;
        let [y_plane, u_plane, v_plane] = &mut dest.planes;

        for row in 0..h {
            let src = &packed.data[row * packed.stride..];
            for x in 0..w {
                let px = &src[x * 4..x * 4 + 4];
                y_plane[row * strides[0] + x] = self.luma(px[2], px[1], px[0]);
            }
        }

        // Chroma from the mean colour of each 2x2 block (clipped at odd edges)
        for row in 0..ch {
            for x in 0..cw {
                let mut sum = [0u32; 3];
                let mut count = 0u32;
                for sy in (row * 2)..(row * 2 + 2).min(h) {
                    for sx in (x * 2)..(x * 2 + 2).min(w) {
                        let px = &packed.data[sy * packed.stride + sx * 4..];
                        sum[0] += px[2] as u32;
                        sum[1] += px[1] as u32;
                        sum[2] += px[0] as u32;
                        count += 1;
                    }
                }
                let avg = |s: u32| ((s + count / 2) / count) as u8;
                let (r, g, b) = (avg(sum[0]), avg(sum[1]), avg(sum[2]));
                u_plane[row * strides[1] + x] = self.chroma(&self.u_table, r, g, b);
                v_plane[row * strides[2] + x] = self.chroma(&self.v_table, r, g, b);
            }
        }
    }

    #[inline]
    fn luma(&self, r: u8, g: u8, b: u8) -> u8 {
        let sum = self.y_table[0][r as usize] + self.y_table[1][g as usize] + self.y_table[2][b as usize];
        (((sum + 128) >> 8) + 16).clamp(16, 235) as u8
    }

    #[inline]
    fn chroma(&self, table: &[[i32; 256]; 3], r: u8, g: u8, b: u8) -> u8 {
        let sum = table[0][r as usize] + table[1][g as usize] + table[2][b as usize];
        (((sum + 128) >> 8) + 128).clamp(16, 240) as u8
    }
}

// ============================================================================
// Tests
// ============================================================================
