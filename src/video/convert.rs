//! Pixel format conversion between planar I420 and the FourCC-tagged layouts.
//!
//! Byte order follows the libyuv naming convention: the FourCC names the channels of a
//! little-endian word, so `ARGB` is stored in memory as B, G, R, A.

use std::fmt;

use crate::error::{BridgeError, Result};

/// Four character code identifying a pixel layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FourCC {
    /// Planar 4:2:0, U before V.
    I420,
    /// Alias of I420.
    IYUV,
    /// Planar 4:2:0, V before U.
    YV12,
    /// Y plane then interleaved UV.
    NV12,
    /// Y plane then interleaved VU.
    NV21,
    /// Packed 4:2:2, Y0 U Y1 V.
    YUY2,
    /// Packed 4:2:2, U Y0 V Y1.
    UYVY,
    /// 32-bit B, G, R, A in memory.
    ARGB,
    /// 32-bit A, R, G, B in memory.
    BGRA,
    /// 32-bit R, G, B, A in memory.
    ABGR,
    /// 32-bit A, B, G, R in memory.
    RGBA,
    /// 24-bit B, G, R.
    BG24,
    /// RGB565, little endian.
    RGBP,
    /// ARGB1555, little endian.
    RGBO,
    /// ARGB4444, little endian.
    R444,
}

impl FourCC {
    /// Every supported code.
    pub const ALL: [FourCC; 15] = [
        FourCC::I420,
        FourCC::IYUV,
        FourCC::YV12,
        FourCC::NV12,
        FourCC::NV21,
        FourCC::YUY2,
        FourCC::UYVY,
        FourCC::ARGB,
        FourCC::BGRA,
        FourCC::ABGR,
        FourCC::RGBA,
        FourCC::BG24,
        FourCC::RGBP,
        FourCC::RGBO,
        FourCC::R444,
    ];

    /// The four characters of the code.
    pub fn name(self) -> &'static str {
        match self {
            FourCC::I420 => "I420",
            FourCC::IYUV => "IYUV",
            FourCC::YV12 => "YV12",
            FourCC::NV12 => "NV12",
            FourCC::NV21 => "NV21",
            FourCC::YUY2 => "YUY2",
            FourCC::UYVY => "UYVY",
            FourCC::ARGB => "ARGB",
            FourCC::BGRA => "BGRA",
            FourCC::ABGR => "ABGR",
            FourCC::RGBA => "RGBA",
            FourCC::BG24 => "24BG",
            FourCC::RGBP => "RGBP",
            FourCC::RGBO => "RGBO",
            FourCC::R444 => "R444",
        }
    }

    /// Integer tag: first character in the low byte.
    pub fn value(self) -> u32 {
        let bytes = self.name().as_bytes();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Code with integer tag `value`.
    pub fn from_u32(value: u32) -> Option<FourCC> {
        FourCC::ALL.into_iter().find(|fourcc| fourcc.value() == value)
    }

    /// Code named `name`, ignoring case.
    pub fn from_name(name: &str) -> Option<FourCC> {
        FourCC::ALL
            .into_iter()
            .find(|fourcc| fourcc.name().eq_ignore_ascii_case(name))
    }

    /// Whether conversion through I420 reproduces the planes exactly.
    pub fn is_lossless_yuv(self) -> bool {
        !matches!(self.layout(), Layout::Rgb { .. })
    }

    fn layout(self) -> Layout {
        match self {
            FourCC::I420 | FourCC::IYUV => Layout::Planar { swap_uv: false },
            FourCC::YV12 => Layout::Planar { swap_uv: true },
            FourCC::NV12 => Layout::SemiPlanar { vu: false },
            FourCC::NV21 => Layout::SemiPlanar { vu: true },
            FourCC::YUY2 => Layout::Packed422 { luma_first: true },
            FourCC::UYVY => Layout::Packed422 { luma_first: false },
            FourCC::BG24 => Layout::Rgb { bytes: 3 },
            FourCC::RGBP | FourCC::RGBO | FourCC::R444 => Layout::Rgb { bytes: 2 },
            FourCC::ARGB | FourCC::BGRA | FourCC::ABGR | FourCC::RGBA => Layout::Rgb { bytes: 4 },
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug)]
enum Layout {
    Planar { swap_uv: bool },
    SemiPlanar { vu: bool },
    Packed422 { luma_first: bool },
    Rgb { bytes: usize },
}

/// Exact number of bytes a `width` x `height` image occupies in `fourcc`.
pub fn required_buffer_size(width: usize, height: usize, fourcc: FourCC) -> usize {
    match fourcc.layout() {
        Layout::Planar { .. } | Layout::SemiPlanar { .. } => {
            width * height + chroma_dim(width) * chroma_dim(height) * 2
        }
        Layout::Packed422 { .. } => width * height * 2,
        Layout::Rgb { bytes } => width * height * bytes,
    }
}

/// Same as [`required_buffer_size`] for a raw tag; unknown tags fail.
pub fn required_buffer_size_raw(width: usize, height: usize, fourcc: u32) -> Result<usize> {
    let fourcc = FourCC::from_u32(fourcc)
        .ok_or_else(|| BridgeError::UnsupportedFormat(format!("fourcc {fourcc:#010x}")))?;
    Ok(required_buffer_size(width, height, fourcc))
}

pub(crate) fn chroma_dim(luma: usize) -> usize {
    (luma + 1) >> 1
}

fn plane_len(stride: usize, width: usize, rows: usize) -> usize {
    if rows == 0 || width == 0 {
        0
    } else {
        stride * (rows - 1) + width
    }
}

/// Borrowed I420 planes with their strides.
#[derive(Clone, Copy, Debug)]
pub struct I420Planes<'a> {
    /// Luma plane.
    pub y: &'a [u8],
    /// Bytes between luma rows.
    pub stride_y: usize,
    /// Cb plane.
    pub u: &'a [u8],
    /// Bytes between Cb rows.
    pub stride_u: usize,
    /// Cr plane.
    pub v: &'a [u8],
    /// Bytes between Cr rows.
    pub stride_v: usize,
}

impl I420Planes<'_> {
    fn validate(&self, width: usize, height: usize) -> Result<()> {
        let (cw, ch) = (chroma_dim(width), chroma_dim(height));
        let checks = [
            ("y", self.y.len(), self.stride_y, width, height),
            ("u", self.u.len(), self.stride_u, cw, ch),
            ("v", self.v.len(), self.stride_v, cw, ch),
        ];
        for (plane, len, stride, w, rows) in checks {
            if stride < w {
                return Err(BridgeError::invalid_argument(format!(
                    "{plane} stride {stride} below width {w}"
                )));
            }
            let need = plane_len(stride, w, rows);
            if len < need {
                return Err(BridgeError::invalid_argument(format!(
                    "{plane} plane holds {len} bytes, need {need}"
                )));
            }
        }
        Ok(())
    }
}

/// Mutable I420 planes with their strides.
#[derive(Debug)]
pub struct I420PlanesMut<'a> {
    /// Luma plane.
    pub y: &'a mut [u8],
    /// Bytes between luma rows.
    pub stride_y: usize,
    /// Cb plane.
    pub u: &'a mut [u8],
    /// Bytes between Cb rows.
    pub stride_u: usize,
    /// Cr plane.
    pub v: &'a mut [u8],
    /// Bytes between Cr rows.
    pub stride_v: usize,
}

impl I420PlanesMut<'_> {
    fn validate(&self, width: usize, height: usize) -> Result<()> {
        let (cw, ch) = (chroma_dim(width), chroma_dim(height));
        let checks = [
            (self.y.len(), self.stride_y, width, height),
            (self.u.len(), self.stride_u, cw, ch),
            (self.v.len(), self.stride_v, cw, ch),
        ];
        for (len, stride, w, rows) in checks {
            let need = plane_len(stride.max(w), w, rows);
            if stride < w || len < need {
                return Err(BridgeError::InsufficientBuffer { has: len, need });
            }
        }
        Ok(())
    }
}

fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// BT.601 limited range YUV to RGB.
pub(crate) fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
    ]
}

fn rgb_to_y([r, g, b]: [u8; 3]) -> u8 {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    clamp_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16)
}

fn rgb_to_uv([r, g, b]: [u8; 3]) -> (u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    (
        clamp_u8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128),
        clamp_u8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128),
    )
}

fn store_rgb(fourcc: FourCC, px: &mut [u8], [r, g, b]: [u8; 3]) {
    match fourcc {
        FourCC::ARGB => px.copy_from_slice(&[b, g, r, 0xFF]),
        FourCC::BGRA => px.copy_from_slice(&[0xFF, r, g, b]),
        FourCC::ABGR => px.copy_from_slice(&[r, g, b, 0xFF]),
        FourCC::RGBA => px.copy_from_slice(&[0xFF, b, g, r]),
        FourCC::BG24 => px.copy_from_slice(&[b, g, r]),
        FourCC::RGBP => {
            let word = (b as u16 >> 3) | ((g as u16 >> 2) << 5) | ((r as u16 >> 3) << 11);
            px.copy_from_slice(&word.to_le_bytes());
        }
        FourCC::RGBO => {
            let word =
                (b as u16 >> 3) | ((g as u16 >> 3) << 5) | ((r as u16 >> 3) << 10) | 0x8000;
            px.copy_from_slice(&word.to_le_bytes());
        }
        FourCC::R444 => {
            let word = (b as u16 >> 4) | ((g as u16 >> 4) << 4) | ((r as u16 >> 4) << 8) | 0xF000;
            px.copy_from_slice(&word.to_le_bytes());
        }
        _ => {}
    }
}

fn expand5(v: u16) -> u8 {
    let v = (v & 0x1F) as u8;
    (v << 3) | (v >> 2)
}

fn expand6(v: u16) -> u8 {
    let v = (v & 0x3F) as u8;
    (v << 2) | (v >> 4)
}

fn expand4(v: u16) -> u8 {
    let v = (v & 0x0F) as u8;
    (v << 4) | v
}

fn load_rgb(fourcc: FourCC, px: &[u8]) -> [u8; 3] {
    match fourcc {
        FourCC::ARGB => [px[2], px[1], px[0]],
        FourCC::BGRA => [px[1], px[2], px[3]],
        FourCC::ABGR => [px[0], px[1], px[2]],
        FourCC::RGBA => [px[3], px[2], px[1]],
        FourCC::BG24 => [px[2], px[1], px[0]],
        FourCC::RGBP => {
            let word = u16::from_le_bytes([px[0], px[1]]);
            [expand5(word >> 11), expand6(word >> 5), expand5(word)]
        }
        FourCC::RGBO => {
            let word = u16::from_le_bytes([px[0], px[1]]);
            [expand5(word >> 10), expand5(word >> 5), expand5(word)]
        }
        FourCC::R444 => {
            let word = u16::from_le_bytes([px[0], px[1]]);
            [expand4(word >> 8), expand4(word >> 4), expand4(word)]
        }
        _ => [0, 0, 0],
    }
}

/// Convert planar I420 into `dst` laid out as `fourcc`. Capacity is checked before any write.
/// Returns the number of bytes written.
///
/// For the 4:2:2 packed layouts an odd trailing column carries luma and U only.
pub fn i420_to_packed(
    src: &I420Planes<'_>,
    dst: &mut [u8],
    width: usize,
    height: usize,
    fourcc: FourCC,
) -> Result<usize> {
    let need = required_buffer_size(width, height, fourcc);
    if dst.len() < need {
        return Err(BridgeError::InsufficientBuffer {
            has: dst.len(),
            need,
        });
    }
    src.validate(width, height)?;
    let (cw, ch) = (chroma_dim(width), chroma_dim(height));

    match fourcc.layout() {
        Layout::Planar { swap_uv } => {
            let (first, first_stride, second, second_stride) = if swap_uv {
                (src.v, src.stride_v, src.u, src.stride_u)
            } else {
                (src.u, src.stride_u, src.v, src.stride_v)
            };
            let (luma, chroma) = dst[..need].split_at_mut(width * height);
            copy_plane(src.y, src.stride_y, luma, width, height);
            let (a, b) = chroma.split_at_mut(cw * ch);
            copy_plane(first, first_stride, a, cw, ch);
            copy_plane(second, second_stride, b, cw, ch);
        }
        Layout::SemiPlanar { vu } => {
            let (luma, chroma) = dst[..need].split_at_mut(width * height);
            copy_plane(src.y, src.stride_y, luma, width, height);
            for row in 0..ch {
                let out = &mut chroma[row * cw * 2..(row + 1) * cw * 2];
                let u = &src.u[row * src.stride_u..];
                let v = &src.v[row * src.stride_v..];
                for col in 0..cw {
                    let (a, b) = if vu { (v[col], u[col]) } else { (u[col], v[col]) };
                    out[col * 2] = a;
                    out[col * 2 + 1] = b;
                }
            }
        }
        Layout::Packed422 { luma_first } => {
            for row in 0..height {
                let y = &src.y[row * src.stride_y..];
                let u = &src.u[(row / 2) * src.stride_u..];
                let v = &src.v[(row / 2) * src.stride_v..];
                let out = &mut dst[row * width * 2..(row + 1) * width * 2];
                for pair in 0..cw {
                    let x = pair * 2;
                    let chunk = &mut out[x * 2..(x * 2 + 4).min(width * 2)];
                    if chunk.len() == 4 {
                        if luma_first {
                            chunk.copy_from_slice(&[y[x], u[pair], y[x + 1], v[pair]]);
                        } else {
                            chunk.copy_from_slice(&[u[pair], y[x], v[pair], y[x + 1]]);
                        }
                    } else if luma_first {
                        chunk.copy_from_slice(&[y[x], u[pair]]);
                    } else {
                        chunk.copy_from_slice(&[u[pair], y[x]]);
                    }
                }
            }
        }
        Layout::Rgb { bytes } => {
            for row in 0..height {
                let y = &src.y[row * src.stride_y..];
                let u = &src.u[(row / 2) * src.stride_u..];
                let v = &src.v[(row / 2) * src.stride_v..];
                let out = &mut dst[row * width * bytes..(row + 1) * width * bytes];
                for (col, px) in out.chunks_exact_mut(bytes).enumerate() {
                    store_rgb(fourcc, px, yuv_to_rgb(y[col], u[col / 2], v[col / 2]));
                }
            }
        }
    }
    Ok(need)
}

/// Convert `src` laid out as `fourcc` into planar I420. The source must hold the full
/// required size and every destination plane must fit, both checked before any write.
pub fn packed_to_i420(
    src: &[u8],
    width: usize,
    height: usize,
    fourcc: FourCC,
    dst: &mut I420PlanesMut<'_>,
) -> Result<()> {
    let need = required_buffer_size(width, height, fourcc);
    if src.len() < need {
        return Err(BridgeError::InsufficientBuffer {
            has: src.len(),
            need,
        });
    }
    dst.validate(width, height)?;
    let (cw, ch) = (chroma_dim(width), chroma_dim(height));

    match fourcc.layout() {
        Layout::Planar { swap_uv } => {
            let (luma, chroma) = src[..need].split_at(width * height);
            let (a, b) = chroma.split_at(cw * ch);
            let (u, v) = if swap_uv { (b, a) } else { (a, b) };
            restride(luma, width, dst.y, dst.stride_y, width, height);
            restride(u, cw, dst.u, dst.stride_u, cw, ch);
            restride(v, cw, dst.v, dst.stride_v, cw, ch);
        }
        Layout::SemiPlanar { vu } => {
            let (luma, chroma) = src[..need].split_at(width * height);
            restride(luma, width, dst.y, dst.stride_y, width, height);
            for row in 0..ch {
                let pairs = &chroma[row * cw * 2..(row + 1) * cw * 2];
                for col in 0..cw {
                    let (a, b) = (pairs[col * 2], pairs[col * 2 + 1]);
                    let (u, v) = if vu { (b, a) } else { (a, b) };
                    dst.u[row * dst.stride_u + col] = u;
                    dst.v[row * dst.stride_v + col] = v;
                }
            }
        }
        Layout::Packed422 { luma_first } => {
            let row_bytes = width * 2;
            let sample = |row: usize, pair: usize| -> (u8, u8, Option<u8>, Option<u8>) {
                let line = &src[row * row_bytes..(row + 1) * row_bytes];
                let x = pair * 4;
                let chunk = &line[x..(x + 4).min(row_bytes)];
                match (luma_first, chunk.len()) {
                    (true, 4) => (chunk[0], chunk[1], Some(chunk[2]), Some(chunk[3])),
                    (false, 4) => (chunk[1], chunk[0], Some(chunk[3]), Some(chunk[2])),
                    (true, _) => (chunk[0], chunk[1], None, None),
                    (false, _) => (chunk[1], chunk[0], None, None),
                }
            };
            for row in 0..height {
                for pair in 0..cw {
                    let (y0, _, y1, _) = sample(row, pair);
                    dst.y[row * dst.stride_y + pair * 2] = y0;
                    if let Some(y1) = y1 {
                        dst.y[row * dst.stride_y + pair * 2 + 1] = y1;
                    }
                }
            }
            for crow in 0..ch {
                let top = crow * 2;
                let bottom = (top + 1).min(height - 1);
                for pair in 0..cw {
                    let (_, u0, _, v0) = sample(top, pair);
                    let (_, u1, _, v1) = sample(bottom, pair);
                    dst.u[crow * dst.stride_u + pair] = avg2(u0, u1);
                    dst.v[crow * dst.stride_v + pair] =
                        avg2(v0.unwrap_or(128), v1.unwrap_or(128));
                }
            }
        }
        Layout::Rgb { bytes } => {
            let row_bytes = width * bytes;
            let pixel = |row: usize, col: usize| {
                let offset = row * row_bytes + col * bytes;
                load_rgb(fourcc, &src[offset..offset + bytes])
            };
            for row in 0..height {
                for col in 0..width {
                    dst.y[row * dst.stride_y + col] = rgb_to_y(pixel(row, col));
                }
            }
            for crow in 0..ch {
                for ccol in 0..cw {
                    let mut sum = [0u32; 3];
                    let mut count = 0u32;
                    for row in (crow * 2)..(crow * 2 + 2).min(height) {
                        for col in (ccol * 2)..(ccol * 2 + 2).min(width) {
                            let rgb = pixel(row, col);
                            for (acc, channel) in sum.iter_mut().zip(rgb) {
                                *acc += channel as u32;
                            }
                            count += 1;
                        }
                    }
                    let mean = sum.map(|total| ((total + count / 2) / count) as u8);
                    let (u, v) = rgb_to_uv(mean);
                    dst.u[crow * dst.stride_u + ccol] = u;
                    dst.v[crow * dst.stride_v + ccol] = v;
                }
            }
        }
    }
    Ok(())
}

fn avg2(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) >> 1) as u8
}

fn copy_plane(src: &[u8], src_stride: usize, dst: &mut [u8], width: usize, rows: usize) {
    for row in 0..rows {
        dst[row * width..(row + 1) * width]
            .copy_from_slice(&src[row * src_stride..row * src_stride + width]);
    }
}

fn restride(src: &[u8], src_stride: usize, dst: &mut [u8], dst_stride: usize, width: usize, rows: usize) {
    for row in 0..rows {
        dst[row * dst_stride..row * dst_stride + width]
            .copy_from_slice(&src[row * src_stride..row * src_stride + width]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::I420Buffer;

    const WIDTH: usize = 32;
    const HEIGHT: usize = 8;

    fn gradient() -> I420Buffer {
        let mut buffer = I420Buffer::new(WIDTH, HEIGHT);
        buffer.fill_with(|plane, x, y| match plane {
            0 => (16 + (x * 7 + y * 3) % 219) as u8,
            1 => (64 + x * 4 + y) as u8,
            _ => (192 - x * 3 - y) as u8,
        });
        buffer
    }

    #[test]
    fn fourcc_values_use_little_endian_character_order() {
        assert_eq!(FourCC::I420.value(), 0x3032_3449);
        assert_eq!(FourCC::from_u32(FourCC::BG24.value()), Some(FourCC::BG24));
        assert_eq!(FourCC::from_name("24bg"), Some(FourCC::BG24));
        assert_eq!(FourCC::from_u32(0), None);
    }

    #[test]
    fn required_sizes_follow_format_families() {
        assert_eq!(required_buffer_size(5, 3, FourCC::I420), 15 + 3 * 2 * 2);
        assert_eq!(required_buffer_size(5, 3, FourCC::NV21), 27);
        assert_eq!(required_buffer_size(5, 3, FourCC::YUY2), 30);
        assert_eq!(required_buffer_size(5, 3, FourCC::RGBO), 30);
        assert_eq!(required_buffer_size(5, 3, FourCC::BG24), 45);
        assert_eq!(required_buffer_size(5, 3, FourCC::BGRA), 60);
        assert!(required_buffer_size_raw(2, 2, 0x1234).is_err());
    }

    #[test]
    fn short_destination_is_rejected_untouched() {
        let frame = gradient();
        let mut rgba = vec![0xAB; 4 * WIDTH * HEIGHT - 1];
        let err = i420_to_packed(&frame.planes(), &mut rgba, WIDTH, HEIGHT, FourCC::RGBA)
            .expect_err("buffer too small");
        assert_eq!(
            err.to_string(),
            format!("insufficient buffer size [has {}, need {}]", 4 * WIDTH * HEIGHT - 1, 4 * WIDTH * HEIGHT)
        );
        assert!(rgba.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn rgba_stores_alpha_in_first_byte() {
        let mut frame = I420Buffer::new(WIDTH, HEIGHT);
        frame.fill_with(|plane, _, _| if plane == 0 { 235 } else { 128 });
        let mut rgba = vec![0; 4 * WIDTH * HEIGHT];
        i420_to_packed(&frame.planes(), &mut rgba, WIDTH, HEIGHT, FourCC::RGBA).expect("convert");
        for px in rgba.chunks_exact(4) {
            assert_eq!(px, [0xFF, 0xFF, 0xFF, 0xFF]);
        }
    }

    #[test]
    fn yuv_layouts_round_trip_exactly() {
        let frame = gradient();
        for fourcc in FourCC::ALL.into_iter().filter(|f| f.is_lossless_yuv()) {
            let mut packed = vec![0; required_buffer_size(WIDTH, HEIGHT, fourcc)];
            i420_to_packed(&frame.planes(), &mut packed, WIDTH, HEIGHT, fourcc).expect("to packed");
            let mut back = I420Buffer::new(WIDTH, HEIGHT);
            packed_to_i420(&packed, WIDTH, HEIGHT, fourcc, &mut back.planes_mut()).expect("to i420");
            assert_eq!(back, frame, "{fourcc} round trip differs");
        }
    }

    #[test]
    fn rgb_round_trip_stays_close() {
        let mut frame = I420Buffer::new(WIDTH, HEIGHT);
        frame.fill_with(|plane, _, _| match plane {
            0 => 120,
            1 => 110,
            _ => 140,
        });
        for fourcc in [FourCC::ARGB, FourCC::ABGR, FourCC::BG24] {
            let mut packed = vec![0; required_buffer_size(WIDTH, HEIGHT, fourcc)];
            i420_to_packed(&frame.planes(), &mut packed, WIDTH, HEIGHT, fourcc).expect("to rgb");
            let mut back = I420Buffer::new(WIDTH, HEIGHT);
            packed_to_i420(&packed, WIDTH, HEIGHT, fourcc, &mut back.planes_mut()).expect("to i420");
            for (a, b) in frame.data_y().iter().zip(back.data_y()) {
                assert!((*a as i32 - *b as i32).abs() <= 2, "{fourcc} luma {a} vs {b}");
            }
            for (a, b) in frame.data_u().iter().zip(back.data_u()) {
                assert!((*a as i32 - *b as i32).abs() <= 2, "{fourcc} chroma {a} vs {b}");
            }
        }
    }

    #[test]
    fn small_destination_planes_are_rejected() {
        let packed = vec![0; required_buffer_size(WIDTH, HEIGHT, FourCC::ARGB)];
        let mut y = vec![0; WIDTH * HEIGHT - 1];
        let mut u = vec![0; WIDTH * HEIGHT / 4];
        let mut v = vec![0; WIDTH * HEIGHT / 4];
        let mut planes = I420PlanesMut {
            y: &mut y,
            stride_y: WIDTH,
            u: &mut u,
            stride_u: WIDTH / 2,
            v: &mut v,
            stride_v: WIDTH / 2,
        };
        let err = packed_to_i420(&packed, WIDTH, HEIGHT, FourCC::ARGB, &mut planes)
            .expect_err("plane too small");
        assert!(matches!(err, BridgeError::InsufficientBuffer { .. }));
    }
}
