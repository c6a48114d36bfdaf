//! NV12 colorspace conversion
//!
//! Pure functions: the capture handler converts the latest raw frame into
//! the caller's format, one row per rayon task.

use rayon::prelude::*;

use super::frame::PixelFormat;
use crate::error::ConversionError;

/// Output formats [`convert`] can produce from NV12.
pub const SUPPORTED_OUTPUTS: [PixelFormat; 8] = [
    PixelFormat::Rgb8,
    PixelFormat::Rgba8,
    PixelFormat::Bgr8,
    PixelFormat::Bgra8,
    PixelFormat::Rgb32f,
    PixelFormat::Rgba32f,
    PixelFormat::Gray8,
    PixelFormat::Nv12,
];

pub fn is_supported(src: PixelFormat, dst: PixelFormat) -> bool {
    src == PixelFormat::Nv12 && SUPPORTED_OUTPUTS.contains(&dst)
}

/// Convert a tightly packed `width` x `height` image from `src_format` into
/// `dst_format`. Float outputs carry values in 0..=255.
pub fn convert(
    src: &[u8],
    src_format: PixelFormat,
    dst: &mut [u8],
    dst_format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<(), ConversionError> {
    if !is_supported(src_format, dst_format) {
        return Err(ConversionError::UnsupportedFormat {
            src: src_format,
            dst: dst_format,
        });
    }

    let src_len = src_format.size(width, height);
    if src.len() < src_len {
        return Err(ConversionError::SourceTooShort {
            expected: src_len,
            actual: src.len(),
        });
    }
    let dst_len = dst_format.size(width, height);
    if dst.len() < dst_len {
        return Err(ConversionError::DestinationTooShort {
            expected: dst_len,
            actual: dst.len(),
        });
    }

    let (w, h) = (width as usize, height as usize);
    let (y_plane, uv_plane) = src[..src_len].split_at(w * h);
    let dst = &mut dst[..dst_len];

    match dst_format {
        PixelFormat::Nv12 => dst.copy_from_slice(&src[..src_len]),
        PixelFormat::Gray8 => dst.copy_from_slice(y_plane),
        PixelFormat::Rgb8 => convert_rows(y_plane, uv_plane, w, h, dst, 3, |px, (r, g, b)| {
            px.copy_from_slice(&[r, g, b]);
        }),
        PixelFormat::Bgr8 => convert_rows(y_plane, uv_plane, w, h, dst, 3, |px, (r, g, b)| {
            px.copy_from_slice(&[b, g, r]);
        }),
        PixelFormat::Rgba8 => convert_rows(y_plane, uv_plane, w, h, dst, 4, |px, (r, g, b)| {
            px.copy_from_slice(&[r, g, b, 255]);
        }),
        PixelFormat::Bgra8 => convert_rows(y_plane, uv_plane, w, h, dst, 4, |px, (r, g, b)| {
            px.copy_from_slice(&[b, g, r, 255]);
        }),
        PixelFormat::Rgb32f => convert_rows(y_plane, uv_plane, w, h, dst, 12, |px, (r, g, b)| {
            write_floats(px, &[r as f32, g as f32, b as f32]);
        }),
        PixelFormat::Rgba32f => convert_rows(y_plane, uv_plane, w, h, dst, 16, |px, (r, g, b)| {
            write_floats(px, &[r as f32, g as f32, b as f32, 255.0]);
        }),
        PixelFormat::I420 | PixelFormat::Yuyv => {
            return Err(ConversionError::UnsupportedFormat {
                src: src_format,
                dst: dst_format,
            })
        }
    }

    Ok(())
}

fn convert_rows<F>(
    y_plane: &[u8],
    uv_plane: &[u8],
    width: usize,
    height: usize,
    dst: &mut [u8],
    bytes_per_pixel: usize,
    put: F,
) where
    F: Fn(&mut [u8], (u8, u8, u8)) + Sync,
{
    let row_bytes = width * bytes_per_pixel;
    let uv_stride = width.div_ceil(2) * 2;
    if row_bytes == 0 {
        return;
    }

    dst.par_chunks_mut(row_bytes)
        .take(height)
        .enumerate()
        .for_each(|(row, line)| {
            let y_line = &y_plane[row * width..][..width];
            let uv_line = &uv_plane[(row / 2) * uv_stride..][..uv_stride];
            for (x, px) in line.chunks_exact_mut(bytes_per_pixel).enumerate() {
                let uv = (x / 2) * 2;
                put(px, yuv_to_rgb(y_line[x], uv_line[uv], uv_line[uv + 1]));
            }
        });
}

fn write_floats(px: &mut [u8], values: &[f32]) {
    for (out, value) in px.chunks_exact_mut(4).zip(values) {
        out.copy_from_slice(&value.to_ne_bytes());
    }
}

/// Limited-range BT.601, 8-bit fixed point.
#[inline(always)]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = (y as i32 - 16).max(0) * 298;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (c + 409 * e + 128) >> 8;
    let g = (c - 100 * d - 208 * e + 128) >> 8;
    let b = (c + 516 * d + 128) >> 8;
    (clamp(r), clamp(g), clamp(b))
}

#[inline(always)]
fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Uniform NV12 image.
    fn nv12(width: u32, height: u32, y: u8, u: u8, v: u8) -> Vec<u8> {
        let luma = (width * height) as usize;
        let mut buf = vec![y; luma];
        for _ in 0..(PixelFormat::Nv12.size(width, height) - luma) / 2 {
            buf.extend_from_slice(&[u, v]);
        }
        buf
    }

    #[test]
    fn white_and_black() {
        let mut out = vec![0u8; PixelFormat::Rgb8.size(2, 2)];
        convert(&nv12(2, 2, 235, 128, 128), PixelFormat::Nv12, &mut out, PixelFormat::Rgb8, 2, 2).unwrap();
        assert!(out.iter().all(|b| *b == 255));

        convert(&nv12(2, 2, 16, 128, 128), PixelFormat::Nv12, &mut out, PixelFormat::Rgb8, 2, 2).unwrap();
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn channel_order() {
        // BT.601 red
        let src = nv12(2, 2, 81, 90, 240);
        let mut rgba = vec![0u8; PixelFormat::Rgba8.size(2, 2)];
        convert(&src, PixelFormat::Nv12, &mut rgba, PixelFormat::Rgba8, 2, 2).unwrap();
        assert_eq!(&rgba[..4], &[255, 0, 0, 255]);

        let mut bgr = vec![0u8; PixelFormat::Bgr8.size(2, 2)];
        convert(&src, PixelFormat::Nv12, &mut bgr, PixelFormat::Bgr8, 2, 2).unwrap();
        assert_eq!(&bgr[..3], &[0, 0, 255]);
    }

    #[test]
    fn float_output() {
        let mut out = vec![0u8; PixelFormat::Rgba32f.size(2, 2)];
        convert(&nv12(2, 2, 235, 128, 128), PixelFormat::Nv12, &mut out, PixelFormat::Rgba32f, 2, 2).unwrap();
        let first: Vec<f32> = out[..16]
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(first, [255.0, 255.0, 255.0, 255.0]);
    }

    #[test]
    fn odd_dimensions() {
        let src = nv12(3, 3, 235, 128, 128);
        let mut out = vec![0u8; PixelFormat::Rgb8.size(3, 3)];
        convert(&src, PixelFormat::Nv12, &mut out, PixelFormat::Rgb8, 3, 3).unwrap();
        assert!(out.iter().all(|b| *b == 255));
    }

    #[test]
    fn gray_and_passthrough() {
        let mut src = nv12(2, 2, 0, 128, 128);
        src[..4].copy_from_slice(&[1, 2, 3, 4]);

        let mut gray = vec![0u8; 4];
        convert(&src, PixelFormat::Nv12, &mut gray, PixelFormat::Gray8, 2, 2).unwrap();
        assert_eq!(gray, [1, 2, 3, 4]);

        let mut copy = vec![0u8; src.len()];
        convert(&src, PixelFormat::Nv12, &mut copy, PixelFormat::Nv12, 2, 2).unwrap();
        assert_eq!(copy, src);
    }

    #[test]
    fn rejects_unsupported_and_short_buffers() {
        let src = nv12(2, 2, 0, 128, 128);
        let mut out = vec![0u8; 64];
        assert_eq!(
            convert(&src, PixelFormat::Nv12, &mut out, PixelFormat::I420, 2, 2),
            Err(ConversionError::UnsupportedFormat {
                src: PixelFormat::Nv12,
                dst: PixelFormat::I420
            })
        );
        assert!(matches!(
            convert(&src, PixelFormat::Rgb8, &mut out, PixelFormat::Rgba8, 2, 2),
            Err(ConversionError::UnsupportedFormat { .. })
        ));
        // planar and packed YUV targets are never produced
        for dst in [PixelFormat::I420, PixelFormat::Yuyv] {
            assert_eq!(
                convert(&src, PixelFormat::Nv12, &mut out, dst, 2, 2),
                Err(ConversionError::UnsupportedFormat {
                    src: PixelFormat::Nv12,
                    dst
                })
            );
        }
        assert!(matches!(
            convert(&src[..4], PixelFormat::Nv12, &mut out, PixelFormat::Rgb8, 2, 2),
            Err(ConversionError::SourceTooShort { expected: 6, actual: 4 })
        ));
        assert!(matches!(
            convert(&src, PixelFormat::Nv12, &mut out[..2], PixelFormat::Rgb8, 2, 2),
            Err(ConversionError::DestinationTooShort { expected: 12, actual: 2 })
        ));
    }
}
