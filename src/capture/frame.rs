use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Pixel formats known to the capture engine.
///
/// `Nv12` is the decode-native layout held in the raw ring; the rest are
/// conversion targets (see [`crate::capture::convert`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    Bgr8,
    Bgra8,
    Rgb32f,
    Rgba32f,
    Gray8,
    Nv12,
    I420,
    Yuyv,
}

impl PixelFormat {
    /// Bytes occupied by a tightly packed `width` x `height` image.
    pub fn size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => w * h * 3,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => w * h * 4,
            PixelFormat::Rgb32f => w * h * 3 * 4,
            PixelFormat::Rgba32f => w * h * 4 * 4,
            PixelFormat::Gray8 => w * h,
            PixelFormat::Yuyv => w.div_ceil(2) * 4 * h,
            PixelFormat::Nv12 | PixelFormat::I420 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }

    /// Channels per pixel for the interleaved formats.
    pub fn channels(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Bgr8 | PixelFormat::Rgb32f => Some(3),
            PixelFormat::Rgba8 | PixelFormat::Bgra8 | PixelFormat::Rgba32f => Some(4),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Nv12 | PixelFormat::I420 | PixelFormat::Yuyv => None,
        }
    }

    /// Caps `format` tag used by GStreamer for this layout.
    pub fn gst_name(self) -> &'static str {
        match self {
            PixelFormat::Rgb8 => "RGB",
            PixelFormat::Rgba8 => "RGBA",
            PixelFormat::Bgr8 => "BGR",
            PixelFormat::Bgra8 => "BGRA",
            PixelFormat::Rgb32f => "RGBF32",
            PixelFormat::Rgba32f => "RGBAF32",
            PixelFormat::Gray8 => "GRAY8",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::I420 => "I420",
            PixelFormat::Yuyv => "YUY2",
        }
    }

    pub fn from_gst_name(name: &str) -> Option<Self> {
        match name {
            "RGB" => Some(PixelFormat::Rgb8),
            "RGBA" | "RGBx" => Some(PixelFormat::Rgba8),
            "BGR" => Some(PixelFormat::Bgr8),
            "BGRA" | "BGRx" => Some(PixelFormat::Bgra8),
            "GRAY8" => Some(PixelFormat::Gray8),
            "NV12" => Some(PixelFormat::Nv12),
            "I420" => Some(PixelFormat::I420),
            "YUY2" => Some(PixelFormat::Yuyv),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::Rgba8 => "rgba8",
            PixelFormat::Bgr8 => "bgr8",
            PixelFormat::Bgra8 => "bgra8",
            PixelFormat::Rgb32f => "rgb32f",
            PixelFormat::Rgba32f => "rgba32f",
            PixelFormat::Gray8 => "gray8",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::I420 => "i420",
            PixelFormat::Yuyv => "yuyv",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format = match s.to_ascii_lowercase().as_str() {
            "rgb8" | "rgb" | "rgb24" => PixelFormat::Rgb8,
            "rgba8" | "rgba" => PixelFormat::Rgba8,
            "bgr8" | "bgr" | "bgr24" => PixelFormat::Bgr8,
            "bgra8" | "bgra" => PixelFormat::Bgra8,
            "rgb32f" => PixelFormat::Rgb32f,
            "rgba32f" => PixelFormat::Rgba32f,
            "gray8" | "gray" => PixelFormat::Gray8,
            "nv12" => PixelFormat::Nv12,
            "i420" => PixelFormat::I420,
            "yuyv" | "yuy2" => PixelFormat::Yuyv,
            other => return Err(format!("unknown pixel format '{other}'")),
        };
        Ok(format)
    }
}

/// Capability metadata the backend attaches to each decoded sample.
///
/// Every field is optional because the backend may hand over incomplete
/// caps; the ingestion path decides what it can accept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleCaps {
    pub format: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    /// Plane layout of the payload; `None` means tightly packed
    pub layout: Option<PlaneLayout>,
}

impl SampleCaps {
    pub fn nv12(width: i32, height: i32) -> Self {
        Self {
            format: Some(PixelFormat::Nv12.gst_name().to_string()),
            width: Some(width),
            height: Some(height),
            layout: None,
        }
    }

    pub fn with_layout(mut self, layout: PlaneLayout) -> Self {
        self.layout = Some(layout);
        self
    }
}

/// Row strides and plane offsets of an NV12 payload, in bytes.
///
/// Decoders commonly pad rows to an alignment; the ring only ever holds
/// tightly packed frames, so padded payloads are repacked on ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Luma and interleaved chroma row strides
    pub strides: [usize; 2],
    /// Start of the luma and chroma planes
    pub offsets: [usize; 2],
}

impl PlaneLayout {
    /// Layout of a tightly packed frame.
    pub fn packed(width: u32, height: u32) -> Self {
        let (w, h) = (width as usize, height as usize);
        Self {
            strides: [w, w.div_ceil(2) * 2],
            offsets: [0, w * h],
        }
    }

    pub fn is_packed(&self, width: u32, height: u32) -> bool {
        *self == Self::packed(width, height)
    }

    /// Bytes a payload needs to hold every visible row in this layout.
    pub fn required_len(&self, width: u32, height: u32) -> usize {
        let packed = Self::packed(width, height);
        let (h, ch) = (height as usize, (height as usize).div_ceil(2));
        let y_stride = self.strides[0].max(packed.strides[0]);
        let uv_stride = self.strides[1].max(packed.strides[1]);
        let y_end = self.offsets[0] + y_stride * (h - 1) + packed.strides[0];
        let uv_end = self.offsets[1] + uv_stride * (ch - 1) + packed.strides[1];
        y_end.max(uv_end)
    }

    /// Copy the visible rows of `src` into the tightly packed `dst`.
    ///
    /// `src` must hold [`Self::required_len`] bytes and `dst` the packed NV12
    /// size.
    pub fn pack(&self, src: &[u8], dst: &mut [u8], width: u32, height: u32) {
        let packed = Self::packed(width, height);
        let (h, ch) = (height as usize, (height as usize).div_ceil(2));
        let (y_dst, uv_dst) = dst.split_at_mut(packed.offsets[1]);

        copy_rows(&src[self.offsets[0]..], self.strides[0], y_dst, packed.strides[0], h);
        copy_rows(&src[self.offsets[1]..], self.strides[1], uv_dst, packed.strides[1], ch);
    }
}

fn copy_rows(src: &[u8], src_stride: usize, dst: &mut [u8], row_bytes: usize, rows: usize) {
    // a stride shorter than a row cannot describe real memory
    let src_stride = src_stride.max(row_bytes);
    for (row, out) in dst.chunks_exact_mut(row_bytes).take(rows).enumerate() {
        let start = row * src_stride;
        out.copy_from_slice(&src[start..start + row_bytes]);
    }
}

/// Frame returned by [`crate::Decoder::capture`].
///
/// Borrows the output pool; valid until the next call on the decoder.
#[derive(Debug)]
pub struct CapturedFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Ingestion sequence number of the raw frame this was converted from
    pub sequence: u64,
}

impl CapturedFrame<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_layouts() {
        assert_eq!(PixelFormat::Rgb8.size(4, 2), 24);
        assert_eq!(PixelFormat::Rgba32f.size(4, 2), 128);
        assert_eq!(PixelFormat::Nv12.size(4, 2), 12);
        // odd dimensions round the chroma planes up
        assert_eq!(PixelFormat::Nv12.size(3, 3), 9 + 2 * 4);
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("RGBA8".parse::<PixelFormat>(), Ok(PixelFormat::Rgba8));
        assert_eq!("rgb32f".parse::<PixelFormat>(), Ok(PixelFormat::Rgb32f));
        assert!("argb".parse::<PixelFormat>().is_err());
        assert_eq!(PixelFormat::from_gst_name("NV12"), Some(PixelFormat::Nv12));
        assert_eq!(PixelFormat::Bgra8.to_string(), "bgra8");
    }

    #[test]
    fn packed_layout_needs_no_repack() {
        let layout = PlaneLayout::packed(3, 3);
        assert_eq!(layout.strides, [3, 4]);
        assert_eq!(layout.offsets, [0, 9]);
        assert!(layout.is_packed(3, 3));
        assert_eq!(layout.required_len(3, 3), PixelFormat::Nv12.size(3, 3));
    }

    #[test]
    fn pack_drops_row_padding() {
        // 6x2 frame, both planes padded to 8 bytes per row
        let layout = PlaneLayout {
            strides: [8, 8],
            offsets: [0, 16],
        };
        let mut src = vec![0u8; 24];
        src[..6].fill(10);
        src[8..14].fill(20);
        src[16..22].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert!(!layout.is_packed(6, 2));
        assert_eq!(layout.required_len(6, 2), 22);

        let mut dst = vec![0xff; PixelFormat::Nv12.size(6, 2)];
        layout.pack(&src, &mut dst, 6, 2);
        assert_eq!(
            dst,
            [10, 10, 10, 10, 10, 10, 20, 20, 20, 20, 20, 20, 1, 2, 3, 4, 5, 6]
        );
    }
}
