//! Stream configuration handed to the decoder at construction

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::BufferDomain;
use crate::uri::Uri;

/// Compressed video codecs the decoder can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
    Vp8,
    Vp9,
    Mpeg2,
    Mpeg4,
}

impl Codec {
    pub fn as_str(self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
            Codec::Vp8 => "vp8",
            Codec::Vp9 => "vp9",
            Codec::Mpeg2 => "mpeg2",
            Codec::Mpeg4 => "mpeg4",
        }
    }

    /// RTP `encoding-name`, `None` for codecs without an RTP depayloader.
    pub fn rtp_encoding(self) -> Option<&'static str> {
        match self {
            Codec::H264 => Some("H264"),
            Codec::H265 => Some("H265"),
            Codec::Vp8 => Some("VP8"),
            Codec::Vp9 => Some("VP9"),
            Codec::Mpeg2 | Codec::Mpeg4 => None,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let codec = match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Codec::H264,
            "h265" | "hevc" => Codec::H265,
            "vp8" => Codec::Vp8,
            "vp9" => Codec::Vp9,
            "mpeg2" => Codec::Mpeg2,
            "mpeg4" => Codec::Mpeg4,
            _ => return Err(ConfigError::UnsupportedCodec(s.to_string())),
        };
        Ok(codec)
    }
}

/// Flip/rotation applied while resampling.
///
/// Discriminants follow the `flip-method` numbering of the nvvidconv element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlipMethod {
    #[default]
    None = 0,
    CounterClockwise = 1,
    #[serde(rename = "rotate-180")]
    Rotate180 = 2,
    Clockwise = 3,
    Horizontal = 4,
    UpperRightDiagonal = 5,
    Vertical = 6,
    UpperLeftDiagonal = 7,
}

impl FlipMethod {
    /// Method name understood by `videoflip`.
    pub fn videoflip_name(self) -> &'static str {
        match self {
            FlipMethod::None => "none",
            FlipMethod::CounterClockwise => "counterclockwise",
            FlipMethod::Rotate180 => "rotate-180",
            FlipMethod::Clockwise => "clockwise",
            FlipMethod::Horizontal => "horizontal-flip",
            FlipMethod::UpperRightDiagonal => "upper-right-diagonal",
            FlipMethod::Vertical => "vertical-flip",
            FlipMethod::UpperLeftDiagonal => "upper-left-diagonal",
        }
    }
}

impl FromStr for FlipMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let flip = match s.to_ascii_lowercase().as_str() {
            "" | "none" => FlipMethod::None,
            "counterclockwise" | "rotate-90-ccw" => FlipMethod::CounterClockwise,
            "rotate-180" => FlipMethod::Rotate180,
            "clockwise" | "rotate-90-cw" => FlipMethod::Clockwise,
            "horizontal" | "horizontal-flip" => FlipMethod::Horizontal,
            "upper-right-diagonal" => FlipMethod::UpperRightDiagonal,
            "vertical" | "vertical-flip" => FlipMethod::Vertical,
            "upper-left-diagonal" => FlipMethod::UpperLeftDiagonal,
            _ => return Err(ConfigError::UnsupportedFlip(s.to_string())),
        };
        Ok(flip)
    }
}

/// Immutable per-stream configuration.
#[derive(Debug, Clone)]
pub struct DecoderOptions {
    pub resource: Uri,
    pub codec: Codec,
    /// Output width, 0 keeps the stream's own geometry
    pub width: u32,
    /// Output height, 0 keeps the stream's own geometry
    pub height: u32,
    pub flip: FlipMethod,
    pub num_buffers: usize,
    /// Share backend memory with the raw ring instead of copying
    pub zero_copy: bool,
    /// Pause between starting the backend and the second status poll
    pub open_settle: Duration,
    /// Pause between stopping the backend and draining its status channel
    pub close_settle: Duration,
}

impl DecoderOptions {
    pub const DEFAULT_NUM_BUFFERS: usize = 4;

    pub fn new(resource: Uri, codec: Codec) -> Self {
        Self {
            resource,
            codec,
            width: 0,
            height: 0,
            flip: FlipMethod::None,
            num_buffers: Self::DEFAULT_NUM_BUFFERS,
            zero_copy: true,
            open_settle: Duration::from_millis(100),
            close_settle: Duration::from_millis(250),
        }
    }

    /// Parse `resource` and `codec` strings.
    pub fn parse(resource: &str, codec: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(Uri::parse(resource)?, codec.parse()?))
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_flip(mut self, flip: FlipMethod) -> Self {
        self.flip = flip;
        self
    }

    pub fn with_buffers(mut self, num_buffers: usize) -> Self {
        self.num_buffers = num_buffers;
        self
    }

    pub fn with_zero_copy(mut self, zero_copy: bool) -> Self {
        self.zero_copy = zero_copy;
        self
    }

    pub fn with_settle(mut self, open: Duration, close: Duration) -> Self {
        self.open_settle = open;
        self.close_settle = close;
        self
    }

    /// Whether the backend should resample to a fixed geometry.
    pub fn has_target_size(&self) -> bool {
        self.width != 0 && self.height != 0
    }

    pub fn buffer_domain(&self) -> BufferDomain {
        if self.zero_copy {
            BufferDomain::Shared
        } else {
            BufferDomain::Host
        }
    }
}
