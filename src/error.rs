//! Error taxonomy for the capture engine

use std::path::PathBuf;

use thiserror::Error;

use crate::capture::frame::PixelFormat;

/// Rejected stream configuration. Fatal to construction, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("empty resource locator")]
    EmptyResource,
    #[error("unsupported protocol '{0}' (supported: file://, rtp://, rtsp://)")]
    UnsupportedProtocol(String),
    #[error("unsupported video file extension '{0}' (supported: mkv, mp4, qt, flv, avi, h264, h265)")]
    UnsupportedExtension(String),
    #[error("unsupported codec '{0}' (supported: h264, h265, vp8, vp9, mpeg2, mpeg4)")]
    UnsupportedCodec(String),
    #[error("codec {codec} cannot be received over {protocol}")]
    CodecNotAvailable {
        codec: &'static str,
        protocol: &'static str,
    },
    #[error("file extension '{extension}' does not carry {codec}")]
    ExtensionCodecMismatch {
        extension: String,
        codec: &'static str,
    },
    #[error("invalid port in '{0}'")]
    InvalidPort(String),
    #[error("couldn't find file '{}'", .0.display())]
    MissingFile(PathBuf),
    #[error("unsupported flip method '{0}'")]
    UnsupportedFlip(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure reported by the decode backend collaborator.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("failed to build pipeline: {0}")]
    Launch(String),
    #[error("failed to transition pipeline to {target}: {reason}")]
    StateChange { target: &'static str, reason: String },
    #[error("error from {source_path}: {message}")]
    Bus {
        source_path: String,
        message: String,
        debug: Option<String>,
    },
}

/// Slot memory could not be obtained.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to allocate {count} buffers ({slot_size} bytes each)")]
pub struct AllocationError {
    pub count: usize,
    pub slot_size: usize,
}

/// A decoded frame the ingestion path had to drop. Logged, never escalated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("sample had no caps")]
    MissingCaps,
    #[error("caps missing width/height")]
    MissingDimensions,
    #[error("non-positive frame dimensions {width}x{height}")]
    NonPositiveDimensions { width: i32, height: i32 },
    #[error("unexpected raw format '{0}' (expected NV12)")]
    UnexpectedFormat(String),
    #[error("frame holds {actual} bytes, {expected} required for its dimensions")]
    Truncated { expected: usize, actual: usize },
    #[error("sample had no buffer")]
    MissingBuffer,
    #[error("failed to map buffer memory")]
    MapFailed,
    #[error("no ring slot available for writing")]
    NoWritableSlot,
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

/// Failure of the colorspace conversion collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("unsupported conversion {src} -> {dst} (supported outputs: rgb8, rgba8, bgr8, bgra8, rgb32f, rgba32f, gray8, nv12)")]
    UnsupportedFormat { src: PixelFormat, dst: PixelFormat },
    #[error("source holds {actual} bytes, {expected} required")]
    SourceTooShort { expected: usize, actual: usize },
    #[error("destination holds {actual} bytes, {expected} required")]
    DestinationTooShort { expected: usize, actual: usize },
}

/// Errors surfaced by the capture API.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("backend failed to start: {0}")]
    BackendStart(#[source] BackendError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("end of stream (EOS) has been reached, stream has been closed")]
    EndOfStream,
    #[error("timed out waiting for a frame")]
    Timeout,
}

impl DecodeError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DecodeError::Timeout | DecodeError::BackendStart(_) | DecodeError::Conversion(_)
        )
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, DecodeError::EndOfStream)
    }
}
