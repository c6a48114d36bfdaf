pub mod capture;
pub mod error;
pub mod options;
pub mod pipeline;
pub mod uri;

use std::path::{Path, PathBuf};
use std::time::Duration;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{CapturedFrame, DecodeBackend, Decoder, DecoderStats, StreamState, Timeout};
#[cfg(feature = "gstreamer-pipeline")]
pub use capture::{GstBackend, GstRuntime};
pub use error::{ConfigError, DecodeError};
pub use options::{Codec, DecoderOptions, FlipMethod};
pub use uri::{Protocol, Uri};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub decoder: DecoderConfig,
    pub capture: CaptureLoopConfig,
    pub logging: LoggingConfig,
}

/// Stream to decode, as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// `file://`, `rtp://` or `rtsp://` locator; bare paths are files
    pub resource: String,
    pub codec: String,
    /// 0 keeps the stream's geometry
    pub width: u32,
    pub height: u32,
    pub flip: FlipMethod,
    pub num_buffers: usize,
    pub zero_copy: bool,
    pub open_settle_ms: u64,
    pub close_settle_ms: u64,
}

/// Capture loop driven by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureLoopConfig {
    pub format: PixelFormat,
    /// Per-capture timeout, `None` blocks until a frame or end of stream
    pub timeout_ms: Option<u64>,
    /// Stop after this many frames
    pub max_frames: Option<u64>,
    /// Write the last captured frame here as PNG
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing-subscriber` env filter, `RUST_LOG` takes precedence
    pub filter: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            resource: String::new(),
            codec: "h264".into(),
            width: 0,
            height: 0,
            flip: FlipMethod::None,
            num_buffers: DecoderOptions::DEFAULT_NUM_BUFFERS,
            zero_copy: true,
            open_settle_ms: 100,
            close_settle_ms: 250,
        }
    }
}

impl Default for CaptureLoopConfig {
    fn default() -> Self {
        Self {
            format: PixelFormat::Rgb8,
            timeout_ms: Some(1000),
            max_frames: None,
            snapshot: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "streamcap=info".into(),
        }
    }
}

impl Config {
    /// Defaults, overlaid by `path` (TOML) when given, overlaid by
    /// `STREAMCAP__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder
            .add_source(
                config::Environment::with_prefix("STREAMCAP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

impl CaptureLoopConfig {
    pub fn timeout(&self) -> Timeout {
        self.timeout_ms.map(Duration::from_millis).into()
    }
}

impl TryFrom<&DecoderConfig> for DecoderOptions {
    type Error = ConfigError;

    fn try_from(config: &DecoderConfig) -> Result<Self, Self::Error> {
        if (config.width == 0) != (config.height == 0) {
            return Err(ConfigError::Invalid(format!(
                "width and height must be set together (got {}x{})",
                config.width, config.height
            )));
        }
        Ok(DecoderOptions::parse(&config.resource, &config.codec)?
            .with_size(config.width, config.height)
            .with_flip(config.flip)
            .with_buffers(config.num_buffers)
            .with_zero_copy(config.zero_copy)
            .with_settle(
                Duration::from_millis(config.open_settle_ms),
                Duration::from_millis(config.close_settle_ms),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_sources() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.decoder.codec, "h264");
        assert_eq!(config.decoder.num_buffers, 4);
        assert_eq!(config.capture.format, PixelFormat::Rgb8);
        assert_eq!(config.capture.timeout(), Timeout::from_millis(1000));
    }

    #[test]
    fn loads_toml_file() {
        let path = std::env::temp_dir().join(format!("streamcap-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[decoder]
resource = "rtp://@:5000"
codec = "h265"
width = 1280
height = 720
flip = "rotate-180"

[capture]
format = "bgra8"
max_frames = 10
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.decoder.resource, "rtp://@:5000");
        assert_eq!(config.decoder.flip, FlipMethod::Rotate180);
        assert_eq!(config.capture.format, PixelFormat::Bgra8);
        assert_eq!(config.capture.max_frames, Some(10));
        // untouched keys keep their defaults
        assert!(config.decoder.zero_copy);

        let options = DecoderOptions::try_from(&config.decoder).unwrap();
        assert_eq!(options.codec, Codec::H265);
        assert_eq!(options.resource.port, Some(5000));
        assert!(options.has_target_size());
    }

    #[test]
    fn rejects_half_specified_geometry() {
        let config = DecoderConfig {
            resource: "rtp://@:5000".into(),
            width: 640,
            ..DecoderConfig::default()
        };
        assert!(matches!(
            DecoderOptions::try_from(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn empty_resource_is_a_config_error() {
        let config = DecoderConfig::default();
        assert_eq!(
            DecoderOptions::try_from(&config).unwrap_err(),
            ConfigError::EmptyResource
        );
    }
}
