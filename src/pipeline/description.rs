//! Declarative description of the decode pipeline

use std::fmt;

use tracing::{debug, info};

use crate::capture::frame::PixelFormat;
use crate::error::ConfigError;
use crate::options::{Codec, DecoderOptions, FlipMethod};
use crate::uri::Protocol;

/// Name of the sink stage that delivers frames to the ingestion callback.
pub const SINK_NAME: &str = "framesink";

/// Supported video file extensions.
pub const SUPPORTED_EXTENSIONS: [&str; 7] = ["mkv", "mp4", "qt", "flv", "avi", "h264", "h265"];

/// Role of a stage in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Source,
    Demuxer,
    Queue,
    Depayloader,
    Parser,
    Decoder,
    Converter,
    Caps,
    Sink,
}

/// One element of the pipeline, or a caps filter between elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub kind: StageKind,
    /// Element factory name, or the caps string for [`StageKind::Caps`]
    pub element: String,
    pub properties: Vec<(String, String)>,
}

impl Stage {
    fn new(kind: StageKind, element: impl Into<String>) -> Self {
        Self {
            kind,
            element: element.into(),
            properties: Vec::new(),
        }
    }

    fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.properties.push((key.to_string(), value.to_string()));
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.element)?;
        for (key, value) in &self.properties {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Ordered stage list the backend is launched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDescription {
    stages: Vec<Stage>,
}

impl PipelineDescription {
    /// Build the description for `options`.
    ///
    /// `available` answers whether an element factory is installed; it picks
    /// hardware decoders and converters over the software fallbacks.
    pub fn build(
        options: &DecoderOptions,
        available: &dyn Fn(&str) -> bool,
    ) -> Result<Self, ConfigError> {
        let uri = &options.resource;
        let codec = options.codec;
        let mut stages = Vec::new();

        match uri.protocol {
            Protocol::File => {
                let path = uri.file_path().unwrap_or_default();
                if !path.is_file() {
                    return Err(ConfigError::MissingFile(path));
                }
                stages.push(
                    Stage::new(StageKind::Source, "filesrc")
                        .with("location", quote(&path.to_string_lossy())),
                );

                match uri.extension.as_str() {
                    "mkv" => stages.push(Stage::new(StageKind::Demuxer, "matroskademux")),
                    "mp4" | "qt" => stages.push(Stage::new(StageKind::Demuxer, "qtdemux")),
                    "flv" => stages.push(Stage::new(StageKind::Demuxer, "flvdemux")),
                    "avi" => stages.push(Stage::new(StageKind::Demuxer, "avidemux")),
                    "h264" if codec == Codec::H264 => {}
                    "h265" if codec == Codec::H265 => {}
                    ext @ ("h264" | "h265") => {
                        return Err(ConfigError::ExtensionCodecMismatch {
                            extension: ext.to_string(),
                            codec: codec.as_str(),
                        })
                    }
                    ext => return Err(ConfigError::UnsupportedExtension(ext.to_string())),
                }

                stages.push(Stage::new(StageKind::Queue, "queue"));
                if let Some(parser) = parser_for(codec) {
                    stages.push(Stage::new(StageKind::Parser, parser));
                }
            }
            Protocol::Rtp => {
                let port = uri
                    .port
                    .ok_or_else(|| ConfigError::InvalidPort(uri.to_string()))?;
                let encoding = rtp_encoding(codec, uri.protocol)?;

                let mut source = Stage::new(StageKind::Source, "udpsrc").with("port", port);
                if let Some(group) = uri.multicast_group() {
                    source = source
                        .with("multicast-group", group)
                        .with("auto-multicast", "true");
                }
                source = source.with(
                    "caps",
                    quote(&format!(
                        "application/x-rtp,media=(string)video,clock-rate=(int)90000,encoding-name=(string){}",
                        encoding
                    )),
                );
                stages.push(source);
                push_depayload(&mut stages, codec);
            }
            Protocol::Rtsp => {
                rtp_encoding(codec, uri.protocol)?;
                stages.push(
                    Stage::new(StageKind::Source, "rtspsrc").with("location", quote(&uri.string)),
                );
                stages.push(Stage::new(StageKind::Queue, "queue"));
                push_depayload(&mut stages, codec);
            }
        }

        let decoder = pick(decoders_for(codec), available);
        debug!("using {} decoder: {}", codec, decoder);
        stages.push(Stage::new(StageKind::Decoder, decoder));

        push_resample(&mut stages, options, available);

        stages.push(Stage::new(StageKind::Sink, "appsink").with("name", SINK_NAME));

        let description = Self { stages };
        info!("pipeline: {}", description);
        Ok(description)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|stage| stage.kind).collect()
    }

    pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.kind == kind)
    }

    pub fn sink_name(&self) -> &str {
        SINK_NAME
    }

    /// Render in `gst-launch` syntax.
    pub fn to_launch_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PipelineDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, stage) in self.stages.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ! ")?;
            }
            write!(f, "{}", stage)?;
        }
        Ok(())
    }
}

fn parser_for(codec: Codec) -> Option<&'static str> {
    match codec {
        Codec::H264 => Some("h264parse"),
        Codec::H265 => Some("h265parse"),
        Codec::Mpeg2 => Some("mpegvideoparse"),
        Codec::Mpeg4 => Some("mpeg4videoparse"),
        Codec::Vp8 | Codec::Vp9 => None,
    }
}

fn rtp_encoding(codec: Codec, protocol: Protocol) -> Result<&'static str, ConfigError> {
    codec.rtp_encoding().ok_or(ConfigError::CodecNotAvailable {
        codec: codec.as_str(),
        protocol: protocol.as_str(),
    })
}

fn push_depayload(stages: &mut Vec<Stage>, codec: Codec) {
    let depay = match codec {
        Codec::H264 => "rtph264depay",
        Codec::H265 => "rtph265depay",
        Codec::Vp8 => "rtpvp8depay",
        Codec::Vp9 => "rtpvp9depay",
        // rejected by rtp_encoding before we get here
        Codec::Mpeg2 | Codec::Mpeg4 => return,
    };
    stages.push(Stage::new(StageKind::Depayloader, depay));
    if let Some(parser) = parser_for(codec) {
        stages.push(Stage::new(StageKind::Parser, parser));
    }
}

/// Decoder factories in order of preference, hardware first. The last entry
/// is the software fallback used when nothing else is installed.
fn decoders_for(codec: Codec) -> &'static [&'static str] {
    match codec {
        Codec::H264 => &[
            "nvv4l2decoder",
            "omxh264dec",
            "vah264dec",
            "vaapih264dec",
            "v4l2h264dec",
            "avdec_h264",
        ],
        Codec::H265 => &[
            "nvv4l2decoder",
            "omxh265dec",
            "vah265dec",
            "vaapih265dec",
            "v4l2h265dec",
            "avdec_h265",
        ],
        Codec::Vp8 => &[
            "nvv4l2decoder",
            "omxvp8dec",
            "vavp8dec",
            "vaapivp8dec",
            "v4l2vp8dec",
            "vp8dec",
        ],
        Codec::Vp9 => &[
            "nvv4l2decoder",
            "omxvp9dec",
            "vavp9dec",
            "vaapivp9dec",
            "v4l2vp9dec",
            "vp9dec",
        ],
        Codec::Mpeg2 => &[
            "nvv4l2decoder",
            "omxmpeg2videodec",
            "vampeg2dec",
            "vaapimpeg2dec",
            "avdec_mpeg2video",
        ],
        Codec::Mpeg4 => &["nvv4l2decoder", "omxmpeg4videodec", "avdec_mpeg4"],
    }
}

fn pick(candidates: &'static [&'static str], available: &dyn Fn(&str) -> bool) -> &'static str {
    let fallback = candidates[candidates.len() - 1];
    candidates
        .iter()
        .copied()
        .find(|name| available(name))
        .unwrap_or(fallback)
}

/// Conversion to NV12 system memory, resizing and flipping on the way.
fn push_resample(stages: &mut Vec<Stage>, options: &DecoderOptions, available: &dyn Fn(&str) -> bool) {
    let flip = options.flip;

    if available("nvvidconv") {
        let mut conv = Stage::new(StageKind::Converter, "nvvidconv");
        if flip != FlipMethod::None {
            conv = conv.with("flip-method", flip as i32);
        }
        stages.push(conv);
    } else {
        if flip != FlipMethod::None {
            stages.push(
                Stage::new(StageKind::Converter, "videoflip").with("method", flip.videoflip_name()),
            );
        }
        if options.has_target_size() {
            stages.push(Stage::new(StageKind::Converter, "videoscale"));
        }
        stages.push(Stage::new(StageKind::Converter, "videoconvert"));
    }

    let mut caps = format!("video/x-raw,format=(string){}", PixelFormat::Nv12.gst_name());
    if options.has_target_size() {
        caps.push_str(&format!(
            ",width=(int){},height=(int){}",
            options.width, options.height
        ));
    }
    stages.push(Stage::new(StageKind::Caps, caps));
}

fn quote(value: &str) -> String {
    if value.contains(|c: char| c.is_whitespace() || c == '!' || c == ',' || c == '"') {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::Uri;
    use std::fs;
    use std::path::PathBuf;

    fn nothing_installed(_: &str) -> bool {
        false
    }

    fn temp_video(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("streamcap-desc-{}-{}", std::process::id(), name));
        fs::write(&path, b"not really a video").unwrap();
        path
    }

    fn options(resource: &str, codec: Codec) -> DecoderOptions {
        DecoderOptions::new(Uri::parse(resource).unwrap(), codec)
    }

    #[test]
    fn file_mp4_h264_stage_order() {
        let path = temp_video("clip.mp4");
        let desc = PipelineDescription::build(
            &options(&format!("file://{}", path.display()), Codec::H264),
            &nothing_installed,
        )
        .unwrap();

        let kinds: Vec<_> = desc
            .kinds()
            .into_iter()
            .filter(|kind| {
                matches!(
                    kind,
                    StageKind::Source
                        | StageKind::Demuxer
                        | StageKind::Parser
                        | StageKind::Decoder
                        | StageKind::Sink
                )
            })
            .collect();
        assert_eq!(
            kinds,
            [
                StageKind::Source,
                StageKind::Demuxer,
                StageKind::Parser,
                StageKind::Decoder,
                StageKind::Sink
            ]
        );
        assert_eq!(desc.stage(StageKind::Demuxer).unwrap().element, "qtdemux");
        assert_eq!(desc.stage(StageKind::Decoder).unwrap().element, "avdec_h264");
        assert_eq!(desc.stage(StageKind::Sink).unwrap().property("name"), Some(SINK_NAME));
        fs::remove_file(path).ok();
    }

    #[test]
    fn rtp_launch_string() {
        let desc =
            PipelineDescription::build(&options("rtp://@:5000", Codec::H264), &nothing_installed)
                .unwrap();
        assert_eq!(
            desc.to_launch_string(),
            "udpsrc port=5000 caps=\"application/x-rtp,media=(string)video,clock-rate=(int)90000,encoding-name=(string)H264\" \
             ! rtph264depay ! h264parse ! avdec_h264 ! videoconvert \
             ! video/x-raw,format=(string)NV12 ! appsink name=framesink"
        );
    }

    #[test]
    fn rtp_multicast_joins_group() {
        let desc = PipelineDescription::build(
            &options("rtp://224.1.1.1:5000", Codec::Vp8),
            &nothing_installed,
        )
        .unwrap();
        let source = desc.stage(StageKind::Source).unwrap();
        assert_eq!(source.property("multicast-group"), Some("224.1.1.1"));
        assert_eq!(desc.stage(StageKind::Parser), None);
        assert_eq!(desc.stage(StageKind::Decoder).unwrap().element, "vp8dec");
    }

    #[test]
    fn rtsp_uses_full_location() {
        let desc = PipelineDescription::build(
            &options("rtsp://127.0.0.1:8554/test", Codec::H265),
            &nothing_installed,
        )
        .unwrap();
        assert!(desc
            .to_launch_string()
            .starts_with("rtspsrc location=rtsp://127.0.0.1:8554/test ! queue ! rtph265depay ! h265parse"));
    }

    #[test]
    fn prefers_installed_hardware() {
        let installed = |name: &str| matches!(name, "vaapih264dec" | "nvvidconv");
        let opts = options("rtp://@:5000", Codec::H264)
            .with_size(1280, 720)
            .with_flip(FlipMethod::Rotate180);
        let desc = PipelineDescription::build(&opts, &installed).unwrap();

        assert_eq!(desc.stage(StageKind::Decoder).unwrap().element, "vaapih264dec");
        let conv = desc.stage(StageKind::Converter).unwrap();
        assert_eq!(conv.element, "nvvidconv");
        assert_eq!(conv.property("flip-method"), Some("2"));
        assert_eq!(
            desc.stage(StageKind::Caps).unwrap().element,
            "video/x-raw,format=(string)NV12,width=(int)1280,height=(int)720"
        );
    }

    #[test]
    fn software_resample_chain() {
        let opts = options("rtp://@:5000", Codec::H264)
            .with_size(640, 480)
            .with_flip(FlipMethod::Horizontal);
        let desc = PipelineDescription::build(&opts, &nothing_installed).unwrap();
        let converters: Vec<_> = desc
            .stages()
            .iter()
            .filter(|stage| stage.kind == StageKind::Converter)
            .map(|stage| stage.to_string())
            .collect();
        assert_eq!(
            converters,
            ["videoflip method=horizontal-flip", "videoscale", "videoconvert"]
        );
    }

    #[test]
    fn rejects_bad_configurations() {
        let mov = temp_video("clip.mov");
        assert_eq!(
            PipelineDescription::build(
                &options(&mov.to_string_lossy(), Codec::H264),
                &nothing_installed
            ),
            Err(ConfigError::UnsupportedExtension("mov".into()))
        );
        fs::remove_file(mov).ok();

        let raw = temp_video("clip.h265");
        assert!(matches!(
            PipelineDescription::build(&options(&raw.to_string_lossy(), Codec::H264), &nothing_installed),
            Err(ConfigError::ExtensionCodecMismatch { .. })
        ));
        fs::remove_file(raw).ok();

        assert!(matches!(
            PipelineDescription::build(&options("/no/such/clip.mp4", Codec::H264), &nothing_installed),
            Err(ConfigError::MissingFile(_))
        ));
        assert!(matches!(
            PipelineDescription::build(&options("rtp://@", Codec::H264), &nothing_installed),
            Err(ConfigError::InvalidPort(_))
        ));
        assert!(matches!(
            PipelineDescription::build(&options("rtsp://cam/live", Codec::Mpeg4), &nothing_installed),
            Err(ConfigError::CodecNotAvailable { .. })
        ));
    }

    #[test]
    fn quotes_paths_with_spaces() {
        let path = temp_video("my clip.mkv");
        let desc = PipelineDescription::build(
            &options(&path.to_string_lossy(), Codec::Vp9),
            &nothing_installed,
        )
        .unwrap();
        let location = desc.stage(StageKind::Source).unwrap().property("location").unwrap();
        assert!(location.starts_with('"') && location.ends_with('"'));
        assert_eq!(desc.stage(StageKind::Demuxer).unwrap().element, "matroskademux");
        fs::remove_file(path).ok();
    }
}
