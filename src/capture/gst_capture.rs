//! GStreamer decode backend with hardware decoder detection

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, error, info, trace, warn};

use super::backend::{DecodeBackend, StatusLatch};
use super::frame::{PlaneLayout, SampleCaps};
use super::ingest::{FrameIngest, IngestEvents, SamplePayload};
use crate::error::{BackendError, IngestError};
use crate::pipeline::{BufferDomain, PipelineDescription};

/// Process-wide GStreamer initialization.
///
/// Holding one proves `gst::init` succeeded; every backend is launched
/// through it.
#[derive(Debug, Clone)]
pub struct GstRuntime {
    _private: (),
}

impl GstRuntime {
    pub fn init() -> Result<Self, BackendError> {
        gst::init()
            .map_err(|e| BackendError::Launch(format!("failed to initialize GStreamer: {}", e)))?;
        info!("initialized {}", gst::version_string());
        Ok(Self { _private: () })
    }

    /// Whether the registry provides an element factory named `name`.
    pub fn element_available(&self, name: &str) -> bool {
        match gst::ElementFactory::find(name) {
            Some(factory) => {
                debug!(
                    "found element: {} - {}",
                    name,
                    factory.metadata("long-name").unwrap_or("")
                );
                true
            }
            None => false,
        }
    }
}

/// Launched GStreamer pipeline feeding a [`FrameIngest`] from its appsink.
pub struct GstBackend {
    pipeline: gst::Pipeline,
    bus: gst::Bus,
    /// Errors the appsink callbacks popped off the bus
    latch: StatusLatch,
}

impl GstBackend {
    pub fn launch(
        _runtime: &GstRuntime,
        description: &PipelineDescription,
        mut ingest: FrameIngest,
    ) -> Result<Self, BackendError> {
        let launch = description.to_launch_string();
        let pipeline = gst::parse::launch(&launch)
            .map_err(|e| BackendError::Launch(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| BackendError::Launch("launch string did not produce a pipeline".into()))?;

        let bus = pipeline
            .bus()
            .ok_or_else(|| BackendError::Launch("pipeline has no bus".into()))?;

        let appsink = pipeline
            .by_name(description.sink_name())
            .ok_or_else(|| {
                BackendError::Launch(format!("no element named '{}'", description.sink_name()))
            })?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| {
                BackendError::Launch(format!("'{}' is not an appsink", description.sink_name()))
            })?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 3u32);
        appsink.set_property("drop", true);

        let events = ingest.events();
        let preroll_events = events.clone();
        let eos_events = events.clone();
        let sample_bus = bus.clone();
        let preroll_bus = bus.clone();
        let latch = StatusLatch::new();
        let sample_latch = latch.clone();
        let preroll_latch = latch.clone();

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    ingest_sample(&mut ingest, &events, &sample);
                    if let Some(err) = drain_bus(&sample_bus) {
                        sample_latch.record(err);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .new_preroll(move |sink| {
                    // pulled only so the sample is released
                    let _preroll = sink.pull_preroll().map_err(|_| gst::FlowError::Error)?;
                    preroll_events.preroll();
                    if let Some(err) = drain_bus(&preroll_bus) {
                        preroll_latch.record(err);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .eos(move |_| eos_events.end_of_stream())
                .build(),
        );

        Ok(Self {
            pipeline,
            bus,
            latch,
        })
    }

    fn set_state(&self, state: gst::State, target: &'static str) -> Result<(), BackendError> {
        match self.pipeline.set_state(state) {
            Ok(success) => {
                debug!("pipeline -> {} ({:?})", target, success);
                Ok(())
            }
            Err(err) => Err(BackendError::StateChange {
                target,
                reason: err.to_string(),
            }),
        }
    }
}

impl DecodeBackend for GstBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        info!("starting GStreamer pipeline");
        // Success, Async and NoPreroll (live sources) are all fine here;
        // real failures show up on the bus
        self.set_state(gst::State::Playing, "PLAYING")
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        info!("stopping GStreamer pipeline");
        self.set_state(gst::State::Null, "NULL")
    }

    fn poll_status(&mut self) -> Result<(), BackendError> {
        // errors recorded by the streaming thread were popped first
        let pending = drain_bus(&self.bus);
        match self.latch.take().or(pending) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for GstBackend {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("failed to stop pipeline on drop: {}", err);
        }
    }
}

fn sample_caps(sample: &gst::Sample) -> Option<SampleCaps> {
    let caps = sample.caps()?;
    if let Ok(info) = gst_video::VideoInfo::from_caps(caps) {
        return Some(SampleCaps {
            format: Some(info.format().to_str().to_string()),
            width: Some(info.width() as i32),
            height: Some(info.height() as i32),
            layout: plane_layout(&info),
        });
    }

    // incomplete caps: take whatever fields are there
    let structure = caps.structure(0)?;
    Some(SampleCaps {
        format: structure.get::<&str>("format").ok().map(str::to_string),
        width: structure.get::<i32>("width").ok(),
        height: structure.get::<i32>("height").ok(),
        layout: None,
    })
}

/// Strides and offsets of the first two planes, when the caps describe them.
fn plane_layout(info: &gst_video::VideoInfo) -> Option<PlaneLayout> {
    if info.n_planes() < 2 {
        return None;
    }
    let (strides, offsets) = (info.stride(), info.offset());
    let layout = PlaneLayout {
        strides: [
            usize::try_from(strides[0]).ok()?,
            usize::try_from(strides[1]).ok()?,
        ],
        offsets: [offsets[0], offsets[1]],
    };
    if !layout.is_packed(info.width(), info.height()) {
        trace!("padded layout {:?} for {}x{}", layout, info.width(), info.height());
    }
    Some(layout)
}

fn ingest_sample(ingest: &mut FrameIngest, events: &IngestEvents, sample: &gst::Sample) {
    let caps = sample_caps(sample);

    // push errors are logged and counted by the ingest handle
    match ingest.domain() {
        BufferDomain::Shared => match sample.buffer_owned() {
            Some(buffer) => match buffer.into_mapped_buffer_readable() {
                Ok(mapped) => {
                    let _ = ingest.push_sample(caps.as_ref(), SamplePayload::Shared(Bytes::from_owner(mapped)));
                }
                Err(_) => events.reject(&IngestError::MapFailed),
            },
            None => events.reject(&IngestError::MissingBuffer),
        },
        BufferDomain::Host => match sample.buffer() {
            Some(buffer) => match buffer.map_readable() {
                Ok(map) => {
                    let _ = ingest.push_sample(caps.as_ref(), SamplePayload::Borrowed(map.as_slice()));
                }
                Err(_) => events.reject(&IngestError::MapFailed),
            },
            None => events.reject(&IngestError::MissingBuffer),
        },
    }
}

/// Pop and log every pending bus message. Returns the first error.
fn drain_bus(bus: &gst::Bus) -> Option<BackendError> {
    let mut first = None;
    while let Some(msg) = bus.pop() {
        if let Some(err) = log_message(&msg) {
            first.get_or_insert(err);
        }
    }
    first
}

fn log_message(msg: &gst::Message) -> Option<BackendError> {
    use gst::MessageView;

    let source = msg
        .src()
        .map(|src| src.path_string().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    match msg.view() {
        MessageView::Error(err) => {
            let debug = err.debug().map(|d| d.to_string());
            error!("error from {}: {} ({:?})", source, err.error(), debug);
            return Some(BackendError::Bus {
                source_path: source,
                message: err.error().to_string(),
                debug,
            });
        }
        MessageView::Warning(w) => warn!("warning from {}: {}", source, w.error()),
        MessageView::Info(i) => info!("info from {}: {}", source, i.error()),
        MessageView::Eos(_) => info!("end of stream from {}", source),
        MessageView::StateChanged(s) => debug!(
            "{} state changed: {:?} -> {:?} (pending {:?})",
            source,
            s.old(),
            s.current(),
            s.pending()
        ),
        MessageView::StreamStart(_) => debug!("stream started: {}", source),
        MessageView::AsyncDone(_) => debug!("async done: {}", source),
        _ => trace!("{:?} message from {}", msg.type_(), source),
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::capture::ingest::StreamShared;
    use crate::options::{Codec, DecoderOptions};
    use crate::pipeline::RingBuffer;
    use crate::uri::Uri;

    #[test]
    fn drop_returns_pipeline_to_null() {
        let Ok(runtime) = GstRuntime::init() else {
            eprintln!("GStreamer unavailable, skipping");
            return;
        };
        let options = DecoderOptions::new(Uri::parse("rtp://@:5990").unwrap(), Codec::H264)
            .with_settle(Duration::ZERO, Duration::ZERO);
        let description =
            PipelineDescription::build(&options, &|name| runtime.element_available(name)).unwrap();

        let shared = Arc::new(StreamShared::default());
        let (writer, _reader) = RingBuffer::new(options.num_buffers);
        let ingest = FrameIngest::new(writer, shared, options.num_buffers, BufferDomain::Host);
        let Ok(mut backend) = GstBackend::launch(&runtime, &description, ingest) else {
            eprintln!("RTP/H.264 elements unavailable, skipping");
            return;
        };

        let pipeline = backend.pipeline.clone();
        if let Err(err) = backend.start() {
            eprintln!("pipeline did not start: {err}");
        }
        drop(backend);
        assert_eq!(pipeline.current_state(), gst::State::Null);
    }
}
