//! Stream lifecycle and the capture request handler

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, trace, warn};

use super::backend::DecodeBackend;
use super::convert;
use super::frame::{CapturedFrame, PixelFormat};
use super::ingest::{FrameIngest, StreamShared};
use super::signal::Timeout;
use super::state::StreamState;
use crate::error::{AllocationError, BackendError, ConversionError, DecodeError};
use crate::options::DecoderOptions;
use crate::pipeline::{OutputPool, PipelineDescription, RingBuffer, RingReader, RingStats};

#[cfg(feature = "gstreamer-pipeline")]
use super::gst_capture::{GstBackend, GstRuntime};

/// Counters describing a decoder's traffic so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub ring: RingStats,
    /// Samples the ingestion path rejected
    pub dropped: u64,
    pub prerolls: u64,
    /// Successful `capture()` calls
    pub captured: u64,
}

/// Video stream decoder.
///
/// Owns the consumer side of the raw frame ring and the output pool. All
/// operations take `&mut self`; share a decoder between threads behind a
/// `Mutex`.
pub struct Decoder {
    options: DecoderOptions,
    description: PipelineDescription,
    backend: Box<dyn DecodeBackend>,
    shared: Arc<StreamShared>,
    reader: RingReader,
    output: OutputPool,
    /// Backend started and not yet stopped
    active: bool,
    captured: u64,
}

impl Decoder {
    /// Create a decoder driven by the GStreamer backend.
    #[cfg(feature = "gstreamer-pipeline")]
    pub fn create(runtime: &GstRuntime, options: DecoderOptions) -> Result<Self, DecodeError> {
        Self::with_backend(
            options,
            &|element| runtime.element_available(element),
            |description, ingest| {
                let backend = GstBackend::launch(runtime, description, ingest)?;
                Ok(Box::new(backend) as Box<dyn DecodeBackend>)
            },
        )
    }

    /// Create a decoder around any backend.
    ///
    /// `available` answers whether the backend provides an element, `launch`
    /// builds the backend from the validated description. Configuration
    /// errors are reported before `launch` runs.
    pub fn with_backend<F>(
        options: DecoderOptions,
        available: &dyn Fn(&str) -> bool,
        launch: F,
    ) -> Result<Self, DecodeError>
    where
        F: FnOnce(&PipelineDescription, FrameIngest) -> Result<Box<dyn DecodeBackend>, DecodeError>,
    {
        let description = PipelineDescription::build(&options, available)?;

        let shared = Arc::new(StreamShared::default());
        let (writer, reader) = RingBuffer::new(options.num_buffers);
        let ingest = FrameIngest::new(
            writer,
            Arc::clone(&shared),
            options.num_buffers,
            options.buffer_domain(),
        );
        let backend = launch(&description, ingest)?;

        Ok(Self {
            options,
            description,
            backend,
            shared,
            reader,
            output: OutputPool::new(),
            active: false,
            captured: 0,
        })
    }

    /// Start streaming.
    ///
    /// No-op while streaming, always fails after end of stream. A backend
    /// that reports an error while starting is stopped again and the decoder
    /// stays closed.
    #[instrument(skip(self), fields(resource = %self.options.resource))]
    pub fn open(&mut self) -> Result<(), DecodeError> {
        match self.shared.state.load() {
            StreamState::EndOfStream => return Err(DecodeError::EndOfStream),
            StreamState::Streaming => return Ok(()),
            StreamState::Closed => {}
        }

        info!("opening stream");
        // wakes left over from a previous session carry no frame
        self.shared.signal.clear();
        self.active = true;

        if let Err(err) = self.start_backend() {
            error!("failed to start stream: {}", err);
            self.stop_backend();
            return Err(DecodeError::BackendStart(err));
        }

        match self.shared.state.open() {
            StreamState::EndOfStream => {
                warn!("stream ended while starting");
                Err(DecodeError::EndOfStream)
            }
            _ => {
                info!("stream opened");
                Ok(())
            }
        }
    }

    fn start_backend(&mut self) -> Result<(), BackendError> {
        self.backend.start()?;
        self.backend.poll_status()?;
        settle(self.options.open_settle);
        self.backend.poll_status()
    }

    /// Stop streaming. Idempotent; end of stream stays terminal but the
    /// backend is still released.
    #[instrument(skip(self), fields(resource = %self.options.resource))]
    pub fn close(&mut self) {
        if !self.active {
            return;
        }
        info!("closing stream");
        self.stop_backend();
        self.shared.state.close();
    }

    fn stop_backend(&mut self) {
        // stop first, then drain: callbacks still in flight only hold
        // shared handles
        if let Err(err) = self.backend.stop() {
            warn!("failed to stop backend: {}", err);
        }
        settle(self.options.close_settle);
        if let Err(err) = self.backend.poll_status() {
            debug!("backend reported while stopping: {}", err);
        }
        self.active = false;
    }

    /// Wait for the newest frame and convert it into `format`.
    ///
    /// Opens the stream first when closed. A zero timeout polls without
    /// blocking. The returned frame borrows the output pool and stays valid
    /// until the next call on this decoder.
    pub fn capture(
        &mut self,
        format: PixelFormat,
        timeout: impl Into<Timeout>,
    ) -> Result<CapturedFrame<'_>, DecodeError> {
        let timeout = timeout.into();
        match self.shared.state.load() {
            StreamState::EndOfStream => return Err(DecodeError::EndOfStream),
            StreamState::Closed => self.open()?,
            StreamState::Streaming => {}
        }

        if !convert::is_supported(PixelFormat::Nv12, format) {
            return Err(ConversionError::UnsupportedFormat {
                src: PixelFormat::Nv12,
                dst: format,
            }
            .into());
        }

        let deadline = timeout.deadline(Instant::now());
        while !self.reader.has_pending() {
            if self.shared.state.load() == StreamState::EndOfStream {
                return Err(DecodeError::EndOfStream);
            }
            if !self.shared.signal.wait_until(deadline) && !self.reader.has_pending() {
                if self.shared.state.load() == StreamState::EndOfStream {
                    return Err(DecodeError::EndOfStream);
                }
                trace!("timed out waiting for a frame ({:?})", timeout);
                return Err(DecodeError::Timeout);
            }
        }

        let Some(raw) = self.reader.read_latest_once() else {
            return Err(DecodeError::Timeout);
        };
        let info = raw.info;
        let size = format.size(info.width, info.height);

        self.output.allocate(self.options.num_buffers, size)?;
        let dst = self.output.next_for_write().ok_or(AllocationError {
            count: self.options.num_buffers,
            slot_size: size,
        })?;

        let started = Instant::now();
        convert::convert(raw.data(), info.format, dst, format, info.width, info.height)?;
        metrics::histogram!("streamcap_convert_time_us")
            .record(started.elapsed().as_micros() as f64);
        metrics::counter!("streamcap_frames_captured").increment(1);
        self.captured += 1;

        trace!(
            "captured frame {} ({}x{} {})",
            raw.sequence,
            info.width,
            info.height,
            format
        );

        Ok(CapturedFrame {
            data: dst,
            width: info.width,
            height: info.height,
            format,
            sequence: raw.sequence,
        })
    }

    pub fn state(&self) -> StreamState {
        self.shared.state.load()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == StreamState::Streaming
    }

    pub fn has_end_of_stream(&self) -> bool {
        self.state() == StreamState::EndOfStream
    }

    /// Frame width: configured, or discovered from the stream once a frame
    /// has arrived.
    pub fn width(&self) -> u32 {
        match self.shared.width.load(Ordering::Relaxed) {
            0 => self.options.width,
            width => width,
        }
    }

    pub fn height(&self) -> u32 {
        match self.shared.height.load(Ordering::Relaxed) {
            0 => self.options.height,
            height => height,
        }
    }

    pub fn options(&self) -> &DecoderOptions {
        &self.options
    }

    pub fn description(&self) -> &PipelineDescription {
        &self.description
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            ring: self.reader.stats(),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            prerolls: self.shared.prerolls.load(Ordering::Relaxed),
            captured: self.captured,
        }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.close();
    }
}

fn settle(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}
