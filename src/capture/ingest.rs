//! Producer-side entry points invoked from the backend's streaming thread

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::frame::{PixelFormat, SampleCaps};
use super::signal::WakeSignal;
use super::state::{StateCell, StreamState};
use crate::error::IngestError;
use crate::pipeline::ringbuf::FrameInfo;
use crate::pipeline::{BufferDomain, RingWriter};

/// State the ingestion side shares with the decoder.
#[derive(Default)]
pub(crate) struct StreamShared {
    pub(crate) state: StateCell,
    pub(crate) signal: WakeSignal,
    pub(crate) width: AtomicU32,
    pub(crate) height: AtomicU32,
    pub(crate) dropped: AtomicU64,
    pub(crate) prerolls: AtomicU64,
}

/// Bytes of a decoded sample.
pub enum SamplePayload<'a> {
    /// Mapped backend memory, valid only for the duration of the callback
    Borrowed(&'a [u8]),
    /// Backend memory the ring may keep a reference to
    Shared(Bytes),
}

impl SamplePayload<'_> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            SamplePayload::Borrowed(data) => data,
            SamplePayload::Shared(bytes) => bytes,
        }
    }
}

/// Ingestion handle handed to the backend at launch.
///
/// Owns the producer half of the raw frame ring, so only one thread can
/// publish frames. Pre-roll and end-of-stream notifications go through the
/// cloneable [`IngestEvents`].
pub struct FrameIngest {
    writer: RingWriter,
    events: IngestEvents,
    num_buffers: usize,
    domain: BufferDomain,
}

impl FrameIngest {
    pub(crate) fn new(
        writer: RingWriter,
        shared: Arc<StreamShared>,
        num_buffers: usize,
        domain: BufferDomain,
    ) -> Self {
        Self {
            writer,
            events: IngestEvents { shared },
            num_buffers,
            domain,
        }
    }

    pub fn events(&self) -> IngestEvents {
        self.events.clone()
    }

    /// Memory domain frames should arrive in; backends use it to decide
    /// between mapping a copy and handing over a shared reference.
    pub fn domain(&self) -> BufferDomain {
        self.domain
    }

    /// Publish a decoded sample.
    ///
    /// Malformed samples are logged and dropped; the error is returned only so
    /// the backend can account for it.
    pub fn push_sample(
        &mut self,
        caps: Option<&SampleCaps>,
        payload: SamplePayload<'_>,
    ) -> Result<(), IngestError> {
        match self.try_push(caps, payload) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.events.reject(&err);
                Err(err)
            }
        }
    }

    fn try_push(
        &mut self,
        caps: Option<&SampleCaps>,
        payload: SamplePayload<'_>,
    ) -> Result<(), IngestError> {
        let caps = caps.ok_or(IngestError::MissingCaps)?;
        let (width, height) = match (caps.width, caps.height) {
            (Some(width), Some(height)) => (width, height),
            _ => return Err(IngestError::MissingDimensions),
        };
        if width < 1 || height < 1 {
            return Err(IngestError::NonPositiveDimensions { width, height });
        }
        let (width, height) = (width as u32, height as u32);

        if let Some(name) = caps.format.as_deref() {
            if PixelFormat::from_gst_name(name) != Some(PixelFormat::Nv12) {
                return Err(IngestError::UnexpectedFormat(name.to_string()));
            }
        }

        let size = payload.as_slice().len();
        let expected = PixelFormat::Nv12.size(width, height);
        let padded = caps.layout.filter(|layout| !layout.is_packed(width, height));
        let required = padded.map_or(expected, |layout| layout.required_len(width, height));
        if size < required {
            return Err(IngestError::Truncated {
                expected: required,
                actual: size,
            });
        }

        trace!("received {}x{} frame ({} bytes)", width, height, size);

        let shared = &self.events.shared;
        shared.width.store(width, Ordering::Relaxed);
        shared.height.store(height, Ordering::Relaxed);

        // repacked frames land tightly packed in a ring slot
        let slot_size = if padded.is_some() { expected } else { size };
        self.writer.allocate(self.num_buffers, slot_size, self.domain)?;

        let info = FrameInfo {
            width,
            height,
            format: PixelFormat::Nv12,
        };
        match (padded, self.domain, payload) {
            (Some(layout), _, payload) => {
                let slot = self
                    .writer
                    .next_for_write()
                    .ok_or(IngestError::NoWritableSlot)?;
                layout.pack(payload.as_slice(), slot, width, height);
                self.writer.publish_write(info);
            }
            (None, BufferDomain::Shared, SamplePayload::Shared(bytes)) => {
                self.writer.publish_shared(info, bytes);
            }
            (None, _, payload) => {
                let slot = self
                    .writer
                    .next_for_write()
                    .ok_or(IngestError::NoWritableSlot)?;
                slot.copy_from_slice(payload.as_slice());
                self.writer.publish_write(info);
            }
        }

        metrics::counter!("streamcap_frames_ingested").increment(1);
        shared.signal.wake();
        Ok(())
    }

    /// Acknowledge a pre-roll sample the backend already pulled and released.
    pub fn discard_preroll(&self) {
        self.events.preroll();
    }
}

/// Cloneable handle for the backend's non-frame notifications.
#[derive(Clone)]
pub struct IngestEvents {
    shared: Arc<StreamShared>,
}

impl IngestEvents {
    /// A pre-roll sample was pulled and released without being forwarded.
    pub fn preroll(&self) {
        debug!("discarded preroll sample");
        self.shared.prerolls.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("streamcap_prerolls_discarded").increment(1);
    }

    /// The backend delivered its last frame.
    ///
    /// Only flips the state and wakes a blocked `capture()`; everything the
    /// consumer may still reference stays alive.
    pub fn end_of_stream(&self) {
        warn!("end of stream (EOS)");
        if self.shared.state.end_of_stream() != StreamState::EndOfStream {
            self.shared.signal.wake();
        }
    }

    pub fn reject(&self, err: &IngestError) {
        match err {
            IngestError::NonPositiveDimensions { .. } => debug!("dropping frame: {}", err),
            _ => warn!("dropping frame: {}", err),
        }
        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("streamcap_frames_dropped").increment(1);
    }

    pub fn state(&self) -> StreamState {
        self.shared.state.load()
    }
}
