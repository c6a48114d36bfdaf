pub mod backend;
pub mod convert;
pub mod engine;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod ingest;
pub mod signal;
pub mod state;

pub use backend::{DecodeBackend, StatusLatch};
pub use engine::{Decoder, DecoderStats};
pub use frame::{CapturedFrame, PixelFormat, PlaneLayout, SampleCaps};
#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::{GstBackend, GstRuntime};
pub use ingest::{FrameIngest, IngestEvents, SamplePayload};
pub use signal::{Timeout, WakeSignal};
pub use state::{StateCell, StreamState};
