//! Frame buffering between the decode backend and the capture handler

pub mod description;
pub mod pool;
pub mod ringbuf;

pub use description::{PipelineDescription, Stage, StageKind};
pub use pool::OutputPool;
pub use ringbuf::{RawFrame, RingBuffer, RingReader, RingStats, RingWriter};

/// Where slot memory lives and who owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferDomain {
    /// Slots are allocated and owned by the pool; frames are copied in.
    Host,
    /// Slots may reference memory still owned by the backend (no copy).
    /// The backend's buffer stays alive until the consumer releases the slot.
    Shared,
}
