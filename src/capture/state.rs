use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a decoder stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamState {
    Closed = 0,
    Streaming = 1,
    /// Terminal: the backend delivered its last frame
    EndOfStream = 2,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamState::Streaming,
            2 => StreamState::EndOfStream,
            _ => StreamState::Closed,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Closed => "closed",
            StreamState::Streaming => "streaming",
            StreamState::EndOfStream => "end-of-stream",
        };
        f.write_str(name)
    }
}

/// Atomic cell shared by the consumer and the backend's end-of-stream callback.
///
/// Every transition is a compare-exchange, so end-of-stream can never be
/// overwritten by a racing open or close.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(StreamState::Closed as u8))
    }

    pub fn load(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Closed -> Streaming. Returns the state actually in effect.
    pub fn open(&self) -> StreamState {
        self.transition(StreamState::Closed, StreamState::Streaming)
    }

    /// Streaming -> Closed. Returns the state actually in effect.
    pub fn close(&self) -> StreamState {
        self.transition(StreamState::Streaming, StreamState::Closed)
    }

    /// Any -> EndOfStream. Returns the previous state.
    pub fn end_of_stream(&self) -> StreamState {
        StreamState::from_u8(self.0.swap(StreamState::EndOfStream as u8, Ordering::AcqRel))
    }

    fn transition(&self, from: StreamState, to: StreamState) -> StreamState {
        match self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => to,
            Err(current) => StreamState::from_u8(current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_cycle() {
        let state = StateCell::new();
        assert_eq!(state.load(), StreamState::Closed);
        assert_eq!(state.open(), StreamState::Streaming);
        assert_eq!(state.open(), StreamState::Streaming);
        assert_eq!(state.close(), StreamState::Closed);
        assert_eq!(state.close(), StreamState::Closed);
    }

    #[test]
    fn end_of_stream_is_terminal() {
        let state = StateCell::new();
        state.open();
        assert_eq!(state.end_of_stream(), StreamState::Streaming);
        assert_eq!(state.close(), StreamState::EndOfStream);
        assert_eq!(state.open(), StreamState::EndOfStream);
        assert_eq!(state.load(), StreamState::EndOfStream);
    }
}
