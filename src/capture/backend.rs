use tracing::debug;

use crate::error::BackendError;

/// Media framework driving a launched pipeline.
///
/// Decoded frames do not flow through this trait: the backend was handed a
/// [`FrameIngest`](super::ingest::FrameIngest) at launch and pushes into it
/// from its own streaming thread.
pub trait DecodeBackend: Send {
    /// Transition the pipeline to playing.
    fn start(&mut self) -> Result<(), BackendError>;

    /// Transition the pipeline to stopped. Must be safe to call repeatedly.
    fn stop(&mut self) -> Result<(), BackendError>;

    /// Drain pending bus messages, logging them. Returns the first error
    /// message found, if any.
    fn poll_status(&mut self) -> Result<(), BackendError>;
}

impl<B: DecodeBackend + ?Sized> DecodeBackend for Box<B> {
    fn start(&mut self) -> Result<(), BackendError> {
        (**self).start()
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        (**self).stop()
    }

    fn poll_status(&mut self) -> Result<(), BackendError> {
        (**self).poll_status()
    }
}

/// Holds the first error a backend's streaming thread ran into until the
/// control thread polls for it.
///
/// Streaming callbacks may pop bus messages before `poll_status` does; they
/// record errors here so none are lost.
#[derive(Clone)]
pub struct StatusLatch {
    tx: flume::Sender<BackendError>,
    rx: flume::Receiver<BackendError>,
}

impl StatusLatch {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self { tx, rx }
    }

    /// Keep `err` unless an earlier one is still waiting.
    pub fn record(&self, err: BackendError) {
        if let Err(flume::TrySendError::Full(err)) = self.tx.try_send(err) {
            debug!("backend error already pending, dropping: {}", err);
        }
    }

    pub fn take(&self) -> Option<BackendError> {
        self.rx.try_recv().ok()
    }
}

impl Default for StatusLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch_error(message: &str) -> BackendError {
        BackendError::Launch(message.to_string())
    }

    #[test]
    fn keeps_the_first_error() {
        let latch = StatusLatch::new();
        let streaming = latch.clone();

        streaming.record(launch_error("first"));
        streaming.record(launch_error("second"));

        assert!(matches!(latch.take(), Some(BackendError::Launch(m)) if m == "first"));
        assert!(latch.take().is_none());
    }

    #[test]
    fn accepts_new_errors_once_taken() {
        let latch = StatusLatch::default();
        latch.record(launch_error("first"));
        latch.take();
        latch.record(launch_error("again"));
        assert!(matches!(latch.take(), Some(BackendError::Launch(m)) if m == "again"));
    }
}
