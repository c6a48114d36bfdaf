//! Single-slot wake signal between the ingestion callback and `capture()`

use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::trace;

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until woken
    Infinite,
    /// Block at most this long; zero polls without blocking
    After(Duration),
}

impl Timeout {
    pub const POLL: Timeout = Timeout::After(Duration::ZERO);

    pub fn from_millis(millis: u64) -> Self {
        Timeout::After(Duration::from_millis(millis))
    }

    /// Absolute deadline, `None` when infinite (or too far out to represent).
    pub fn deadline(self, now: Instant) -> Option<Instant> {
        match self {
            Timeout::Infinite => None,
            Timeout::After(duration) => now.checked_add(duration),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::After(duration)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Timeout::Infinite, Timeout::After)
    }
}

/// Pending-wake signal.
///
/// Backed by a one-slot channel: waking with a wake already pending is a
/// no-op, so any number of wakes between two waits deliver exactly once.
#[derive(Clone)]
pub struct WakeSignal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSignal {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self { tx, rx }
    }

    /// Raise the signal. Never blocks.
    pub fn wake(&self) {
        // Full: a wake is already pending
        if let Err(TrySendError::Disconnected(())) = self.tx.try_send(()) {
            trace!("wake signal has no waiter");
        }
    }

    /// Consume a pending wake, blocking up to `timeout` for one.
    pub fn wait(&self, timeout: Timeout) -> bool {
        match timeout {
            Timeout::Infinite => self.rx.recv().is_ok(),
            Timeout::After(duration) if duration.is_zero() => self.poll(),
            Timeout::After(duration) => match self.rx.recv_timeout(duration) {
                Ok(()) => true,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
            },
        }
    }

    /// Block until `deadline` (forever when `None`).
    pub fn wait_until(&self, deadline: Option<Instant>) -> bool {
        match deadline {
            None => self.wait(Timeout::Infinite),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.wait(Timeout::After(remaining))
            }
        }
    }

    fn poll(&self) -> bool {
        match self.rx.try_recv() {
            Ok(()) => true,
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => false,
        }
    }

    /// Drop any pending wake.
    pub fn clear(&self) {
        while self.poll() {}
    }
}
