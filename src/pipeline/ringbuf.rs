//! Lock-free latest-wins ring for decoded frames
//!
//! One producer (the backend's decode thread) fills slots and publishes them,
//! one consumer (the capture handler) takes the newest publication. Slots move
//! by ownership: the published frame sits behind an atomic pointer, the
//! consumer swaps it out, and spent slots travel back to the producer over an
//! SPSC ring. Neither side ever waits on the other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, trace};

use super::pool::{alloc_slot, alloc_slots};
use super::BufferDomain;
use crate::capture::frame::PixelFormat;
use crate::error::AllocationError;

/// Fewest slots that keep the producer from ever running dry: one being
/// written, one published, one held by the consumer.
pub const MIN_SLOTS: usize = 3;

/// Geometry of a published frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

#[derive(Debug, Clone)]
enum SlotData {
    /// Pool-owned memory, recycled back to the producer
    Pooled(Vec<u8>),
    /// Backend-owned memory referenced without a copy
    Shared(Bytes),
}

/// A published frame as seen by the consumer.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub info: FrameInfo,
    pub sequence: u64,
    generation: u64,
    data: SlotData,
}

impl RawFrame {
    pub fn data(&self) -> &[u8] {
        match &self.data {
            SlotData::Pooled(buf) => buf,
            SlotData::Shared(bytes) => bytes,
        }
    }

    pub fn is_zero_copy(&self) -> bool {
        matches!(self.data, SlotData::Shared(_))
    }
}

struct Recycled {
    generation: u64,
    buf: Vec<u8>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_overwritten: AtomicU64,
}

/// Counters describing ring traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub written: u64,
    pub read: u64,
    /// Published frames replaced before the consumer got to them
    pub overwritten: u64,
}

struct Shared {
    latest: ArcSwapOption<RawFrame>,
    stats: CachePadded<Stats>,
}

/// Constructor for the producer/consumer halves.
pub struct RingBuffer;

impl RingBuffer {
    /// Split a new ring into its halves. `capacity` bounds how many spent
    /// slots can be in flight back to the producer at once.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> (RingWriter, RingReader) {
        let shared = Arc::new(Shared {
            latest: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        });
        let (recycle, returned) = HeapRb::<Recycled>::new(capacity.max(MIN_SLOTS) * 2).split();

        let writer = RingWriter {
            shared: Arc::clone(&shared),
            returned,
            spare: Vec::new(),
            pending: None,
            count: 0,
            slot_size: 0,
            domain: BufferDomain::Host,
            allocated: 0,
            generation: 0,
            sequence: 0,
        };
        let reader = RingReader {
            shared,
            recycle,
            current: None,
        };
        (writer, reader)
    }
}

/// Producer half, owned by the ingestion callback.
pub struct RingWriter {
    shared: Arc<Shared>,
    returned: HeapCons<Recycled>,
    spare: Vec<Vec<u8>>,
    pending: Option<Vec<u8>>,
    count: usize,
    slot_size: usize,
    domain: BufferDomain,
    /// Slots created for the current generation
    allocated: usize,
    generation: u64,
    sequence: u64,
}

impl RingWriter {
    /// (Re)allocate the pool when `count`, `slot_size` or `domain` changed.
    ///
    /// Host pools are filled up front; shared pools only allocate when a
    /// frame has to be copied after all. Slots handed out under the previous
    /// allocation are dropped when they come back.
    pub fn allocate(
        &mut self,
        count: usize,
        slot_size: usize,
        domain: BufferDomain,
    ) -> Result<bool, AllocationError> {
        let count = count.max(MIN_SLOTS);
        if count == self.count && slot_size == self.slot_size && domain == self.domain {
            return Ok(false);
        }

        self.generation += 1;
        self.spare.clear();
        self.pending = None;
        self.allocated = 0;
        self.count = 0;
        self.slot_size = 0;

        if domain == BufferDomain::Host {
            self.spare = alloc_slots(count, slot_size)?;
            self.allocated = count;
        }

        self.count = count;
        self.slot_size = slot_size;
        self.domain = domain;
        debug!(
            "allocated ring of {} buffers ({} bytes each, {:?})",
            count, slot_size, domain
        );
        Ok(true)
    }

    /// Slot the producer should fill next. Never blocks; `None` only when
    /// the pool is unallocated or memory ran out.
    pub fn next_for_write(&mut self) -> Option<&mut [u8]> {
        if self.pending.is_none() {
            self.reclaim();
            let slot = match self.spare.pop() {
                Some(slot) => slot,
                None if self.allocated < self.count => {
                    let slot = alloc_slot(self.slot_size)?;
                    self.allocated += 1;
                    slot
                }
                None => return None,
            };
            self.pending = Some(slot);
        }
        self.pending.as_deref_mut()
    }

    /// Publish the slot last returned by [`next_for_write`](Self::next_for_write).
    pub fn publish_write(&mut self, info: FrameInfo) -> bool {
        let Some(buf) = self.pending.take() else {
            return false;
        };
        self.publish(info, SlotData::Pooled(buf));
        true
    }

    /// Publish backend-owned memory without copying.
    pub fn publish_shared(&mut self, info: FrameInfo, bytes: Bytes) {
        self.publish(info, SlotData::Shared(bytes));
    }

    fn publish(&mut self, info: FrameInfo, data: SlotData) {
        self.sequence += 1;
        let frame = RawFrame {
            info,
            sequence: self.sequence,
            generation: self.generation,
            data,
        };

        let stats = &self.shared.stats;
        stats.frames_written.fetch_add(1, Ordering::Relaxed);

        if let Some(displaced) = self.shared.latest.swap(Some(Arc::new(frame))) {
            stats.frames_overwritten.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("streamcap_frames_overwritten").increment(1);
            match Arc::try_unwrap(displaced) {
                Ok(displaced) => self.keep(displaced.generation, displaced.data),
                // a reader guard still holds it; let next_for_write replace the slot
                Err(displaced) => {
                    if displaced.generation == self.generation
                        && matches!(displaced.data, SlotData::Pooled(_))
                    {
                        self.allocated = self.allocated.saturating_sub(1);
                    }
                }
            }
        }
    }

    fn reclaim(&mut self) {
        while let Some(recycled) = self.returned.try_pop() {
            self.keep(recycled.generation, SlotData::Pooled(recycled.buf));
        }
    }

    fn keep(&mut self, generation: u64, data: SlotData) {
        match data {
            SlotData::Pooled(buf) if generation == self.generation => self.spare.push(buf),
            SlotData::Pooled(_) => trace!("dropping buffer from generation {}", generation),
            SlotData::Shared(_) => {}
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn domain(&self) -> BufferDomain {
        self.domain
    }
}

/// Consumer half, owned by the capture handler.
pub struct RingReader {
    shared: Arc<Shared>,
    recycle: HeapProd<Recycled>,
    current: Option<RawFrame>,
}

impl RingReader {
    /// Take the newest publication, at most once.
    ///
    /// The previously returned frame goes back to the producer, so the
    /// reference is valid until the next call.
    pub fn read_latest_once(&mut self) -> Option<&RawFrame> {
        let latest = self.shared.latest.swap(None)?;
        self.shared.stats.frames_read.fetch_add(1, Ordering::Relaxed);

        let frame = Arc::try_unwrap(latest).unwrap_or_else(|shared| (*shared).clone());
        if let Some(previous) = self.current.replace(frame) {
            if let SlotData::Pooled(buf) = previous.data {
                // a full return ring only means the producer is gone or lagging
                let _ = self.recycle.try_push(Recycled {
                    generation: previous.generation,
                    buf,
                });
            }
        }
        self.current.as_ref()
    }

    /// Whether a publication is waiting to be read.
    pub fn has_pending(&self) -> bool {
        self.shared.latest.load().is_some()
    }

    pub fn stats(&self) -> RingStats {
        let stats = &self.shared.stats;
        RingStats {
            written: stats.frames_written.load(Ordering::Relaxed),
            read: stats.frames_read.load(Ordering::Relaxed),
            overwritten: stats.frames_overwritten.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const INFO: FrameInfo = FrameInfo {
        width: 2,
        height: 2,
        format: PixelFormat::Nv12,
    };

    fn write(writer: &mut RingWriter, value: u8) {
        writer.next_for_write().unwrap().fill(value);
        assert!(writer.publish_write(INFO));
    }

    #[test]
    fn latest_wins_after_many_publications() {
        let (mut writer, mut reader) = RingBuffer::new(4);
        writer.allocate(4, 6, BufferDomain::Host).unwrap();

        for value in 1..=10 {
            write(&mut writer, value);
        }

        let frame = reader.read_latest_once().unwrap();
        assert_eq!(frame.data(), &[10; 6]);
        assert_eq!(frame.sequence, 10);
        assert_eq!(reader.stats().overwritten, 9);
    }

    #[test]
    fn second_read_without_publication_is_empty() {
        let (mut writer, mut reader) = RingBuffer::new(4);
        writer.allocate(4, 6, BufferDomain::Host).unwrap();

        write(&mut writer, 7);
        assert!(reader.read_latest_once().is_some());
        assert!(reader.read_latest_once().is_none());

        write(&mut writer, 8);
        assert_eq!(reader.read_latest_once().unwrap().data(), &[8; 6]);
    }

    #[test]
    fn unpublished_slot_is_invisible() {
        let (mut writer, mut reader) = RingBuffer::new(4);
        writer.allocate(4, 6, BufferDomain::Host).unwrap();

        writer.next_for_write().unwrap().fill(3);
        assert!(!reader.has_pending());
        assert!(reader.read_latest_once().is_none());
    }

    #[test]
    fn allocate_is_noop_for_same_geometry() {
        let (mut writer, _reader) = RingBuffer::new(4);
        assert!(writer.allocate(4, 6, BufferDomain::Host).unwrap());
        assert!(!writer.allocate(4, 6, BufferDomain::Host).unwrap());
        assert!(writer.allocate(4, 12, BufferDomain::Host).unwrap());
        assert_eq!(writer.slot_size(), 12);
        // counts below the minimum are raised
        assert!(writer.allocate(1, 12, BufferDomain::Host).unwrap());
        assert_eq!(writer.count(), MIN_SLOTS);
    }

    #[test]
    fn producer_never_runs_dry_while_consumer_holds_a_slot() {
        let (mut writer, mut reader) = RingBuffer::new(MIN_SLOTS);
        writer.allocate(MIN_SLOTS, 6, BufferDomain::Host).unwrap();

        write(&mut writer, 1);
        assert!(reader.read_latest_once().is_some());
        for value in 2..50 {
            write(&mut writer, value);
        }
        assert_eq!(reader.read_latest_once().unwrap().data(), &[49; 6]);
    }

    #[test]
    fn reallocation_drops_stale_slots() {
        let (mut writer, mut reader) = RingBuffer::new(4);
        writer.allocate(4, 6, BufferDomain::Host).unwrap();
        write(&mut writer, 1);
        assert!(reader.read_latest_once().is_some());

        writer.allocate(4, 12, BufferDomain::Host).unwrap();
        writer.next_for_write().unwrap().fill(2);
        writer.publish_write(INFO);

        // the old-generation slot returned here must not be reused
        let frame = reader.read_latest_once().unwrap();
        assert_eq!(frame.data().len(), 12);
        write(&mut writer, 3);
        assert_eq!(reader.read_latest_once().unwrap().data(), &[3; 12]);
    }

    #[test]
    fn shared_slots_are_published_without_copy() {
        let (mut writer, mut reader) = RingBuffer::new(4);
        writer.allocate(4, 6, BufferDomain::Shared).unwrap();

        writer.publish_shared(INFO, Bytes::from_static(&[9; 6]));
        let frame = reader.read_latest_once().unwrap();
        assert!(frame.is_zero_copy());
        assert_eq!(frame.data(), &[9; 6]);

        // copies still work in a shared pool, allocating lazily
        write(&mut writer, 4);
        let frame = reader.read_latest_once().unwrap();
        assert!(!frame.is_zero_copy());
    }

    #[test]
    fn concurrent_reader_sees_whole_frames_in_order() {
        let (mut writer, mut reader) = RingBuffer::new(4);
        writer.allocate(4, 64, BufferDomain::Host).unwrap();

        let producer = thread::spawn(move || {
            for value in 1..=200u8 {
                if let Some(slot) = writer.next_for_write() {
                    slot.fill(value);
                    writer.publish_write(INFO);
                }
            }
            writer
        });

        let mut last = 0u8;
        loop {
            if let Some(frame) = reader.read_latest_once() {
                let first = frame.data()[0];
                assert!(frame.data().iter().all(|b| *b == first), "torn frame");
                assert!(first > last, "frame {first} delivered after {last}");
                last = first;
            }
            if producer.is_finished() && !reader.has_pending() {
                break;
            }
        }
        producer.join().unwrap();
        let stats = reader.stats();
        assert_eq!(stats.written, 200);
        assert_eq!(stats.read + stats.overwritten, 200);
    }
}
