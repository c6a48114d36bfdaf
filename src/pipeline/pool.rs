//! Slot allocation and the output-side pool

use tracing::debug;

use crate::error::AllocationError;

/// Allocate one zeroed slot without aborting on allocation failure.
pub(crate) fn alloc_slot(slot_size: usize) -> Option<Vec<u8>> {
    let mut slot = Vec::new();
    slot.try_reserve_exact(slot_size).ok()?;
    slot.resize(slot_size, 0);
    Some(slot)
}

pub(crate) fn alloc_slots(count: usize, slot_size: usize) -> Result<Vec<Vec<u8>>, AllocationError> {
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(count)
        .map_err(|_| AllocationError { count, slot_size })?;
    for _ in 0..count {
        slots.push(alloc_slot(slot_size).ok_or(AllocationError { count, slot_size })?);
    }
    Ok(slots)
}

/// Pool receiving converted frames.
///
/// Owned by the capture handler alone, so a plain rotating cursor is enough:
/// every capture writes exactly one slot and the previous `count - 1`
/// results stay untouched.
#[derive(Debug, Default)]
pub struct OutputPool {
    slots: Vec<Vec<u8>>,
    cursor: usize,
    slot_size: usize,
}

impl OutputPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)allocate when `count` or `slot_size` changed. Returns whether it did.
    pub fn allocate(&mut self, count: usize, slot_size: usize) -> Result<bool, AllocationError> {
        let count = count.max(1);
        if count == self.slots.len() && slot_size == self.slot_size {
            return Ok(false);
        }

        // drop the old pool first so peak usage stays at one allocation
        self.slots = Vec::new();
        self.slot_size = 0;
        self.cursor = 0;

        self.slots = alloc_slots(count, slot_size)?;
        self.slot_size = slot_size;
        debug!("allocated {} output buffers ({} bytes each)", count, slot_size);
        Ok(true)
    }

    /// Advance to the next slot and hand it out for writing.
    pub fn next_for_write(&mut self) -> Option<&mut [u8]> {
        if self.slots.is_empty() {
            return None;
        }
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.slots.get_mut(self.cursor).map(Vec::as_mut_slice)
    }

    /// Slot written by the last [`next_for_write`](Self::next_for_write).
    pub fn latest(&self) -> Option<&[u8]> {
        self.slots.get(self.cursor).map(Vec::as_slice)
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_noop_for_same_geometry() {
        let mut pool = OutputPool::new();
        assert!(pool.allocate(3, 16).unwrap());
        assert!(!pool.allocate(3, 16).unwrap());
        assert!(pool.allocate(3, 32).unwrap());
        assert_eq!(pool.slot_size(), 32);
        assert_eq!(pool.count(), 3);
    }

    #[test]
    fn rotates_through_slots() {
        let mut pool = OutputPool::new();
        pool.allocate(2, 4).unwrap();

        pool.next_for_write().unwrap().fill(1);
        pool.next_for_write().unwrap().fill(2);
        assert_eq!(pool.latest().unwrap(), &[2, 2, 2, 2]);

        // wraps around onto the first slot
        let slot = pool.next_for_write().unwrap();
        assert_eq!(slot, &[1, 1, 1, 1]);
    }

    #[test]
    fn unallocated_pool_has_no_slots() {
        let mut pool = OutputPool::new();
        assert!(pool.next_for_write().is_none());
        assert!(pool.latest().is_none());
    }

    #[test]
    fn oversized_request_fails_cleanly() {
        let err = alloc_slots(2, usize::MAX).unwrap_err();
        assert_eq!(err.count, 2);
        assert_eq!(err.slot_size, usize::MAX);
    }
}
