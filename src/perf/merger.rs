//! Timestamp-ordered merge over many per-CPU rings.
//!
//! Each ring contributes its oldest unread record to an indexed min-heap.
//! Sample records are keyed by the timestamp at the start of their data;
//! anything else (lost-record notices, short samples) is keyed 0 so it
//! surfaces ahead of the sample backlog. Within a ring order stays FIFO.

use thiserror::Error;

use super::heap::RingHeap;
use super::ring::{PerfRing, RingError, PERF_RECORD_SAMPLE, SAMPLE_SIZE_PREFIX};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergerError {
    #[error("merger has no rings")]
    NoRings,

    #[error("merger read batch is already open")]
    AlreadyActive,

    #[error("merger read batch is not open")]
    NotActive,

    #[error("no records available")]
    BufferEmpty,

    #[error(transparent)]
    Ring(#[from] RingError),
}

/// Sort key of the record at the ring's read cursor, or `None` when the
/// ring has nothing unread.
pub fn record_timestamp(ring: &PerfRing) -> Option<u64> {
    if ring.is_empty() {
        return None;
    }
    if ring.peek_type() != PERF_RECORD_SAMPLE {
        return Some(0);
    }
    let mut raw = [0u8; 8];
    match ring.peek_copy(&mut raw, SAMPLE_SIZE_PREFIX) {
        Ok(()) => Some(u64::from_le_bytes(raw)),
        Err(_) => Some(0),
    }
}

/// Borrows a set of rings for the duration of a merge session.
pub struct Merger<'a> {
    rings: Vec<&'a mut PerfRing>,
    heap: RingHeap,
    active: bool,
}

impl<'a> Default for Merger<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Merger<'a> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(rings: usize) -> Self {
        Self {
            rings: Vec::with_capacity(rings),
            heap: RingHeap::with_capacity(rings),
            active: false,
        }
    }

    /// Register a ring. Its index is the registration order.
    pub fn add_ring(&mut self, ring: &'a mut PerfRing) -> Result<(), MergerError> {
        if self.active {
            return Err(MergerError::AlreadyActive);
        }
        self.rings.push(ring);
        Ok(())
    }

    pub fn ring_count(&self) -> usize {
        self.rings.len()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Open a read batch on every ring and seed the heap.
    pub fn start(&mut self) -> Result<(), MergerError> {
        if self.rings.is_empty() {
            return Err(MergerError::NoRings);
        }
        if self.active {
            return Err(MergerError::AlreadyActive);
        }

        for (index, ring) in self.rings.iter_mut().enumerate() {
            ring.start_read_batch();
            if self.heap.contains(index) {
                continue;
            }
            if let Some(timestamp) = record_timestamp(&**ring) {
                self.heap.set(index, timestamp);
            }
        }

        self.active = true;
        Ok(())
    }

    /// True when no ring has an unread record in the current batch.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn peek_timestamp(&self) -> Result<u64, MergerError> {
        self.head().map(|(timestamp, _)| timestamp)
    }

    /// The ring holding the oldest record and its index.
    pub fn current_ring(&self) -> Result<(&PerfRing, usize), MergerError> {
        let (_, index) = self.head()?;
        Ok((&*self.rings[index], index))
    }

    /// Consume the oldest record and re-key its ring.
    pub fn pop(&mut self) -> Result<(), MergerError> {
        let (_, index) = self.head()?;
        let ring = &mut *self.rings[index];
        ring.pop()?;

        match record_timestamp(ring) {
            Some(timestamp) => self.heap.set(index, timestamp),
            None => {
                self.heap.remove(index);
            }
        }
        Ok(())
    }

    /// Release consumed space on every ring and close the batch.
    pub fn finish(&mut self) {
        for ring in self.rings.iter_mut() {
            ring.finish_read_batch();
        }
        self.active = false;
    }

    fn head(&self) -> Result<(u64, usize), MergerError> {
        if !self.active {
            return Err(MergerError::NotActive);
        }
        self.heap
            .peek()
            .map(|entry| (entry.timestamp, entry.ring_index))
            .ok_or(MergerError::BufferEmpty)
    }
}
