//! One side of a kernel perf ring buffer.
//!
//! The region starts with `struct perf_event_mmap_page`; only the two shared
//! indices at offsets 1024 and 1032 are written concurrently. The producer
//! publishes `data_head`, the consumer publishes `data_tail`, and each side
//! keeps a private copy of both cursors between batch boundaries.
//!
//! A consumer brackets its reads with [`PerfRing::start_read_batch`] and
//! [`PerfRing::finish_read_batch`]; records written after the start of a
//! batch are not visible until the next one. Producers use the matching
//! write-batch pair.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use super::storage::RingStorage;

pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_SAMPLE: u32 = 9;

// Byte offsets into `struct perf_event_mmap_page`.
pub const META_VERSION: usize = 0;
pub const META_COMPAT_VERSION: usize = 4;
pub const META_DATA_HEAD: usize = 1024;
pub const META_DATA_TAIL: usize = 1032;
pub const META_DATA_OFFSET: usize = 1040;
pub const META_DATA_SIZE: usize = 1048;
pub const META_AUX_OFFSET: usize = 1056;
pub const META_AUX_SIZE: usize = 1064;
/// Bytes of the metadata page this module reads.
pub const META_LEN: usize = 1072;

pub const RECORD_HEADER_SIZE: usize = 8;
/// Length word the kernel places in front of raw sample data.
pub const SAMPLE_SIZE_PREFIX: usize = 4;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("ring storage is empty")]
    NilBuffer,

    #[error("data region must be a power of two of at least 8 bytes")]
    InvalidBufferLength,

    #[error("ring storage is not 8-byte aligned")]
    MisalignedBuffer,

    #[error("storage of {len} bytes cannot hold metadata and data ending at byte {needed}")]
    RegionTooSmall { len: usize, needed: u64 },

    #[error("no space left in ring")]
    NoSpace,

    #[error("ring is empty")]
    BufferEmpty,

    #[error("record of {size} bytes can never fit in the ring")]
    CannotFit { size: usize },

    #[error("cannot write an empty payload")]
    EmptyWrite,

    #[error("read of {requested} bytes exceeds record payload of {available} bytes")]
    SizeExceeded { requested: usize, available: usize },
}

/// The 8-byte header in front of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: u32,
    pub misc: u16,
    /// Total record length including this header.
    pub size: u16,
}

impl RecordHeader {
    pub fn from_bytes(raw: [u8; RECORD_HEADER_SIZE]) -> Self {
        Self {
            record_type: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            misc: u16::from_le_bytes([raw[4], raw[5]]),
            size: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; RECORD_HEADER_SIZE] {
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.record_type.to_le_bytes());
        raw[4..6].copy_from_slice(&self.misc.to_le_bytes());
        raw[6..8].copy_from_slice(&self.size.to_le_bytes());
        raw
    }
}

/// Static fields of the metadata page, read once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingMetadata {
    pub version: u32,
    pub compat_version: u32,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

#[inline]
const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Producer or consumer view over a ring's shared memory.
pub struct PerfRing {
    storage: Arc<dyn RingStorage>,
    meta: NonNull<u8>,
    data: NonNull<u8>,
    capacity: u64,
    mask: u64,
    /// Local read cursor; published as `data_tail`.
    read_pos: u64,
    /// Local write cursor; published as `data_head`.
    write_pos: u64,
}

// SAFETY: the pointers target memory kept alive by `storage`, which is
// Send + Sync. Mutation of shared state goes through the atomic indices,
// and each `PerfRing` is used by one thread at a time.
unsafe impl Send for PerfRing {}

impl std::fmt::Debug for PerfRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfRing")
            .field("capacity", &self.capacity)
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .finish()
    }
}

impl PerfRing {
    /// Bind to storage using the geometry the storage reports.
    pub fn new(storage: Arc<dyn RingStorage>) -> Result<Self, RingError> {
        let data_pages = storage.data_pages();
        let page_size = storage.page_size();
        Self::init(storage, data_pages, page_size)
    }

    /// Bind to storage holding a metadata page and `data_pages` data pages.
    ///
    /// Both cursors start from the indices already published in the
    /// metadata, so a view attached to a live ring picks up where it is.
    pub fn init(
        storage: Arc<dyn RingStorage>,
        data_pages: u32,
        page_size: u64,
    ) -> Result<Self, RingError> {
        let len = storage.len();
        let base = NonNull::new(storage.as_ptr())
            .filter(|_| len > 0)
            .ok_or(RingError::NilBuffer)?;

        let capacity = u64::from(data_pages)
            .checked_mul(page_size)
            .ok_or(RingError::InvalidBufferLength)?;
        if capacity < 8 || !capacity.is_power_of_two() {
            return Err(RingError::InvalidBufferLength);
        }
        if base.as_ptr() as usize % 8 != 0 {
            return Err(RingError::MisalignedBuffer);
        }
        if len < META_LEN {
            return Err(RingError::RegionTooSmall {
                len,
                needed: META_LEN as u64,
            });
        }

        // SAFETY: the region holds at least META_LEN bytes and is 8-aligned.
        let data_offset = unsafe { read_meta_u64(base, META_DATA_OFFSET) };
        let data_start = if data_offset == 0 {
            page_size
        } else {
            data_offset
        };
        let data_end = data_start.saturating_add(capacity);
        if data_start < META_LEN as u64 || data_end > len as u64 {
            return Err(RingError::RegionTooSmall {
                len,
                needed: data_end,
            });
        }

        // SAFETY: `data_start + capacity <= len` was checked above.
        let data = unsafe { NonNull::new_unchecked(base.as_ptr().add(data_start as usize)) };

        let mut ring = Self {
            storage,
            meta: base,
            data,
            capacity,
            mask: capacity - 1,
            read_pos: 0,
            write_pos: 0,
        };
        ring.read_pos = ring.data_tail().load(Ordering::Acquire);
        ring.write_pos = ring.data_head().load(Ordering::Acquire);
        Ok(ring)
    }

    /// Size of the data region in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The storage this view is bound to.
    pub fn storage(&self) -> &Arc<dyn RingStorage> {
        &self.storage
    }

    pub fn metadata(&self) -> RingMetadata {
        // SAFETY: offsets lie within the validated metadata block.
        unsafe {
            RingMetadata {
                version: read_meta_u32(self.meta, META_VERSION),
                compat_version: read_meta_u32(self.meta, META_COMPAT_VERSION),
                data_offset: read_meta_u64(self.meta, META_DATA_OFFSET),
                data_size: read_meta_u64(self.meta, META_DATA_SIZE),
                aux_offset: read_meta_u64(self.meta, META_AUX_OFFSET),
                aux_size: read_meta_u64(self.meta, META_AUX_SIZE),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Observe the space the consumer has released.
    pub fn start_write_batch(&mut self) {
        self.read_pos = self.data_tail().load(Ordering::Acquire);
    }

    /// Append one record and return the data-region offset of `payload`.
    ///
    /// Sample records get the kernel's 4-byte raw-size word in front of the
    /// payload. The record is invisible to readers until
    /// [`finish_write_batch`](Self::finish_write_batch).
    pub fn write(&mut self, payload: &[u8], record_type: u32) -> Result<usize, RingError> {
        if payload.is_empty() {
            return Err(RingError::EmptyWrite);
        }

        let prefix = if record_type == PERF_RECORD_SAMPLE {
            SAMPLE_SIZE_PREFIX
        } else {
            0
        };
        let aligned = align8(RECORD_HEADER_SIZE + prefix + payload.len());
        if aligned as u64 > self.capacity || aligned > usize::from(u16::MAX) {
            return Err(RingError::CannotFit { size: aligned });
        }

        let used = self.write_pos.wrapping_sub(self.read_pos);
        if used + aligned as u64 > self.capacity {
            return Err(RingError::NoSpace);
        }

        let header = RecordHeader {
            record_type,
            misc: 0,
            size: aligned as u16,
        };
        self.copy_in(self.write_pos, &header.to_bytes());

        let mut pos = self.write_pos.wrapping_add(RECORD_HEADER_SIZE as u64);
        if prefix > 0 {
            // Raw size counts the padding that keeps the record 8-aligned.
            let raw_size = (aligned - RECORD_HEADER_SIZE - SAMPLE_SIZE_PREFIX) as u32;
            self.copy_in(pos, &raw_size.to_le_bytes());
            pos = pos.wrapping_add(SAMPLE_SIZE_PREFIX as u64);
        }
        self.copy_in(pos, payload);

        self.write_pos = self.write_pos.wrapping_add(aligned as u64);
        Ok((pos & self.mask) as usize)
    }

    /// Publish everything written since the last batch.
    pub fn finish_write_batch(&mut self) {
        self.data_head().store(self.write_pos, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------------

    /// Observe the records the producer has published.
    pub fn start_read_batch(&mut self) {
        self.write_pos = self.data_head().load(Ordering::Acquire);
    }

    /// Header of the record at the read cursor.
    pub fn peek_header(&self) -> Result<RecordHeader, RingError> {
        if self.read_pos == self.write_pos {
            return Err(RingError::BufferEmpty);
        }
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        self.copy_out(self.read_pos, &mut raw);
        Ok(RecordHeader::from_bytes(raw))
    }

    /// Record type at the read cursor. Meaningless when the ring is empty.
    pub fn peek_type(&self) -> u32 {
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        self.copy_out(self.read_pos, &mut raw);
        RecordHeader::from_bytes(raw).record_type
    }

    /// Payload length of the record at the read cursor, header excluded.
    /// For samples this includes the 4-byte raw-size word.
    pub fn peek_size(&self) -> Result<usize, RingError> {
        let header = self.peek_header()?;
        Ok(usize::from(header.size).saturating_sub(RECORD_HEADER_SIZE))
    }

    /// Copy `dst.len()` bytes of the current payload starting at `offset`.
    pub fn peek_copy(&self, dst: &mut [u8], offset: usize) -> Result<(), RingError> {
        let available = self.peek_size()?;
        let requested = offset.saturating_add(dst.len());
        if requested > available {
            return Err(RingError::SizeExceeded {
                requested,
                available,
            });
        }
        let pos = self
            .read_pos
            .wrapping_add((RECORD_HEADER_SIZE + offset) as u64);
        self.copy_out(pos, dst);
        Ok(())
    }

    /// Consume the record at the read cursor.
    pub fn pop(&mut self) -> Result<(), RingError> {
        let header = self.peek_header()?;
        let remaining = self.write_pos.wrapping_sub(self.read_pos);
        // A corrupt size must not move the cursor past the producer or stall it.
        let advance = align8(usize::from(header.size)).max(RECORD_HEADER_SIZE) as u64;
        let advance = advance.min(remaining);
        self.read_pos = self.read_pos.wrapping_add(advance);
        Ok(())
    }

    /// Release consumed space back to the producer.
    pub fn finish_read_batch(&mut self) {
        self.data_tail().store(self.read_pos, Ordering::Release);
    }

    /// Unconsumed bytes between the local cursors, saturated to `u32`.
    pub fn bytes_remaining(&self) -> u32 {
        let used = self.write_pos.wrapping_sub(self.read_pos);
        u32::try_from(used).unwrap_or(u32::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    // -----------------------------------------------------------------------
    // Raw access
    // -----------------------------------------------------------------------

    fn data_head(&self) -> &AtomicU64 {
        // SAFETY: META_DATA_HEAD + 8 <= META_LEN <= len, the base is 8-aligned,
        // and `storage` outlives the borrow.
        unsafe { &*self.meta.as_ptr().add(META_DATA_HEAD).cast::<AtomicU64>() }
    }

    fn data_tail(&self) -> &AtomicU64 {
        // SAFETY: as for `data_head`.
        unsafe { &*self.meta.as_ptr().add(META_DATA_TAIL).cast::<AtomicU64>() }
    }

    /// Copy `src` into the data region at logical position `pos`, wrapping.
    fn copy_in(&self, pos: u64, src: &[u8]) {
        debug_assert!(src.len() as u64 <= self.capacity);
        let start = (pos & self.mask) as usize;
        let first = src.len().min(self.capacity as usize - start);
        // SAFETY: both spans lie inside the data region; the producer owns
        // the bytes between its cursors until they are published.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.data.as_ptr().add(start), first);
            ptr::copy_nonoverlapping(
                src.as_ptr().add(first),
                self.data.as_ptr(),
                src.len() - first,
            );
        }
    }

    /// Copy out of the data region at logical position `pos`, wrapping.
    fn copy_out(&self, pos: u64, dst: &mut [u8]) {
        debug_assert!(dst.len() as u64 <= self.capacity);
        let start = (pos & self.mask) as usize;
        let first = dst.len().min(self.capacity as usize - start);
        // SAFETY: both spans lie inside the data region; published bytes are
        // not rewritten until the consumer releases them.
        unsafe {
            ptr::copy_nonoverlapping(self.data.as_ptr().add(start), dst.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(
                self.data.as_ptr(),
                dst.as_mut_ptr().add(first),
                dst.len() - first,
            );
        }
    }
}

unsafe fn read_meta_u64(base: NonNull<u8>, offset: usize) -> u64 {
    ptr::read_volatile(base.as_ptr().add(offset).cast::<u64>())
}

unsafe fn read_meta_u32(base: NonNull<u8>, offset: usize) -> u32 {
    ptr::read_volatile(base.as_ptr().add(offset).cast::<u32>())
}
