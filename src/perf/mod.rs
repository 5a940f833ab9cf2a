//! Kernel perf ring buffers: the shared-memory wire protocol, the storage
//! that backs it, and the timestamp-ordered merge across per-CPU rings.

pub mod heap;
pub mod merger;
#[cfg(target_os = "linux")]
pub mod mmap;
pub mod ring;
pub mod storage;

pub use merger::{Merger, MergerError};
#[cfg(target_os = "linux")]
pub use mmap::MmapRingStorage;
pub use ring::{PerfRing, RecordHeader, RingError, PERF_RECORD_LOST, PERF_RECORD_SAMPLE};
pub use storage::{MemoryRingStorage, RingStorage, StorageError};
