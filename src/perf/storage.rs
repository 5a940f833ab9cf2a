use std::alloc::{self, Layout};
use std::os::fd::RawFd;
use std::ptr::NonNull;

use thiserror::Error;

use super::ring::{META_DATA_OFFSET, META_DATA_SIZE, META_LEN};

/// Errors raised while acquiring or releasing ring backing memory.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("OS error: {0}")]
    Os(#[from] std::io::Error),

    #[error("invalid ring layout: {0}")]
    InvalidLayout(&'static str),
}

/// Contiguous memory holding a perf metadata page followed by the data pages.
///
/// Implementations hand out a raw pointer because the region is written
/// concurrently by a producer and a consumer that only synchronize through
/// the atomic indices in the metadata page.
pub trait RingStorage: Send + Sync {
    /// Base of the region (metadata page first). Null once closed.
    fn as_ptr(&self) -> *mut u8;

    /// Total length of the region in bytes. Zero once closed.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of data pages following the metadata.
    fn data_pages(&self) -> u32;

    /// Page size the region was laid out with.
    fn page_size(&self) -> u64;

    /// The perf event descriptor backing the region, or -1.
    fn file_descriptor(&self) -> RawFd;

    /// Release the region. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), StorageError>;
}

/// Returns the system page size, falling back to 4 KiB.
pub fn system_page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).ok().filter(|s| *s > 0).unwrap_or(4096)
}

/// Heap-backed ring storage for tests and inter-thread pipelines.
pub struct MemoryRingStorage {
    ptr: Option<NonNull<u8>>,
    layout: Layout,
    data_pages: u32,
    page_size: u64,
}

// SAFETY: the allocation is exclusively owned by this value; concurrent
// access through `as_ptr` is coordinated by the ring protocol's atomics.
unsafe impl Send for MemoryRingStorage {}
unsafe impl Sync for MemoryRingStorage {}

impl MemoryRingStorage {
    /// Allocate one metadata page plus `data_pages` pages of the system page size.
    pub fn new(data_pages: u32) -> Result<Self, StorageError> {
        Self::with_page_size(data_pages, system_page_size())
    }

    /// Allocate with an explicit page size.
    ///
    /// Page sizes smaller than the metadata block get a metadata area rounded
    /// up to whole pages, advertised through `data_offset` the way current
    /// kernels do. Otherwise `data_offset` stays zero and readers fall back
    /// to the one-page convention.
    pub fn with_page_size(data_pages: u32, page_size: u64) -> Result<Self, StorageError> {
        if page_size == 0 {
            return Err(StorageError::InvalidLayout("page size must be positive"));
        }

        let page = usize::try_from(page_size)
            .map_err(|_| StorageError::InvalidLayout("page size exceeds address space"))?;
        let meta_len = META_LEN.div_ceil(page) * page;
        let data_len = page
            .checked_mul(data_pages as usize)
            .ok_or(StorageError::InvalidLayout("data region exceeds address space"))?;
        let total = meta_len
            .checked_add(data_len)
            .ok_or(StorageError::InvalidLayout("region exceeds address space"))?;

        let align = if page.is_power_of_two() {
            page.clamp(8, 4096)
        } else {
            8
        };
        let layout = Layout::from_size_align(total, align)
            .map_err(|_| StorageError::InvalidLayout("unrepresentable allocation"))?;

        // SAFETY: `total >= META_LEN > 0`, so the layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };

        if meta_len != page {
            // SAFETY: the region is at least META_LEN bytes and 8-byte aligned.
            unsafe {
                ptr.as_ptr()
                    .add(META_DATA_OFFSET)
                    .cast::<u64>()
                    .write(meta_len as u64);
                ptr.as_ptr()
                    .add(META_DATA_SIZE)
                    .cast::<u64>()
                    .write(data_len as u64);
            }
        }

        Ok(Self {
            ptr: Some(ptr),
            layout,
            data_pages,
            page_size,
        })
    }
}

impl RingStorage for MemoryRingStorage {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    fn len(&self) -> usize {
        if self.ptr.is_some() {
            self.layout.size()
        } else {
            0
        }
    }

    fn data_pages(&self) -> u32 {
        self.data_pages
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn file_descriptor(&self) -> RawFd {
        -1
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: allocated in `with_page_size` with this exact layout.
            unsafe { alloc::dealloc(ptr.as_ptr(), self.layout) };
        }
        Ok(())
    }
}

impl Drop for MemoryRingStorage {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
