//! Kernel-backed ring storage: a BPF-output perf event mapped shared.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};

use perf_event_open_sys as sys;
use tracing::debug;

use super::storage::{system_page_size, RingStorage, StorageError};

/// Attributes for a BPF output event delivering raw samples.
///
/// `watermark_bytes == 0` wakes pollers on every record.
fn bpf_output_attr(watermark_bytes: u32) -> sys::bindings::perf_event_attr {
    let mut attr = sys::bindings::perf_event_attr::default();
    attr.size = std::mem::size_of::<sys::bindings::perf_event_attr>() as u32;
    attr.type_ = sys::bindings::PERF_TYPE_SOFTWARE;
    attr.config = u64::from(sys::bindings::PERF_COUNT_SW_BPF_OUTPUT);
    attr.sample_type = u64::from(sys::bindings::PERF_SAMPLE_RAW);
    if watermark_bytes > 0 {
        attr.set_watermark(1);
        attr.__bindgen_anon_2.wakeup_watermark = watermark_bytes;
    } else {
        attr.__bindgen_anon_2.wakeup_events = 1;
    }
    attr
}

/// One CPU's BPF output ring, owned until closed or dropped.
pub struct MmapRingStorage {
    fd: Option<OwnedFd>,
    region: Option<NonNull<u8>>,
    len: usize,
    cpu: i32,
    data_pages: u32,
    page_size: u64,
}

// SAFETY: the mapping is owned by this value and only unmapped through
// `&mut self`; concurrent access goes through the ring protocol.
unsafe impl Send for MmapRingStorage {}
unsafe impl Sync for MmapRingStorage {}

impl MmapRingStorage {
    /// Open a BPF output event on `cpu` (-1 for any CPU) and map
    /// `data_pages` pages of ring plus the metadata page.
    ///
    /// `watermark_bytes == 0` wakes pollers on every record.
    pub fn open(cpu: i32, data_pages: u32, watermark_bytes: u32) -> Result<Self, StorageError> {
        if data_pages == 0 || !data_pages.is_power_of_two() {
            return Err(StorageError::InvalidLayout(
                "data page count must be a power of two",
            ));
        }

        let page_size = system_page_size();
        let len = usize::try_from(page_size)
            .ok()
            .and_then(|page| page.checked_mul(1 + data_pages as usize))
            .ok_or(StorageError::InvalidLayout("mapping exceeds address space"))?;

        let mut attr = bpf_output_attr(watermark_bytes);

        // SAFETY: `attr` is a fully initialized perf_event_attr whose size
        // field matches the bindings' layout.
        let ret = unsafe {
            sys::perf_event_open(
                &mut attr,
                -1,
                cpu,
                -1,
                libc::c_ulong::from(sys::bindings::PERF_FLAG_FD_CLOEXEC),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: a non-negative return is a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(ret) };

        // SAFETY: mapping a perf event descriptor with a length of
        // (1 + 2^n) pages is the documented way to obtain its ring.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let region = NonNull::new(addr.cast::<u8>())
            .ok_or(StorageError::InvalidLayout("mmap returned null"))?;

        debug!(cpu, data_pages, page_size, fd = fd.as_raw_fd(), "mapped perf ring");

        Ok(Self {
            fd: Some(fd),
            region: Some(region),
            len,
            cpu,
            data_pages,
            page_size,
        })
    }

    pub fn cpu(&self) -> i32 {
        self.cpu
    }
}

impl RingStorage for MmapRingStorage {
    fn as_ptr(&self) -> *mut u8 {
        self.region.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    fn len(&self) -> usize {
        if self.region.is_some() {
            self.len
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
        self.fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    fn close(&mut self) -> Result<(), StorageError> {
        let mut result = Ok(());
        if let Some(region) = self.region.take() {
            // SAFETY: `region` and `len` describe the mapping created in `open`.
            if unsafe { libc::munmap(region.as_ptr().cast(), self.len) } != 0 {
                result = Err(io::Error::last_os_error().into());
            }
        }
        // Dropping the descriptor closes it.
        self.fd = None;
        result
    }
}

impl Drop for MmapRingStorage {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(cpu = self.cpu, error = %err, "failed to release perf ring");
        }
    }
}
