//! Host page backing, used when no memory controller is available.
//!
//! Pages come from anonymous shared memory. The device reaches them through
//! bus addresses assigned from a dedicated window, the CPU through their host
//! frames.

use crate::config::PageMode;
use crate::error::{V3dError, V3dResult};
use crate::mm::vmem::{ExtentPool, VaPool};
use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

/// A set of host pages backing one object.
///
/// Dropping the backing releases the pages.
pub trait HostBacking: Send + Sync + Debug {
    fn page_count(&self) -> usize;

    /// Address the device uses for page `index`.
    fn bus_addr(&self, index: usize) -> u64;

    /// Host frame number of the first 4 KiB of page `index`.
    fn cpu_pfn(&self, index: usize) -> u64;

    /// All bus addresses, in page order.
    fn bus_addrs(&self) -> Vec<u64> {
        (0..self.page_count()).map(|i| self.bus_addr(i)).collect()
    }
}

pub trait HostPageSource: Send + Sync + Debug {
    fn alloc_pages(&self, count: usize, mode: PageMode) -> V3dResult<Box<dyn HostBacking>>;
}

/// Default bus window for host pages: 256 MiB at 2 GiB, inside a 32-bit mask.
const SHMEM_BUS_BASE: u64 = 0x8000_0000;
const SHMEM_BUS_SIZE: u64 = 256 * 1024 * 1024;

/// Anonymous shared memory pages with bus addresses from a fixed window.
#[derive(Debug, Clone)]
pub struct ShmemPageSource {
    bus: Arc<Mutex<ExtentPool>>,
}

impl Default for ShmemPageSource {
    fn default() -> Self {
        Self::new(SHMEM_BUS_BASE, SHMEM_BUS_SIZE)
    }
}

impl ShmemPageSource {
    /// Pages get bus addresses from `[bus_base, bus_base + bus_size)`.
    #[must_use]
    pub fn new(bus_base: u64, bus_size: u64) -> Self {
        Self {
            bus: Arc::new(Mutex::new(ExtentPool::new(
                bus_base,
                bus_base + bus_size,
                PageMode::Big.size(),
            ))),
        }
    }

    /// Bytes of bus window currently assigned.
    #[must_use]
    pub fn bus_bytes_in_use(&self) -> u64 {
        self.bus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live_bytes()
    }
}

impl HostPageSource for ShmemPageSource {
    fn alloc_pages(&self, count: usize, mode: PageMode) -> V3dResult<Box<dyn HostBacking>> {
        let page_size = mode.size();
        let len = (count as u64)
            .checked_mul(page_size)
            .filter(|&len| len > 0)
            .ok_or_else(|| V3dError::InvalidArgument(format!("{count} host pages")))?;

        let bus_base = self
            .bus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate_va(len)
            .ok_or(V3dError::OutOfMemory)?;

        #[allow(clippy::cast_possible_truncation)]
        let map_len = len as usize;

        // SAFETY: a fresh anonymous mapping, no existing memory is touched.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            self.bus
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .free_va(bus_base, len);
            log::warn!("host page mapping of {len} bytes failed: {err}");
            return Err(V3dError::OutOfMemory);
        }

        log::trace!("host pages: {count} x 0x{page_size:x} at bus 0x{bus_base:x}");

        Ok(Box::new(ShmemPages {
            addr: ptr as usize,
            len: map_len,
            page_size,
            count,
            bus_base,
            bus: Arc::clone(&self.bus),
        }))
    }
}

#[derive(Debug)]
struct ShmemPages {
    addr: usize,
    len: usize,
    page_size: u64,
    count: usize,
    bus_base: u64,
    bus: Arc<Mutex<ExtentPool>>,
}

impl HostBacking for ShmemPages {
    fn page_count(&self) -> usize {
        self.count
    }

    fn bus_addr(&self, index: usize) -> u64 {
        self.bus_base + index as u64 * self.page_size
    }

    fn cpu_pfn(&self, index: usize) -> u64 {
        (self.addr as u64 + index as u64 * self.page_size) >> 12
    }
}

impl Drop for ShmemPages {
    fn drop(&mut self) {
        // SAFETY: `addr`/`len` describe the mapping created in `alloc_pages`,
        // which nothing else unmaps.
        let ret = unsafe { libc::munmap(self.addr as *mut libc::c_void, self.len) };
        if ret != 0 {
            log::error!(
                "munmap of host pages at 0x{:x} failed: {}",
                self.addr,
                io::Error::last_os_error()
            );
        }

        let freed = self
            .bus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free_va(self.bus_base, self.len as u64);
        if !freed {
            log::error!("bus range 0x{:x} was not assigned", self.bus_base);
        }
    }
}
