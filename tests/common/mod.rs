#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use v3d_gem::config::PageMode;
use v3d_gem::mm::{HostBacking, HostPageSource, ShmemPageSource, SimulatedCma};
use v3d_gem::{Device, DeviceConfig, V3dError, V3dResult};

pub const MIB: u64 = 1024 * 1024;

/// Shared memory host pages that count live backings and can be made to fail.
#[derive(Debug, Clone, Default)]
pub struct CountingHostPages {
    inner: ShmemPageSource,
    live: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl CountingHostPages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backings handed out and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn bus_bytes_in_use(&self) -> u64 {
        self.inner.bus_bytes_in_use()
    }
}

#[derive(Debug)]
struct Counted {
    inner: Box<dyn HostBacking>,
    live: Arc<AtomicUsize>,
}

impl HostBacking for Counted {
    fn page_count(&self) -> usize {
        self.inner.page_count()
    }

    fn bus_addr(&self, index: usize) -> u64 {
        self.inner.bus_addr(index)
    }

    fn cpu_pfn(&self, index: usize) -> u64 {
        self.inner.cpu_pfn(index)
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HostPageSource for CountingHostPages {
    fn alloc_pages(&self, count: usize, mode: PageMode) -> V3dResult<Box<dyn HostBacking>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(V3dError::OutOfMemory);
        }
        let inner = self.inner.alloc_pages(count, mode)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Counted {
            inner,
            live: Arc::clone(&self.live),
        }))
    }
}

/// A device over one simulated 16 MiB controller.
pub fn cma_device(config: DeviceConfig) -> (Arc<Device>, Arc<SimulatedCma>) {
    let cma = Arc::new(SimulatedCma::new().with_controller(0x4000_0000, 16 * MIB));
    let device = Device::load(config, cma.clone());
    (device, cma)
}

/// A device with no controllers, backed by counted host pages.
pub fn host_device(config: DeviceConfig) -> (Arc<Device>, Arc<SimulatedCma>, CountingHostPages) {
    let cma = Arc::new(SimulatedCma::new());
    let host = CountingHostPages::new();
    let device = Device::builder(config, cma.clone())
        .host_pages(Arc::new(host.clone()))
        .load();
    (device, cma, host)
}
