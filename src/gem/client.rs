//! Per-client memory state.
//!
//! A [`ClientPrivate`] is shared through `Arc`: the session holds one
//! reference, every live object holds one, and a closed client waiting for
//! its termination notification is held by the device. The last reference
//! going away returns the client's blocks, pagetable and parked host pages.

use crate::config::DeviceConfig;
use crate::error::V3dResult;
use crate::mm::block::BlockAllocator;
use crate::mm::host::HostBacking;
use crate::mm::provider::{ContiguousMemoryProvider, ControllerInfo};
use crate::mm::vmem::HwVirtualMem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Mutable allocation state of one client.
///
/// Only touched with the device lock held.
#[derive(Debug)]
pub struct ClientMemory {
    pub vmem: HwVirtualMem,
    pub blocks: BlockAllocator,
    /// Host pages released while the hardware may still access them.
    pub dead_pages: Vec<Box<dyn HostBacking>>,
    /// Park released host pages instead of freeing them.
    pub defer_host_release: bool,
    /// Keep clearing pagetable entries after the session is closed.
    pub clear_pagetable_on_close: bool,
}

#[derive(Debug)]
pub struct ClientPrivate {
    id: u64,
    provider: Arc<dyn ContiguousMemoryProvider>,
    mem: Mutex<ClientMemory>,
}

impl ClientPrivate {
    pub(crate) fn new(
        id: u64,
        config: &DeviceConfig,
        controllers: Vec<ControllerInfo>,
        provider: Arc<dyn ContiguousMemoryProvider>,
    ) -> V3dResult<Arc<Self>> {
        let mut vmem = HwVirtualMem::new(config.page_mode);
        if config.eager_pagetable {
            vmem.init(provider.as_ref())?;
        }

        Ok(Arc::new(Self {
            id,
            provider,
            mem: Mutex::new(ClientMemory {
                vmem,
                blocks: BlockAllocator::new(controllers, config.page_mode, config.dma_mask()),
                dead_pages: Vec::new(),
                defer_host_release: false,
                clear_pagetable_on_close: false,
            }),
        }))
    }

    /// The client's termination token (its magic id).
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn provider(&self) -> &dyn ContiguousMemoryProvider {
        self.provider.as_ref()
    }

    /// Lock the allocation state. Callers hold the device lock.
    pub(crate) fn memory(&self) -> MutexGuard<'_, ClientMemory> {
        self.mem.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` over the allocation state, for inspection.
    pub fn inspect<R>(&self, f: impl FnOnce(&ClientMemory) -> R) -> R {
        f(&self.memory())
    }
}

impl Drop for ClientPrivate {
    fn drop(&mut self) {
        let mem = self.mem.get_mut().unwrap_or_else(PoisonError::into_inner);
        let provider = self.provider.as_ref();

        log::debug!(
            "releasing client 0x{:x}: {} deferred host backings",
            self.id,
            mem.dead_pages.len()
        );

        mem.vmem.destroy(provider);
        mem.blocks.release_all(provider);
        mem.dead_pages.clear();
    }
}
