//! # Device state and client lifetimes
//!
//! A closed client keeps its memory until the hardware is known to be done
//! with it. Two events decide that and they may come in either order:
//!
//! ```text
//!            close                       terminated(token)
//!   OPEN ─────────────► AWAITING ──────────────────────────► RELEASED
//!     │                                                         ▲
//!     │ terminated(token)                      close            │
//!     └──────────────► OPEN, token on confirmed_dead ───────────┘
//! ```
//!
//! While awaiting, the device holds the client's last reference. Termination
//! drops it, which returns the blocks, the pagetable and any parked host
//! pages. A new master session means the hardware was reset, so every client
//! still awaiting termination is released at that point.

use crate::config::{ALLOC_BLOCK_SIZE, DeviceConfig, FALLBACK_TOTAL_MEMORY, HW_VIRTUAL_ADDR_SIZE};
use crate::drm::file::DrmFile;
use crate::drm::ioctl::{V3D_CREATE_CPU_WRITECOMBINE, V3D_CREATE_HW_READONLY};
use crate::error::{V3dError, V3dResult};
use crate::gem::client::ClientPrivate;
use crate::gem::handles::HandleTable;
use crate::gem::object::{GemObject, ObjectKind, ObjectSource};
use crate::gem::registry;
use crate::mm::host::{HostPageSource, ShmemPageSource};
use crate::mm::provider::{ContiguousMemoryProvider, ControllerInfo};
use crate::mm::vmem::ExtentPool;
use crate::sync::{PendingSignal, StructMutex};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// First client token handed out.
pub const MAGIC_ID_BASE: u64 = 0xdead_c1e5_0000_0000;

/// CPU mapping offsets start above the 32-bit range.
pub const MMAP_OFFSET_START: u64 = ((0xFFFF_FFFF >> 12) + 1) << 12;
pub const MMAP_OFFSET_SIZE: u64 = ((0xFFFF_FFFF >> 12) * 256) << 12;

/// Caching used for a CPU mapping of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAttr {
    Cached,
    WriteCombine,
}

/// Decides how objects are mapped into the CPU.
pub trait MappingPolicy: Send + Sync + Debug {
    fn cache_attr(&self, flags: u32, kind: ObjectKind) -> CacheAttr;
}

/// Write-combined when the object asks for it, cached otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMappingPolicy;

impl MappingPolicy for DefaultMappingPolicy {
    fn cache_attr(&self, flags: u32, _kind: ObjectKind) -> CacheAttr {
        if flags & V3D_CREATE_CPU_WRITECOMBINE != 0 {
            CacheAttr::WriteCombine
        } else {
            CacheAttr::Cached
        }
    }
}

/// A CPU mapping request resolved to its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMapping {
    pub offset: u64,
    pub size: u64,
    pub attr: CacheAttr,
}

/// Result of a successful object creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedObject {
    pub handle: u32,
    /// Size of the mapping, rounded up to whole pages.
    pub size: u64,
    pub hw_addr: u64,
}

/// Location and extent of a client's pagetable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagetableInfo {
    pub pt_phys: u64,
    pub va_size: u64,
}

/// State guarded by the device lock.
#[derive(Debug)]
pub struct DeviceState {
    /// Closed clients whose termination has not been confirmed.
    awaiting: Vec<Arc<ClientPrivate>>,
    /// Tokens confirmed terminated before their client closed.
    confirmed_dead: Vec<u64>,
    master: Option<u64>,
    offsets: ExtentPool,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            awaiting: Vec::new(),
            confirmed_dead: Vec::new(),
            master: None,
            offsets: ExtentPool::new(
                MMAP_OFFSET_START,
                MMAP_OFFSET_START + MMAP_OFFSET_SIZE,
                1 << 12,
            ),
        }
    }

    fn flush_dead_clients(&mut self) {
        log::debug!(
            "flushing {} clients awaiting termination, {} confirmed dead",
            self.awaiting.len(),
            self.confirmed_dead.len()
        );
        // Dropping the references releases the clients.
        self.awaiting.clear();
        self.confirmed_dead.clear();
    }

    fn term_client(&mut self, token: u64) {
        if let Some(pos) = self.awaiting.iter().position(|c| c.id() == token) {
            let client = self.awaiting.remove(pos);
            log::debug!("client 0x{token:x} terminated after close, releasing");
            drop(client);
            return;
        }

        if self.confirmed_dead.contains(&token) {
            log::debug!("client 0x{token:x} already reported terminated");
            return;
        }

        // Not closed yet: remember so the close releases it at once.
        if self.confirmed_dead.try_reserve(1).is_err() {
            log::warn!("lost termination record for client 0x{token:x}");
            return;
        }
        log::debug!("client 0x{token:x} terminated before close");
        self.confirmed_dead.push(token);
    }
}

#[derive(Debug)]
pub struct DeviceBuilder {
    config: DeviceConfig,
    provider: Arc<dyn ContiguousMemoryProvider>,
    host: Option<Arc<dyn HostPageSource>>,
    policy: Option<Box<dyn MappingPolicy>>,
}

impl DeviceBuilder {
    #[must_use]
    pub fn host_pages(mut self, host: Arc<dyn HostPageSource>) -> Self {
        self.host = Some(host);
        self
    }

    #[must_use]
    pub fn mapping_policy(mut self, policy: Box<dyn MappingPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Discover the controllers and bring the device up.
    #[must_use]
    pub fn load(self) -> Arc<Device> {
        let controllers = discover_controllers(&self.config, self.provider.as_ref());
        log::debug!(
            "device loaded: {} usable controllers, {:?} pages",
            controllers.len(),
            self.config.page_mode
        );

        Arc::new(Device {
            config: self.config,
            controllers,
            provider: self.provider,
            host: self
                .host
                .unwrap_or_else(|| Arc::new(ShmemPageSource::default())),
            policy: self
                .policy
                .unwrap_or_else(|| Box::new(DefaultMappingPolicy)),
            next_magic: AtomicU64::new(MAGIC_ID_BASE),
            state: StructMutex::new(DeviceState::new()),
        })
    }
}

/// Keep the controllers the MMU can reach and the provider can serve.
fn discover_controllers(
    config: &DeviceConfig,
    provider: &dyn ContiguousMemoryProvider,
) -> Vec<ControllerInfo> {
    if config.ignore_cma {
        log::debug!("controllers ignored, objects use host pages");
        return Vec::new();
    }

    let mut usable = Vec::new();
    for info in provider.controllers() {
        if !config.dma_capable(info.base, info.size) {
            log::warn!(
                "memc {}: 0x{:x}+0x{:x} is beyond the MMU address range",
                info.memc,
                info.base,
                info.size
            );
            continue;
        }

        let phys = match provider.get_region(info.memc, ALLOC_BLOCK_SIZE, ALLOC_BLOCK_SIZE) {
            Ok(phys) => phys,
            Err(e) => {
                log::warn!("memc {}: trial allocation failed: {e}", info.memc);
                continue;
            }
        };
        let lowmem = config.reject_lowmem && provider.is_lowmem(phys);
        provider.put_region(info.memc, phys, ALLOC_BLOCK_SIZE);
        if lowmem {
            log::warn!("memc {}: region is in low memory, ignored", info.memc);
            continue;
        }

        log::debug!(
            "found memc {} (base 0x{:x}, size 0x{:x})",
            info.memc,
            info.base,
            info.size
        );
        usable.push(info);
    }
    usable
}

pub struct Device {
    config: DeviceConfig,
    controllers: Vec<ControllerInfo>,
    provider: Arc<dyn ContiguousMemoryProvider>,
    host: Arc<dyn HostPageSource>,
    policy: Box<dyn MappingPolicy>,
    next_magic: AtomicU64,
    state: StructMutex<DeviceState>,
}

impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("controllers", &self.controllers)
            .finish_non_exhaustive()
    }
}

impl Device {
    #[must_use]
    pub fn builder(config: DeviceConfig, provider: Arc<dyn ContiguousMemoryProvider>) -> DeviceBuilder {
        DeviceBuilder {
            config,
            provider,
            host: None,
            policy: None,
        }
    }

    /// Bring a device up with shared memory host pages and the default
    /// mapping policy.
    #[must_use]
    pub fn load(config: DeviceConfig, provider: Arc<dyn ContiguousMemoryProvider>) -> Arc<Self> {
        Self::builder(config, provider).load()
    }

    /// Stop receiving termination notifications and release every closed
    /// client. Open sessions keep their memory until they close.
    pub fn unload(&self) {
        registry::unregister(self);
        self.state.lock().flush_dead_clients();
        log::debug!("device unloaded");
    }

    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Controllers found usable at load time.
    #[must_use]
    pub fn controllers(&self) -> &[ControllerInfo] {
        &self.controllers
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn ContiguousMemoryProvider> {
        &self.provider
    }

    fn source(&self) -> ObjectSource<'_> {
        ObjectSource {
            config: &self.config,
            use_controllers: !self.controllers.is_empty(),
            host: self.host.as_ref(),
        }
    }

    // -------------------------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------------------------

    /// Open a session.
    pub fn open(self: &Arc<Self>) -> V3dResult<DrmFile> {
        let client = self.new_client()?;
        Ok(DrmFile::new(Arc::clone(self), client))
    }

    /// Open a session on the primary node. With no master present it becomes
    /// master and every client left over from before is released.
    pub fn open_primary(self: &Arc<Self>) -> V3dResult<DrmFile> {
        let client = self.new_client()?;
        {
            let mut state = self.state.lock();
            if state.master.is_none() {
                log::debug!("client 0x{:x} is master", client.id());
                state.master = Some(client.id());
                state.flush_dead_clients();
            }
        }
        Ok(DrmFile::new(Arc::clone(self), client))
    }

    fn new_client(&self) -> V3dResult<Arc<ClientPrivate>> {
        let id = self.next_magic.fetch_add(1, Ordering::Relaxed);
        let client = ClientPrivate::new(
            id,
            &self.config,
            self.controllers.clone(),
            Arc::clone(&self.provider),
        )?;
        log::debug!("opened client 0x{id:x}");
        Ok(client)
    }

    /// Close a session: release its objects, then either release the client
    /// or keep it until its termination is confirmed.
    pub(crate) fn close_client(&self, client: &Arc<ClientPrivate>, handles: &HandleTable) {
        let id = client.id();
        let mut state = self.state.lock();

        {
            let mut mem = client.memory();
            if !mem.clear_pagetable_on_close {
                log::debug!("client 0x{id:x}: pagetable entries kept on free");
                mem.vmem.set_clear_entries_on_free(false);
            }
            mem.defer_host_release = !state.confirmed_dead.contains(&id);
        }

        for obj in handles.drain() {
            obj.release(&mut state.offsets);
        }

        if let Some(pos) = state.confirmed_dead.iter().position(|&t| t == id) {
            state.confirmed_dead.remove(pos);
            log::debug!("client 0x{id:x} closed after termination");
        } else {
            log::debug!("client 0x{id:x} closed, awaiting termination");
            state.awaiting.push(Arc::clone(client));
        }

        if state.master == Some(id) {
            state.master = None;
        }
    }

    // -------------------------------------------------------------------------------------------
    // Termination
    // -------------------------------------------------------------------------------------------

    /// The hardware no longer uses the memory of client `token`.
    pub fn notify_client_terminated(&self, token: u64) {
        self.state.lock().term_client(token);
    }

    pub(crate) fn notify_client_terminated_interruptible(
        &self,
        token: u64,
        signal: &PendingSignal,
    ) -> V3dResult<()> {
        self.state.lock_interruptible(signal)?.term_client(token);
        Ok(())
    }

    #[must_use]
    pub fn master(&self) -> Option<u64> {
        self.state.lock().master
    }

    /// Tokens of closed clients still holding memory.
    #[must_use]
    pub fn awaiting_termination(&self) -> Vec<u64> {
        self.state.lock().awaiting.iter().map(|c| c.id()).collect()
    }

    #[must_use]
    pub fn confirmed_dead(&self) -> Vec<u64> {
        self.state.lock().confirmed_dead.clone()
    }

    // -------------------------------------------------------------------------------------------
    // Per-client operations, called through a session
    // -------------------------------------------------------------------------------------------

    pub(crate) fn pagetable_info(
        &self,
        client: &ClientPrivate,
        signal: &PendingSignal,
    ) -> V3dResult<PagetableInfo> {
        let _state = self.state.lock_interruptible(signal)?;
        let mut mem = client.memory();
        mem.vmem.init(client.provider())?;
        let pt_phys = mem
            .vmem
            .pagetable_phys()
            .ok_or_else(|| V3dError::invariant("pagetable missing after init"))?;
        Ok(PagetableInfo {
            pt_phys,
            va_size: HW_VIRTUAL_ADDR_SIZE,
        })
    }

    fn publish(
        handles: &HandleTable,
        state: &mut DeviceState,
        obj: GemObject,
    ) -> V3dResult<CreatedObject> {
        let size = obj.size();
        let hw_addr = obj.hw_addr();
        match handles.insert(obj) {
            Ok(handle) => {
                log::trace!("handle={handle} size=0x{size:x} hw_addr=0x{hw_addr:x}");
                Ok(CreatedObject {
                    handle,
                    size,
                    hw_addr,
                })
            }
            Err(obj) => {
                obj.release(&mut state.offsets);
                Err(V3dError::OutOfMemory)
            }
        }
    }

    pub(crate) fn create_object(
        &self,
        client: &Arc<ClientPrivate>,
        handles: &HandleTable,
        signal: &PendingSignal,
        size: u64,
        flags: u32,
        description: Option<&str>,
    ) -> V3dResult<CreatedObject> {
        let mut state = self.state.lock_interruptible(signal)?;
        let obj = GemObject::create(self.source(), client, size, flags, description)?;
        Self::publish(handles, &mut state, obj)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_external_object(
        &self,
        client: &Arc<ClientPrivate>,
        handles: &HandleTable,
        signal: &PendingSignal,
        phys: u64,
        size: u64,
        flags: u32,
        description: Option<&str>,
    ) -> V3dResult<CreatedObject> {
        if flags & !V3D_CREATE_HW_READONLY != 0 {
            return Err(V3dError::InvalidArgument(format!(
                "flags 0x{flags:x} not valid for external objects"
            )));
        }

        let mut state = self.state.lock_interruptible(signal)?;
        let obj =
            GemObject::create_external(self.source(), client, phys, size, flags, description)?;
        Self::publish(handles, &mut state, obj)
    }

    pub(crate) fn close_object(
        &self,
        handles: &HandleTable,
        signal: &PendingSignal,
        handle: u32,
    ) -> V3dResult<()> {
        let mut state = self.state.lock_interruptible(signal)?;
        let obj = handles.remove(handle).ok_or(V3dError::NotFound(handle))?;
        obj.release(&mut state.offsets);
        Ok(())
    }

    pub(crate) fn mmap_offset(
        &self,
        handles: &HandleTable,
        signal: &PendingSignal,
        handle: u32,
    ) -> V3dResult<u64> {
        let mut state = self.state.lock_interruptible(signal)?;
        let offset = handles
            .with_object(handle, |obj| obj.assign_mmap_offset(&mut state.offsets))
            .ok_or(V3dError::NotFound(handle))??;
        log::trace!("handle={handle} offset=0x{offset:x}");
        Ok(offset)
    }

    pub(crate) fn set_clear_pagetable_on_close(
        &self,
        client: &ClientPrivate,
        signal: &PendingSignal,
    ) -> V3dResult<()> {
        let _state = self.state.lock_interruptible(signal)?;
        client.memory().clear_pagetable_on_close = true;
        Ok(())
    }

    /// Memory that may be available for objects. There is no guarantee any
    /// of it can actually be allocated.
    #[must_use]
    pub fn total_memory(&self) -> u64 {
        match self.controllers.iter().map(|c| c.size).sum::<u64>() {
            0 => FALLBACK_TOTAL_MEMORY,
            total => total,
        }
    }

    // -------------------------------------------------------------------------------------------
    // CPU mappings
    // -------------------------------------------------------------------------------------------

    pub(crate) fn mmap(&self, handles: &HandleTable, offset: u64) -> V3dResult<CpuMapping> {
        let mapping = handles
            .with_offset(offset, |obj| CpuMapping {
                offset,
                size: obj.size(),
                attr: self.policy.cache_attr(obj.flags(), obj.kind()),
            })
            .ok_or_else(|| V3dError::InvalidArgument(format!("no object at offset 0x{offset:x}")))?;
        log::trace!("mmap offset 0x{offset:x}: {mapping:?}");
        Ok(mapping)
    }

    pub(crate) fn fault(
        &self,
        handles: &HandleTable,
        signal: &PendingSignal,
        offset: u64,
        page_index: u64,
    ) -> V3dResult<u64> {
        let _state = self.state.lock_interruptible(signal)?;
        handles
            .with_offset(offset, |obj| obj.fault_pfn(page_index))
            .ok_or_else(|| V3dError::InvalidArgument(format!("no object at offset 0x{offset:x}")))?
    }
}
