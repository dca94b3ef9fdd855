//! GEM objects.
//!
//! An object is built in stages: hardware address space is reserved, backing
//! pages are acquired, the pagetable is written, and only then is the object
//! handed to the caller for publishing. A failure at any stage undoes the
//! earlier ones in reverse order before the error is returned.

use crate::config::{DeviceConfig, PageMode};
use crate::drm::ioctl::{V3D_CREATE_CPU_WRITECOMBINE, V3D_CREATE_HW_READONLY};
use crate::error::{V3dError, V3dResult};
use crate::gem::client::{ClientMemory, ClientPrivate};
use crate::mm::block::PageAllocation;
use crate::mm::host::{HostBacking, HostPageSource};
use crate::mm::pagetable;
use crate::mm::vmem::{ExtentPool, VaPool};
use crate::utils::round_up;
use std::sync::Arc;

/// What provides an object's memory.
#[derive(Debug)]
pub enum Backing {
    /// Pages from the client's controller blocks.
    Device(Vec<PageAllocation>),
    /// Host pages, used when there is no usable controller.
    Host(Box<dyn HostBacking>),
    /// Caller-owned contiguous memory, never freed here.
    External { phys: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Device,
    Host,
    External,
}

impl Backing {
    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        match self {
            Self::Device(_) => ObjectKind::Device,
            Self::Host(_) => ObjectKind::Host,
            Self::External { .. } => ObjectKind::External,
        }
    }

    fn bus_addrs(&self) -> Vec<u64> {
        match self {
            Self::Device(pages) => pages.iter().map(|p| p.phys).collect(),
            Self::Host(pages) => pages.bus_addrs(),
            Self::External { .. } => Vec::new(),
        }
    }

    /// Give the memory back, or park host pages while the hardware may still
    /// reference them.
    fn release(self, mem: &mut ClientMemory) {
        match self {
            Self::Device(pages) => {
                log::trace!("free {} controller pages", pages.len());
                mem.blocks.release_pages(&pages);
            }
            Self::Host(pages) if mem.defer_host_release => {
                log::trace!("defer release of {} host pages", pages.page_count());
                mem.dead_pages.push(pages);
            }
            Self::Host(pages) => drop(pages),
            Self::External { .. } => {}
        }
    }
}

/// Published state of an object, as listed by [`HandleTable::objects`].
///
/// [`HandleTable::objects`]: crate::gem::handles::HandleTable::objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub handle: u32,
    pub size: u64,
    pub hw_addr: u64,
    pub flags: u32,
    pub kind: ObjectKind,
    pub description: Option<String>,
}

/// Where new objects get their memory from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjectSource<'a> {
    pub config: &'a DeviceConfig,
    pub use_controllers: bool,
    pub host: &'a dyn HostPageSource,
}

#[derive(Debug)]
pub struct GemObject {
    size: u64,
    flags: u32,
    hw_addr: u64,
    /// Offset of the caller's address within the first page (external only).
    page_offset: u64,
    page_mode: PageMode,
    backing: Backing,
    description: Option<String>,
    mmap_offset: Option<u64>,
    client: Arc<ClientPrivate>,
}

/// Copy a description, dropping it if it does not fit.
fn copy_description(desc: Option<&str>, max_len: usize) -> Option<String> {
    let desc = desc?;
    if desc.len() >= max_len {
        log::warn!("object description of {} bytes dropped", desc.len());
        return None;
    }
    Some(desc.to_owned())
}

/// Return a reservation taken during a failed creation.
fn unwind_va(mem: &mut ClientMemory, va: u64, size: u64) {
    if let Err(e) = mem.vmem.free(va, size) {
        log::error!("unwinding va 0x{va:x}: {e}");
    }
}

impl GemObject {
    /// Create an object of at least `size` bytes backed by new memory.
    pub(crate) fn create(
        src: ObjectSource<'_>,
        client: &Arc<ClientPrivate>,
        size: u64,
        flags: u32,
        description: Option<&str>,
    ) -> V3dResult<Self> {
        let page_mode = src.config.page_mode;
        let page_size = page_mode.size();
        let size = round_up(size, page_size).ok_or(V3dError::OutOfMemory)?;
        let readonly = flags & V3D_CREATE_HW_READONLY != 0;
        let description = copy_description(description, src.config.max_description_len);

        let mut mem = client.memory();
        mem.vmem.init(client.provider())?;

        let va = mem.vmem.allocate(size)?;

        #[allow(clippy::cast_possible_truncation)]
        let count = (size / page_size) as usize;
        let acquired = if src.use_controllers {
            mem.blocks
                .acquire_pages(client.provider(), count)
                .map(Backing::Device)
        } else {
            src.host.alloc_pages(count, page_mode).map(Backing::Host)
        };
        let backing = match acquired {
            Ok(backing) => backing,
            Err(e) => {
                unwind_va(&mut mem, va, size);
                return Err(e);
            }
        };

        if let Err(e) = pagetable::bind(&mut mem.vmem, va, &backing.bus_addrs(), readonly) {
            backing.release(&mut mem);
            unwind_va(&mut mem, va, size);
            return Err(e);
        }
        drop(mem);

        log::trace!(
            "object: size=0x{size:x} hw_addr=0x{va:x} {:?}",
            backing.kind()
        );

        Ok(Self {
            size,
            flags,
            hw_addr: va,
            page_offset: 0,
            page_mode,
            backing,
            description,
            mmap_offset: None,
            client: Arc::clone(client),
        })
    }

    /// Wrap caller-owned contiguous memory at `phys` as an object.
    pub(crate) fn create_external(
        src: ObjectSource<'_>,
        client: &Arc<ClientPrivate>,
        phys: u64,
        size: u64,
        flags: u32,
        description: Option<&str>,
    ) -> V3dResult<Self> {
        if size == 0 {
            return Err(V3dError::InvalidArgument(
                "external object of zero size".into(),
            ));
        }
        if !src.config.dma_capable(phys, size) {
            log::warn!("external object 0x{phys:x}+0x{size:x} is beyond the MMU address range");
            return Err(V3dError::InvalidArgument(format!(
                "0x{phys:x}+0x{size:x} is not addressable by the MMU"
            )));
        }

        let page_mode = src.config.page_mode;
        let page_size = page_mode.size();
        let page_offset = phys & (page_size - 1);
        let alloc_size = size
            .checked_add(page_offset)
            .and_then(|s| round_up(s, page_size))
            .ok_or(V3dError::OutOfMemory)?;
        let readonly = flags & V3D_CREATE_HW_READONLY != 0;
        let description = copy_description(description, src.config.max_ext_description_len);

        let mut mem = client.memory();
        mem.vmem.init(client.provider())?;

        let va = mem.vmem.allocate(alloc_size)?;

        #[allow(clippy::cast_possible_truncation)]
        let count = (alloc_size / page_size) as usize;
        if let Err(e) = pagetable::bind_external(&mut mem.vmem, phys, count, va, readonly) {
            unwind_va(&mut mem, va, alloc_size);
            return Err(e);
        }
        drop(mem);

        log::trace!("external object: phys=0x{phys:x} size=0x{alloc_size:x} hw_addr=0x{va:x}");

        Ok(Self {
            size: alloc_size,
            flags,
            hw_addr: va,
            page_offset,
            page_mode,
            backing: Backing::External { phys },
            description,
            mmap_offset: None,
            client: Arc::clone(client),
        })
    }

    /// Unbind the object, give back its memory and its client reference.
    pub(crate) fn release(self, offsets: &mut ExtentPool) {
        let Self {
            size,
            hw_addr,
            backing,
            mmap_offset,
            client,
            ..
        } = self;

        if let Some(offset) = mmap_offset
            && !offsets.free_va(offset, size)
        {
            log::warn!("mmap offset 0x{offset:x}+0x{size:x} was not reserved");
        }

        let mut mem = client.memory();
        if let Err(e) = mem.vmem.free(hw_addr, size) {
            log::error!("freeing object va 0x{hw_addr:x}: {e}");
        }
        backing.release(&mut mem);
        drop(mem);

        log::trace!("released object at 0x{hw_addr:x}");
        drop(client);
    }

    /// Size of the object's hardware mapping.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn flags(&self) -> u32 {
        self.flags
    }

    /// Hardware address reported to the caller.
    #[must_use]
    pub const fn hw_addr(&self) -> u64 {
        self.hw_addr + self.page_offset
    }

    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        self.backing.kind()
    }

    #[must_use]
    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    #[must_use]
    pub const fn mmap_offset(&self) -> Option<u64> {
        self.mmap_offset
    }

    #[must_use]
    pub const fn write_combine(&self) -> bool {
        self.flags & V3D_CREATE_CPU_WRITECOMBINE != 0
    }

    /// The object's CPU mapping offset, assigned on first request.
    pub(crate) fn assign_mmap_offset(&mut self, offsets: &mut ExtentPool) -> V3dResult<u64> {
        if matches!(self.backing, Backing::External { .. }) {
            return Err(V3dError::PermissionDenied);
        }
        if let Some(offset) = self.mmap_offset {
            return Ok(offset);
        }
        let offset = offsets.allocate_va(self.size).ok_or(V3dError::OutOfMemory)?;
        self.mmap_offset = Some(offset);
        Ok(offset)
    }

    /// Host frame backing 4 KiB page `index` of the object.
    pub(crate) fn fault_pfn(&self, index: u64) -> V3dResult<u64> {
        let per_page = self.page_mode.entries_per_page() as u64;
        let out_of_range = || {
            V3dError::InvalidArgument(format!("page {index} beyond object of 0x{:x}", self.size))
        };

        #[allow(clippy::cast_possible_truncation)]
        let page = (index / per_page) as usize;
        let sub = index % per_page;

        match &self.backing {
            Backing::Device(pages) => pages
                .get(page)
                .map(|p| p.cpu_pfn() + sub)
                .ok_or_else(out_of_range),
            Backing::Host(pages) if page < pages.page_count() => Ok(pages.cpu_pfn(page) + sub),
            Backing::Host(_) => Err(out_of_range()),
            Backing::External { .. } => Err(V3dError::PermissionDenied),
        }
    }

    pub(crate) fn info(&self, handle: u32) -> ObjectInfo {
        ObjectInfo {
            handle,
            size: self.size,
            hw_addr: self.hw_addr(),
            flags: self.flags,
            kind: self.kind(),
            description: self.description.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions_that_do_not_fit_are_dropped() {
        assert_eq!(copy_description(Some("tex"), 32).as_deref(), Some("tex"));
        assert_eq!(copy_description(Some("x".repeat(31).as_str()), 32).map(|s| s.len()), Some(31));
        assert!(copy_description(Some("x".repeat(32).as_str()), 32).is_none());
        assert!(copy_description(None, 32).is_none());
    }
}
