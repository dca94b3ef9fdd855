//! Per-client hardware virtual memory.
//!
//! Each client owns a private 1 GiB hardware address window. Addresses are
//! handed out by an [`ExtentPool`]; the first MMU page is never used so that a
//! zero address is always invalid. The pagetable storage is created on
//! [`HwVirtualMem::init`] and lives in a coherent buffer from the provider.

use crate::config::{HW_PAGE_TABLE_ALIGN, HW_PAGE_TABLE_SIZE, HW_VIRTUAL_ADDR_SIZE, PageMode};
use crate::error::{V3dError, V3dResult};
use crate::mm::pagetable::PageTable;
use crate::mm::provider::ContiguousMemoryProvider;
use crate::utils::round_up;
use std::collections::{BTreeMap, BTreeSet};

/// Allocator of hardware virtual address ranges.
pub trait VaPool {
    /// Returns (base, limit) of the managed window.
    fn bounds(&self) -> (u64, u64);
    fn allocate_va(&mut self, size: u64) -> Option<u64>;
    /// Returns `false` if `[addr, addr + size)` was not a live allocation.
    fn free_va(&mut self, addr: u64, size: u64) -> bool;
}

/// Free-extent pool with best-fit selection by size.
///
/// Free ranges are indexed both by address (for coalescing) and by size
/// (for selection).
#[derive(Debug)]
pub struct ExtentPool {
    base: u64,
    limit: u64,
    granule: u64,
    free_by_addr: BTreeMap<u64, u64>,
    free_by_size: BTreeSet<(u64, u64)>,
    live: BTreeMap<u64, u64>,
}

impl ExtentPool {
    #[must_use]
    pub fn new(base: u64, limit: u64, granule: u64) -> Self {
        let mut pool = Self {
            base,
            limit,
            granule,
            free_by_addr: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            live: BTreeMap::new(),
        };
        if limit > base {
            pool.insert_free(base, limit - base);
        }
        pool
    }

    fn insert_free(&mut self, start: u64, len: u64) {
        self.free_by_addr.insert(start, len);
        self.free_by_size.insert((len, start));
    }

    fn remove_free(&mut self, start: u64, len: u64) {
        self.free_by_addr.remove(&start);
        self.free_by_size.remove(&(len, start));
    }

    /// Bytes currently handed out.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.live.values().sum()
    }

    /// Iterate the live ranges as (address, size).
    pub fn live_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.live.iter().map(|(&a, &s)| (a, s))
    }
}

impl VaPool for ExtentPool {
    fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    fn allocate_va(&mut self, size: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let size = round_up(size, self.granule)?;
        let &(len, start) = self.free_by_size.range((size, 0)..).next()?;

        self.remove_free(start, len);
        if len > size {
            self.insert_free(start + size, len - size);
        }
        self.live.insert(start, size);
        Some(start)
    }

    fn free_va(&mut self, addr: u64, size: u64) -> bool {
        let Some(size) = round_up(size, self.granule) else {
            return false;
        };
        match self.live.get(&addr) {
            Some(&len) if len == size => {
                self.live.remove(&addr);
            }
            _ => return false,
        }

        let mut start = addr;
        let mut len = size;

        if let Some((&prev, &prev_len)) = self.free_by_addr.range(..addr).next_back() {
            if prev + prev_len == addr {
                self.remove_free(prev, prev_len);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free_by_addr.get(&(addr + size)) {
            self.remove_free(addr + size, next_len);
            len += next_len;
        }

        self.insert_free(start, len);
        true
    }
}

/// A client's hardware virtual address space and its pagetable.
#[derive(Debug)]
pub struct HwVirtualMem {
    mode: PageMode,
    pool: Option<ExtentPool>,
    table: Option<PageTable>,
    clear_entries_on_free: bool,
}

impl HwVirtualMem {
    /// An address space with no pool or pagetable yet.
    #[must_use]
    pub const fn new(mode: PageMode) -> Self {
        Self {
            mode,
            pool: None,
            table: None,
            clear_entries_on_free: true,
        }
    }

    /// Create the pool and pagetable. Does nothing if they already exist.
    pub fn init(&mut self, provider: &dyn ContiguousMemoryProvider) -> V3dResult<()> {
        if self.table.is_some() {
            return Ok(());
        }

        let page_size = self.mode.size();
        let pool = ExtentPool::new(page_size, HW_VIRTUAL_ADDR_SIZE, page_size);
        log::debug!(
            "created virtual pool granule=0x{page_size:x} base=0x{page_size:x} size=0x{HW_VIRTUAL_ADDR_SIZE:x}"
        );

        let phys = provider.alloc_coherent(HW_PAGE_TABLE_SIZE, HW_PAGE_TABLE_ALIGN)?;
        if phys & (HW_PAGE_TABLE_ALIGN - 1) != 0 {
            provider.free_coherent(phys, HW_PAGE_TABLE_SIZE);
            return Err(V3dError::invariant(format!(
                "pagetable storage 0x{phys:x} is misaligned"
            )));
        }

        self.pool = Some(pool);
        self.table = Some(PageTable::zeroed(phys));

        log::debug!("created pagetable @ 0x{phys:x} ({HW_PAGE_TABLE_SIZE} bytes)");
        Ok(())
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.table.is_some()
    }

    #[must_use]
    pub const fn page_mode(&self) -> PageMode {
        self.mode
    }

    #[must_use]
    pub const fn clear_entries_on_free(&self) -> bool {
        self.clear_entries_on_free
    }

    pub fn set_clear_entries_on_free(&mut self, clear: bool) {
        self.clear_entries_on_free = clear;
    }

    /// Physical address of the pagetable, if created.
    #[must_use]
    pub fn pagetable_phys(&self) -> Option<u64> {
        self.table.as_ref().map(PageTable::phys)
    }

    #[must_use]
    pub const fn page_table(&self) -> Option<&PageTable> {
        self.table.as_ref()
    }

    pub(crate) fn page_table_mut(&mut self) -> V3dResult<&mut PageTable> {
        self.table
            .as_mut()
            .ok_or_else(|| V3dError::invariant("pagetable used before creation"))
    }

    #[must_use]
    pub const fn pool(&self) -> Option<&ExtentPool> {
        self.pool.as_ref()
    }

    /// Reserve `size` bytes of hardware address space.
    pub fn allocate(&mut self, size: u64) -> V3dResult<u64> {
        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| V3dError::invariant("virtual pool used before creation"))?;
        pool.allocate_va(size).ok_or(V3dError::OutOfMemory)
    }

    /// Return a range, clearing its entries first when the policy asks for it.
    pub fn free(&mut self, va: u64, size: u64) -> V3dResult<()> {
        if self.clear_entries_on_free {
            self.page_table_mut()?.clear_range(va, size)?;
        }

        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| V3dError::invariant("virtual pool used before creation"))?;
        if pool.free_va(va, size) {
            Ok(())
        } else {
            Err(V3dError::invariant(format!(
                "va 0x{va:x}+0x{size:x} was not allocated"
            )))
        }
    }

    /// Drop the pool and return the pagetable storage.
    pub fn destroy(&mut self, provider: &dyn ContiguousMemoryProvider) {
        if let Some(table) = self.table.take() {
            provider.free_coherent(table.phys(), HW_PAGE_TABLE_SIZE);
            log::debug!("freed pagetable @ 0x{:x}", table.phys());
        }
        self.pool = None;
    }
}
