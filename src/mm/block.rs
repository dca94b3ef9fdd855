//! # Block allocator
//!
//! Device-local object memory is carved out of 2 MiB physically contiguous
//! blocks obtained from the memory controllers. Each client keeps one ordered
//! list of blocks per controller and hands out single pages from them through
//! a per-block bitmap.
//!
//! Consecutive pages of one request are striped round-robin across the
//! controllers to spread load between memory controllers. A controller that
//! cannot grow falls back to space already held on the others first.
//!
//! Emptied blocks stay in the list until the client itself is released.

use crate::config::{ALLOC_BLOCK_SIZE, PageMode};
use crate::error::{V3dError, V3dResult};
use crate::mm::provider::{ContiguousMemoryProvider, ControllerInfo};

/// One 2 MiB region taken from a memory controller.
#[derive(Debug)]
pub struct AllocBlock {
    memc: u32,
    phys: u64,
    bitmap: Vec<u64>,
    capacity: usize,
    n_allocs: usize,
}

impl AllocBlock {
    fn new(memc: u32, phys: u64, capacity: usize) -> Self {
        Self {
            memc,
            phys,
            bitmap: vec![0; capacity.div_ceil(64)],
            capacity,
            n_allocs: 0,
        }
    }

    #[must_use]
    pub const fn phys(&self) -> u64 {
        self.phys
    }

    #[must_use]
    pub const fn memc(&self) -> u32 {
        self.memc
    }

    /// Number of pages currently handed out from this block.
    #[must_use]
    pub const fn allocated(&self) -> usize {
        self.n_allocs
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.n_allocs == self.capacity
    }

    #[must_use]
    pub fn is_set(&self, bit: usize) -> bool {
        bit < self.capacity && self.bitmap[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn first_zero(&self) -> Option<usize> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
            .map(|(i, w)| i * 64 + w.trailing_ones() as usize)
            .filter(|&bit| bit < self.capacity)
    }

    fn claim(&mut self) -> V3dResult<usize> {
        let bit = self.first_zero().ok_or_else(|| {
            V3dError::invariant(format!(
                "block 0x{:x} has {} of {} pages allocated but no clear bit",
                self.phys, self.n_allocs, self.capacity
            ))
        })?;
        self.bitmap[bit / 64] |= 1 << (bit % 64);
        self.n_allocs += 1;
        Ok(bit)
    }

    fn release(&mut self, bit: usize) -> V3dResult<()> {
        if !self.is_set(bit) {
            return Err(V3dError::invariant(format!(
                "page {bit} of block 0x{:x} released twice",
                self.phys
            )));
        }
        self.bitmap[bit / 64] &= !(1 << (bit % 64));
        self.n_allocs -= 1;
        Ok(())
    }
}

/// One physical page drawn from a block.
///
/// The block is named by index into the owning client's per-controller list,
/// so the allocation is only meaningful together with that client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAllocation {
    pub(crate) controller: usize,
    pub(crate) block: usize,
    pub(crate) bit: usize,
    /// Physical (bus) address of the page.
    pub phys: u64,
}

impl PageAllocation {
    /// Host page frame number of the first 4 KiB of the page.
    #[must_use]
    pub const fn cpu_pfn(&self) -> u64 {
        self.phys >> 12
    }
}

/// Per-client block lists, one per usable controller.
#[derive(Debug)]
pub struct BlockAllocator {
    controllers: Vec<ControllerInfo>,
    mode: PageMode,
    dma_mask: u64,
    blocks: Vec<Vec<AllocBlock>>,
    all_full: Vec<bool>,
    next_alloc_device: usize,
}

impl BlockAllocator {
    #[must_use]
    pub fn new(controllers: Vec<ControllerInfo>, mode: PageMode, dma_mask: u64) -> Self {
        let n = controllers.len();
        Self {
            controllers,
            mode,
            dma_mask,
            blocks: (0..n).map(|_| Vec::new()).collect(),
            // Forces a block to be added on the first request.
            all_full: vec![true; n],
            next_alloc_device: 0,
        }
    }

    #[must_use]
    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    #[must_use]
    pub fn blocks(&self, controller: usize) -> &[AllocBlock] {
        self.blocks.get(controller).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn all_blocks_full(&self, controller: usize) -> bool {
        self.all_full.get(controller).copied().unwrap_or(true)
    }

    /// Controller slot the next page is preferably taken from.
    #[must_use]
    pub const fn next_alloc_device(&self) -> usize {
        self.next_alloc_device
    }

    const fn pages_per_block(&self) -> usize {
        self.mode.pages_per_block()
    }

    /// Get a new block for controller `slot` from the provider.
    fn add_block(&mut self, provider: &dyn ContiguousMemoryProvider, slot: usize) -> Option<usize> {
        let memc = self.controllers[slot].memc;

        let phys = match provider.get_region(memc, ALLOC_BLOCK_SIZE, ALLOC_BLOCK_SIZE) {
            Ok(phys) => phys,
            Err(e) => {
                log::trace!("memc {memc}: no block available ({e})");
                return None;
            }
        };

        if phys.saturating_add(ALLOC_BLOCK_SIZE - 1) > self.dma_mask {
            log::warn!("memc {memc}: block 0x{phys:x} is beyond the MMU address range");
            provider.put_region(memc, phys, ALLOC_BLOCK_SIZE);
            return None;
        }

        let capacity = self.pages_per_block();
        self.blocks[slot].push(AllocBlock::new(memc, phys, capacity));
        self.all_full[slot] = false;

        log::trace!("new block @ 0x{phys:x} ({ALLOC_BLOCK_SIZE} bytes) on memc {memc}");
        Some(self.blocks[slot].len() - 1)
    }

    /// Walk the list of `slot` from its cursor to a block with a free page,
    /// flagging the list full when there is none.
    fn scan_list(&mut self, slot: usize, cursors: &mut [Option<usize>]) -> Option<usize> {
        if self.all_full[slot] {
            return None;
        }

        let list = &self.blocks[slot];
        let start = cursors[slot].unwrap_or(0);
        match (start..list.len()).find(|&idx| !list[idx].is_full()) {
            Some(idx) => {
                cursors[slot] = Some(idx);
                Some(idx)
            }
            None => {
                self.all_full[slot] = true;
                None
            }
        }
    }

    /// Find a block with a free page.
    ///
    /// The preferred controller is tried first, from its list and then from
    /// the provider. When it can give nothing, space already held on the
    /// other controllers is used before any of them grows by a block.
    fn find_block_with_space(
        &mut self,
        provider: &dyn ContiguousMemoryProvider,
        cursors: &mut [Option<usize>],
    ) -> V3dResult<(usize, usize)> {
        let n = self.controllers.len();
        let preferred = self.next_alloc_device;

        if let Some(idx) = self.scan_list(preferred, cursors) {
            return Ok((preferred, idx));
        }
        if let Some(idx) = self.add_block(provider, preferred) {
            cursors[preferred] = Some(idx);
            return Ok((preferred, idx));
        }

        let others = (1..n).map(|i| (preferred + i) % n);
        for slot in others.clone() {
            if let Some(idx) = self.scan_list(slot, cursors) {
                self.next_alloc_device = slot;
                return Ok((slot, idx));
            }
        }
        for slot in others {
            if let Some(idx) = self.add_block(provider, slot) {
                cursors[slot] = Some(idx);
                self.next_alloc_device = slot;
                return Ok((slot, idx));
            }
        }

        Err(V3dError::OutOfMemory)
    }

    /// Allocate `count` pages. Either every page is allocated or none is.
    pub fn acquire_pages(
        &mut self,
        provider: &dyn ContiguousMemoryProvider,
        count: usize,
    ) -> V3dResult<Vec<PageAllocation>> {
        if self.controllers.is_empty() {
            return Err(V3dError::OutOfMemory);
        }

        let mut cursors: Vec<Option<usize>> = (0..self.controllers.len())
            .map(|slot| (!self.all_full[slot] && !self.blocks[slot].is_empty()).then_some(0))
            .collect();

        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            match self.acquire_one(provider, &mut cursors) {
                Ok(page) => pages.push(page),
                Err(e) => {
                    self.release_pages(&pages);
                    return Err(e);
                }
            }
        }

        // Spare the next request a walk over a list with no space in it.
        if let Some(last) = pages.last() {
            let list = &self.blocks[last.controller];
            if last.block + 1 == list.len() && list[last.block].is_full() {
                self.all_full[last.controller] = true;
            }
        }

        log::trace!("allocated {count} pages");
        Ok(pages)
    }

    fn acquire_one(
        &mut self,
        provider: &dyn ContiguousMemoryProvider,
        cursors: &mut [Option<usize>],
    ) -> V3dResult<PageAllocation> {
        let (slot, idx) = self.find_block_with_space(provider, cursors)?;
        let page_size = self.mode.size();
        let block = &mut self.blocks[slot][idx];
        let bit = block.claim()?;
        let phys = block.phys + bit as u64 * page_size;

        self.next_alloc_device = (slot + 1) % self.controllers.len();

        Ok(PageAllocation {
            controller: slot,
            block: idx,
            bit,
            phys,
        })
    }

    /// Return pages to their blocks. Blocks themselves are kept, and the
    /// freed space is found again by the next request.
    pub fn release_pages(&mut self, pages: &[PageAllocation]) {
        for page in pages {
            if let Some(full) = self.all_full.get_mut(page.controller) {
                *full = false;
            }
            let released = self
                .blocks
                .get_mut(page.controller)
                .and_then(|list| list.get_mut(page.block))
                .ok_or_else(|| {
                    V3dError::invariant(format!("page 0x{:x} names no block", page.phys))
                })
                .and_then(|block| block.release(page.bit));
            if let Err(e) = released {
                log::error!("release_pages: {e}");
            }
        }
    }

    /// Hand every block back to its controller.
    pub fn release_all(&mut self, provider: &dyn ContiguousMemoryProvider) {
        for (slot, list) in self.blocks.iter_mut().enumerate() {
            for block in list.drain(..) {
                log::trace!("free block @ 0x{:x}", block.phys);
                provider.put_region(block.memc, block.phys, ALLOC_BLOCK_SIZE);
            }
            self.all_full[slot] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::provider::SimulatedCma;
    use std::collections::HashSet;

    const MIB: u64 = 1024 * 1024;

    fn allocator(cma: &SimulatedCma, mode: PageMode) -> BlockAllocator {
        BlockAllocator::new(cma.controllers(), mode, (1 << 40) - 1)
    }

    #[test]
    fn first_request_adds_a_block() {
        let cma = SimulatedCma::new().with_controller(0x4000_0000, 8 * MIB);
        let mut blocks = allocator(&cma, PageMode::Big);
        assert!(blocks.all_blocks_full(0));

        let pages = blocks.acquire_pages(&cma, 3).unwrap();
        assert_eq!(blocks.blocks(0).len(), 1);
        assert_eq!(blocks.blocks(0)[0].allocated(), 3);
        assert!(!blocks.all_blocks_full(0));
        assert_eq!(pages[1].phys, 0x4000_0000 + 0x10000);
    }

    #[test]
    fn pages_are_striped_across_controllers() {
        let cma = SimulatedCma::new()
            .with_controller(0x4000_0000, 8 * MIB)
            .with_controller(0x8000_0000, 8 * MIB);
        let mut blocks = allocator(&cma, PageMode::Small);

        let pages = blocks.acquire_pages(&cma, 4).unwrap();
        let slots: Vec<_> = pages.iter().map(|p| p.controller).collect();
        assert_eq!(slots, [0, 1, 0, 1]);
        assert_eq!(cma.live_regions(0), 1);
        assert_eq!(cma.live_regions(1), 1);
    }

    #[test]
    fn exhausted_controller_falls_back() {
        let cma = SimulatedCma::new()
            .with_controller(0x4000_0000, 8 * MIB)
            .with_controller(0x8000_0000, 8 * MIB);
        cma.set_exhausted(0, true);
        let mut blocks = allocator(&cma, PageMode::Big);

        let pages = blocks.acquire_pages(&cma, 2).unwrap();
        assert!(pages.iter().all(|p| p.controller == 1));
        assert_eq!(cma.live_regions(0), 0);
    }

    #[test]
    fn fallback_fills_existing_blocks_first() {
        let cma = SimulatedCma::new()
            .with_controller(0x4000_0000, 8 * MIB)
            .with_controller(0x8000_0000, 8 * MIB);
        cma.set_exhausted(0, true);
        let mut blocks = allocator(&cma, PageMode::Big);

        let pages = blocks.acquire_pages(&cma, 8).unwrap();
        assert!(pages.iter().all(|p| p.controller == 1 && p.block == 0));
        assert_eq!(cma.live_regions(1), 1);

        // 32 big pages per block: the next 40 need just two more.
        blocks.acquire_pages(&cma, 40).unwrap();
        assert_eq!(cma.live_regions(1), 2);
        assert_eq!(cma.live_regions(0), 0);
    }

    #[test]
    fn block_beyond_dma_mask_is_returned() {
        let cma = SimulatedCma::new().with_controller(0x1_0000_0000, 8 * MIB);
        let mut blocks = BlockAllocator::new(cma.controllers(), PageMode::Small, u32::MAX.into());

        assert!(matches!(
            blocks.acquire_pages(&cma, 1),
            Err(V3dError::OutOfMemory)
        ));
        assert_eq!(cma.live_regions(0), 0);
    }

    #[test]
    fn failed_batch_rolls_back() {
        let cma = SimulatedCma::new().with_controller(0x4000_0000, 2 * MIB);
        let mut blocks = allocator(&cma, PageMode::Big);

        assert!(blocks.acquire_pages(&cma, 33).is_err());
        assert_eq!(blocks.blocks(0)[0].allocated(), 0);

        // The rolled back block is found again without a new region.
        let pages = blocks.acquire_pages(&cma, 32).unwrap();
        assert_eq!(pages.len(), 32);
        assert_eq!(cma.live_regions(0), 1);
        assert!(blocks.all_blocks_full(0));
    }

    #[test]
    fn no_page_is_handed_out_twice() {
        let cma = SimulatedCma::new()
            .with_controller(0x4000_0000, 16 * MIB)
            .with_controller(0x8000_0000, 16 * MIB);
        let mut blocks = allocator(&cma, PageMode::Big);
        let mut live: Vec<Vec<PageAllocation>> = Vec::new();

        for round in 0..40usize {
            if round % 3 == 2 {
                let batch = live.remove(round % live.len());
                blocks.release_pages(&batch);
            } else {
                live.push(blocks.acquire_pages(&cma, 1 + round % 7).unwrap());
            }

            let mut seen = HashSet::new();
            for p in live.iter().flatten() {
                assert!(seen.insert((p.controller, p.block, p.bit)));
                assert!(blocks.blocks(p.controller)[p.block].is_set(p.bit));
            }
        }
    }

    #[test]
    fn double_release_is_reported_not_applied() {
        let cma = SimulatedCma::new().with_controller(0x4000_0000, 4 * MIB);
        let mut blocks = allocator(&cma, PageMode::Big);
        let pages = blocks.acquire_pages(&cma, 2).unwrap();

        blocks.release_pages(&pages[..1]);
        blocks.release_pages(&pages[..1]);
        assert_eq!(blocks.blocks(0)[0].allocated(), 1);

        blocks.release_all(&cma);
        assert_eq!(cma.live_regions(0), 0);
    }
}
