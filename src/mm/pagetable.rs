//! # V3D MMU pagetable
//!
//! The hardware walks a single flat table of 32-bit entries, one entry per
//! 4 KiB granule of the 1 GiB virtual window, so the table is 1 MiB.
//!
//! ```text
//!  31  30       29     28     27                                0
//! +---+--------+------+------+-----------------------------------+
//! | - | BIGPAGE| WRITE| VALID|  physical address >> 12 (40 bit PA) |
//! +---+--------+------+------+-----------------------------------+
//! ```
//!
//! With 64 KiB big pages the sixteen entries covering one page all carry
//! `BIGPAGE` and consecutive frame numbers, so the MMU can be switched back to
//! 4 KiB translation without rebuilding the table.
//!
//! Entries for one object are written as a batch followed by a single write
//! barrier; a reader that learns the object's address afterwards observes the
//! whole mapping.

use crate::config::{HW_PAGE_TABLE_ENTRIES, HW_SMALLEST_PAGE_SHIFT, PageMode};
use crate::error::{V3dError, V3dResult};
use crate::mm::vmem::HwVirtualMem;
use bitfield_struct::bitfield;
use std::sync::atomic::{Ordering, fence};

/// Mask of the flag nibble; a shifted physical address must never reach it.
pub const PAGE_FLAG_MASK: u32 = 0xf000_0000;

/// A single V3D MMU pagetable entry.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct HwPte {
    /// Physical address bits 39..12.
    #[bits(28)]
    pub pfn: u32,
    pub valid: bool,
    pub write: bool,
    pub bigpage: bool,
    #[bits(1)]
    __reserved: u8,
}

impl HwPte {
    /// Build a valid leaf entry for the 4 KiB granule at `pa`.
    pub fn leaf(pa: u64, readonly: bool, big: bool) -> V3dResult<Self> {
        let frame = pa >> HW_SMALLEST_PAGE_SHIFT;
        if frame & u64::from(PAGE_FLAG_MASK) != 0 || frame > u64::from(u32::MAX) {
            return Err(V3dError::invariant(format!(
                "physical address 0x{pa:x} does not fit a pagetable entry"
            )));
        }

        #[allow(clippy::cast_possible_truncation)]
        Ok(Self::new()
            .with_pfn(frame as u32)
            .with_valid(true)
            .with_write(!readonly)
            .with_bigpage(big))
    }

    /// Physical address of the granule this entry points at.
    #[must_use]
    pub fn physical_address(self) -> u64 {
        u64::from(self.pfn()) << HW_SMALLEST_PAGE_SHIFT
    }
}

/// Host copy of one client's pagetable plus the bus address the hardware uses.
#[derive(Debug)]
pub struct PageTable {
    entries: Box<[u32]>,
    phys: u64,
}

impl PageTable {
    /// A zeroed table whose storage lives at bus address `phys`.
    pub(crate) fn zeroed(phys: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let entries = vec![0u32; HW_PAGE_TABLE_ENTRIES as usize].into_boxed_slice();
        Self { entries, phys }
    }

    #[must_use]
    pub const fn phys(&self) -> u64 {
        self.phys
    }

    /// The entry translating hardware virtual address `va`.
    #[must_use]
    pub fn entry(&self, va: u64) -> Option<HwPte> {
        let idx = usize::try_from(va >> HW_SMALLEST_PAGE_SHIFT).ok()?;
        self.entries.get(idx).map(|&e| HwPte::from_bits(e))
    }

    fn index_range(&self, va: u64, granules: usize) -> V3dResult<std::ops::Range<usize>> {
        let start = usize::try_from(va >> HW_SMALLEST_PAGE_SHIFT)
            .map_err(|_| V3dError::invariant(format!("va 0x{va:x} out of range")))?;
        let end = start
            .checked_add(granules)
            .filter(|&end| end <= self.entries.len())
            .ok_or_else(|| {
                V3dError::invariant(format!(
                    "va 0x{va:x} + {granules} entries exceeds the pagetable"
                ))
            })?;
        Ok(start..end)
    }

    /// Commit a prepared batch, then order it before any later publication.
    fn commit(&mut self, va: u64, batch: &[HwPte]) -> V3dResult<()> {
        let range = self.index_range(va, batch.len())?;
        for (slot, pte) in self.entries[range].iter_mut().zip(batch) {
            *slot = pte.into_bits();
        }
        fence(Ordering::Release);
        Ok(())
    }

    /// Zero the entries covering `[va, va + size)`.
    pub(crate) fn clear_range(&mut self, va: u64, size: u64) -> V3dResult<()> {
        #[allow(clippy::cast_possible_truncation)]
        let granules = (size >> HW_SMALLEST_PAGE_SHIFT) as usize;
        let range = self.index_range(va, granules)?;
        self.entries[range].fill(0);
        fence(Ordering::Release);
        Ok(())
    }
}

/// Expand page base addresses into table entries for `mode`.
fn build_entries(
    mode: PageMode,
    pages: impl IntoIterator<Item = u64>,
    readonly: bool,
) -> V3dResult<Vec<HwPte>> {
    let per_page = mode.entries_per_page();
    let big = mode == PageMode::Big;
    let mut batch = Vec::new();

    for pa in pages {
        if pa & (mode.size() - 1) != 0 {
            return Err(V3dError::invariant(format!(
                "page 0x{pa:x} is not aligned to the MMU page size"
            )));
        }
        for i in 0..per_page as u64 {
            batch.push(HwPte::leaf(pa + (i << HW_SMALLEST_PAGE_SHIFT), readonly, big)?);
        }
    }
    Ok(batch)
}

/// Map `pages` (page base bus addresses, in order) at `va`.
///
/// The range must have been reserved from `vmem` and be unbound. Nothing is
/// written unless every page produces a valid entry.
pub fn bind(vmem: &mut HwVirtualMem, va: u64, pages: &[u64], readonly: bool) -> V3dResult<()> {
    let mode = vmem.page_mode();
    let batch = build_entries(mode, pages.iter().copied(), readonly)?;
    vmem.page_table_mut()?.commit(va, &batch)?;
    log::trace!("bound {} pages at va 0x{va:x}", pages.len());
    Ok(())
}

/// Map `page_count` pages of caller-owned contiguous memory starting at the
/// page containing `phys`.
pub fn bind_external(
    vmem: &mut HwVirtualMem,
    phys: u64,
    page_count: usize,
    va: u64,
    readonly: bool,
) -> V3dResult<()> {
    let mode = vmem.page_mode();
    let page_size = mode.size();
    let base = phys & !(page_size - 1);
    let batch = build_entries(
        mode,
        (0..page_count as u64).map(|i| base + i * page_size),
        readonly,
    )?;
    vmem.page_table_mut()?.commit(va, &batch)?;
    log::trace!("bound external 0x{base:x} ({page_count} pages) at va 0x{va:x}");
    Ok(())
}
