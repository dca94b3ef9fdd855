//! Device configuration.
//!
//! The MMU revision decides the addressing capability of the hardware, the
//! integration decides the page size and when the pagetable is created.

/// Size of one contiguous block requested from a memory controller.
pub const ALLOC_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Size of the hardware virtual address window covered by one pagetable.
pub const HW_VIRTUAL_ADDR_SIZE: u64 = 1 << 30;

/// The pagetable always has one entry per 4 KiB granule.
pub const HW_SMALLEST_PAGE_SHIFT: u32 = 12;

pub const HW_PAGE_TABLE_ENTRY_SIZE: u64 = 4;
pub const HW_PAGE_TABLE_ALIGN: u64 = 4096;
pub const HW_PAGE_TABLE_ENTRIES: u64 = HW_VIRTUAL_ADDR_SIZE >> HW_SMALLEST_PAGE_SHIFT;
pub const HW_PAGE_TABLE_SIZE: u64 = HW_PAGE_TABLE_ENTRY_SIZE * HW_PAGE_TABLE_ENTRIES;

/// Reported when no memory controller is usable.
pub const FALLBACK_TOTAL_MEMORY: u64 = 256 * 1024 * 1024;

/// MMU page size used for objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageMode {
    /// 4 KiB pages, one table entry each.
    #[default]
    Small,
    /// 64 KiB big pages, sixteen duplicated table entries each.
    Big,
}

impl PageMode {
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Small => 12,
            Self::Big => 16,
        }
    }

    #[must_use]
    pub const fn size(self) -> u64 {
        1 << self.shift()
    }

    /// Number of 4 KiB table entries covering one page.
    #[must_use]
    pub const fn entries_per_page(self) -> usize {
        1 << (self.shift() - HW_SMALLEST_PAGE_SHIFT)
    }

    /// Number of pages in one allocation block.
    #[must_use]
    pub const fn pages_per_block(self) -> usize {
        (ALLOC_BLOCK_SIZE >> self.shift()) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub page_mode: PageMode,
    /// Number of physical address bits the MMU can output.
    pub dma_mask_bits: u32,
    /// Never use memory controllers, back every object with host pages.
    pub ignore_cma: bool,
    /// Reject controllers whose memory sits in the low memory zone.
    pub reject_lowmem: bool,
    /// Create the pagetable when a client opens rather than on first use.
    pub eager_pagetable: bool,
    pub max_description_len: usize,
    pub max_ext_description_len: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            page_mode: PageMode::Small,
            dma_mask_bits: 40,
            ignore_cma: false,
            reject_lowmem: false,
            eager_pagetable: false,
            max_description_len: 256,
            max_ext_description_len: 32,
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the configuration for a device-tree compatible string.
    #[must_use]
    pub fn for_compatible(compatible: &str) -> Option<Self> {
        match compatible {
            "brcm,v3d-v3.3.0.0" => Some(Self::new().dma_mask_bits(32)),
            "brcm,v3d-v3.3.1.0" | "brcm,v3d-v4.0.2.0" | "brcm,v3d-v4.1.34.0" => {
                Some(Self::new().dma_mask_bits(40))
            }
            _ => None,
        }
    }

    #[must_use]
    pub const fn big_pages(mut self) -> Self {
        self.page_mode = PageMode::Big;
        self
    }

    #[must_use]
    pub const fn dma_mask_bits(mut self, bits: u32) -> Self {
        self.dma_mask_bits = bits;
        self
    }

    #[must_use]
    pub const fn ignore_cma(mut self) -> Self {
        self.ignore_cma = true;
        self
    }

    #[must_use]
    pub const fn reject_lowmem(mut self) -> Self {
        self.reject_lowmem = true;
        self
    }

    #[must_use]
    pub const fn eager_pagetable(mut self) -> Self {
        self.eager_pagetable = true;
        self
    }

    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.page_mode.size()
    }

    #[must_use]
    pub const fn dma_mask(&self) -> u64 {
        if self.dma_mask_bits >= 64 {
            u64::MAX
        } else {
            (1 << self.dma_mask_bits) - 1
        }
    }

    /// Whether `[addr, addr + size)` is reachable by the MMU.
    #[must_use]
    pub const fn dma_capable(&self, addr: u64, size: u64) -> bool {
        if size == 0 {
            return addr <= self.dma_mask();
        }
        match addr.checked_add(size - 1) {
            Some(last) => last <= self.dma_mask(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_geometry() {
        assert_eq!(PageMode::Small.pages_per_block(), 512);
        assert_eq!(PageMode::Big.pages_per_block(), 32);
        assert_eq!(PageMode::Big.entries_per_page(), 16);
        assert_eq!(HW_PAGE_TABLE_SIZE, 1024 * 1024);
    }

    #[test]
    fn compatible_lookup() {
        let old = DeviceConfig::for_compatible("brcm,v3d-v3.3.0.0").unwrap();
        assert!(old.dma_capable(0xffff_f000, 0x1000));
        assert!(!old.dma_capable(0x1_0000_0000, 0x1000));

        let new = DeviceConfig::for_compatible("brcm,v3d-v4.1.34.0").unwrap();
        assert!(new.dma_capable(0x1_0000_0000, 0x1000));
        assert!(DeviceConfig::for_compatible("brcm,v3d-v9").is_none());
    }
}
