//! The contiguous-memory provider consumed by the allocators.
//!
//! Physically contiguous regions come from per memory controller reservations
//! (CMA devices). The provider also hands out the coherent, host addressable
//! buffers used as pagetable storage.

use crate::error::{V3dError, V3dResult};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Mutex;

/// One memory controller reservation as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerInfo {
    /// Provider side index of the controller (the MEMC number).
    pub memc: u32,
    pub base: u64,
    pub size: u64,
}

pub trait ContiguousMemoryProvider: Send + Sync + Debug {
    /// Every controller reservation, usable or not.
    fn controllers(&self) -> Vec<ControllerInfo>;

    /// Carve `size` bytes aligned to `align` out of controller `memc`.
    fn get_region(&self, memc: u32, size: u64, align: u64) -> V3dResult<u64>;

    /// Return a region obtained from [`get_region`](Self::get_region).
    fn put_region(&self, memc: u32, phys: u64, size: u64);

    /// Whether `phys` sits in the low memory zone with a permanent cached
    /// kernel mapping.
    fn is_lowmem(&self, _phys: u64) -> bool {
        false
    }

    /// Allocate a zeroed coherent buffer and return its physical address.
    fn alloc_coherent(&self, size: u64, align: u64) -> V3dResult<u64>;

    fn free_coherent(&self, phys: u64, size: u64);
}

/// Tracks occupied ranges of one physical window: Start Address -> Size.
#[derive(Debug)]
struct RegionSpace {
    base: u64,
    limit: u64,
    allocations: BTreeMap<u64, u64>,
}

impl RegionSpace {
    fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            limit: base + size,
            allocations: BTreeMap::new(),
        }
    }

    fn align_up(val: u64, align: u64) -> u64 {
        (val + align - 1) & !(align - 1)
    }

    /// First fit over the holes between live allocations.
    fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(1);
        let mut candidate = Self::align_up(self.base, align);

        for (&start, &len) in &self.allocations {
            if start >= candidate && start - candidate >= size {
                break;
            }
            candidate = Self::align_up(start + len, align);
        }

        if candidate.checked_add(size)? <= self.limit {
            self.allocations.insert(candidate, size);
            Some(candidate)
        } else {
            None
        }
    }

    fn free(&mut self, addr: u64, size: u64) -> bool {
        match self.allocations.get(&addr) {
            Some(&len) if len == size => {
                self.allocations.remove(&addr);
                true
            }
            _ => false,
        }
    }

    fn live_bytes(&self) -> u64 {
        self.allocations.values().sum()
    }
}

#[derive(Debug)]
struct SimController {
    info: ControllerInfo,
    space: RegionSpace,
    exhausted: bool,
}

#[derive(Debug)]
struct SimState {
    controllers: Vec<SimController>,
    coherent: RegionSpace,
    coherent_exhausted: bool,
    lowmem_limit: u64,
}

/// An in-process provider over simulated physical address windows.
///
/// Used by the test-suite and for running the allocator without hardware.
#[derive(Debug)]
pub struct SimulatedCma {
    state: Mutex<SimState>,
}

const SIM_COHERENT_BASE: u64 = 0x0800_0000;
const SIM_COHERENT_SIZE: u64 = 64 * 1024 * 1024;

impl Default for SimulatedCma {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCma {
    /// A provider with no controllers and a 64 MiB coherent pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                controllers: Vec::new(),
                coherent: RegionSpace::new(SIM_COHERENT_BASE, SIM_COHERENT_SIZE),
                coherent_exhausted: false,
                lowmem_limit: 0,
            }),
        }
    }

    /// Add a controller reservation; its MEMC number is its insertion index.
    #[must_use]
    pub fn with_controller(self, base: u64, size: u64) -> Self {
        {
            let mut state = self.lock();
            let memc = state.controllers.len() as u32;
            state.controllers.push(SimController {
                info: ControllerInfo { memc, base, size },
                space: RegionSpace::new(base, size),
                exhausted: false,
            });
        }
        self
    }

    /// Addresses below `limit` are reported as low memory.
    #[must_use]
    pub fn with_lowmem_limit(self, limit: u64) -> Self {
        self.lock().lowmem_limit = limit;
        self
    }

    /// Make every request against `memc` fail (or succeed again).
    pub fn set_exhausted(&self, memc: u32, exhausted: bool) {
        if let Some(c) = self.lock().controllers.get_mut(memc as usize) {
            c.exhausted = exhausted;
        }
    }

    pub fn set_coherent_exhausted(&self, exhausted: bool) {
        self.lock().coherent_exhausted = exhausted;
    }

    /// Number of regions currently handed out from `memc`.
    #[must_use]
    pub fn live_regions(&self, memc: u32) -> usize {
        self.lock()
            .controllers
            .get(memc as usize)
            .map_or(0, |c| c.space.allocations.len())
    }

    #[must_use]
    pub fn live_bytes(&self, memc: u32) -> u64 {
        self.lock()
            .controllers
            .get(memc as usize)
            .map_or(0, |c| c.space.live_bytes())
    }

    /// Number of coherent buffers currently handed out.
    #[must_use]
    pub fn live_coherent(&self) -> usize {
        self.lock().coherent.allocations.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ContiguousMemoryProvider for SimulatedCma {
    fn controllers(&self) -> Vec<ControllerInfo> {
        self.lock().controllers.iter().map(|c| c.info).collect()
    }

    fn get_region(&self, memc: u32, size: u64, align: u64) -> V3dResult<u64> {
        let mut state = self.lock();
        let c = state
            .controllers
            .get_mut(memc as usize)
            .ok_or_else(|| V3dError::InvalidArgument(format!("no controller {memc}")))?;

        if c.exhausted {
            return Err(V3dError::OutOfMemory);
        }
        c.space.allocate(size, align).ok_or(V3dError::OutOfMemory)
    }

    fn put_region(&self, memc: u32, phys: u64, size: u64) {
        let mut state = self.lock();
        let freed = state
            .controllers
            .get_mut(memc as usize)
            .is_some_and(|c| c.space.free(phys, size));
        if !freed {
            log::error!("put_region: 0x{phys:x}+0x{size:x} was not handed out by memc {memc}");
        }
    }

    fn is_lowmem(&self, phys: u64) -> bool {
        phys < self.lock().lowmem_limit
    }

    fn alloc_coherent(&self, size: u64, align: u64) -> V3dResult<u64> {
        let mut state = self.lock();
        if state.coherent_exhausted {
            return Err(V3dError::OutOfMemory);
        }
        state
            .coherent
            .allocate(size, align)
            .ok_or(V3dError::OutOfMemory)
    }

    fn free_coherent(&self, phys: u64, size: u64) {
        if !self.lock().coherent.free(phys, size) {
            log::error!("free_coherent: 0x{phys:x}+0x{size:x} was not handed out");
        }
    }
}
