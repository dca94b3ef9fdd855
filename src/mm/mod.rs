pub mod block;
pub mod host;
pub mod pagetable;
pub mod provider;
pub mod vmem;

pub use block::{AllocBlock, BlockAllocator, PageAllocation};
pub use host::{HostBacking, HostPageSource, ShmemPageSource};
pub use pagetable::{HwPte, PageTable};
pub use provider::{ContiguousMemoryProvider, ControllerInfo, SimulatedCma};
pub use vmem::{ExtentPool, HwVirtualMem, VaPool};
