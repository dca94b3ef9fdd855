//! Memory management for the Broadcom V3D GPU.
//!
//! Objects are carved out of 2 MiB blocks taken from contiguous memory
//! controllers, or backed by host pages when no controller is usable. Every
//! session owns a private 1 GiB hardware address space described by a flat
//! pagetable. Memory of a closed session is only given back once the
//! hardware is known to have finished with it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use v3d_gem::{Device, DeviceConfig, SimulatedCma};
//!
//! let cma = SimulatedCma::new().with_controller(0x4000_0000, 64 << 20);
//! let device = Device::load(DeviceConfig::new(), Arc::new(cma));
//! let file = device.open().expect("open");
//! let obj = file.create_object(0x3000, 0, Some("vertices")).expect("create");
//! println!("handle {} at 0x{:x}", obj.handle, obj.hw_addr);
//! ```

pub mod config;
pub mod drm;
pub mod error;
pub mod gem;
pub mod mm;
pub mod sync;
pub mod utils;

pub use config::{DeviceConfig, PageMode};
pub use drm::DrmFile;
pub use error::{V3dError, V3dResult};
pub use gem::{CacheAttr, CpuMapping, CreatedObject, Device, MappingPolicy, ObjectInfo, ObjectKind};
pub use mm::{ContiguousMemoryProvider, HostBacking, HostPageSource, ShmemPageSource, SimulatedCma};
pub use sync::PendingSignal;
