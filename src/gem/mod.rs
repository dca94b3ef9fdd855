pub mod client;
pub mod device;
pub mod handles;
pub mod object;
pub mod registry;

pub use client::{ClientMemory, ClientPrivate};
pub use device::{
    CacheAttr, CpuMapping, CreatedObject, DefaultMappingPolicy, Device, DeviceBuilder,
    MappingPolicy, PagetableInfo,
};
pub use handles::HandleTable;
pub use object::{Backing, GemObject, ObjectInfo, ObjectKind};
