use crate::utils::{drm_io, drm_ior, drm_iow, drm_iowr};

// ===============================================================================================
// Constants
// ===============================================================================================

pub const DRM_COMMAND_BASE: u32 = 0x40;

/// Map the object read-only in the hardware pagetable.
pub const V3D_CREATE_HW_READONLY: u32 = 0x1;
/// Map the object write-combined, rather than cached, into the CPU.
pub const V3D_CREATE_CPU_WRITECOMBINE: u32 = 0x2;

pub const DRM_V3D_GET_MMU_PAGETABLE: u32 = 0x1;
pub const DRM_V3D_GEM_CREATE: u32 = 0x2;
pub const DRM_V3D_GEM_MMAP_OFFSET: u32 = 0x3;
pub const DRM_V3D_GEM_CREATE_EXT: u32 = 0x4;
pub const DRM_V3D_GET_MEM_TOTAL: u32 = 0x5;
pub const DRM_V3D_GET_FILE_TOKEN: u32 = 0x6;
pub const DRM_V3D_SET_CLIENT_TERM: u32 = 0x7;
pub const DRM_V3D_CLEAR_PT_ON_CLOSE: u32 = 0x8;

/// The core DRM handle close command.
pub const DRM_GEM_CLOSE: u32 = 0x09;

// ===============================================================================================
// Argument structures
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct MmuPagetableArgs {
    /// Physical address of the client's pagetable (up to 40 bits).
    pub pt_phys: u64,
    /// Size of the virtual window the pagetable covers.
    pub va_size: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct MemTotalArgs {
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCreateArgs {
    /// Requested size in, rounded size out.
    pub size: u32,
    pub flags: u32,
    pub handle: u32,
    pub hw_addr: u32,
    /// Optional NUL terminated description, 0 for none.
    pub desc: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemMmapOffsetArgs {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCreateExtArgs {
    /// Start of the external memory, any alignment.
    pub phys: u64,
    pub size: u32,
    /// Only [`V3D_CREATE_HW_READONLY`] is accepted.
    pub flags: u32,
    pub handle: u32,
    /// Address of `phys` itself, not of its page.
    pub hw_addr: u32,
    pub desc: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FileTokenArgs {
    pub token: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCloseArgs {
    pub handle: u32,
    pub pad: u32,
}

// ===============================================================================================
// Command numbers
// ===============================================================================================

pub const DRM_IOCTL_GEM_CLOSE: u32 = drm_iow::<GemCloseArgs>(DRM_GEM_CLOSE);

pub const DRM_IOCTL_V3D_GET_MMU_PAGETABLE: u32 =
    drm_ior::<MmuPagetableArgs>(DRM_COMMAND_BASE + DRM_V3D_GET_MMU_PAGETABLE);
pub const DRM_IOCTL_V3D_GEM_CREATE: u32 =
    drm_iowr::<GemCreateArgs>(DRM_COMMAND_BASE + DRM_V3D_GEM_CREATE);
pub const DRM_IOCTL_V3D_GEM_MMAP_OFFSET: u32 =
    drm_iowr::<GemMmapOffsetArgs>(DRM_COMMAND_BASE + DRM_V3D_GEM_MMAP_OFFSET);
pub const DRM_IOCTL_V3D_GEM_CREATE_EXT: u32 =
    drm_iowr::<GemCreateExtArgs>(DRM_COMMAND_BASE + DRM_V3D_GEM_CREATE_EXT);
pub const DRM_IOCTL_V3D_GET_MEM_TOTAL: u32 =
    drm_ior::<MemTotalArgs>(DRM_COMMAND_BASE + DRM_V3D_GET_MEM_TOTAL);
pub const DRM_IOCTL_V3D_GET_FILE_TOKEN: u32 =
    drm_ior::<FileTokenArgs>(DRM_COMMAND_BASE + DRM_V3D_GET_FILE_TOKEN);
pub const DRM_IOCTL_V3D_SET_CLIENT_TERM: u32 =
    drm_iow::<FileTokenArgs>(DRM_COMMAND_BASE + DRM_V3D_SET_CLIENT_TERM);
pub const DRM_IOCTL_V3D_CLEAR_PT_ON_CLOSE: u32 =
    drm_io(DRM_COMMAND_BASE + DRM_V3D_CLEAR_PT_ON_CLOSE);
