mod common;

use common::{MIB, cma_device};
use std::ffi::CString;
use std::ptr;
use v3d_gem::drm::ioctl::*;
use v3d_gem::{DeviceConfig, DrmFile};

fn call<T>(file: &DrmFile, cmd: u32, args: &mut T) -> Result<(), i32> {
    unsafe { file.ioctl(cmd, ptr::from_mut(args).cast()) }
}

#[test]
fn create_map_and_close_through_commands() {
    let (device, _cma) = cma_device(DeviceConfig::new());
    let file = device.open().unwrap();

    let desc = CString::new("color buffer").unwrap();
    let mut create = GemCreateArgs {
        size: 0x1800,
        desc: desc.as_ptr() as u64,
        ..Default::default()
    };
    call(&file, DRM_IOCTL_V3D_GEM_CREATE, &mut create).unwrap();
    assert_eq!(create.handle, 1);
    assert_eq!(create.size, 0x2000);
    assert_ne!(create.hw_addr, 0);

    let info = &file.objects()[0];
    assert_eq!(info.description.as_deref(), Some("color buffer"));
    assert_eq!(u64::from(create.hw_addr), info.hw_addr);

    let mut mmap = GemMmapOffsetArgs {
        handle: create.handle,
        ..Default::default()
    };
    call(&file, DRM_IOCTL_V3D_GEM_MMAP_OFFSET, &mut mmap).unwrap();
    assert_eq!(mmap.offset, file.mmap_offset(1).unwrap());

    let mut close = GemCloseArgs {
        handle: create.handle,
        pad: 0,
    };
    call(&file, DRM_IOCTL_GEM_CLOSE, &mut close).unwrap();
    assert_eq!(call(&file, DRM_IOCTL_GEM_CLOSE, &mut close), Err(-libc::ENOENT));
    assert!(file.objects().is_empty());
}

#[test]
fn overlong_descriptions_are_dropped() {
    let (device, _cma) = cma_device(DeviceConfig::new());
    let file = device.open().unwrap();

    let long = CString::new("d".repeat(300)).unwrap();
    let mut create = GemCreateArgs {
        size: 0x1000,
        desc: long.as_ptr() as u64,
        ..Default::default()
    };
    call(&file, DRM_IOCTL_V3D_GEM_CREATE, &mut create).unwrap();

    let ext_desc = CString::new("e".repeat(32)).unwrap();
    let mut ext = GemCreateExtArgs {
        phys: 0x10_0400,
        size: 0x100,
        desc: ext_desc.as_ptr() as u64,
        ..Default::default()
    };
    call(&file, DRM_IOCTL_V3D_GEM_CREATE_EXT, &mut ext).unwrap();
    assert_eq!(ext.hw_addr & 0xfff, 0x400);

    assert!(file.objects().iter().all(|o| o.description.is_none()));
}

#[test]
fn queries() {
    let (device, _cma) = cma_device(DeviceConfig::new());
    let file = device.open().unwrap();

    let mut pt = MmuPagetableArgs::default();
    call(&file, DRM_IOCTL_V3D_GET_MMU_PAGETABLE, &mut pt).unwrap();
    assert_eq!(pt.va_size, 1 << 30);
    assert_ne!(pt.pt_phys, 0);

    let mut total = MemTotalArgs::default();
    call(&file, DRM_IOCTL_V3D_GET_MEM_TOTAL, &mut total).unwrap();
    assert_eq!(total.size, 16 * MIB);

    let mut token = FileTokenArgs::default();
    call(&file, DRM_IOCTL_V3D_GET_FILE_TOKEN, &mut token).unwrap();
    assert_eq!(token.token, file.client_token());
    assert!(token.token >= 0xdead_c1e5_0000_0000);
}

#[test]
fn errors_come_back_as_negative_errno() {
    let (device, _cma) = cma_device(DeviceConfig::new());
    let master = device.open_primary().unwrap();
    let file = device.open().unwrap();

    let mut ext = GemCreateExtArgs {
        phys: 0x1000,
        size: 0x1000,
        flags: V3D_CREATE_CPU_WRITECOMBINE,
        ..Default::default()
    };
    assert_eq!(call(&file, DRM_IOCTL_V3D_GEM_CREATE_EXT, &mut ext), Err(-libc::EINVAL));

    let mut term = FileTokenArgs {
        token: file.client_token(),
    };
    assert_eq!(call(&file, DRM_IOCTL_V3D_SET_CLIENT_TERM, &mut term), Err(-libc::EPERM));
    call(&master, DRM_IOCTL_V3D_SET_CLIENT_TERM, &mut term).unwrap();
    assert_eq!(device.confirmed_dead(), [file.client_token()]);

    let mut zero = GemCreateArgs::default();
    assert_eq!(call(&file, DRM_IOCTL_V3D_GEM_CREATE, &mut zero), Err(-libc::ENOMEM));

    let mut mmap = GemMmapOffsetArgs {
        handle: 42,
        ..Default::default()
    };
    assert_eq!(call(&file, DRM_IOCTL_V3D_GEM_MMAP_OFFSET, &mut mmap), Err(-libc::ENOENT));

    let mut unused = 0u64;
    assert_eq!(call(&file, 0xdead_0000, &mut unused), Err(-libc::EINVAL));
    assert_eq!(
        unsafe { file.ioctl(DRM_IOCTL_V3D_GEM_CREATE, ptr::null_mut()) },
        Err(-libc::EFAULT)
    );
}

#[test]
fn clear_pagetable_on_close_needs_no_argument() {
    let (device, _cma) = cma_device(DeviceConfig::new());
    let file = device.open().unwrap();

    unsafe { file.ioctl(DRM_IOCTL_V3D_CLEAR_PT_ON_CLOSE, ptr::null_mut()) }.unwrap();
    assert!(file.client().inspect(|mem| mem.clear_pagetable_on_close));
}
