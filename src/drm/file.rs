use crate::drm::ioctl::{
    DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_V3D_CLEAR_PT_ON_CLOSE, DRM_IOCTL_V3D_GEM_CREATE,
    DRM_IOCTL_V3D_GEM_CREATE_EXT, DRM_IOCTL_V3D_GEM_MMAP_OFFSET, DRM_IOCTL_V3D_GET_FILE_TOKEN,
    DRM_IOCTL_V3D_GET_MEM_TOTAL, DRM_IOCTL_V3D_GET_MMU_PAGETABLE, DRM_IOCTL_V3D_SET_CLIENT_TERM,
    FileTokenArgs, GemCloseArgs, GemCreateArgs, GemCreateExtArgs, GemMmapOffsetArgs,
    MemTotalArgs, MmuPagetableArgs,
};
use crate::error::{V3dError, V3dResult};
use crate::gem::client::ClientPrivate;
use crate::gem::device::{CpuMapping, CreatedObject, Device, PagetableInfo};
use crate::gem::handles::HandleTable;
use crate::gem::object::ObjectInfo;
use crate::sync::PendingSignal;
use std::sync::Arc;

/// One open session on the device.
///
/// Every session has its own hardware address space and pagetable. Dropping
/// the session closes it.
#[derive(Debug)]
pub struct DrmFile {
    device: Arc<Device>,
    client: Arc<ClientPrivate>,
    handles: HandleTable,
    signal: PendingSignal,
}

fn to_u32(val: u64, what: &str) -> V3dResult<u32> {
    u32::try_from(val).map_err(|_| V3dError::invariant(format!("{what} 0x{val:x} exceeds 32 bits")))
}

/// Copy a user supplied description of fewer than `max_len` bytes.
///
/// # Safety
/// `ptr` must be 0 or point to readable memory holding a NUL terminated
/// string or at least `max_len` bytes.
unsafe fn read_description(ptr: u64, max_len: usize) -> Option<String> {
    if ptr == 0 {
        return None;
    }
    let p = ptr as *const libc::c_char;
    let len = unsafe { libc::strnlen(p, max_len) };
    if len >= max_len {
        log::warn!("object description longer than {} bytes dropped", max_len - 1);
        return None;
    }
    let bytes = unsafe { std::slice::from_raw_parts(p.cast::<u8>(), len) };
    Some(String::from_utf8_lossy(bytes).into_owned())
}

impl DrmFile {
    pub(crate) fn new(device: Arc<Device>, client: Arc<ClientPrivate>) -> Self {
        Self {
            device,
            client,
            handles: HandleTable::new(),
            signal: PendingSignal::new(),
        }
    }

    #[must_use]
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[must_use]
    pub const fn client(&self) -> &Arc<ClientPrivate> {
        &self.client
    }

    /// Raising this signal interrupts the session's waits for the device lock.
    #[must_use]
    pub const fn signal(&self) -> &PendingSignal {
        &self.signal
    }

    #[must_use]
    pub fn is_master(&self) -> bool {
        self.device.master() == Some(self.client.id())
    }

    /// Close the session.
    pub fn close(self) {
        drop(self);
    }

    // ===========================================================================================
    // Typed entry points
    // ===========================================================================================

    /// Create the pagetable if needed and report where it is.
    pub fn pagetable_info(&self) -> V3dResult<PagetableInfo> {
        self.device.pagetable_info(&self.client, &self.signal)
    }

    pub fn create_object(
        &self,
        size: u64,
        flags: u32,
        description: Option<&str>,
    ) -> V3dResult<CreatedObject> {
        self.device.create_object(
            &self.client,
            &self.handles,
            &self.signal,
            size,
            flags,
            description,
        )
    }

    /// Wrap caller-owned contiguous memory. The returned address corresponds
    /// to `phys` itself, which need not be page aligned.
    pub fn create_external_object(
        &self,
        phys: u64,
        size: u64,
        flags: u32,
        description: Option<&str>,
    ) -> V3dResult<CreatedObject> {
        self.device.create_external_object(
            &self.client,
            &self.handles,
            &self.signal,
            phys,
            size,
            flags,
            description,
        )
    }

    pub fn mmap_offset(&self, handle: u32) -> V3dResult<u64> {
        self.device.mmap_offset(&self.handles, &self.signal, handle)
    }

    #[must_use]
    pub fn total_memory(&self) -> u64 {
        self.device.total_memory()
    }

    /// Token identifying this client in termination notifications.
    #[must_use]
    pub fn client_token(&self) -> u64 {
        self.client.id()
    }

    /// Report that client `token` has terminated. Master only.
    pub fn notify_client_terminated(&self, token: u64) -> V3dResult<()> {
        if !self.is_master() {
            return Err(V3dError::PermissionDenied);
        }
        self.device
            .notify_client_terminated_interruptible(token, &self.signal)
    }

    /// Keep clearing pagetable entries of objects freed after close.
    pub fn set_clear_pagetable_on_close(&self) -> V3dResult<()> {
        self.device
            .set_clear_pagetable_on_close(&self.client, &self.signal)
    }

    pub fn gem_close(&self, handle: u32) -> V3dResult<()> {
        self.device.close_object(&self.handles, &self.signal, handle)
    }

    /// Resolve a CPU mapping offset obtained from [`mmap_offset`](Self::mmap_offset).
    pub fn mmap(&self, offset: u64) -> V3dResult<CpuMapping> {
        self.device.mmap(&self.handles, offset)
    }

    /// Host page frame for 4 KiB page `page_index` of the mapping at `offset`.
    pub fn fault(&self, offset: u64, page_index: u64) -> V3dResult<u64> {
        self.device
            .fault(&self.handles, &self.signal, offset, page_index)
    }

    /// Published objects. Only takes the handle table lock.
    #[must_use]
    pub fn objects(&self) -> Vec<ObjectInfo> {
        self.handles.objects()
    }

    // ===========================================================================================
    // Raw command interface
    // ===========================================================================================

    fn get_mmu_pagetable(&self, args: &mut MmuPagetableArgs) -> V3dResult<()> {
        let info = self.pagetable_info()?;
        args.pt_phys = info.pt_phys;
        args.va_size = to_u32(info.va_size, "va size")?;
        Ok(())
    }

    /// # Safety
    /// `args.desc` must satisfy [`read_description`].
    unsafe fn gem_create(&self, args: &mut GemCreateArgs) -> V3dResult<()> {
        let max = self.device.config().max_description_len;
        let desc = unsafe { read_description(args.desc, max) };
        let created = self.create_object(u64::from(args.size), args.flags, desc.as_deref())?;

        args.handle = created.handle;
        args.size = to_u32(created.size, "object size")?;
        args.hw_addr = to_u32(created.hw_addr, "hw address")?;
        Ok(())
    }

    /// # Safety
    /// `args.desc` must satisfy [`read_description`].
    unsafe fn gem_create_ext(&self, args: &mut GemCreateExtArgs) -> V3dResult<()> {
        let max = self.device.config().max_ext_description_len;
        let desc = unsafe { read_description(args.desc, max) };
        let created = self.create_external_object(
            args.phys,
            u64::from(args.size),
            args.flags,
            desc.as_deref(),
        )?;

        args.handle = created.handle;
        args.hw_addr = to_u32(created.hw_addr, "hw address")?;
        Ok(())
    }

    /// Execute an encoded device command.
    ///
    /// Failures are reported as negative errno values.
    ///
    /// # Safety
    /// `arg` must point to a valid, writable argument structure of the type
    /// `cmd` encodes, and any description pointer in it must be 0 or point
    /// to a readable NUL terminated string.
    pub unsafe fn ioctl(&self, cmd: u32, arg: *mut libc::c_void) -> Result<(), i32> {
        if arg.is_null() && cmd != DRM_IOCTL_V3D_CLEAR_PT_ON_CLOSE {
            return Err(-libc::EFAULT);
        }

        let res = match cmd {
            DRM_IOCTL_V3D_GET_MMU_PAGETABLE => {
                self.get_mmu_pagetable(unsafe { &mut *arg.cast::<MmuPagetableArgs>() })
            }
            DRM_IOCTL_V3D_GEM_CREATE => unsafe { self.gem_create(&mut *arg.cast::<GemCreateArgs>()) },
            DRM_IOCTL_V3D_GEM_MMAP_OFFSET => {
                let args = unsafe { &mut *arg.cast::<GemMmapOffsetArgs>() };
                self.mmap_offset(args.handle).map(|offset| args.offset = offset)
            }
            DRM_IOCTL_V3D_GEM_CREATE_EXT => unsafe {
                self.gem_create_ext(&mut *arg.cast::<GemCreateExtArgs>())
            },
            DRM_IOCTL_V3D_GET_MEM_TOTAL => {
                let args = unsafe { &mut *arg.cast::<MemTotalArgs>() };
                args.size = self.total_memory();
                Ok(())
            }
            DRM_IOCTL_V3D_GET_FILE_TOKEN => {
                let args = unsafe { &mut *arg.cast::<FileTokenArgs>() };
                args.token = self.client_token();
                Ok(())
            }
            DRM_IOCTL_V3D_SET_CLIENT_TERM => {
                let args = unsafe { &*arg.cast::<FileTokenArgs>() };
                self.notify_client_terminated(args.token)
            }
            DRM_IOCTL_V3D_CLEAR_PT_ON_CLOSE => self.set_clear_pagetable_on_close(),
            DRM_IOCTL_GEM_CLOSE => {
                let args = unsafe { &*arg.cast::<GemCloseArgs>() };
                self.gem_close(args.handle)
            }
            _ => Err(V3dError::InvalidArgument(format!("unknown command 0x{cmd:x}"))),
        };

        res.map_err(|e| {
            log::debug!("command 0x{cmd:x} failed: {e}");
            -e.errno()
        })
    }
}

impl Drop for DrmFile {
    fn drop(&mut self) {
        self.device.close_client(&self.client, &self.handles);
    }
}
