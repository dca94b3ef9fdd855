#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_NONE: u32 = 0;
const _IOC_WRITE: u32 = 1;
const _IOC_READ: u32 = 2;

/// The DRM ioctl type character (`'d'`).
pub const DRM_IOCTL_BASE: u32 = 0x64;

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

#[must_use]
pub const fn drm_io(nr: u32) -> u32 {
    _ioc(_IOC_NONE, DRM_IOCTL_BASE, nr, 0)
}

#[must_use]
pub const fn drm_ior<T>(nr: u32) -> u32 {
    _ioc(_IOC_READ, DRM_IOCTL_BASE, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn drm_iow<T>(nr: u32) -> u32 {
    _ioc(_IOC_WRITE, DRM_IOCTL_BASE, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn drm_iowr<T>(nr: u32) -> u32 {
    _ioc(_IOC_READ | _IOC_WRITE, DRM_IOCTL_BASE, nr, std::mem::size_of::<T>())
}

/// Extracts the command number from an encoded ioctl.
#[must_use]
pub const fn ioc_nr(cmd: u32) -> u32 {
    (cmd >> _IOC_NRSHIFT) & ((1 << _IOC_NRBITS) - 1)
}

/// Extracts the argument size from an encoded ioctl.
#[must_use]
pub const fn ioc_size(cmd: u32) -> usize {
    ((cmd >> _IOC_SIZESHIFT) & ((1 << _IOC_SIZEBITS) - 1)) as usize
}

/// Round `val` up to the next multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
#[must_use]
pub const fn round_up(val: u64, align: u64) -> Option<u64> {
    match val.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}
