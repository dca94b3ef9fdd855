//! Process-wide entry point for client termination notifications.
//!
//! The component that knows when a client's hardware work has finished is
//! not a session of the device and has no handle on it. It reaches the
//! device through the single registered instance here.

use crate::gem::device::Device;
use std::sync::{Arc, Mutex, PoisonError, Weak};

static TERMINATION_TARGET: Mutex<Option<Weak<Device>>> = Mutex::new(None);

fn target() -> std::sync::MutexGuard<'static, Option<Weak<Device>>> {
    TERMINATION_TARGET
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Route termination notifications to `device`.
pub fn register(device: &Arc<Device>) {
    let mut guard = target();
    if guard.as_ref().and_then(Weak::upgrade).is_some() {
        log::warn!("replacing the registered device");
    }
    *guard = Some(Arc::downgrade(device));
}

/// Stop routing notifications to `device`. Another registered device is left
/// alone.
pub fn unregister(device: &Device) {
    let mut guard = target();
    if guard
        .as_ref()
        .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), device))
    {
        *guard = None;
    }
}

/// The currently registered device, if it is still alive.
#[must_use]
pub fn registered() -> Option<Arc<Device>> {
    target().as_ref().and_then(Weak::upgrade)
}

/// Tell the registered device that client `token` has terminated.
///
/// Returns `false` when no device is registered.
pub fn notify_client_terminated(token: u64) -> bool {
    let Some(device) = registered() else {
        log::debug!("termination of 0x{token:x} with no device registered");
        return false;
    };
    device.notify_client_terminated(token);
    true
}
