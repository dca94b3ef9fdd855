//! The device lock.
//!
//! All allocator, pagetable and lifetime-list state of a device sits behind one
//! [`StructMutex`]. Waiting for it can be abandoned when the caller's
//! [`PendingSignal`] is raised, in which case the call fails with
//! [`V3dError::Interrupted`] and may be retried.

use crate::error::{V3dError, V3dResult};
use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;

const SPIN_ATTEMPTS: u32 = 64;
const BACKOFF: Duration = Duration::from_micros(50);

/// A signal delivered to the thread issuing a call, such as a process
/// receiving a termination request.
#[derive(Debug, Clone, Default)]
pub struct PendingSignal(Arc<AtomicBool>);

impl PendingSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub struct StructMutex<T> {
    inner: Mutex<T>,
}

impl<T> StructMutex<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Lock, giving up with [`V3dError::Interrupted`] once `signal` is raised.
    pub fn lock_interruptible(&self, signal: &PendingSignal) -> V3dResult<MutexGuard<'_, T>> {
        let mut attempts = 0;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => {
                    log::warn!("device lock poisoned by a panicking holder, recovering");
                    return Ok(poisoned.into_inner());
                }
                Err(TryLockError::WouldBlock) => {}
            }

            if signal.is_raised() {
                return Err(V3dError::Interrupted);
            }

            // Spin briefly, then back off to the scheduler.
            if attempts < SPIN_ATTEMPTS {
                attempts += 1;
                spin_loop();
            } else {
                thread::sleep(BACKOFF);
            }
        }
    }

    /// Lock without honouring signals, for teardown paths that must complete.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Closure convenience, built on the guard.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn uncontended_lock_ignores_signal() {
        let l = StructMutex::new(1u32);
        let signal = PendingSignal::new();
        signal.raise();
        // The lock is free, so a pending signal does not matter.
        let mut g = l.lock_interruptible(&signal).unwrap();
        *g += 1;
        drop(g);
        assert_eq!(l.with_lock(|v| *v), 2);
    }

    #[test]
    fn contended_lock_is_interrupted() {
        let l = Arc::new(StructMutex::new(0u32));
        let held = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let holder = {
            let l = Arc::clone(&l);
            let held = Arc::clone(&held);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                let _g = l.lock();
                held.wait();
                release.wait();
            })
        };

        held.wait();
        let signal = PendingSignal::new();
        signal.raise();
        let res = l.lock_interruptible(&signal);
        assert!(matches!(res, Err(V3dError::Interrupted)));

        release.wait();
        holder.join().unwrap();

        signal.clear();
        assert!(l.lock_interruptible(&signal).is_ok());
    }
}
