//! # Raw Spinlock
//!
//! The bare test-and-set lock underneath the other flavors.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// Test-and-set spinlock with no stage awareness
#[derive(Debug)]
pub struct RawSpinlock {
    locked: AtomicBool,
}

impl RawSpinlock {
    /// Create an unlocked spinlock
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Spin until the lock is acquired
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Acquire the lock if it is free
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock
    ///
    /// # Safety
    ///
    /// The caller holds the lock.
    pub unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Whether the lock is held
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinlock {
    fn default() -> Self {
        Self::new()
    }
}
