//! # Hard Spinlock
//!
//! Serializes with hard IRQs disabled, whatever the current stage. Safe to
//! share between out-of-band and in-band code, at the price of masking the
//! CPU for the whole critical section.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use dovetail_hal::IrqFlags;

use super::raw::RawSpinlock;
use super::StageContext;

/// Spinlock held with hard IRQs disabled
pub struct HardSpinlock<T> {
    raw: RawSpinlock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `raw`.
unsafe impl<T: Send> Sync for HardSpinlock<T> {}
unsafe impl<T: Send> Send for HardSpinlock<T> {}

impl<T> HardSpinlock<T> {
    /// Create an unlocked spinlock
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpinlock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the lock, returning the data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Mutable access through an exclusive borrow
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Whether the lock is held
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Acquire with hard IRQs already disabled by the caller
    pub fn lock<'a, C: StageContext + ?Sized>(&'a self, ctx: &'a C) -> HardSpinlockGuard<'a, T, C> {
        warn_on_once!(
            !ctx.hard_irqs_disabled(),
            "hard spinlock taken with hard IRQs enabled"
        );
        self.raw.lock();
        HardSpinlockGuard {
            lock: self,
            ctx,
            flags: None,
        }
    }

    /// Disable hard IRQs and acquire; the saved state comes back on release
    pub fn lock_irqsave<'a, C: StageContext + ?Sized>(
        &'a self,
        ctx: &'a C,
    ) -> HardSpinlockGuard<'a, T, C> {
        let flags = ctx.hard_irq_save();
        self.raw.lock();
        HardSpinlockGuard {
            lock: self,
            ctx,
            flags: Some(flags),
        }
    }

    /// Like [`lock_irqsave`](Self::lock_irqsave), giving up if the lock is held
    pub fn try_lock_irqsave<'a, C: StageContext + ?Sized>(
        &'a self,
        ctx: &'a C,
    ) -> Option<HardSpinlockGuard<'a, T, C>> {
        let flags = ctx.hard_irq_save();
        if self.raw.try_lock() {
            Some(HardSpinlockGuard {
                lock: self,
                ctx,
                flags: Some(flags),
            })
        } else {
            ctx.hard_irq_restore(flags);
            None
        }
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for HardSpinlock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HardSpinlock")
            .field("locked", &self.raw.is_locked())
            .finish_non_exhaustive()
    }
}

/// Guard of a [`HardSpinlock`]
pub struct HardSpinlockGuard<'a, T, C: StageContext + ?Sized> {
    lock: &'a HardSpinlock<T>,
    ctx: &'a C,
    flags: Option<IrqFlags>,
}

impl<T, C: StageContext + ?Sized> Deref for HardSpinlockGuard<'_, T, C> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, C: StageContext + ?Sized> DerefMut for HardSpinlockGuard<'_, T, C> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, C: StageContext + ?Sized> Drop for HardSpinlockGuard<'_, T, C> {
    fn drop(&mut self) {
        // SAFETY: the guard holds the lock.
        unsafe { self.lock.raw.unlock() };
        if let Some(flags) = self.flags {
            self.ctx.hard_irq_restore(flags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::mock::MockContext;

    #[test]
    fn test_irqsave_restores_exact_flags() {
        let ctx = MockContext::inband_enabled();
        let before = ctx.hard_save_flags();
        let lock = HardSpinlock::new(0u32);
        {
            let mut guard = lock.lock_irqsave(&ctx);
            *guard = 3;
            assert!(ctx.hard_irqs_disabled());
            assert!(lock.is_locked());
        }
        assert_eq!(ctx.hard_save_flags(), before);
        assert!(!ctx.inband_stalled());
        assert_eq!(lock.into_inner(), 3);
    }

    #[test]
    fn test_lock_leaves_flags_alone() {
        let ctx = MockContext::inband_enabled();
        ctx.hard_irq_save();
        let flags = ctx.hard_save_flags();
        let lock = HardSpinlock::new(());
        drop(lock.lock(&ctx));
        assert_eq!(ctx.hard_save_flags(), flags);
    }

    #[test]
    fn test_try_lock_irqsave() {
        let ctx = MockContext::inband_enabled();
        let lock = HardSpinlock::new(());
        let guard = lock.try_lock_irqsave(&ctx);
        assert!(guard.is_some());

        let other = MockContext::inband_enabled();
        assert!(lock.try_lock_irqsave(&other).is_none());
        assert!(!other.hard_irqs_disabled());
        drop(guard);
        assert!(!ctx.hard_irqs_disabled());
    }
}
