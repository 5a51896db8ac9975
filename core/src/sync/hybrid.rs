//! # Hybrid Spinlock
//!
//! A lock both stages can share without the in-band side ever running with
//! hard IRQs off outside of the critical section itself.
//!
//! From in-band code, the irqsave form disables hard IRQs, stalls the
//! in-band stage and disables preemption before spinning. From the pipeline
//! entry code, where hard IRQs are already off and the in-band state must
//! not be touched, only the raw lock is taken.
//!
//! The hard IRQ state saved at acquisition lives in the lock itself, next
//! to the raw lock word. The in-band stall state travels in the guard.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use dovetail_hal::IrqFlags;

use super::raw::RawSpinlock;
use super::StageContext;

/// How a guard was acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HybridMode {
    /// From the pipeline entry code: raw lock only
    Pipeline,
    /// Hard IRQs off and preemption disabled, stall untouched
    Plain { inband: bool },
    /// Hard IRQs off, in-band stalled and preemption disabled
    IrqSave { inband_stalled: Option<bool> },
}

/// Spinlock shared between the out-of-band and in-band stages
pub struct HybridSpinlock<T> {
    raw: RawSpinlock,
    hwflags: UnsafeCell<IrqFlags>,
    data: UnsafeCell<T>,
}

// SAFETY: `data` and `hwflags` are only touched with `raw` held.
unsafe impl<T: Send> Sync for HybridSpinlock<T> {}
unsafe impl<T: Send> Send for HybridSpinlock<T> {}

impl<T> HybridSpinlock<T> {
    /// Create an unlocked spinlock
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpinlock::new(),
            hwflags: UnsafeCell::new(IrqFlags::from_raw(0)),
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

    /// Acquire without touching the in-band stall bit
    pub fn lock<'a, C: StageContext + ?Sized>(&'a self, ctx: &'a C) -> HybridSpinlockGuard<'a, T, C> {
        if ctx.on_pipeline_entry() {
            self.raw.lock();
            return self.guard(ctx, HybridMode::Pipeline);
        }

        let inband = ctx.running_inband();
        if inband {
            ctx.preempt_disable();
        }
        let flags = ctx.hard_irq_save();
        self.raw.lock();
        // SAFETY: the raw lock is held.
        unsafe { *self.hwflags.get() = flags };
        self.guard(ctx, HybridMode::Plain { inband })
    }

    /// Acquire with the in-band stage stalled and hard IRQs off
    pub fn lock_irqsave<'a, C: StageContext + ?Sized>(
        &'a self,
        ctx: &'a C,
    ) -> HybridSpinlockGuard<'a, T, C> {
        if ctx.on_pipeline_entry() {
            self.raw.lock();
            return self.guard(ctx, HybridMode::Pipeline);
        }

        let flags = ctx.hard_irq_save();
        let inband_stalled = self.stall_inband(ctx);
        self.raw.lock();
        // SAFETY: the raw lock is held.
        unsafe { *self.hwflags.get() = flags };
        self.guard(ctx, HybridMode::IrqSave { inband_stalled })
    }

    /// Like [`lock_irqsave`](Self::lock_irqsave), giving up if the lock is held
    pub fn try_lock_irqsave<'a, C: StageContext + ?Sized>(
        &'a self,
        ctx: &'a C,
    ) -> Option<HybridSpinlockGuard<'a, T, C>> {
        if ctx.on_pipeline_entry() {
            return self
                .raw
                .try_lock()
                .then(|| self.guard(ctx, HybridMode::Pipeline));
        }

        let flags = ctx.hard_irq_save();
        let inband_stalled = self.stall_inband(ctx);
        if !self.raw.try_lock() {
            if let Some(false) = inband_stalled {
                ctx.unstall_inband();
            }
            if inband_stalled.is_some() {
                ctx.preempt_enable();
            }
            ctx.hard_irq_restore(flags);
            return None;
        }
        // SAFETY: the raw lock is held.
        unsafe { *self.hwflags.get() = flags };
        Some(self.guard(ctx, HybridMode::IrqSave { inband_stalled }))
    }

    fn stall_inband<C: StageContext + ?Sized>(&self, ctx: &C) -> Option<bool> {
        if !ctx.running_inband() {
            return None;
        }
        let stalled = ctx.test_and_stall_inband();
        ctx.preempt_disable();
        Some(stalled)
    }

    fn guard<'a, C: StageContext + ?Sized>(
        &'a self,
        ctx: &'a C,
        mode: HybridMode,
    ) -> HybridSpinlockGuard<'a, T, C> {
        HybridSpinlockGuard {
            lock: self,
            ctx,
            mode,
        }
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for HybridSpinlock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HybridSpinlock")
            .field("locked", &self.raw.is_locked())
            .finish_non_exhaustive()
    }
}

/// Guard of a [`HybridSpinlock`]
pub struct HybridSpinlockGuard<'a, T, C: StageContext + ?Sized> {
    lock: &'a HybridSpinlock<T>,
    ctx: &'a C,
    mode: HybridMode,
}

impl<T, C: StageContext + ?Sized> Deref for HybridSpinlockGuard<'_, T, C> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, C: StageContext + ?Sized> DerefMut for HybridSpinlockGuard<'_, T, C> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, C: StageContext + ?Sized> Drop for HybridSpinlockGuard<'_, T, C> {
    fn drop(&mut self) {
        let ctx = self.ctx;

        if self.mode == HybridMode::Pipeline {
            // SAFETY: the guard holds the lock.
            unsafe { self.lock.raw.unlock() };
            return;
        }

        // SAFETY: the guard holds the lock; read the slot before releasing.
        let flags = unsafe { *self.lock.hwflags.get() };
        // SAFETY: the guard holds the lock.
        unsafe { self.lock.raw.unlock() };

        match self.mode {
            HybridMode::Plain { inband } => {
                ctx.hard_irq_restore(flags);
                if inband {
                    ctx.preempt_enable();
                }
            },
            HybridMode::IrqSave { inband_stalled } => {
                if let Some(stalled) = inband_stalled {
                    if !stalled {
                        ctx.unstall_inband();
                        if !ctx.hard_irqs_disabled_flags(flags) {
                            ctx.sync_inband();
                        }
                    }
                    ctx.preempt_enable();
                }
                ctx.hard_irq_restore(flags);
            },
            HybridMode::Pipeline => {},
        }
    }
}
