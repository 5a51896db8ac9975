//! # Pipeline-Aware Spinlocks
//!
//! Three lock flavors, from bare to stage-aware:
//!
//! | lock               | acquire from in-band                    | acquire on pipeline entry |
//! |--------------------|-----------------------------------------|---------------------------|
//! | [`RawSpinlock`]    | spin only                               | spin only                 |
//! | [`HardSpinlock`]   | hard IRQs off, spin                     | hard IRQs off, spin       |
//! | [`HybridSpinlock`] | hard IRQs off, in-band stalled, no preempt, spin | spin only        |
//!
//! The stage-aware flavors learn about the CPU state through a
//! [`StageContext`], implemented by the pipeline. Recursive acquisition is
//! not detected and spins forever.

mod hard;
mod hybrid;
mod raw;

pub use hard::{HardSpinlock, HardSpinlockGuard};
pub use hybrid::{HybridSpinlock, HybridSpinlockGuard};
pub use raw::RawSpinlock;

use dovetail_hal::IrqFlags;

/// CPU and stage state seen by the stage-aware locks
pub trait StageContext {
    /// Disable hard IRQs, returning the previous state
    fn hard_irq_save(&self) -> IrqFlags;

    /// Restore a saved hard IRQ state
    fn hard_irq_restore(&self, flags: IrqFlags);

    /// Current hard IRQ state
    fn hard_save_flags(&self) -> IrqFlags;

    /// Whether `flags` has hard IRQs disabled
    fn hard_irqs_disabled_flags(&self, flags: IrqFlags) -> bool;

    /// Whether hard IRQs are disabled on this CPU
    fn hard_irqs_disabled(&self) -> bool {
        self.hard_irqs_disabled_flags(self.hard_save_flags())
    }

    /// Whether the in-band stage is current
    fn running_inband(&self) -> bool;

    /// Whether the CPU is inside the pipeline entry code
    fn on_pipeline_entry(&self) -> bool;

    /// Stall the in-band stage, returning whether it already was
    fn test_and_stall_inband(&self) -> bool;

    /// Unstall the in-band stage without replaying its log
    fn unstall_inband(&self);

    /// Disable preemption
    fn preempt_disable(&self);

    /// Enable preemption
    fn preempt_enable(&self);

    /// Replay the in-band log if anything is pending
    ///
    /// Called with hard IRQs off and the in-band stage current.
    fn sync_inband(&self);
}

#[cfg(test)]
mod mock;
