//! # Virtual Interrupt State
//!
//! What "disabling interrupts" means once the pipeline is in place. For
//! either stage, disabling only sets the stage's stall bit; the CPU keeps
//! taking interrupts, which get logged. Enabling clears the bit and
//! replays the log.
//!
//! The in-band calls may only be made from the in-band stage.

use dovetail_hal::{ArchIrq, IrqFlags};

use super::Pipeline;
use crate::stage::Stage;

/// State returned by [`Pipeline::test_and_lock_stage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLockState {
    hard: IrqFlags,
    inband_stalled: Option<bool>,
    irqsoff: bool,
}

impl StageLockState {
    /// Hard IRQ state before locking
    pub fn hard_flags(&self) -> IrqFlags {
        self.hard
    }

    /// In-band stall state before locking, `None` if locked out-of-band
    pub fn inband_stalled(&self) -> Option<bool> {
        self.inband_stalled
    }

    /// Whether the current stage was already disabled before locking
    pub fn irqsoff(&self) -> bool {
        self.irqsoff
    }
}

impl<A: ArchIrq> Pipeline<A> {
    // =========================================================================
    // In-band stage
    // =========================================================================

    /// Stall the in-band stage
    pub fn inband_irq_disable(&self) {
        self.check_inband_stage();
        self.stall_inband_nocheck();
    }

    /// Unstall the in-band stage and replay its log
    ///
    /// Hard IRQs are expected to be on.
    pub fn inband_irq_enable(&self) {
        warn_on_once!(
            self.hard_irqs_disabled(),
            "in-band IRQs enabled with hard IRQs off"
        );
        self.inband_irq_enable_inner();
    }

    fn inband_irq_enable_inner(&self) {
        self.check_inband_stage();

        let flags = self.hard_irq_save();
        self.unstall_inband_nocheck();
        if self.stage_irqs_pending(Stage::InBand) && !self.on_pipeline_entry() {
            self.sync_current_irq_stage();
        }
        self.hard_irq_restore(flags);
    }

    /// Stall the in-band stage, returning whether it already was
    pub fn inband_irq_save(&self) -> bool {
        self.check_inband_stage();
        self.test_and_stall_inband_nocheck()
    }

    /// Restore a state returned by [`inband_irq_save`](Self::inband_irq_save)
    pub fn inband_irq_restore(&self, stalled: bool) {
        if stalled {
            self.inband_irq_disable();
        } else {
            self.inband_irq_enable_inner();
        }
    }

    /// Whether the in-band stage is stalled
    pub fn inband_irqs_disabled(&self) -> bool {
        self.check_inband_stage();
        self.test_inband_stall()
    }

    /// Replay the in-band log now, leaving hard IRQs off
    pub fn sync_inband_irqs(&self) {
        self.check_inband_stage();
        warn_on_once!(
            self.test_inband_stall(),
            "in-band log synchronized while stalled"
        );

        if !self.hard_irqs_disabled() {
            self.hard_irq_disable();
        }

        if self.stage_irqs_pending(Stage::InBand) {
            self.preempt_disable();
            self.sync_current_irq_stage();
            self.preempt_enable();
        }
    }

    /// Disable hard IRQs, then stall the in-band stage
    pub fn local_irq_disable_full(&self) {
        self.hard_irq_disable();
        self.inband_irq_disable();
    }

    /// Enable hard IRQs, then unstall the in-band stage
    pub fn local_irq_enable_full(&self) {
        self.hard_irq_enable();
        self.inband_irq_enable();
    }

    // =========================================================================
    // Out-of-band stage
    // =========================================================================

    /// Stall the out-of-band stage
    pub fn oob_irq_disable(&self) {
        self.hard_irq_disable();
        self.stall_oob();
    }

    /// Unstall the out-of-band stage and synchronize
    ///
    /// Returns with hard IRQs on.
    pub fn oob_irq_enable(&self) {
        self.hard_irq_disable();
        self.unstall_oob();
        if self.stage_irqs_pending(Stage::OutOfBand) {
            self.synchronize_pipeline();
        }
        self.hard_irq_enable();
    }

    /// Stall the out-of-band stage, returning whether it already was
    pub fn oob_irq_save(&self) -> bool {
        self.hard_irq_disable();
        self.test_and_stall_oob()
    }

    /// Restore a state returned by [`oob_irq_save`](Self::oob_irq_save)
    pub fn oob_irq_restore(&self, stalled: bool) {
        if stalled == self.test_oob_stall() {
            return;
        }
        if !stalled {
            warn_on_once!(
                !self.hard_irqs_disabled(),
                "out-of-band state restored with hard IRQs on"
            );
            self.unstall_oob();
            if self.stage_irqs_pending(Stage::OutOfBand) {
                self.synchronize_pipeline();
            }
            self.hard_irq_enable();
        }
    }

    /// Whether the out-of-band stage is stalled
    pub fn oob_irqs_disabled(&self) -> bool {
        self.test_oob_stall()
    }

    // =========================================================================
    // Stage-agnostic
    // =========================================================================

    /// Whether the current stage may not take interrupts right now
    pub fn stage_disabled(&self) -> bool {
        if self.hard_irqs_disabled() {
            return true;
        }
        self.running_inband() && self.test_inband_stall()
    }

    /// Lock out interrupts for whichever stage is current
    ///
    /// Hard IRQs are disabled, and the in-band stage is stalled when
    /// running in-band.
    pub fn test_and_lock_stage(&self) -> StageLockState {
        let hard = self.hard_irq_save();
        let hard_off = self.arch().irqs_disabled_flags(hard);

        if self.running_inband() {
            let stalled = self.test_and_stall_inband_nocheck();
            StageLockState {
                hard,
                inband_stalled: Some(stalled),
                irqsoff: stalled || hard_off,
            }
        } else {
            StageLockState {
                hard,
                inband_stalled: None,
                irqsoff: hard_off,
            }
        }
    }

    /// Undo [`test_and_lock_stage`](Self::test_and_lock_stage)
    pub fn unlock_stage(&self, state: StageLockState) {
        warn_on_once!(
            !self.hard_irqs_disabled(),
            "stage unlocked with hard IRQs on"
        );

        if self.running_inband() && state.inband_stalled == Some(false) {
            self.unstall_inband_nocheck();
            if !self.arch().irqs_disabled_flags(state.hard)
                && self.stage_irqs_pending(Stage::InBand)
                && !self.on_pipeline_entry()
            {
                self.sync_current_irq_stage();
            }
        }
        self.hard_irq_restore(state.hard);
    }

    /// Disable hard IRQs and, from in-band, preemption
    pub fn hard_preempt_disable(&self) -> IrqFlags {
        let flags = self.hard_irq_save();
        if self.running_inband() {
            self.preempt_disable();
        }
        flags
    }

    /// Undo [`hard_preempt_disable`](Self::hard_preempt_disable)
    pub fn hard_preempt_enable(&self, flags: IrqFlags) {
        if self.running_inband() {
            self.preempt_enable();
        }
        self.hard_irq_restore(flags);
    }

    /// Prepare the CPU for idling
    ///
    /// Pending in-band IRQs are delivered first, in which case idling is
    /// called off. Otherwise the companion core gets the final say. Hard
    /// IRQs are left off either way.
    pub fn irq_cpuidle_enter(&self) -> bool {
        warn_on_once!(
            !self.test_inband_stall(),
            "idle entered with the in-band stage unstalled"
        );

        self.hard_irq_disable();

        if self.stage_irqs_pending(Stage::InBand) {
            self.unstall_inband_nocheck();
            self.synchronize_pipeline();
            self.stall_inband_nocheck();
            return false;
        }

        self.companion()
            .map_or(true, |companion| companion.cpuidle_control(self.arch().this_cpu()))
    }
}
