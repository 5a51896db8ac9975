//! # Log Synchronization
//!
//! Replays logged IRQs once their stage is unstalled. Every routine here
//! runs with hard IRQs off on the CPU owning the logs.
//!
//! Synchronization walks the stages from the highest priority down and
//! stops at the first stalled one: a stalled out-of-band stage keeps the
//! in-band log on hold too.

use dovetail_hal::{ArchIrq, IrqNumber};

use super::Pipeline;
use crate::stage::Stage;

impl<A: ArchIrq> Pipeline<A> {
    /// Drain the log of the current stage
    ///
    /// The stage is stalled while its handlers run. In-band handlers run
    /// with hard IRQs enabled, out-of-band ones with hard IRQs off. If a
    /// handler leaves the CPU on the in-band stage, draining continues with
    /// the in-band log.
    pub fn sync_current_irq_stage(&self) {
        warn_on_once!(
            self.on_pipeline_entry(),
            "logs synchronized from the pipeline entry code"
        );
        warn_on_once!(
            !self.hard_irqs_disabled(),
            "logs synchronized with hard IRQs on"
        );

        let mut stage = self.current_stage();
        'respin: loop {
            self.this_ctx().stall.stall(stage);

            loop {
                let pd = self.this_staged(stage);
                // SAFETY: own CPU, hard IRQs off; the view ends with the statement.
                let Some(irq) = (unsafe { pd.log_mut() }).pull_lowest() else {
                    break 'respin;
                };
                let irq = irq as IrqNumber;

                if stage.is_inband() {
                    self.hard_irq_enable();
                    self.do_inband_irq(irq);
                    self.hard_irq_disable();
                } else {
                    self.do_oob_irq_number(irq);
                }

                if self.current_stage() != stage {
                    if warn_on_once!(
                        stage.is_inband(),
                        "in-band handler of IRQ {} switched to the out-of-band stage",
                        irq
                    ) {
                        break 'respin;
                    }
                    stage = Stage::InBand;
                    continue 'respin;
                }
            }
        }

        self.this_ctx().stall.unstall(stage);
    }

    /// Drain logs from `top` down to the in-band stage, from in-band
    ///
    /// Stops at the first stalled stage.
    pub fn sync_irq_stage(&self, top: Stage) {
        warn_on_once!(
            !self.running_inband(),
            "stage walk started from the out-of-band stage"
        );
        warn_on_once!(
            !self.hard_irqs_disabled(),
            "stage walk with hard IRQs on"
        );

        let mut stage = top;
        loop {
            if self.test_stall(stage) {
                break;
            }

            if self.stage_irqs_pending(stage) {
                if stage.is_inband() {
                    self.sync_current_irq_stage();
                } else {
                    self.switch_oob(self.this_staged(Stage::OutOfBand));
                    self.sync_current_irq_stage();
                    self.switch_inband(self.this_staged(Stage::InBand));
                }
            }

            if stage.is_inband() {
                break;
            }
            stage = Stage::InBand;
        }
    }

    /// Deliver whatever the current state allows
    ///
    /// From the in-band stage the whole pipeline is walked from the top.
    /// From the top stage itself only its own log is drained.
    pub fn synchronize_pipeline(&self) {
        let (top, stalled) = if self.oob_stage_present() {
            (Stage::OutOfBand, self.test_oob_stall())
        } else {
            (Stage::InBand, self.test_inband_stall())
        };

        if self.current_stage() != top {
            self.sync_irq_stage(top);
        } else if !stalled {
            self.sync_current_irq_stage();
        }
    }

    /// Synchronize on the way out of an interrupt
    #[inline]
    pub fn synchronize_pipeline_on_irq(&self) {
        self.synchronize_pipeline();
    }
}
