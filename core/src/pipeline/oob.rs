//! # Out-of-Band Stage Lifecycle
//!
//! A companion core installs the out-of-band stage when it starts and
//! removes it when it stops. Both are rare, serialized administrative
//! operations; no out-of-band traffic may be in flight while they run.

use alloc::sync::Arc;

use dovetail_hal::ArchIrq;

use super::Pipeline;
use crate::stage::Stage;
use crate::PipelineResult;

/// Hooks a companion core exposes to the pipeline
pub trait CompanionCore: Send + Sync {
    /// An interrupt entered the pipeline on `cpu`
    fn irq_enter_pipeline(&self, _cpu: usize) {}

    /// An interrupt is about to leave the pipeline on `cpu`
    fn irq_exit_pipeline(&self, _cpu: usize) {}

    /// Whether `cpu` may go idle
    fn cpuidle_control(&self, _cpu: usize) -> bool {
        true
    }
}

impl<A: ArchIrq> Pipeline<A> {
    /// Install the out-of-band stage as `name`
    ///
    /// Fails with `Busy` if a stage is already installed, or
    /// `NotSupported` if the architecture refuses.
    pub fn enable_oob_stage(&self, name: &'static str) -> PipelineResult<()> {
        if self.oob.present() {
            return Err(crate::PipelineError::Busy);
        }

        for ctx in self.cpus.iter() {
            // SAFETY: the stage is absent, so nothing can be using its logs.
            unsafe { ctx.staged(Stage::OutOfBand).log_mut() }.clear();
        }

        self.arch().enable_oob_stage()?;

        let flags = self.hard_irq_save();
        self.oob.install(name);
        self.hard_irq_restore(flags);

        log::info!("IRQ pipeline: high-priority {} stage added.", name);
        Ok(())
    }

    /// Remove the out-of-band stage
    ///
    /// Must be called from the in-band stage.
    pub fn disable_oob_stage(&self) {
        if warn_on_once!(
            !self.running_inband() || !self.oob.present(),
            "out-of-band stage removed from the wrong context"
        ) {
            return;
        }

        let name = self.oob.name();
        let flags = self.hard_irq_save();
        self.oob.remove();
        self.hard_irq_restore(flags);

        log::info!("IRQ pipeline: {} stage removed.", name);
    }

    /// Run `f` on the out-of-band stage with that stage stalled
    ///
    /// Whatever became pending meanwhile is synchronized before returning,
    /// and the caller's hard IRQ state is restored.
    pub fn run_oob_call<R>(&self, f: impl FnOnce() -> R) -> R {
        warn_on_once!(!self.oob.present(), "out-of-band call without an out-of-band stage");

        let flags = self.hard_irq_save();

        let from = self.current_stage();
        if from != Stage::OutOfBand {
            self.switch_oob(self.this_staged(Stage::OutOfBand));
        }

        let stalled = self.test_and_stall_oob();
        let ret = f();
        self.hard_irq_disable();
        if !stalled {
            self.unstall_oob();
        }

        if self.running_oob() {
            if from == Stage::OutOfBand {
                if !stalled && self.stage_irqs_pending(Stage::OutOfBand) {
                    self.sync_current_irq_stage();
                }
                self.hard_irq_restore(flags);
                return ret;
            }
            self.switch_inband(self.this_staged(Stage::InBand));
        }

        self.sync_irq_stage(Stage::OutOfBand);
        self.hard_irq_restore(flags);

        ret
    }

    /// Attach or detach the companion core
    pub fn set_companion(&self, companion: Option<Arc<dyn CompanionCore>>) {
        let flags = self.hard_irq_save();
        *self.companion.write() = companion;
        self.hard_irq_restore(flags);
    }

    pub(crate) fn companion(&self) -> Option<Arc<dyn CompanionCore>> {
        self.companion.read().clone()
    }
}
