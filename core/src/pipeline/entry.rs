//! # Pipeline Entry
//!
//! The path every hardware interrupt takes, from the architecture trap
//! handler down to a stage.
//!
//! ```text
//!   pipeline_entry          switch to oob, PIPELINE_OFFSET, companion hook
//!   generic_pipeline_irq    oob line ─► handler now │ else ─► in-band log
//!   pipeline_exit           restore stage, synchronize
//! ```
//!
//! Out-of-band handlers run with hard IRQs off and must never enable them.
//! A handler that keeps failing to claim its interrupt, or that returns
//! garbage, gets its line quarantined: the line falls back to in-band
//! delivery, is disabled and masked at the chip.

use dovetail_hal::{ArchIrq, IrqNumber};

use super::Pipeline;
use crate::debug::PIPELINE_DEBUG;
use crate::irq::{DescState, IrqDesc, IrqLineFlags, IrqReturn, IrqState};
use crate::preempt::{HARDIRQ_OFFSET, PIPELINE_OFFSET};
use crate::stage::Stage;
use crate::PipelineResult;

/// State carried from [`Pipeline::pipeline_entry`] to [`Pipeline::pipeline_exit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct PipelineFrame {
    prev: Stage,
}

impl PipelineFrame {
    /// Stage the interrupt preempted
    pub fn preempted_stage(&self) -> Stage {
        self.prev
    }
}

impl<A: ArchIrq> Pipeline<A> {
    /// Run a hardware interrupt through the pipeline
    ///
    /// Called from the architecture trap handler with hard IRQs off.
    /// Returns whether the in-band interrupt epilogue may run: the in-band
    /// stage is current and unstalled.
    pub fn handle_irq_pipelined(&self, irq: IrqNumber) -> bool {
        let frame = self.pipeline_entry();
        self.generic_pipeline_irq(irq);
        self.pipeline_exit(frame)
    }

    /// Enter the pipeline for a hardware interrupt
    pub fn pipeline_entry(&self) -> PipelineFrame {
        warn_on_once!(!self.is_enabled(), "interrupt before pipeline init");
        warn_on_once!(
            !self.hard_irqs_disabled(),
            "pipeline entered with hard IRQs on"
        );

        // An interrupt cannot be taken with the oob stage stalled, since
        // that implies hard IRQs off. Fix up and carry on.
        if PIPELINE_DEBUG {
            if self.test_oob_stall() {
                log::error!("IRQ pipeline: out-of-band stage stalled on IRQ entry");
                self.unstall_oob();
            }
            warn_on_once!(self.on_pipeline_entry(), "nested pipeline entry");
        }

        let prev = self.switch_stage_on_irq();

        if let Some(companion) = self.companion() {
            companion.irq_enter_pipeline(self.arch().this_cpu());
        }

        let ctx = self.this_ctx();
        ctx.preempt.add(PIPELINE_OFFSET);
        ctx.rcu_nmi_nesting
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);

        PipelineFrame { prev }
    }

    /// Leave the pipeline, synchronizing the preempted stage
    ///
    /// Returns whether the in-band interrupt epilogue may run.
    pub fn pipeline_exit(&self, frame: PipelineFrame) -> bool {
        let ctx = self.this_ctx();
        ctx.rcu_nmi_nesting
            .fetch_sub(1, core::sync::atomic::Ordering::Relaxed);
        ctx.preempt.sub(PIPELINE_OFFSET);

        if let Some(companion) = self.companion() {
            companion.irq_exit_pipeline(self.arch().this_cpu());
        }

        self.restore_stage_on_irq(frame.prev);
        self.synchronize_pipeline_on_irq();

        self.running_inband() && !self.test_inband_stall()
    }

    /// Dispatch `irq` from the pipeline entry code
    pub fn generic_pipeline_irq(&self, irq: IrqNumber) {
        let Some(desc) = self.descs.get(irq as usize) else {
            warn_on_once!(true, "spurious IRQ {} beyond the descriptor table", irq);
            return;
        };
        self.handle_oob_irq(desc);
    }

    /// Run an out-of-band handler for `desc` now, or log the IRQ in-band
    ///
    /// Returns `true` if the IRQ was delivered to the out-of-band stage.
    pub fn handle_oob_irq(&self, desc: &IrqDesc) -> bool {
        let irq = desc.irq();
        let is_oob = desc.inner.lock_irqsave(self).is_oob();

        if !self.oob_stage_present() || !is_oob {
            self.irq_post_inband(irq);
            return false;
        }

        warn_on_once!(
            self.running_inband(),
            "out-of-band IRQ {} handled from the in-band stage",
            irq
        );

        let stalled = self.test_and_stall_oob();
        self.do_oob_irq(desc);
        if !stalled {
            self.unstall_oob();
        }

        true
    }

    /// Raise `irq` in software, as if the hardware had
    ///
    /// An out-of-band line hitting a stalled out-of-band stage is logged
    /// there; anything else goes through the regular entry path.
    pub fn irq_inject_pipeline(&self, irq: IrqNumber) -> PipelineResult<()> {
        let desc = self.desc(irq)?;
        let flags = self.hard_irq_save();

        let is_oob = desc.inner.lock_irqsave(self).is_oob();
        if self.oob_stage_present() && is_oob && self.test_oob_stall() {
            self.irq_post_oob(irq);
        } else {
            let prev = self.switch_stage_on_irq();
            if let Some(companion) = self.companion() {
                companion.irq_enter_pipeline(self.arch().this_cpu());
            }
            self.handle_oob_irq(desc);
            if let Some(companion) = self.companion() {
                companion.irq_exit_pipeline(self.arch().this_cpu());
            }
            self.restore_stage_on_irq(prev);
            self.synchronize_pipeline_on_irq();
        }

        self.hard_irq_restore(flags);
        Ok(())
    }

    fn switch_stage_on_irq(&self) -> Stage {
        let prev = self.current_stage();
        if self.oob_stage_present() && prev != Stage::OutOfBand {
            self.switch_oob(self.this_staged(Stage::OutOfBand));
        }
        prev
    }

    fn restore_stage_on_irq(&self, prev: Stage) {
        if prev == Stage::InBand && self.running_oob() {
            self.switch_inband(self.this_staged(Stage::InBand));
        }
    }

    // =========================================================================
    // Handler invocation
    // =========================================================================

    pub(crate) fn do_oob_irq_number(&self, irq: IrqNumber) {
        match self.descs.get(irq as usize) {
            Some(desc) => self.do_oob_irq(desc),
            None => log::warn!("IRQ pipeline: no descriptor for out-of-band IRQ {}", irq),
        }
    }

    /// Call the out-of-band handler of `desc`, hard IRQs off
    fn do_oob_irq(&self, desc: &IrqDesc) {
        let irq = desc.irq();
        self.run_handler(desc, |state, ret| {
            if ret.contains(IrqReturn::HANDLED) {
                state.irqs_unhandled = 0;
            } else {
                self.handle_unexpected_irq(state, irq, ret);
            }
        });
    }

    /// Run the handler of `desc`, serialized across CPUs
    ///
    /// An event hitting a line whose handler is busy on another CPU only
    /// marks it [`IrqState::PENDING`]; the busy CPU runs the handler again
    /// before letting go of the line. Per-CPU lines are not serialized.
    fn run_handler(&self, desc: &IrqDesc, mut check: impl FnMut(&mut DescState, IrqReturn)) {
        let irq = desc.irq();

        let (mut action, per_cpu) = {
            let mut state = desc.inner.lock_irqsave(self);
            if state.state.contains(IrqState::DISABLED) {
                return;
            }
            let Some(action) = state.action.clone() else {
                log::warn!("IRQ pipeline: no handler for IRQ {}", irq);
                return;
            };
            let per_cpu = state.flags.contains(IrqLineFlags::PER_CPU);
            if !per_cpu {
                if state.state.contains(IrqState::IN_PROGRESS) {
                    state.state.insert(IrqState::PENDING);
                    return;
                }
                state.state.insert(IrqState::IN_PROGRESS);
            }
            (action, per_cpu)
        };

        loop {
            desc.account(self.arch().this_cpu());
            let ret = action.handler.handle(irq);

            let mut state = desc.inner.lock_irqsave(self);
            check(&mut *state, ret);
            if per_cpu {
                return;
            }

            let replay = state.state.contains(IrqState::PENDING)
                && !state.state.contains(IrqState::DISABLED);
            let next = if replay { state.action.clone() } else { None };
            state.state.remove(IrqState::PENDING);
            match next {
                Some(next) => action = next,
                None => {
                    state.state.remove(IrqState::IN_PROGRESS);
                    return;
                },
            }
        }
    }

    fn handle_unexpected_irq(&self, state: &mut DescState, irq: IrqNumber, ret: IrqReturn) {
        if ret != IrqReturn::NONE {
            log::error!(
                "IRQ pipeline: out-of-band handler of IRQ {} returned bogus status {:#x}, disabling",
                irq,
                ret.bits()
            );
            Self::quarantine(state, irq);
            return;
        }

        let now = self.arch().clock_ticks();
        if now > state.last_unhandled.saturating_add(self.config().unhandled_window) {
            state.irqs_unhandled = 0;
        } else {
            state.irqs_unhandled = state.irqs_unhandled.saturating_add(1);
        }
        state.last_unhandled = now;

        if state.irqs_unhandled > self.config().unhandled_limit {
            log::error!(
                "IRQ pipeline: out-of-band IRQ {} stuck or unexpected, disabling",
                irq
            );
            Self::quarantine(state, irq);
        }
    }

    fn quarantine(state: &mut DescState, irq: IrqNumber) {
        state.flags.remove(IrqLineFlags::OOB);
        state
            .state
            .insert(IrqState::DISABLED | IrqState::SPURIOUS_DISABLED);
        state.mask(irq);
    }

    /// Call the in-band handler of `irq`, hard IRQs on, in-band stalled
    pub(crate) fn do_inband_irq(&self, irq: IrqNumber) {
        let ctx = self.this_ctx();
        ctx.preempt.add(HARDIRQ_OFFSET);
        self.arch()
            .do_irq_pipelined(irq, &|irq| self.handle_inband_irq(irq));
        ctx.preempt.sub(HARDIRQ_OFFSET);

        warn_on_once!(
            !self.test_inband_stall(),
            "in-band handler of IRQ {} left the stage unstalled",
            irq
        );
    }

    fn handle_inband_irq(&self, irq: IrqNumber) {
        let Some(desc) = self.descs.get(irq as usize) else {
            log::warn!("IRQ pipeline: no descriptor for in-band IRQ {}", irq);
            return;
        };

        self.run_handler(desc, |_, ret| {
            if ret == IrqReturn::NONE {
                log::trace!("IRQ pipeline: in-band IRQ {} not claimed", irq);
            }
        });
    }
}
