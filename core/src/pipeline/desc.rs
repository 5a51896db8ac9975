//! # Line Management
//!
//! Attaching handlers to lines and controlling delivery per line.

use alloc::sync::Arc;

use dovetail_hal::{ArchIrq, IrqChip, IrqNumber};

use super::Pipeline;
use crate::irq::{IrqAction, IrqDesc, IrqHandler, IrqLineFlags, IrqState, IrqStatus};
use crate::{PipelineError, PipelineResult};

impl<A: ArchIrq> Pipeline<A> {
    /// Descriptor of `irq`
    pub fn desc(&self, irq: IrqNumber) -> PipelineResult<&IrqDesc> {
        self.descs
            .get(irq as usize)
            .ok_or(PipelineError::InvalidIrq)
    }

    /// Attach `handler` to `irq`
    ///
    /// Lines flagged [`IrqLineFlags::OOB`] are delivered on the out-of-band
    /// stage whenever one is installed, and require a pipeline-safe chip.
    pub fn request_irq(
        &self,
        irq: IrqNumber,
        handler: Arc<dyn IrqHandler>,
        flags: IrqLineFlags,
        name: &'static str,
    ) -> PipelineResult<()> {
        let desc = self.desc(irq)?;
        {
            let mut state = desc.inner.lock_irqsave(self);
            if state.action.is_some() {
                return Err(PipelineError::AlreadyRegistered);
            }
            if flags.contains(IrqLineFlags::OOB)
                && state.chip.as_ref().is_some_and(|chip| !chip.is_pipeline_safe())
            {
                return Err(PipelineError::NotSupported);
            }

            state.action = Some(IrqAction { handler, name });
            state.flags = flags;
            state.state = IrqState::empty();
            state.irqs_unhandled = 0;
            state.last_unhandled = 0;
            state.unmask(irq);
        }

        log::debug!(
            "IRQ pipeline: IRQ {} attached to {}{}",
            irq,
            name,
            if flags.contains(IrqLineFlags::OOB) {
                " (out-of-band)"
            } else {
                ""
            }
        );
        Ok(())
    }

    /// Detach the handler of `irq`, returning it
    pub fn free_irq(&self, irq: IrqNumber) -> PipelineResult<Arc<dyn IrqHandler>> {
        let desc = self.desc(irq)?;
        let mut state = desc.inner.lock_irqsave(self);
        let action = state.action.take().ok_or(PipelineError::NotRegistered)?;
        state.mask(irq);
        state.flags = IrqLineFlags::empty();
        state.state = IrqState::empty();
        Ok(action.handler)
    }

    /// Set the interrupt chip driving `irq`
    pub fn set_irq_chip(&self, irq: IrqNumber, chip: Arc<dyn IrqChip>) -> PipelineResult<()> {
        let desc = self.desc(irq)?;
        let mut state = desc.inner.lock_irqsave(self);
        if state.is_oob() && !chip.is_pipeline_safe() {
            return Err(PipelineError::NotSupported);
        }
        state.chip = Some(chip);
        Ok(())
    }

    /// Resume delivery of `irq`, lifting a quarantine
    pub fn enable_irq(&self, irq: IrqNumber) -> PipelineResult<()> {
        let desc = self.desc(irq)?;
        let mut state = desc.inner.lock_irqsave(self);
        if state.action.is_none() {
            return Err(PipelineError::NotRegistered);
        }
        state
            .state
            .remove(IrqState::DISABLED | IrqState::SPURIOUS_DISABLED);
        state.irqs_unhandled = 0;
        state.unmask(irq);
        Ok(())
    }

    /// Stop delivery of `irq`
    pub fn disable_irq(&self, irq: IrqNumber) -> PipelineResult<()> {
        let desc = self.desc(irq)?;
        let mut state = desc.inner.lock_irqsave(self);
        state.state.insert(IrqState::DISABLED);
        state.mask(irq);
        Ok(())
    }

    /// Allocate a software-only line and attach `handler` to it
    ///
    /// Synthetic lines are taken from the top of the descriptor table.
    pub fn create_synthetic_irq(
        &self,
        handler: Arc<dyn IrqHandler>,
        flags: IrqLineFlags,
        name: &'static str,
    ) -> PipelineResult<IrqNumber> {
        for desc in self.descs.iter().rev() {
            let mut state = desc.inner.lock_irqsave(self);
            if state.action.is_some() || state.chip.is_some() {
                continue;
            }
            state.action = Some(IrqAction { handler, name });
            state.flags = flags | IrqLineFlags::SYNTHETIC;
            state.state = IrqState::empty();
            state.irqs_unhandled = 0;
            drop(state);

            log::debug!("IRQ pipeline: synthetic IRQ {} created for {}", desc.irq(), name);
            return Ok(desc.irq());
        }
        Err(PipelineError::Busy)
    }

    /// Snapshot of `irq`
    pub fn irq_status(&self, irq: IrqNumber) -> PipelineResult<IrqStatus> {
        let desc = self.desc(irq)?;
        let state = desc.inner.lock_irqsave(self);
        Ok(IrqStatus {
            irq,
            name: state.action.as_ref().map_or("", |action| action.name),
            registered: state.action.is_some(),
            flags: state.flags,
            state: state.state,
            unhandled: state.irqs_unhandled,
            count: desc.count(),
        })
    }
}
