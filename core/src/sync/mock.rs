//! Stand-alone [`StageContext`] for lock tests.

use core::cell::Cell;

use dovetail_hal::IrqFlags;

use super::StageContext;

const IRQ_ENABLE: usize = 1 << 9;

/// Single-CPU state machine with no pipeline behind it
#[derive(Debug, Default)]
pub(crate) struct MockContext {
    hard: Cell<usize>,
    inband_stalled: Cell<bool>,
    running_oob: Cell<bool>,
    pipeline_entry: Cell<bool>,
    preempt: Cell<u32>,
    syncs: Cell<u32>,
}

impl MockContext {
    /// In-band, unstalled, hard IRQs on, a tag bit set in the flags
    pub(crate) fn inband_enabled() -> Self {
        let ctx = Self::default();
        ctx.hard.set(IRQ_ENABLE | 0x46);
        ctx
    }

    pub(crate) fn inband_stalled(&self) -> bool {
        self.inband_stalled.get()
    }

    pub(crate) fn set_inband_stalled(&self, stalled: bool) {
        self.inband_stalled.set(stalled);
    }

    pub(crate) fn set_running_oob(&self, oob: bool) {
        self.running_oob.set(oob);
    }

    pub(crate) fn set_on_pipeline_entry(&self, entry: bool) {
        self.pipeline_entry.set(entry);
    }

    pub(crate) fn preempt_depth(&self) -> u32 {
        self.preempt.get()
    }

    pub(crate) fn syncs(&self) -> u32 {
        self.syncs.get()
    }
}

impl StageContext for MockContext {
    fn hard_irq_save(&self) -> IrqFlags {
        let old = self.hard.get();
        self.hard.set(old & !IRQ_ENABLE);
        IrqFlags::from_raw(old)
    }

    fn hard_irq_restore(&self, flags: IrqFlags) {
        self.hard.set(flags.raw());
    }

    fn hard_save_flags(&self) -> IrqFlags {
        IrqFlags::from_raw(self.hard.get())
    }

    fn hard_irqs_disabled_flags(&self, flags: IrqFlags) -> bool {
        flags.raw() & IRQ_ENABLE == 0
    }

    fn running_inband(&self) -> bool {
        !self.running_oob.get()
    }

    fn on_pipeline_entry(&self) -> bool {
        self.pipeline_entry.get()
    }

    fn test_and_stall_inband(&self) -> bool {
        self.inband_stalled.replace(true)
    }

    fn unstall_inband(&self) {
        self.inband_stalled.set(false);
    }

    fn preempt_disable(&self) {
        self.preempt.set(self.preempt.get() + 1);
    }

    fn preempt_enable(&self) {
        self.preempt.set(self.preempt.get() - 1);
    }

    fn sync_inband(&self) {
        assert!(self.hard_irqs_disabled());
        self.syncs.set(self.syncs.get() + 1);
    }
}
