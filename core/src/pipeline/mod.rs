//! # Interrupt Pipeline
//!
//! [`Pipeline`] owns everything the two stages share: the per-CPU contexts
//! (stage logs, preemption counter, live stall word), the IRQ descriptor
//! table, the out-of-band stage slot and the companion core hooks.
//!
//! There are no globals. Architecture code keeps one `Pipeline` for the
//! lifetime of the system and calls into it from its trap handlers.
//!
//! ## Stage Switching
//!
//! ```text
//!   in-band ──switch_oob──► out-of-band
//!      ▲                        │
//!      └──────switch_inband─────┘
//! ```
//!
//! Switching is one add or subtract on the per-CPU preemption counter.
//! Every switch to the out-of-band stage is paired with a switch back
//! before the in-band stage resumes.

mod desc;
mod entry;
mod irqflags;
mod oob;
mod synchronize;

#[cfg(test)]
mod tests;

pub use entry::PipelineFrame;
pub use irqflags::StageLockState;
pub use oob::CompanionCore;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use dovetail_hal::{ArchIrq, IrqFlags, IrqNumber};
use spin::RwLock;

use crate::config::{PipelineConfig, IRQ_BITMAP_BITS};
use crate::debug::PIPELINE_DEBUG;
use crate::irq::IrqDesc;
use crate::percpu::PerCpu;
use crate::preempt::{PreemptCount, NMI_OFFSET, PREEMPT_OFFSET, STAGE_MASK, STAGE_OFFSET};
use crate::stage::{OobSlot, Stage, StageData, NR_STAGES};
use crate::stall::{StallBits, TaskStall};
use crate::sync::StageContext;
use crate::{PipelineError, PipelineResult};

// =============================================================================
// Per-CPU context
// =============================================================================

/// Pipeline state of one CPU
#[derive(Debug)]
pub struct CpuContext {
    stages: [StageData; NR_STAGES],
    preempt: PreemptCount,
    stall: TaskStall,
    nmi_saved_stall: AtomicUsize,
    rcu_nmi_nesting: AtomicU32,
}

impl CpuContext {
    fn new(cpu: usize) -> Self {
        Self {
            stages: [
                StageData::new(Stage::InBand, cpu),
                StageData::new(Stage::OutOfBand, cpu),
            ],
            preempt: PreemptCount::new(),
            stall: TaskStall::new(),
            nmi_saved_stall: AtomicUsize::new(0),
            rcu_nmi_nesting: AtomicU32::new(0),
        }
    }

    /// Stage context of `stage` on this CPU
    pub fn staged(&self, stage: Stage) -> &StageData {
        &self.stages[stage.index()]
    }

    /// Preemption counter
    pub fn preempt(&self) -> &PreemptCount {
        &self.preempt
    }

    /// Stall word of the task running on this CPU
    pub fn stall(&self) -> &TaskStall {
        &self.stall
    }

    /// Depth of the RCU read side opened by pipeline entries
    pub fn rcu_nmi_nesting(&self) -> u32 {
        self.rcu_nmi_nesting.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Two-stage interrupt pipeline
pub struct Pipeline<A: ArchIrq> {
    arch: A,
    config: PipelineConfig,
    oob: OobSlot,
    cpus: PerCpu<CpuContext>,
    descs: Box<[IrqDesc]>,
    companion: RwLock<Option<Arc<dyn CompanionCore>>>,
    enabled: AtomicBool,
    oopsing: AtomicBool,
}

impl<A: ArchIrq> Pipeline<A> {
    /// Build a pipeline for every CPU `arch` reports
    ///
    /// Each CPU starts on the in-band stage, stalled, with empty logs.
    pub fn new(arch: A, config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        let nr_cpus = arch.nr_cpus();
        if nr_cpus == 0 {
            return Err(PipelineError::InvalidConfig);
        }

        let descs = (0..config.nr_irqs)
            .map(|irq| IrqDesc::new(irq as IrqNumber, nr_cpus))
            .collect();

        Ok(Self {
            arch,
            config,
            oob: OobSlot::new(),
            cpus: PerCpu::new(nr_cpus, CpuContext::new),
            descs,
            companion: RwLock::new(None),
            enabled: AtomicBool::new(false),
            oopsing: AtomicBool::new(false),
        })
    }

    /// Start pipelining interrupts
    pub fn init(&self) {
        if self.enabled.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!(
            "IRQ pipeline enabled: {} CPU(s), {} IRQ(s), {}-level event logs",
            self.cpus.len(),
            self.descs.len(),
            crate::event_log::map_levels(IRQ_BITMAP_BITS)
        );
    }

    /// Whether [`init`](Self::init) ran
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Architecture backend
    pub fn arch(&self) -> &A {
        &self.arch
    }

    /// Runtime configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Context of `cpu`
    pub fn cpu_context(&self, cpu: usize) -> Option<&CpuContext> {
        self.cpus.get(cpu)
    }

    #[inline]
    pub(crate) fn this_ctx(&self) -> &CpuContext {
        self.cpus.this(&self.arch)
    }

    // =========================================================================
    // Hard interrupt state
    // =========================================================================

    /// Disable hard IRQs, returning the previous state
    #[inline]
    pub fn hard_irq_save(&self) -> IrqFlags {
        self.arch.local_irq_save()
    }

    /// Restore a saved hard IRQ state
    #[inline]
    pub fn hard_irq_restore(&self, flags: IrqFlags) {
        self.arch.local_irq_restore(flags);
    }

    /// Enable hard IRQs
    #[inline]
    pub fn hard_irq_enable(&self) {
        self.arch.local_irq_enable();
    }

    /// Disable hard IRQs
    #[inline]
    pub fn hard_irq_disable(&self) {
        self.arch.local_irq_disable();
    }

    /// Whether hard IRQs are disabled on this CPU
    #[inline]
    pub fn hard_irqs_disabled(&self) -> bool {
        self.arch.irqs_disabled()
    }

    // =========================================================================
    // Stages
    // =========================================================================

    /// Stage running on this CPU
    #[inline]
    pub fn current_stage(&self) -> Stage {
        Stage::from_index(self.this_ctx().preempt.stage_level())
    }

    /// Whether the in-band stage is current
    #[inline]
    pub fn running_inband(&self) -> bool {
        self.current_stage() == Stage::InBand
    }

    /// Whether the out-of-band stage is current
    #[inline]
    pub fn running_oob(&self) -> bool {
        self.current_stage() == Stage::OutOfBand
    }

    /// Whether an out-of-band stage is installed
    #[inline]
    pub fn oob_stage_present(&self) -> bool {
        self.oob.present()
    }

    /// Name of `stage`, `None` for an absent out-of-band stage
    pub fn stage_name(&self, stage: Stage) -> Option<&'static str> {
        match stage {
            Stage::InBand => Some(self.config.inband_name),
            Stage::OutOfBand => self.oob.present().then(|| self.oob.name()),
        }
    }

    /// Context of `stage` on this CPU
    #[inline]
    pub fn this_staged(&self, stage: Stage) -> &StageData {
        self.this_ctx().staged(stage)
    }

    /// Context of the current stage on this CPU
    #[inline]
    pub fn current_irq_staged(&self) -> &StageData {
        self.this_staged(self.current_stage())
    }

    /// Make the out-of-band stage current
    pub fn switch_oob(&self, pd: &StageData) {
        self.check_staged(pd, Stage::OutOfBand);
        let preempt = &self.this_ctx().preempt;
        if preempt.get() & STAGE_MASK == 0 {
            preempt.add(STAGE_OFFSET);
        }
    }

    /// Make the in-band stage current
    pub fn switch_inband(&self, pd: &StageData) {
        self.check_staged(pd, Stage::InBand);
        let preempt = &self.this_ctx().preempt;
        if preempt.get() & STAGE_MASK != 0 {
            preempt.sub(STAGE_OFFSET);
        }
    }

    /// Make `pd`'s stage current; no-op if it already is
    pub fn switch_to(&self, pd: &StageData) {
        match pd.stage() {
            Stage::InBand => self.switch_inband(pd),
            Stage::OutOfBand => self.switch_oob(pd),
        }
    }

    fn check_staged(&self, pd: &StageData, stage: Stage) {
        warn_on_once!(
            pd.cpu() != self.arch.this_cpu() || pd.stage() != stage,
            "stage context of CPU{} used on CPU{}",
            pd.cpu(),
            self.arch.this_cpu()
        );
    }

    /// Whether the CPU is inside the pipeline entry code
    #[inline]
    pub fn on_pipeline_entry(&self) -> bool {
        self.this_ctx().preempt.on_pipeline_entry()
    }

    /// Raw preemption counter of this CPU
    pub fn preempt_count(&self) -> u32 {
        self.this_ctx().preempt.get()
    }

    /// Disable preemption
    pub fn preempt_disable(&self) {
        self.this_ctx().preempt.add(PREEMPT_OFFSET);
    }

    /// Enable preemption
    pub fn preempt_enable(&self) {
        self.this_ctx().preempt.sub(PREEMPT_OFFSET);
    }

    // =========================================================================
    // Stall bits
    // =========================================================================

    /// Stall bits of the running task
    pub fn stall_bits(&self) -> StallBits {
        self.this_ctx().stall.load()
    }

    /// Stall `stage`
    pub fn stall(&self, stage: Stage) {
        match stage {
            Stage::InBand => self.stall_inband(),
            Stage::OutOfBand => self.stall_oob(),
        }
    }

    /// Unstall `stage`; the caller synchronizes afterwards
    pub fn unstall(&self, stage: Stage) {
        match stage {
            Stage::InBand => self.unstall_inband(),
            Stage::OutOfBand => self.unstall_oob(),
        }
    }

    /// Stall `stage`, returning whether it already was
    pub fn test_and_stall(&self, stage: Stage) -> bool {
        match stage {
            Stage::InBand => self.test_and_stall_inband(),
            Stage::OutOfBand => self.test_and_stall_oob(),
        }
    }

    /// Whether `stage` is stalled
    #[inline]
    pub fn test_stall(&self, stage: Stage) -> bool {
        self.this_ctx().stall.test(stage)
    }

    /// Stall the in-band stage
    pub fn stall_inband(&self) {
        self.check_not_oob("stall_inband");
        self.stall_inband_nocheck();
    }

    /// Unstall the in-band stage
    pub fn unstall_inband(&self) {
        self.check_not_oob("unstall_inband");
        self.unstall_inband_nocheck();
    }

    /// Stall the in-band stage, returning whether it already was
    pub fn test_and_stall_inband(&self) -> bool {
        self.check_not_oob("test_and_stall_inband");
        self.test_and_stall_inband_nocheck()
    }

    /// Whether the in-band stage is stalled
    pub fn test_inband_stall(&self) -> bool {
        self.test_stall(Stage::InBand)
    }

    /// Stall the out-of-band stage
    pub fn stall_oob(&self) {
        self.this_ctx().stall.stall(Stage::OutOfBand);
    }

    /// Unstall the out-of-band stage
    pub fn unstall_oob(&self) {
        self.this_ctx().stall.unstall(Stage::OutOfBand);
    }

    /// Stall the out-of-band stage, returning whether it already was
    pub fn test_and_stall_oob(&self) -> bool {
        self.this_ctx().stall.test_and_stall(Stage::OutOfBand)
    }

    /// Whether the out-of-band stage is stalled
    pub fn test_oob_stall(&self) -> bool {
        self.test_stall(Stage::OutOfBand)
    }

    #[inline]
    pub(crate) fn stall_inband_nocheck(&self) {
        self.this_ctx().stall.stall(Stage::InBand);
    }

    #[inline]
    pub(crate) fn unstall_inband_nocheck(&self) {
        self.this_ctx().stall.unstall(Stage::InBand);
    }

    #[inline]
    pub(crate) fn test_and_stall_inband_nocheck(&self) -> bool {
        self.this_ctx().stall.test_and_stall(Stage::InBand)
    }

    fn check_not_oob(&self, what: &str) {
        warn_on_once!(self.running_oob(), "{} called from the out-of-band stage", what);
    }

    /// Save the live stall word into `prev` and load `next`'s
    ///
    /// Called by the scheduler with hard IRQs off, when switching tasks.
    pub fn switch_task_stall(&self, prev: &TaskStall, next: &TaskStall) {
        warn_on_once!(
            !self.hard_irqs_disabled(),
            "task stall bits switched with hard IRQs on"
        );
        let live = &self.this_ctx().stall;
        prev.store(live.load());
        live.store(next.load());
    }

    // =========================================================================
    // Event logs
    // =========================================================================

    /// Log `irq` for later delivery on `stage`
    ///
    /// Hard IRQs must be off.
    pub fn irq_post_stage(&self, stage: Stage, irq: IrqNumber) {
        if warn_on_once!(
            !self.hard_irqs_disabled() || irq as usize >= IRQ_BITMAP_BITS,
            "bad post of IRQ {} to {:?} stage",
            irq,
            stage
        ) {
            return;
        }
        // SAFETY: own CPU, hard IRQs off, no other view of the log is live.
        unsafe { self.this_staged(stage).log_mut() }.post(irq as usize);
    }

    /// Log `irq` for the in-band stage
    pub fn irq_post_inband(&self, irq: IrqNumber) {
        self.irq_post_stage(Stage::InBand, irq);
    }

    /// Log `irq` for the out-of-band stage
    pub fn irq_post_oob(&self, irq: IrqNumber) {
        warn_on_once!(
            !self.oob_stage_present(),
            "IRQ {} posted to an absent out-of-band stage",
            irq
        );
        self.irq_post_stage(Stage::OutOfBand, irq);
    }

    /// Whether `stage` has IRQs pending on this CPU
    pub fn stage_irqs_pending(&self, stage: Stage) -> bool {
        let flags = self.hard_irq_save();
        // SAFETY: own CPU, hard IRQs off, read-only.
        let pending = unsafe { self.this_staged(stage).log() }.pending();
        self.hard_irq_restore(flags);
        pending
    }

    // =========================================================================
    // NMI
    // =========================================================================

    /// Enter an NMI: the stall bits are saved and the NMI nesting raised
    pub fn nmi_enter(&self) {
        let ctx = self.this_ctx();
        ctx.nmi_saved_stall
            .store(ctx.stall.load().bits(), Ordering::Relaxed);
        ctx.preempt.add(NMI_OFFSET);
    }

    /// Leave an NMI, putting the stall bits back as they were
    pub fn nmi_exit(&self) {
        let ctx = self.this_ctx();
        ctx.preempt.sub(NMI_OFFSET);
        ctx.stall.store(StallBits::from_bits_truncate(
            ctx.nmi_saved_stall.load(Ordering::Relaxed),
        ));
    }

    fn in_nmi(&self) -> bool {
        self.preempt_count() & crate::preempt::NMI_MASK != 0
    }

    // =========================================================================
    // Debug
    // =========================================================================

    /// Whether a broken interrupt state was detected
    ///
    /// Once set, in-band stage checks stay silent.
    pub fn is_oopsing(&self) -> bool {
        self.oopsing.load(Ordering::Relaxed)
    }

    /// Enter oops mode and lock out interrupts on this CPU
    ///
    /// Called on the way to a fatal error report, from any stage. Hard IRQs
    /// are disabled and the in-band stage is stalled without complaint.
    pub fn irq_pipeline_oops(&self) {
        self.oopsing.store(true, Ordering::Relaxed);
        self.local_irq_disable_full();
    }

    /// Verify that in-band-only code runs on the in-band stage
    ///
    /// The first violation is reported and silences further checks.
    pub fn check_inband_stage(&self) {
        if !PIPELINE_DEBUG {
            return;
        }

        let flags = self.hard_irq_save();
        let stage = self.current_stage();
        if stage.is_inband() && !self.test_oob_stall() {
            self.hard_irq_restore(flags);
            return;
        }
        if self.in_nmi() || self.oopsing.swap(true, Ordering::Relaxed) {
            self.hard_irq_restore(flags);
            return;
        }
        self.hard_irq_restore(flags);

        static WARNED: AtomicBool = AtomicBool::new(false);
        if stage.is_inband() {
            crate::debug::report(
                &WARNED,
                format_args!("oob stage found stalled while modifying in-band interrupt state"),
            );
        } else {
            crate::debug::report(
                &WARNED,
                format_args!(
                    "code running in oob context '{}' called an in-band only routine",
                    self.oob.name()
                ),
            );
        }
    }
}

impl<A: ArchIrq> core::fmt::Debug for Pipeline<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("cpus", &self.cpus.len())
            .field("oob_present", &self.oob.present())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl<A: ArchIrq> StageContext for Pipeline<A> {
    fn hard_irq_save(&self) -> IrqFlags {
        self.arch.local_irq_save()
    }

    fn hard_irq_restore(&self, flags: IrqFlags) {
        self.arch.local_irq_restore(flags);
    }

    fn hard_save_flags(&self) -> IrqFlags {
        self.arch.local_save_flags()
    }

    fn hard_irqs_disabled_flags(&self, flags: IrqFlags) -> bool {
        self.arch.irqs_disabled_flags(flags)
    }

    fn running_inband(&self) -> bool {
        Pipeline::running_inband(self)
    }

    fn on_pipeline_entry(&self) -> bool {
        Pipeline::on_pipeline_entry(self)
    }

    fn test_and_stall_inband(&self) -> bool {
        self.test_and_stall_inband_nocheck()
    }

    fn unstall_inband(&self) {
        self.unstall_inband_nocheck();
    }

    fn preempt_disable(&self) {
        Pipeline::preempt_disable(self);
    }

    fn preempt_enable(&self) {
        Pipeline::preempt_enable(self);
    }

    fn sync_inband(&self) {
        if Pipeline::running_inband(self)
            && !self.test_inband_stall()
            && !Pipeline::on_pipeline_entry(self)
            && self.stage_irqs_pending(Stage::InBand)
        {
            self.sync_current_irq_stage();
        }
    }
}
