//! # Stages
//!
//! A stage is a priority domain for interrupt delivery. The in-band stage
//! always exists; the out-of-band stage exists only while a companion core
//! has installed it.
//!
//! Every CPU keeps one [`StageData`] per stage, holding that stage's event
//! log. The stage the CPU is currently running on is recorded in its
//! preemption counter.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::RwLock;

use crate::config::IRQ_BITMAP_BITS;
use crate::event_log::EventLog;
use crate::stall::StallBits;

/// Number of stages
pub const NR_STAGES: usize = 2;

/// Stage identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum Stage {
    /// Regular kernel stage
    InBand = 0,
    /// High-priority stage of the companion core
    OutOfBand = 1,
}

impl Stage {
    /// Stage index, also its value in the preemption counter
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Stage from an index read back from the preemption counter
    #[inline]
    pub const fn from_index(index: usize) -> Self {
        if index == 0 {
            Stage::InBand
        } else {
            Stage::OutOfBand
        }
    }

    /// Stall bit of the stage
    #[inline]
    pub const fn stall_bit(self) -> StallBits {
        match self {
            Stage::InBand => StallBits::INBAND,
            Stage::OutOfBand => StallBits::OOB,
        }
    }

    /// Whether this is the in-band stage
    #[inline]
    pub const fn is_inband(self) -> bool {
        matches!(self, Stage::InBand)
    }
}

// =============================================================================
// Out-of-band slot
// =============================================================================

/// Installation slot of the out-of-band stage
#[derive(Debug)]
pub(crate) struct OobSlot {
    present: AtomicBool,
    name: RwLock<&'static str>,
}

impl OobSlot {
    pub(crate) const fn new() -> Self {
        Self {
            present: AtomicBool::new(false),
            name: RwLock::new(""),
        }
    }

    #[inline]
    pub(crate) fn present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    pub(crate) fn name(&self) -> &'static str {
        *self.name.read()
    }

    /// Publish the stage, name first
    pub(crate) fn install(&self, name: &'static str) {
        *self.name.write() = name;
        self.present.store(true, Ordering::Release);
    }

    pub(crate) fn remove(&self) {
        self.present.store(false, Ordering::Release);
    }
}

// =============================================================================
// Per-CPU stage context
// =============================================================================

/// Per-CPU context of one stage
pub struct StageData {
    log: UnsafeCell<EventLog<IRQ_BITMAP_BITS>>,
    stage: Stage,
    cpu: usize,
}

// SAFETY: the event log is only reached through `log` / `log_mut`, whose
// callers run on the owning CPU with hard interrupts disabled.
unsafe impl Sync for StageData {}

impl StageData {
    pub(crate) fn new(stage: Stage, cpu: usize) -> Self {
        Self {
            log: UnsafeCell::new(EventLog::new()),
            stage,
            cpu,
        }
    }

    /// Stage this context belongs to
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// CPU owning this context
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Shared view of the event log
    ///
    /// # Safety
    ///
    /// The caller runs on [`cpu`](Self::cpu) with hard interrupts disabled,
    /// and no mutable view is live.
    #[inline]
    pub(crate) unsafe fn log(&self) -> &EventLog<IRQ_BITMAP_BITS> {
        // SAFETY: upheld by the caller.
        unsafe { &*self.log.get() }
    }

    /// Mutable view of the event log
    ///
    /// # Safety
    ///
    /// The caller runs on [`cpu`](Self::cpu) with hard interrupts disabled,
    /// or every CPU is quiesced, and no other view is live.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn log_mut(&self) -> &mut EventLog<IRQ_BITMAP_BITS> {
        // SAFETY: upheld by the caller.
        unsafe { &mut *self.log.get() }
    }
}

impl core::fmt::Debug for StageData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StageData")
            .field("stage", &self.stage)
            .field("cpu", &self.cpu)
            .finish_non_exhaustive()
    }
}
