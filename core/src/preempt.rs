//! # Preemption Counter
//!
//! Per-CPU nesting counter. Besides the usual preemption, softirq, hardirq
//! and NMI fields it carries two pipeline fields: the pipeline-entry marker
//! and the index of the current stage.
//!
//! ```text
//!  31        26  25     24       23-20   19-16     15-8      7-0
//! ┌───────────┬──────┬─────────┬───────┬─────────┬─────────┬─────────┐
//! │  unused   │STAGE │PIPELINE │  NMI  │ HARDIRQ │ SOFTIRQ │ PREEMPT │
//! └───────────┴──────┴─────────┴───────┴─────────┴─────────┴─────────┘
//! ```
//!
//! Switching stage is a single add or subtract of [`STAGE_OFFSET`], and
//! the current stage reads back as a mask and shift.

use core::sync::atomic::{AtomicU32, Ordering};

use static_assertions::const_assert_eq;

// =============================================================================
// Layout
// =============================================================================

/// Preemption-disable nesting bits
pub const PREEMPT_BITS: u32 = 8;
/// Softirq nesting bits
pub const SOFTIRQ_BITS: u32 = 8;
/// Hard IRQ nesting bits
pub const HARDIRQ_BITS: u32 = 4;
/// NMI nesting bits
pub const NMI_BITS: u32 = 4;
/// Pipeline entry marker bits
pub const PIPELINE_BITS: u32 = 1;
/// Current stage bits
pub const STAGE_BITS: u32 = 1;

/// Shift of the preemption field
pub const PREEMPT_SHIFT: u32 = 0;
/// Shift of the softirq field
pub const SOFTIRQ_SHIFT: u32 = PREEMPT_SHIFT + PREEMPT_BITS;
/// Shift of the hard IRQ field
pub const HARDIRQ_SHIFT: u32 = SOFTIRQ_SHIFT + SOFTIRQ_BITS;
/// Shift of the NMI field
pub const NMI_SHIFT: u32 = HARDIRQ_SHIFT + HARDIRQ_BITS;
/// Shift of the pipeline entry marker
pub const PIPELINE_SHIFT: u32 = NMI_SHIFT + NMI_BITS;
/// Shift of the stage field
pub const STAGE_SHIFT: u32 = PIPELINE_SHIFT + PIPELINE_BITS;

const fn field_mask(bits: u32, shift: u32) -> u32 {
    ((1 << bits) - 1) << shift
}

/// Preemption field
pub const PREEMPT_MASK: u32 = field_mask(PREEMPT_BITS, PREEMPT_SHIFT);
/// Softirq field
pub const SOFTIRQ_MASK: u32 = field_mask(SOFTIRQ_BITS, SOFTIRQ_SHIFT);
/// Hard IRQ field
pub const HARDIRQ_MASK: u32 = field_mask(HARDIRQ_BITS, HARDIRQ_SHIFT);
/// NMI field
pub const NMI_MASK: u32 = field_mask(NMI_BITS, NMI_SHIFT);
/// Pipeline entry marker
pub const PIPELINE_MASK: u32 = field_mask(PIPELINE_BITS, PIPELINE_SHIFT);
/// Stage field
pub const STAGE_MASK: u32 = field_mask(STAGE_BITS, STAGE_SHIFT);

/// One level of preemption disabling
pub const PREEMPT_OFFSET: u32 = 1 << PREEMPT_SHIFT;
/// One level of softirq nesting
pub const SOFTIRQ_OFFSET: u32 = 1 << SOFTIRQ_SHIFT;
/// One level of hard IRQ nesting
pub const HARDIRQ_OFFSET: u32 = 1 << HARDIRQ_SHIFT;
/// One level of NMI nesting
pub const NMI_OFFSET: u32 = 1 << NMI_SHIFT;
/// Pipeline entry marker
pub const PIPELINE_OFFSET: u32 = 1 << PIPELINE_SHIFT;
/// Out-of-band stage marker
pub const STAGE_OFFSET: u32 = 1 << STAGE_SHIFT;

const_assert_eq!(PREEMPT_MASK, 0x0000_00ff);
const_assert_eq!(SOFTIRQ_MASK, 0x0000_ff00);
const_assert_eq!(HARDIRQ_MASK, 0x000f_0000);
const_assert_eq!(NMI_MASK, 0x00f0_0000);
const_assert_eq!(PIPELINE_MASK, 0x0100_0000);
const_assert_eq!(STAGE_MASK, 0x0200_0000);
const_assert_eq!(
    PREEMPT_MASK | SOFTIRQ_MASK | HARDIRQ_MASK | NMI_MASK | PIPELINE_MASK | STAGE_MASK,
    PREEMPT_MASK + SOFTIRQ_MASK + HARDIRQ_MASK + NMI_MASK + PIPELINE_MASK + STAGE_MASK
);

// =============================================================================
// Counter
// =============================================================================

/// Per-CPU preemption counter
///
/// Only the owning CPU updates it, so relaxed ordering is enough.
#[derive(Debug)]
pub struct PreemptCount(AtomicU32);

impl PreemptCount {
    /// Zeroed counter: in-band stage, preemptible
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Raw counter value
    #[inline]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Add `val` to the counter
    #[inline]
    pub fn add(&self, val: u32) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Subtract `val` from the counter
    #[inline]
    pub fn sub(&self, val: u32) {
        self.0.fetch_sub(val, Ordering::Relaxed);
    }

    /// Index of the current stage
    #[inline]
    pub fn stage_level(&self) -> usize {
        ((self.get() & STAGE_MASK) >> STAGE_SHIFT) as usize
    }

    /// Whether the CPU is inside the pipeline entry code
    #[inline]
    pub fn on_pipeline_entry(&self) -> bool {
        self.get() & PIPELINE_MASK != 0
    }

    /// Hard IRQ nesting depth
    pub fn hardirq_count(&self) -> u32 {
        (self.get() & HARDIRQ_MASK) >> HARDIRQ_SHIFT
    }

    /// Preemption-disable depth
    pub fn preempt_depth(&self) -> u32 {
        (self.get() & PREEMPT_MASK) >> PREEMPT_SHIFT
    }

    /// Whether the CPU is in any interrupt context
    pub fn in_interrupt(&self) -> bool {
        self.get() & (HARDIRQ_MASK | SOFTIRQ_MASK | NMI_MASK) != 0
    }
}

impl Default for PreemptCount {
    fn default() -> Self {
        Self::new()
    }
}
