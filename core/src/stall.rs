//! # Stall Bits
//!
//! Virtual interrupt masks. A stage whose stall bit is set receives no
//! interrupts: they are logged instead and replayed once the bit clears.
//!
//! Stall bits belong to the running task, not to the CPU. The CPU holds the
//! live word of whichever task runs on it; a context switch saves that word
//! into the outgoing task and loads the incoming one.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::stage::Stage;

/// Bit of the in-band stall flag
pub const INBAND_STALL_BIT: u32 = 0;

/// Bit of the out-of-band stall flag
pub const OOB_STALL_BIT: u32 = 1;

bitflags::bitflags! {
    /// Stall flags of one task
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StallBits: usize {
        /// In-band stage stalled
        const INBAND = 1 << INBAND_STALL_BIT;
        /// Out-of-band stage stalled
        const OOB = 1 << OOB_STALL_BIT;
    }
}

/// Atomic stall word
///
/// Bits are flipped with atomic read-modify-write operations so that an
/// interrupt landing between a read and a write cannot lose an update.
#[derive(Debug)]
pub struct TaskStall {
    bits: AtomicUsize,
}

impl TaskStall {
    /// Stall word of a new task: in-band stalled, out-of-band clear
    pub const fn new() -> Self {
        Self::with_bits(StallBits::INBAND)
    }

    /// Stall word with the given flags
    pub const fn with_bits(bits: StallBits) -> Self {
        Self {
            bits: AtomicUsize::new(bits.bits()),
        }
    }

    /// Stall `stage`
    #[inline]
    pub fn stall(&self, stage: Stage) {
        self.bits.fetch_or(stage.stall_bit().bits(), Ordering::Relaxed);
    }

    /// Unstall `stage`
    #[inline]
    pub fn unstall(&self, stage: Stage) {
        self.bits
            .fetch_and(!stage.stall_bit().bits(), Ordering::Relaxed);
    }

    /// Stall `stage`, returning whether it already was
    #[inline]
    pub fn test_and_stall(&self, stage: Stage) -> bool {
        let bit = stage.stall_bit().bits();
        self.bits.fetch_or(bit, Ordering::Relaxed) & bit != 0
    }

    /// Whether `stage` is stalled
    #[inline]
    pub fn test(&self, stage: Stage) -> bool {
        self.bits.load(Ordering::Relaxed) & stage.stall_bit().bits() != 0
    }

    /// Snapshot of every flag
    pub fn load(&self) -> StallBits {
        StallBits::from_bits_truncate(self.bits.load(Ordering::Relaxed))
    }

    /// Replace every flag
    pub fn store(&self, bits: StallBits) {
        self.bits.store(bits.bits(), Ordering::Relaxed);
    }
}

impl Default for TaskStall {
    fn default() -> Self {
        Self::new()
    }
}
