//! # Hard Interrupt Control
//!
//! Contract between the interrupt pipeline and the architecture.
//!
//! The pipeline never reads or writes the CPU interrupt flag directly. It
//! goes through [`ArchIrq`], which exposes the "hard" interrupt state: the
//! one the CPU actually honours. Saved states travel as opaque
//! [`IrqFlags`] words that only the architecture knows how to decode.

mod chip;

pub use chip::IrqChip;

use core::fmt;

use static_assertions::const_assert_eq;

// =============================================================================
// Types
// =============================================================================

/// Interrupt line number
pub type IrqNumber = u32;

/// Saved hardware interrupt state
///
/// Opaque to the pipeline. Restoring a value must put the CPU back in the
/// exact state it was saved from.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct IrqFlags(usize);

const_assert_eq!(core::mem::size_of::<IrqFlags>(), core::mem::size_of::<usize>());

impl IrqFlags {
    /// Wrap a raw architecture status word
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw architecture status word
    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for IrqFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IrqFlags({:#x})", self.0)
    }
}

/// Architecture refusal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchError {
    /// The architecture cannot host the requested feature
    NotSupported,
    /// The resource is in use
    Busy,
}

impl fmt::Display for ArchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchError::NotSupported => write!(f, "not supported by architecture"),
            ArchError::Busy => write!(f, "architecture resource busy"),
        }
    }
}

// =============================================================================
// Architecture Trait
// =============================================================================

/// Hard interrupt control for one machine
///
/// All `local_*` operations act on the CPU executing the call.
pub trait ArchIrq: Send + Sync {
    /// Disable hard interrupts, returning the previous state
    fn local_irq_save(&self) -> IrqFlags;

    /// Restore a state returned by [`local_irq_save`](Self::local_irq_save)
    /// or [`local_save_flags`](Self::local_save_flags)
    fn local_irq_restore(&self, flags: IrqFlags);

    /// Enable hard interrupts
    fn local_irq_enable(&self);

    /// Disable hard interrupts
    fn local_irq_disable(&self);

    /// Read the current state without changing it
    fn local_save_flags(&self) -> IrqFlags;

    /// Whether `flags` describes a hard-disabled state
    fn irqs_disabled_flags(&self, flags: IrqFlags) -> bool;

    /// Whether hard interrupts are disabled on this CPU
    fn irqs_disabled(&self) -> bool {
        self.irqs_disabled_flags(self.local_save_flags())
    }

    /// Index of the executing CPU, below [`nr_cpus`](Self::nr_cpus)
    fn this_cpu(&self) -> usize;

    /// Number of CPUs the pipeline has to serve
    fn nr_cpus(&self) -> usize;

    /// Monotonic tick counter
    fn clock_ticks(&self) -> u64;

    /// Prepare the architecture for an out-of-band stage
    ///
    /// Called once per installation, before the stage becomes visible.
    fn enable_oob_stage(&self) -> Result<(), ArchError> {
        Ok(())
    }

    /// Run an in-band interrupt flow handler
    ///
    /// Architectures that keep per-IRQ bookkeeping (register frames,
    /// accounting) wrap `flow` here. Called with hard interrupts enabled.
    fn do_irq_pipelined(&self, irq: IrqNumber, flow: &dyn Fn(IrqNumber)) {
        flow(irq);
    }
}
