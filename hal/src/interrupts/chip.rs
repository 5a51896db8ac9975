//! # Interrupt Chip
//!
//! Per-line controller operations used by the pipeline.

use super::IrqNumber;

/// Interrupt controller driving a set of lines
pub trait IrqChip: Send + Sync {
    /// Controller name
    fn name(&self) -> &'static str;

    /// Mask a line at the controller
    fn mask(&self, irq: IrqNumber);

    /// Unmask a line at the controller
    fn unmask(&self, irq: IrqNumber);

    /// Whether the chip may be driven with only hard interrupts disabled
    ///
    /// Out-of-band lines can only live on chips returning `true`, since
    /// their handlers run outside of any in-band locking.
    fn is_pipeline_safe(&self) -> bool {
        true
    }
}
