//! # Simulated Interrupt Chip

use alloc::collections::BTreeSet;

use spin::Mutex;

use crate::interrupts::{IrqChip, IrqNumber};

/// Interrupt chip recording the mask state of every line
#[derive(Debug)]
pub struct SimChip {
    name: &'static str,
    pipeline_safe: bool,
    masked: Mutex<BTreeSet<IrqNumber>>,
}

impl SimChip {
    /// Create a pipeline-safe chip
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pipeline_safe: true,
            masked: Mutex::new(BTreeSet::new()),
        }
    }

    /// Create a chip that cannot serve out-of-band lines
    pub fn unsafe_for_pipeline(name: &'static str) -> Self {
        Self {
            pipeline_safe: false,
            ..Self::new(name)
        }
    }

    /// Whether `irq` is currently masked
    pub fn is_masked(&self, irq: IrqNumber) -> bool {
        self.masked.lock().contains(&irq)
    }
}

impl IrqChip for SimChip {
    fn name(&self) -> &'static str {
        self.name
    }

    fn mask(&self, irq: IrqNumber) {
        self.masked.lock().insert(irq);
    }

    fn unmask(&self, irq: IrqNumber) {
        self.masked.lock().remove(&irq);
    }

    fn is_pipeline_safe(&self) -> bool {
        self.pipeline_safe
    }
}
