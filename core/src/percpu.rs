//! # Per-CPU Storage
//!
//! One slot per CPU, allocated once when the pipeline is built. Slots are
//! looked up by the CPU number the architecture reports.

use alloc::boxed::Box;

use dovetail_hal::ArchIrq;

/// Per-CPU arena
#[derive(Debug)]
pub struct PerCpu<T> {
    slots: Box<[T]>,
}

impl<T> PerCpu<T> {
    /// Build `nr_cpus` slots with `init(cpu)`
    pub fn new(nr_cpus: usize, init: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: (0..nr_cpus).map(init).collect(),
        }
    }

    /// Slot of `cpu`
    #[inline]
    pub fn get(&self, cpu: usize) -> Option<&T> {
        self.slots.get(cpu)
    }

    /// Slot of the executing CPU
    #[inline]
    pub fn this(&self, arch: &impl ArchIrq) -> &T {
        &self.slots[arch.this_cpu()]
    }

    /// Every slot, in CPU order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }

    /// Number of CPUs
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
