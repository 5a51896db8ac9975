//! # IRQ Descriptors
//!
//! One descriptor per IRQ line, shared by both stages. A descriptor holds
//! the attached handler, the line flags chosen at request time, the
//! runtime state the pipeline maintains, and per-CPU delivery counters.
//!
//! The mutable part lives behind a [`HybridSpinlock`], so out-of-band and
//! in-band code may both inspect it.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use dovetail_hal::{IrqChip, IrqNumber};

use crate::percpu::PerCpu;
use crate::sync::HybridSpinlock;

// =============================================================================
// Handler types
// =============================================================================

bitflags::bitflags! {
    /// Handler status
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IrqReturn: u32 {
        /// The device raised the interrupt and it was serviced
        const HANDLED = 1 << 0;
        /// Servicing continues in a thread
        const WAKE_THREAD = 1 << 1;
    }
}

impl IrqReturn {
    /// The interrupt was not for this handler
    pub const NONE: Self = Self::empty();
}

/// Interrupt handler
pub trait IrqHandler: Send + Sync {
    /// Service `irq`
    fn handle(&self, irq: IrqNumber) -> IrqReturn;
}

impl<F> IrqHandler for F
where
    F: Fn(IrqNumber) -> IrqReturn + Send + Sync,
{
    fn handle(&self, irq: IrqNumber) -> IrqReturn {
        self(irq)
    }
}

bitflags::bitflags! {
    /// Line flags chosen when requesting an IRQ
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IrqLineFlags: u32 {
        /// Deliver on the out-of-band stage
        const OOB = 1 << 0;
        /// Per-CPU line: the descriptor is not serialized across CPUs
        const PER_CPU = 1 << 1;
        /// Software-only line with no hardware behind it
        const SYNTHETIC = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Runtime state of a line
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IrqState: u32 {
        /// Delivery disabled
        const DISABLED = 1 << 0;
        /// A handler is running
        const IN_PROGRESS = 1 << 1;
        /// Quarantined after misbehaving
        const SPURIOUS_DISABLED = 1 << 2;
        /// Raised again while the handler was running on another CPU
        const PENDING = 1 << 3;
    }
}

// =============================================================================
// Descriptor
// =============================================================================

#[derive(Clone)]
pub(crate) struct IrqAction {
    pub(crate) handler: Arc<dyn IrqHandler>,
    pub(crate) name: &'static str,
}

/// Lock-protected descriptor state
pub(crate) struct DescState {
    pub(crate) action: Option<IrqAction>,
    pub(crate) flags: IrqLineFlags,
    pub(crate) state: IrqState,
    pub(crate) chip: Option<Arc<dyn IrqChip>>,
    pub(crate) irqs_unhandled: u32,
    pub(crate) last_unhandled: u64,
}

impl DescState {
    const fn new() -> Self {
        Self {
            action: None,
            flags: IrqLineFlags::empty(),
            state: IrqState::empty(),
            chip: None,
            irqs_unhandled: 0,
            last_unhandled: 0,
        }
    }

    pub(crate) fn is_oob(&self) -> bool {
        self.flags.contains(IrqLineFlags::OOB)
    }

    pub(crate) fn mask(&self, irq: IrqNumber) {
        if let Some(chip) = &self.chip {
            chip.mask(irq);
        }
    }

    pub(crate) fn unmask(&self, irq: IrqNumber) {
        if let Some(chip) = &self.chip {
            chip.unmask(irq);
        }
    }
}

/// IRQ descriptor
pub struct IrqDesc {
    irq: IrqNumber,
    pub(crate) inner: HybridSpinlock<DescState>,
    counts: PerCpu<AtomicU64>,
}

impl IrqDesc {
    pub(crate) fn new(irq: IrqNumber, nr_cpus: usize) -> Self {
        Self {
            irq,
            inner: HybridSpinlock::new(DescState::new()),
            counts: PerCpu::new(nr_cpus, |_| AtomicU64::new(0)),
        }
    }

    /// Line number
    pub fn irq(&self) -> IrqNumber {
        self.irq
    }

    pub(crate) fn account(&self, cpu: usize) {
        if let Some(count) = self.counts.get(cpu) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Deliveries on `cpu`
    pub fn count_on(&self, cpu: usize) -> u64 {
        self.counts
            .get(cpu)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// Deliveries on all CPUs
    pub fn count(&self) -> u64 {
        self.counts
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .sum()
    }
}

impl core::fmt::Debug for IrqDesc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqDesc")
            .field("irq", &self.irq)
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

/// Snapshot of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqStatus {
    /// Line number
    pub irq: IrqNumber,
    /// Handler name, empty when no handler is attached
    pub name: &'static str,
    /// Whether a handler is attached
    pub registered: bool,
    /// Line flags
    pub flags: IrqLineFlags,
    /// Runtime state
    pub state: IrqState,
    /// Unclaimed out-of-band events in the current burst
    pub unhandled: u32,
    /// Deliveries on all CPUs
    pub count: u64,
}
