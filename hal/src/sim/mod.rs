//! # Simulated Machine
//!
//! A software SMP machine implementing [`ArchIrq`]. Each CPU owns a status
//! word shaped like an x86 flags register; bit 9 is the interrupt enable
//! flag. The "executing" CPU is whichever one was last selected with
//! [`SimArch::set_cpu`], so one host thread drives the whole machine.
//!
//! Exception entry is emulated by [`SimArch::hard_irq_frame`]: the status
//! word is saved, interrupts are disabled, the handler runs, and the saved
//! word is put back, the way a trap and its return would.

mod chip;

pub use chip::SimChip;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::interrupts::{ArchError, ArchIrq, IrqFlags};

bitflags::bitflags! {
    /// Simulated CPU status word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SimStatus: usize {
        /// Always set, like the reserved bit of x86 RFLAGS
        const RESERVED = 1 << 1;
        /// Zero flag, used by tests to tag saved words
        const ZERO = 1 << 6;
        /// Interrupt enable flag
        const IRQ_ENABLE = 1 << 9;
    }
}

/// One simulated CPU
#[derive(Debug)]
struct SimCpu {
    status: AtomicUsize,
}

impl SimCpu {
    fn new() -> Self {
        // CPUs come out of reset with interrupts off.
        Self {
            status: AtomicUsize::new(SimStatus::RESERVED.bits()),
        }
    }
}

/// Simulated SMP machine
#[derive(Debug)]
pub struct SimArch {
    cpus: Box<[SimCpu]>,
    current: AtomicUsize,
    ticks: AtomicU64,
    oob_supported: AtomicBool,
    oob_requests: AtomicUsize,
}

impl SimArch {
    /// Create a machine with `nr_cpus` CPUs, CPU 0 executing
    pub fn new(nr_cpus: usize) -> Self {
        let nr_cpus = nr_cpus.max(1);
        log::debug!("sim: machine with {} CPU(s)", nr_cpus);
        Self {
            cpus: (0..nr_cpus).map(|_| SimCpu::new()).collect(),
            current: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
            oob_supported: AtomicBool::new(true),
            oob_requests: AtomicUsize::new(0),
        }
    }

    /// Make `cpu` the executing CPU
    pub fn set_cpu(&self, cpu: usize) {
        assert!(cpu < self.cpus.len(), "sim: no such CPU {}", cpu);
        self.current.store(cpu, Ordering::Relaxed);
    }

    /// Advance the tick counter
    pub fn advance_ticks(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::Relaxed);
    }

    /// Accept or refuse future out-of-band stage requests
    pub fn set_oob_supported(&self, supported: bool) {
        self.oob_supported.store(supported, Ordering::Relaxed);
    }

    /// Number of accepted out-of-band stage requests
    pub fn oob_requests(&self) -> usize {
        self.oob_requests.load(Ordering::Relaxed)
    }

    /// Status word of the executing CPU
    pub fn status(&self) -> SimStatus {
        SimStatus::from_bits_retain(self.cpu().status.load(Ordering::Relaxed))
    }

    /// Overwrite the status word of the executing CPU
    pub fn set_status(&self, status: SimStatus) {
        self.cpu().status.store(status.bits(), Ordering::Relaxed);
    }

    /// Run `f` the way the CPU would run an interrupt trap handler
    pub fn hard_irq_frame<R>(&self, f: impl FnOnce() -> R) -> R {
        let saved = self.local_irq_save();
        let ret = f();
        self.local_irq_restore(saved);
        ret
    }

    fn cpu(&self) -> &SimCpu {
        &self.cpus[self.current.load(Ordering::Relaxed)]
    }
}

impl ArchIrq for SimArch {
    fn local_irq_save(&self) -> IrqFlags {
        let old = self
            .cpu()
            .status
            .fetch_and(!SimStatus::IRQ_ENABLE.bits(), Ordering::Relaxed);
        IrqFlags::from_raw(old)
    }

    fn local_irq_restore(&self, flags: IrqFlags) {
        self.cpu().status.store(flags.raw(), Ordering::Relaxed);
    }

    fn local_irq_enable(&self) {
        self.cpu()
            .status
            .fetch_or(SimStatus::IRQ_ENABLE.bits(), Ordering::Relaxed);
    }

    fn local_irq_disable(&self) {
        self.cpu()
            .status
            .fetch_and(!SimStatus::IRQ_ENABLE.bits(), Ordering::Relaxed);
    }

    fn local_save_flags(&self) -> IrqFlags {
        IrqFlags::from_raw(self.cpu().status.load(Ordering::Relaxed))
    }

    fn irqs_disabled_flags(&self, flags: IrqFlags) -> bool {
        flags.raw() & SimStatus::IRQ_ENABLE.bits() == 0
    }

    fn this_cpu(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    fn clock_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn enable_oob_stage(&self) -> Result<(), ArchError> {
        if !self.oob_supported.load(Ordering::Relaxed) {
            return Err(ArchError::NotSupported);
        }
        self.oob_requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
