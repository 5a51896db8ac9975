//! # Dovetail Pipeline Core
//!
//! A two-stage interrupt pipeline. A high-priority *out-of-band* stage is
//! layered over the regular *in-band* stage; both share one interrupt
//! controller and one CPU. The in-band stage sees interrupts through a
//! virtual mask (its stall bit) backed by a per-CPU event log, so the real
//! CPU interrupt flag stays under the pipeline's control and out-of-band
//! handlers are never delayed by in-band critical sections.
//!
//! ## Interrupt Flow
//!
//! ```text
//!   hardware IRQ
//!        │
//!        ▼
//!   pipeline_entry ──► switch to oob (if installed)
//!        │
//!        ├── oob line ─────► handler runs now, oob stalled, hard IRQs off
//!        │
//!        └── in-band line ─► posted to the in-band event log
//!        │
//!        ▼
//!   pipeline_exit ──► restore stage ──► synchronize
//!                                         │
//!                                         └─► replay log while unstalled
//! ```
//!
//! ## Components
//!
//! - **Stall bits** ([`stall`]): per-task virtual interrupt masks
//! - **Event log** ([`event_log`]): per-CPU, per-stage pending-IRQ bitmap
//! - **Stages** ([`stage`]): identities and per-CPU stage contexts
//! - **Preempt count** ([`preempt`]): current stage and nesting state
//! - **Locks** ([`sync`]): raw, hard and hybrid spinlocks
//! - **Descriptors** ([`irq`]): handlers and per-line state
//! - **Pipeline** ([`pipeline`]): entry/exit, synchronization, lifecycle

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[macro_use]
pub mod debug;

pub mod config;
pub mod event_log;
pub mod irq;
pub mod percpu;
pub mod pipeline;
pub mod preempt;
pub mod stage;
pub mod stall;
pub mod sync;

use core::fmt;

use dovetail_hal::ArchError;

pub use config::{PipelineConfig, IRQ_BITMAP_BITS};
pub use dovetail_hal::{ArchIrq, IrqChip, IrqFlags, IrqNumber};
pub use irq::{IrqHandler, IrqLineFlags, IrqReturn, IrqState, IrqStatus};
pub use pipeline::{CompanionCore, Pipeline, PipelineFrame, StageLockState};
pub use stage::Stage;
pub use stall::{StallBits, TaskStall};
pub use sync::{HardSpinlock, HybridSpinlock, RawSpinlock, StageContext};

// =============================================================================
// Errors
// =============================================================================

/// Pipeline error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    /// Resource already in use
    Busy,
    /// Not supported by the architecture or the interrupt chip
    NotSupported,
    /// IRQ number outside of the descriptor table
    InvalidIrq,
    /// A handler is already attached to the line
    AlreadyRegistered,
    /// No handler attached to the line
    NotRegistered,
    /// Configuration rejected
    InvalidConfig,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PipelineError::Busy => "resource busy",
            PipelineError::NotSupported => "operation not supported",
            PipelineError::InvalidIrq => "invalid IRQ number",
            PipelineError::AlreadyRegistered => "IRQ already registered",
            PipelineError::NotRegistered => "IRQ not registered",
            PipelineError::InvalidConfig => "invalid pipeline configuration",
        };
        f.write_str(msg)
    }
}

impl From<ArchError> for PipelineError {
    fn from(err: ArchError) -> Self {
        match err {
            ArchError::NotSupported => PipelineError::NotSupported,
            ArchError::Busy => PipelineError::Busy,
        }
    }
}

/// Pipeline result type
pub type PipelineResult<T> = Result<T, PipelineError>;
