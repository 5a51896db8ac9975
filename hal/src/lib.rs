//! # Dovetail Hardware Abstraction Layer
//!
//! The HAL is the only place where the interrupt pipeline touches the
//! machine. Everything above it reasons in terms of *virtual* interrupt
//! state; everything in here manipulates the *real* CPU interrupt flag.
//!
//! ## Boundary
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    dovetail-core                         │
//! │   stages · event logs · stall bits · hybrid locks        │
//! ├──────────────────────────────────────────────────────────┤
//! │                    dovetail-hal                          │
//! │   ArchIrq   ── hard IRQ flag, CPU id, clock, oob hook    │
//! │   IrqChip   ── per-line mask / unmask                    │
//! ├──────────────────────────────────────────────────────────┤
//! │        real architecture  │  sim (feature = "sim")       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! An architecture port implements [`interrupts::ArchIrq`] and hands it to
//! the pipeline. The `sim` feature provides a software machine with the same
//! contract, used by the test suites and for bring-up on a host.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod interrupts;

#[cfg(feature = "sim")]
pub mod sim;

pub use interrupts::{ArchError, ArchIrq, IrqChip, IrqFlags, IrqNumber};
