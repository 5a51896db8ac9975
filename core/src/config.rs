//! # Pipeline Configuration
//!
//! Compile-time sizing of the IRQ space and runtime tunables.
//!
//! The IRQ space decides the shape of every event log, so it is fixed at
//! build time through cargo features:
//!
//! | feature            | `IRQ_BITMAP_BITS` | log levels |
//! |--------------------|-------------------|------------|
//! | (default)          | 1024              | 2          |
//! | `large-irq-space`  | 16384             | 3          |
//! | `huge-irq-space`   | 1048576           | 4          |

use static_assertions::const_assert;

use crate::event_log::{map_levels, MAX_LOG_BITS};
use crate::{PipelineError, PipelineResult};

cfg_if::cfg_if! {
    if #[cfg(feature = "huge-irq-space")] {
        /// Size of the IRQ number space
        pub const IRQ_BITMAP_BITS: usize = 1 << 20;
    } else if #[cfg(feature = "large-irq-space")] {
        /// Size of the IRQ number space
        pub const IRQ_BITMAP_BITS: usize = 16384;
    } else {
        /// Size of the IRQ number space
        pub const IRQ_BITMAP_BITS: usize = 1024;
    }
}

const_assert!(IRQ_BITMAP_BITS <= MAX_LOG_BITS);
const_assert!(map_levels(IRQ_BITMAP_BITS) >= 2);

/// Default number of descriptors
pub const DEFAULT_NR_IRQS: usize = 1024;

const_assert!(DEFAULT_NR_IRQS <= IRQ_BITMAP_BITS);

/// Unclaimed out-of-band events tolerated before a line is quarantined
pub const DEFAULT_UNHANDLED_LIMIT: u32 = 1000;

/// Ticks within which consecutive unclaimed events count as a burst
///
/// A tenth of a second at 1000 ticks per second.
pub const DEFAULT_UNHANDLED_WINDOW: u64 = 100;

/// Runtime pipeline configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of IRQ descriptors, at most [`IRQ_BITMAP_BITS`]
    pub nr_irqs: usize,
    /// Unclaimed out-of-band events tolerated before quarantine
    pub unhandled_limit: u32,
    /// Burst window for unclaimed events, in clock ticks
    pub unhandled_window: u64,
    /// Name of the in-band stage
    pub inband_name: &'static str,
}

impl PipelineConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            nr_irqs: DEFAULT_NR_IRQS,
            unhandled_limit: DEFAULT_UNHANDLED_LIMIT,
            unhandled_window: DEFAULT_UNHANDLED_WINDOW,
            inband_name: "in-band",
        }
    }

    /// Set the number of descriptors
    pub const fn with_nr_irqs(mut self, nr_irqs: usize) -> Self {
        self.nr_irqs = nr_irqs;
        self
    }

    /// Set the quarantine threshold
    pub const fn with_unhandled_limit(mut self, limit: u32) -> Self {
        self.unhandled_limit = limit;
        self
    }

    /// Set the burst window
    pub const fn with_unhandled_window(mut self, ticks: u64) -> Self {
        self.unhandled_window = ticks;
        self
    }

    /// Set the in-band stage name
    pub const fn with_inband_name(mut self, name: &'static str) -> Self {
        self.inband_name = name;
        self
    }

    /// Check the configuration against the compiled IRQ space
    pub fn validate(&self) -> PipelineResult<()> {
        if self.nr_irqs == 0 || self.nr_irqs > IRQ_BITMAP_BITS {
            return Err(PipelineError::InvalidConfig);
        }
        if self.unhandled_limit == 0 {
            return Err(PipelineError::InvalidConfig);
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}
