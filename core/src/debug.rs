//! # Pipeline Contract Checks
//!
//! Hot paths verify their calling contract (hard IRQs off, right stage,
//! valid IRQ number) through [`warn_on_once!`](crate::warn_on_once). Checks
//! are compiled in with `debug_assertions` or the `debug-pipeline` feature.
//!
//! A failed check panics in debug builds. Otherwise it is logged once per
//! call site and execution continues.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

/// Whether contract checks are compiled in
pub const PIPELINE_DEBUG: bool = cfg!(any(debug_assertions, feature = "debug-pipeline"));

/// Evaluate a contract violation condition, report it once, return it
///
/// ```rust,ignore
/// if warn_on_once!(!hard_irqs_disabled, "hard IRQs on") {
///     return;
/// }
/// ```
#[macro_export]
macro_rules! warn_on_once {
    ($cond:expr, $($arg:tt)+) => {{
        let hit = $crate::debug::PIPELINE_DEBUG && ($cond);
        if hit {
            static WARNED: core::sync::atomic::AtomicBool =
                core::sync::atomic::AtomicBool::new(false);
            $crate::debug::report(&WARNED, format_args!($($arg)+));
        }
        hit
    }};
}

/// Report a contract violation
#[doc(hidden)]
#[cold]
pub fn report(warned: &AtomicBool, args: fmt::Arguments<'_>) {
    if cfg!(debug_assertions) {
        panic!("IRQ pipeline: {}", args);
    }
    if !warned.swap(true, Ordering::Relaxed) {
        log::error!("IRQ pipeline: {}", args);
    }
}
