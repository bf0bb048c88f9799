//! Vesper-OS kernel logging (`klog`).
//!
//! This crate provides runtime-filtered logging macros that replace ungated
//! `println!` usage throughout the kernel.  It is designed to be a lightweight
//! dependency that every kernel sub-crate can import without pulling in
//! heavyweight subsystems.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Filtered | Use case |
//! |-------|--------------|----------|----------|
//! | [`kprintln!`] | Compiled out | No | Debug diagnostics (replaces `println!`) |
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_always!`] | Active | No | Boot banners, status messages |
//!
//! # Output Sink
//!
//! The crate itself has no knowledge of the console: the boot path registers
//! a sink once via [`set_sink`] (the serial or framebuffer writer), and all
//! macros route through it.  Until a sink is registered, output is discarded.
//! This keeps `klog` free of driver dependencies and lets host-side tests
//! capture kernel output.
//!
//! # Filtering
//!
//! Log filtering is **runtime**: the boot path calls [`set_level`] with the
//! minimum level to emit.  The hot path is a single `Relaxed` atomic load +
//! integer compare.  `Debug` and `Trace` are additionally compiled out in
//! release builds.

#![no_std]

use core::sync::atomic::{AtomicU8, Ordering};

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages.
///
/// Ordered from least severe ([`Trace`](Level::Trace)) to most severe
/// ([`Error`](Level::Error)).  The runtime filter allows messages at or above
/// the configured minimum level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness.
    Error = 4,
}

// ============================================================================
// Runtime Filter
// ============================================================================

/// Sentinel: all output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level.  Messages with `level >= LOG_MIN_LEVEL` are emitted.
/// Initialised to DISABLED; the boot path must call [`set_level`].
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Set the minimum level to emit.
///
/// Called once during early boot; safe to call again if the verbosity changes
/// at runtime.
#[inline]
pub fn set_level(level: Level) {
    LOG_MIN_LEVEL.store(level as u8, Ordering::Release);
}

/// Disable all klog output.  Does **not** affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
///
/// Hot path: single `Relaxed` atomic load + integer compare.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

// ============================================================================
// Output Sink
// ============================================================================

/// Sink signature: receives fully formatted arguments, terminator included.
pub type Sink = fn(core::fmt::Arguments);

/// One-time registered output sink.
static SINK: spin::Once<Sink> = spin::Once::new();

/// Register the output sink.
///
/// Only the first registration takes effect; later calls are ignored.
pub fn set_sink(sink: Sink) {
    SINK.call_once(|| sink);
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_print(args: core::fmt::Arguments) {
    if let Some(sink) = SINK.get() {
        sink(args);
    }
}

// ============================================================================
// Macros
// ============================================================================

/// Unfiltered kernel output (boot banners, status messages).
#[macro_export]
macro_rules! klog_always {
    () => {{
        $crate::_klog_print(format_args!("\n"));
    }};
    ($($arg:tt)+) => {{
        $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
    }};
}

/// Debug-only kernel print — drop-in replacement for `println!`.
///
/// **Fully compiled out** in release builds (zero cost, zero binary impact).
/// Use this for developer diagnostics that should never appear in production.
#[macro_export]
macro_rules! kprintln {
    () => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!();
    }};
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

/// Level-filtered kernel logging.
///
/// `Debug` and `Trace` levels are additionally compiled out in release builds,
/// so they incur zero cost in production even if the filter would allow them.
///
/// # Examples
///
/// ```ignore
/// klog!(Error, "net: TX ring full on interface {}", id);
/// klog!(Info,  "net: loopback registered as interface {}", id);
/// klog!(Trace, "net: RX worker {} picked up a frame", id);
/// ```
#[macro_export]
macro_rules! klog {
    // ---- Error (always compiled in, runtime-filtered) ----
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    // ---- Warn (always compiled in, runtime-filtered) ----
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    // ---- Info (always compiled in, runtime-filtered) ----
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    // ---- Debug (compiled out in release) ----
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    // ---- Trace (compiled out in release) ----
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: the filter is a process-wide static, and the harness runs
    // tests concurrently.
    #[test]
    fn filter_respects_minimum_level() {
        set_level(Level::Warn);
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Warn));
        assert!(!enabled(Level::Info));
        assert!(!enabled(Level::Trace));

        set_level(Level::Trace);
        assert!(enabled(Level::Trace));

        disable();
        assert!(!enabled(Level::Error));
    }
}
