//! Logging abstraction layer
//!
//! The router logs through these macros so the backend can be picked at compile
//! time: the `log` feature (default) forwards to the `log` crate, the `tracing`
//! feature forwards to `tracing`. With neither enabled, logging compiles out.
//!
//! # Usage
//!
//! ```ignore
//! use page_navigator::{debug_log, trace_log, warn_log};
//!
//! trace_log!("fetch cache hit for {}", url);
//! debug_log!("navigation {} accepted: {}", token, url);
//! warn_log!("falling back to full reload of {}", url);
//! ```

/// Trace-level logging
///
/// Used for per-request cache and matcher chatter.
#[macro_export]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        ::tracing::trace!($($arg)*);
        #[cfg(feature = "log")]
        ::log::trace!($($arg)*);
    };
}

/// Debug-level logging
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        ::tracing::debug!($($arg)*);
        #[cfg(feature = "log")]
        ::log::debug!($($arg)*);
    };
}

/// Info-level logging
#[macro_export]
macro_rules! info_log {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        ::tracing::info!($($arg)*);
        #[cfg(feature = "log")]
        ::log::info!($($arg)*);
    };
}

/// Warn-level logging
///
/// Emitted when navigation degrades (full reloads, dropped payloads).
#[macro_export]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        ::tracing::warn!($($arg)*);
        #[cfg(feature = "log")]
        ::log::warn!($($arg)*);
    };
}

/// Error-level logging
#[macro_export]
macro_rules! error_log {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        ::tracing::error!($($arg)*);
        #[cfg(feature = "log")]
        ::log::error!($($arg)*);
    };
}
