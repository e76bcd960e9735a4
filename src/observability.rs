//! Crate-internal logging macros.
//!
//! Events go to `tracing` when that feature is enabled, otherwise to `log`
//! under the `logging` feature, otherwise nowhere. Format arguments are
//! evaluated in every case so all three builds type-check the same call sites.
//!
//! Never pass credential material to these macros. Tokens and secrets are
//! redacted from `Debug` output, but `Display` on raw strings is not.

macro_rules! emit {
    ($level:ident, $($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::$level!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::$level!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::observability::emit!(debug, $($arg)*) };
}

macro_rules! log_info {
    ($($arg:tt)*) => { $crate::observability::emit!(info, $($arg)*) };
}

macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::observability::emit!(warn, $($arg)*) };
}

pub(crate) use emit;
pub(crate) use log_debug;
pub(crate) use log_info;
pub(crate) use log_warn;
