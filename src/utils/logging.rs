//! Logging macros gated by a module-level `ENABLE_LOGS` flag.
//!
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_info, log_warn};
//!
//! log_info!("serial device {port} open");
//! ```
//!
//! Flip a module's flag to `false` to silence its lifecycle chatter without
//! touching `RUST_LOG`.

/// Frame-level tracing. Also requires `AIRWATCH_DEBUG=1`; see [`frame_debug_enabled`].
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS && $crate::utils::logging::frame_debug_enabled() {
            log::debug!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}

use std::sync::OnceLock;

pub const DEBUG_ENV: &str = "AIRWATCH_DEBUG";

static FRAME_DEBUG: OnceLock<bool> = OnceLock::new();

/// Whether per-frame debug logs were requested through `AIRWATCH_DEBUG`.
/// Read once per process.
pub fn frame_debug_enabled() -> bool {
    *FRAME_DEBUG.get_or_init(|| {
        std::env::var(DEBUG_ENV)
            .map(|value| parse_flag(&value))
            .unwrap_or(false)
    })
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Install `env_logger`, `RUST_LOG` first and `info` otherwise.
pub fn init() {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if frame_debug_enabled() {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        builder.filter_level(level);
    }
    // A second init (tests, embedding hosts) keeps the first logger.
    let _ = builder.try_init();
}
