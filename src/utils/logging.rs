//! Per-module switches for delivery chatter.
//!
//! The delivery loop wakes on every poll tick and logs each claim, retry and
//! expiry, so a module can mute its debug, info and warn lines with a
//! module-level `ENABLE_LOGS` without touching `RUST_LOG` for the rest of the
//! crate. `log_error!` ignores the switch: a record that failed locally or was
//! rejected must always leave a trace.
//!
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_info, log_warn};
//!
//! log_info!("drained {} records", count);
//! ```

#[doc(hidden)]
#[macro_export]
macro_rules! __log_gated {
    ($level:expr, $($arg:tt)*) => {
        if ENABLE_LOGS {
            log::log!($level, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::__log_gated!(log::Level::Debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::__log_gated!(log::Level::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::__log_gated!(log::Level::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        log::error!($($arg)*)
    };
}

#[cfg(test)]
mod tests {
    const ENABLE_LOGS: bool = false;

    #[test]
    fn muted_module_still_evaluates_to_unit() {
        let count = 3;
        let () = crate::log_debug!("drained {count} records");
        let () = crate::log_warn!("retrying {} records", count);
        let () = crate::log_error!("{count} records failed locally");
    }
}
