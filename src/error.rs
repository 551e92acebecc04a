use thiserror::Error;

/// Builds [MonitorError::Internal] for a broken invariant.
///
/// Debug builds halt on the spot. Release builds log the failure together with a
/// backtrace and hand the error back so the caller can surface it.
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::report_internal_error($msg.to_string(), file!(), line!())
    };

    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::report_internal_error(format!($fmt, $($arg)*), file!(), line!())
    };
}

/// Errors surfaced by monitor operations.
///
/// Races between threads (inflation in progress, deflation racing an enter) are never
/// reported here; they are retried internally. Only contract violations, exhaustion and
/// broken invariants cross the API boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// `exit`, `wait`, `notify` or `notify_all` called by a thread that does not own the monitor.
    #[error("current thread is not owner ({operation})")]
    IllegalMonitorState {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// `wait` was called with a pending interrupt. The interrupt has been consumed.
    #[error("wait interrupted")]
    Interrupted,

    /// Allocating a monitor failed.
    #[error("out of memory allocating an object monitor")]
    OutOfMemory,

    /// A supposedly impossible monitor state was observed.
    #[error("internal monitor error - {message} ({file}:{line})")]
    Internal {
        /// Description of the broken invariant.
        message: String,
        /// Source file that detected it.
        file: &'static str,
        /// Source line that detected it.
        line: u32,
    },
}

impl MonitorError {
    pub(crate) fn illegal_state(operation: &'static str) -> Self {
        MonitorError::IllegalMonitorState { operation }
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;

#[cold]
#[inline(never)]
pub(crate) fn report_internal_error(message: String, file: &'static str, line: u32) -> MonitorError {
    if cfg!(debug_assertions) {
        panic!("internal monitor error - {} ({}:{})", message, file, line);
    }
    log::error!(
        target: "monitor",
        "internal monitor error - {} ({}:{})\n{:?}",
        message,
        file,
        line,
        backtrace::Backtrace::new()
    );
    MonitorError::Internal {
        message,
        file,
        line,
    }
}
