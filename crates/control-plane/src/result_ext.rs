//! Result extension trait for logging errors with context.

use std::fmt::Display;
use tracing::error;

/// Extension trait for logging errors with context.
///
/// Used where an error is handled by logging it and moving on: deferred-task
/// dispatch, compensation replay and relay loops.
pub trait ResultExt<T, E> {
    /// Log the error with context and the caller's source location if this
    /// is an `Err`. Returns the original `Result` unchanged.
    ///
    /// ```ignore
    /// use execustack_control_plane::result_ext::ResultExt;
    ///
    /// let _ = broker.publish(&destination, &body).await.log("dispatching deferred task");
    /// ```
    fn log<S: ToString>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            error!(
                target: "execustack_control_plane",
                error = %e,
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }
}
