//! Elevated privilege detection.
//!
//! powermetrics refuses to run without root, so the daemon checks up front
//! instead of waiting for the utility's own error message.

/// Returns `true` when the process runs with an effective uid of 0.
#[cfg(unix)]
pub fn is_superuser() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_superuser() -> bool {
    false
}
