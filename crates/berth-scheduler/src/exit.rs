//! Process exit codes.
//!
//! The scheduler treats master disconnects and driver errors as fatal: the
//! process exits and the supervisor restarts it, after which it resumes
//! from persistent state.

use tracing::error;

/// Dedicated exit codes for fatal conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    General = 1,
    RegistrationFailure = 2,
    Disconnected = 3,
    DriverError = 4,
    InitializationFailure = 5,
}

/// Log and exit the process with the given code.
pub fn exit(code: ExitCode, message: &str) -> ! {
    error!(code = code as i32, message, "fatal error, exiting");
    std::process::exit(code as i32)
}
