use alloc_counter::no_alloc;
use std::ffi::c_int;
use std::path::PathBuf;

/// Result type for our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error type which can track cause (reason the error happened) and context (what we were
/// doing when the error happened) without allocating.
///
/// This is the only error type usable on the child side of `fork(2)`, before `execvp(3)`.
#[derive(Debug, Clone, Copy)]
pub struct Error {
    pub errno: c_int,
    pub cause: Option<&'static str>,
    pub context: Option<&'static str>,
}

impl Error {
    /// Create an empty error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn new() -> Error {
        Error {
            errno: 0,
            cause: None,
            context: None,
        }
    }

    /// Create an error from an explicit errno value.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn from_errno(errno: c_int) -> Error {
        Error {
            errno,
            cause: None,
            context: None,
        }
    }

    /// Create an error from the last OS error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn last_os_error() -> Error {
        Error {
            errno: unsafe { *libc::__errno_location() },
            cause: None,
            context: None,
        }
    }

    /// Replace the cause of an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn cause(self, msg: &'static str) -> Error {
        Error {
            errno: self.errno,
            cause: Some(msg),
            context: self.context,
        }
    }

    /// Replace the context of an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn context(self, msg: &'static str) -> Error {
        Error {
            errno: self.errno,
            cause: self.cause,
            context: Some(msg),
        }
    }
}

impl Default for Error {
    fn default() -> Self {
        Self::new()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error {
            errno: e.raw_os_error().unwrap_or(0),
            cause: None,
            context: None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // Get the error message from errno.
        let error_msg = unsafe { libc::strerror(self.errno) };
        let error_msg_len = unsafe { libc::strlen(error_msg) };
        let error_msg_str: &str = unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(
                error_msg as *const u8,
                error_msg_len,
            ))
        };

        match (self.context, self.cause) {
            (Some(context), None) => {
                write!(f, "{}: {} (errno {})", context, error_msg_str, self.errno)
            }
            (None, Some(cause)) => write!(f, "{}: {} (errno {})", cause, error_msg_str, self.errno),
            (Some(context), Some(cause)) => write!(
                f,
                "{}: {}: {} (errno {})",
                context, cause, error_msg_str, self.errno
            ),
            (None, None) => write!(f, "{} (errno {})", error_msg_str, self.errno),
        }
    }
}

impl std::error::Error for Error {}

/// Failure of one step of the identity handoff. Each variant names the step that failed.
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error("provisioning user {user:?} (uid {uid}) failed: {reason}")]
    Provisioning {
        user: String,
        uid: u32,
        reason: String,
    },

    #[error("granting passwordless root to {user:?} in {} failed: {source}", path.display())]
    PrivilegeGrant {
        user: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("switching to user {user:?} (uid {uid}) failed: {source}")]
    Identity {
        user: String,
        uid: u32,
        source: Error,
    },

    #[error("executing {program:?} failed: {source}")]
    Exec { program: String, source: Error },
}

impl ShimError {
    /// Process exit status to report for this failure.
    ///
    /// Exec failures follow the shell convention: 127 when the program was not found, 126 when
    /// it exists but could not be run.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShimError::Exec { source, .. } => exec_failure_code(source.errno),
            _ => 1,
        }
    }
}

/// Map the errno of a failed `execvp(3)` to a shell-style exit status.
pub fn exec_failure_code(errno: c_int) -> i32 {
    match errno {
        libc::ENOENT | libc::ENOTDIR => 127,
        _ => 126,
    }
}

// Define a macro, bail!, which returns an error with no errno and a custom message.
macro_rules! bail {
    ($msg:expr) => {
        return Err(Error {
            errno: 0,
            cause: Some($msg),
            context: None,
        })
    };
}
pub(crate) use bail;

// Define a macro, bail_errno!, which returns an error with the last OS error:
//
// - `bail_errno!()` returns an error with the last OS error.
// - `bail_errno!(msg)` returns an error with the last OS error and a context message.
macro_rules! bail_errno {
    () => {
        return Err(Error::last_os_error());
    };
    ($msg:expr) => {
        return Err(Error::last_os_error().cause($msg));
    };
}
pub(crate) use bail_errno;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_and_cause() {
        let err = Error::from_errno(libc::EPERM)
            .cause("setuid failed")
            .context("dropping privileges");
        let msg = err.to_string();
        assert!(msg.starts_with("dropping privileges: setuid failed: "), "{msg}");
        assert!(msg.ends_with(&format!("(errno {})", libc::EPERM)), "{msg}");
    }

    #[test]
    fn exec_errors_use_shell_exit_codes() {
        let missing = ShimError::Exec {
            program: "nope".into(),
            source: Error::from_errno(libc::ENOENT),
        };
        let denied = ShimError::Exec {
            program: "/etc/passwd".into(),
            source: Error::from_errno(libc::EACCES),
        };
        assert_eq!(missing.exit_code(), 127);
        assert_eq!(denied.exit_code(), 126);
    }

    #[test]
    fn provisioning_errors_exit_1_and_name_the_step() {
        let err = ShimError::Provisioning {
            user: "developer".into(),
            uid: 1000,
            reason: "useradd exited with status 9".into(),
        };
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().starts_with("provisioning user"));
    }
}
