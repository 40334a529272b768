//! PID 1 duties: run one child, forward signals to it, reap every zombie, and exit with the
//! child's status.

use std::ffi::{c_int, OsString};
use std::time::Duration;

use tracing::{debug, info, span, warn, Level};

use crate::command::{Command, ExitStatus};
use crate::error::{Error, Result};
use crate::libc_util;

/// Upper bound on how long zombies can linger if a `SIGCHLD` is coalesced or missed.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Why the reaper stopped before its child finished.
#[derive(Debug, thiserror::Error)]
pub enum ReaperError {
    /// The child could not be started. Carries the exec errno.
    #[error("failed to start child: {0}")]
    Spawn(Error),
    /// Setting up or running the signal loop failed.
    #[error("failed to supervise child: {0}")]
    Supervise(Error),
}

impl ReaperError {
    /// Exit status for the reaper itself: 127/126 for exec failures, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReaperError::Spawn(e) => crate::error::exec_failure_code(e.errno),
            ReaperError::Supervise(_) => 1,
        }
    }
}

/// Run `argv` as the single supervised child until it exits.
///
/// The calling thread's signal mask is replaced for the duration; the child receives the original
/// mask.
pub fn run(argv: &[OsString]) -> std::result::Result<ExitStatus, ReaperError> {
    let span = span!(Level::DEBUG, "reaper");
    let _span_guard = span.enter();

    let Some((program, args)) = argv.split_first() else {
        return Err(ReaperError::Spawn(
            Error::from_errno(libc::ENOENT).cause("no command given"),
        ));
    };

    become_subreaper().map_err(ReaperError::Supervise)?;

    let signals = libc_util::forwardable_signals();
    let original_mask = libc_util::block_signals(&signals).map_err(ReaperError::Supervise)?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.signal_mask(original_mask);
    cmd.new_process_group(true);

    let child = cmd.spawn().map_err(ReaperError::Spawn)?;
    info!(pid = child.id(), program = ?program, "started child");

    supervise(child.id(), child.pgid(), &signals).map_err(ReaperError::Supervise)
}

/// Register as a child subreaper when we are not PID 1, so orphans still land on us.
fn become_subreaper() -> Result<()> {
    if unsafe { libc::getpid() } == 1 {
        return Ok(());
    }
    let 0 = (unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) }) else {
        return Err(Error::last_os_error().cause("failed to become child subreaper"));
    };
    debug!("registered as child subreaper");
    Ok(())
}

/// Forward signals and reap until the child `pid` exits.
fn supervise(pid: c_int, pgid: c_int, signals: &libc::sigset_t) -> Result<ExitStatus> {
    loop {
        match libc_util::wait_for_signal(signals, REAP_INTERVAL)? {
            None | Some(libc::SIGCHLD) => {}
            Some(sig) => {
                debug!(signal = libc_util::signal_name(sig), sig, "forwarding signal");
                if let Err(e) = libc_util::forward_signal(pid, pgid, sig) {
                    warn!(signal = libc_util::signal_name(sig), sig, err = %e, "failed to forward signal");
                }
            }
        }

        if let Some(status) = reap_all(pid)? {
            info!(?status, "child exited");
            return Ok(ExitStatus(status));
        }
    }
}

/// Collect every exited child. Returns the status of `pid` if it was among them.
fn reap_all(pid: c_int) -> Result<Option<libc_util::ExitStatus>> {
    let mut main_status = None;
    while let Some((reaped, status)) = libc_util::reap_one()? {
        if reaped == pid {
            main_status = Some(status);
        } else {
            debug!(pid = reaped, ?status, "reaped orphan");
        }
    }
    Ok(main_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_failure_maps_to_127() {
        let err = ReaperError::Spawn(Error::from_errno(libc::ENOENT));
        assert_eq!(err.exit_code(), 127);
        let err = ReaperError::Spawn(Error::from_errno(libc::EACCES));
        assert_eq!(err.exit_code(), 126);
        let err = ReaperError::Supervise(Error::from_errno(libc::EPERM));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn empty_command_is_a_spawn_error() {
        let err = run(&[]).unwrap_err();
        assert!(matches!(err, ReaperError::Spawn(_)));
        assert_eq!(err.exit_code(), 127);
    }

    #[test]
    fn display_names_the_failed_phase() {
        let err = ReaperError::Spawn(Error::from_errno(libc::ENOENT).cause("exec failed"));
        assert!(err.to_string().starts_with("failed to start child: "), "{err}");
        let err = ReaperError::Supervise(Error::from_errno(libc::EPERM));
        assert!(err.to_string().starts_with("failed to supervise child: "), "{err}");
        let _: &dyn std::error::Error = &err;
    }
}
