use alloc_counter::no_alloc;
use std::ffi::{c_char, c_int};
use std::ptr;

use tracing::{debug, span, Level};

use crate::error::{bail_errno, exec_failure_code, Error, Result};
use crate::libc_util::*;

/// Cause attached to errors from the final `execvp(3)`, as opposed to the setup before it.
pub const EXEC_FAILED: &str = "execvp failed";

/// Context for process execution.
///
/// Everything here is resolved by the caller beforehand so that the work between `fork(2)` and
/// `execvp(3)` stays allocation-free and async-signal-safe.
pub struct Context {
    /// Command to execute, searched on `PATH` if it contains no slash.
    pub command: *const c_char,

    /// Null-element-terminated argument list.
    pub args: Vec<*const c_char>,

    /// Null-element-terminated environment list. If None, the environment is inherited.
    pub envp: Option<Vec<*const c_char>>,

    /// Supplementary groups to install before changing gid and uid.
    pub set_groups: Option<Vec<libc::gid_t>>,

    /// Set a custom group ID for the process.
    pub set_gid: Option<u32>,

    /// Set a custom user ID for the process.
    pub set_uid: Option<u32>,

    /// Signal mask to install immediately before exec. If None, the current mask is kept.
    pub signal_mask: Option<libc::sigset_t>,

    /// Put a spawned child into its own process group, and hand it the controlling terminal if
    /// stdin is one.
    pub new_process_group: bool,
}

/// Handle representing a spawned child process.
#[derive(Debug)]
pub struct Child {
    pid: c_int,
    pgid: c_int,
}

/// Fork and execute the command described by `ctx`, returning a [`Child`].
///
/// This does not return until the child has either executed the command or failed to. A failed
/// exec is reported back through a close-on-exec socket, and surfaces here as an error after the
/// child has been collected.
///
/// # Safety
///
/// The pointers in `ctx` must be valid until this function returns.
pub unsafe fn spawn(ctx: Context) -> Result<Child> {
    let span = span!(Level::DEBUG, "spawn");
    let _span_guard = span.enter();

    // Create the exec status socket. Both ends are close-on-exec, so a successful exec closes
    // the child's end and we read EOF. A failed exec sends us the errno.
    let (status_tx_fd, status_rx_fd) = socket_pair()
        .map_err(|e| e.context("Failed to create socketpair for exec status"))?;

    let pid = libc::fork();
    if pid == -1 {
        let err = Error::last_os_error().cause("fork(2) failed");
        let _ = libc::close(status_tx_fd);
        let _ = libc::close(status_rx_fd);
        return Err(err);
    }

    if pid == 0 {
        let _ = libc::close(status_rx_fd);
        child_entrypoint(&ctx, status_tx_fd);
    }

    // After forking, close our copy of the send end.
    let _ = libc::close(status_tx_fd);
    debug!(%pid, "forked child");

    let exec_errno = socket_recv::<c_int>(status_rx_fd);
    let _ = libc::close(status_rx_fd);

    match exec_errno {
        Ok(None) => {
            debug!(%pid, "child executed command");
            let pgid = if ctx.new_process_group { pid } else { libc::getpgrp() };
            Ok(Child { pid, pgid })
        }
        Ok(Some(errno)) => {
            let status = waitpid(pid).map_err(|e| e.context("failed to collect failed child"))?;
            debug!(%pid, ?status, errno, "child failed to execute command");
            Err(Error::from_errno(errno).cause("exec failed"))
        }
        Err(e) => Err(e.context("Failed to read exec status from child")),
    }
}

/// Replace the current process image with the command described by `ctx`.
///
/// Only returns on failure.
///
/// # Safety
///
/// The pointers in `ctx` must be valid.
pub unsafe fn exec(ctx: &Context) -> Error {
    match prepare_and_exec(ctx) {
        Ok(()) => unreachable!("execvp(3) returned without error---this should never happen"),
        Err(e) => e,
    }
}

impl Child {
    /// Process ID of the child.
    pub fn pid(&self) -> c_int {
        self.pid
    }

    /// Process group the child runs in.
    pub fn pgid(&self) -> c_int {
        self.pgid
    }

    /// Wait for the child to exit, returning the exit status.
    pub fn wait(&self) -> Result<ExitStatus> {
        waitpid(self.pid)
    }
}

/// Runs on the child side of the fork. Never returns.
unsafe fn child_entrypoint(ctx: &Context, status_tx_fd: c_int) -> ! {
    // Catch any panics.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        if ctx.new_process_group {
            enter_process_group()?;
        }
        prepare_and_exec(ctx)
    }));

    let errno = match result {
        Ok(Err(e)) if e.errno != 0 => e.errno,
        _ => libc::EINVAL,
    };
    let _ = socket_send::<c_int>(status_tx_fd, errno);
    libc::_exit(exec_failure_code(errno));
}

/// Move into a new process group and, when stdin is a terminal, make it the foreground group.
///
/// Must run while `SIGTTOU` is still blocked, or `tcsetpgrp(3)` stops us.
#[cfg_attr(debug_assertions, no_alloc)]
unsafe fn enter_process_group() -> Result<()> {
    let 0 = libc::setpgid(0, 0) else {
        bail_errno!("setpgid failed");
    };

    if libc::isatty(libc::STDIN_FILENO) == 1 {
        // Losing the terminal race with another process is not fatal.
        let _ = libc::tcsetpgrp(libc::STDIN_FILENO, libc::getpgrp());
    }

    Ok(())
}

/// Apply identity and signal state, then exec.
#[cfg_attr(debug_assertions, no_alloc)]
unsafe fn prepare_and_exec(ctx: &Context) -> Result<()> {
    // Groups first, then gid, then uid: each step needs the privileges the next one drops.
    if let Some(groups) = &ctx.set_groups {
        let 0 = libc::setgroups(groups.len(), groups.as_ptr()) else {
            bail_errno!("setgroups failed");
        };
    }
    if let Some(gid) = ctx.set_gid {
        let 0 = libc::setgid(gid) else {
            bail_errno!("setgid failed");
        };
    }
    if let Some(uid) = ctx.set_uid {
        let 0 = libc::setuid(uid) else {
            bail_errno!("setuid failed");
        };

        // Dropping from root must be irreversible.
        if uid != 0 && libc::setuid(0) == 0 {
            return Err(Error::from_errno(libc::EPERM).cause("regained root after setuid"));
        }
    }

    // The Rust runtime ignores SIGPIPE, and ignored dispositions survive exec.
    if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
        bail_errno!("failed to reset SIGPIPE");
    }

    if let Some(mask) = &ctx.signal_mask {
        let rc = libc::pthread_sigmask(libc::SIG_SETMASK, mask, ptr::null_mut());
        if rc != 0 {
            return Err(Error::from_errno(rc).cause("failed to restore signal mask"));
        }
    }

    match &ctx.envp {
        Some(envp) => {
            libc::execvpe(ctx.command, ctx.args.as_ptr(), envp.as_ptr());
        }
        None => {
            libc::execvp(ctx.command, ctx.args.as_ptr());
        }
    }

    bail_errno!(EXEC_FAILED);
}
