use alloc_counter::no_alloc;
use std::ffi::{c_int, c_void};
use std::mem;

use crate::error::{bail, bail_errno, Error, Result};

/// Signals which are raised synchronously by faults in this process. These are never blocked.
const SYNCHRONOUS_SIGNALS: [c_int; 7] = [
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGABRT,
    libc::SIGTRAP,
    libc::SIGSYS,
];

/// Create a Unix stream socket pair, with both ends closed on exec.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn socket_pair() -> Result<(c_int, c_int)> {
    let mut socket_fds = [0; 2];
    let 0.. = (unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            socket_fds.as_mut_ptr(),
        )
    }) else {
        bail_errno!("failed to create socketpair");
    };
    let [a, b] = socket_fds;
    Ok((a, b))
}

/// Send a value, interpretable as bytes, to a socket's file descriptor.
///
/// # Safety
///
/// `T` must be a plain-old-data type.
#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn socket_send<T: Copy>(sock_fd: c_int, value: T) -> Result<()> {
    let size = mem::size_of::<T>();

    let result = libc::write(sock_fd, (&value) as *const T as *const c_void, size);

    if result == -1 {
        return Err(Error::last_os_error().cause("failed to send to socket"));
    }

    if (result as usize) != size {
        return Err(Error::new().cause("failed to send socket message in single write call"));
    }

    Ok(())
}

/// Receive a value, interpretable as bytes, from a socket's file descriptor.
///
/// Returns `Ok(None)` if the peer closed the socket without sending anything.
///
/// # Safety
///
/// `T` must be valid for any bit pattern.
#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn socket_recv<T: Copy>(sock_fd: c_int) -> Result<Option<T>> {
    let size = mem::size_of::<T>();

    let mut output_slot = mem::MaybeUninit::<T>::uninit();
    let result = loop {
        let result = libc::read(sock_fd, output_slot.as_mut_ptr().cast(), size);
        if result == -1 && *libc::__errno_location() == libc::EINTR {
            continue;
        }
        break result;
    };

    if result == -1 {
        return Err(Error::last_os_error().cause("failed to receive from socket"));
    };

    if result == 0 {
        return Ok(None);
    }

    if (result as usize) != size {
        return Err(Error::new().cause("failed to receive socket message in single read call"));
    }

    Ok(Some(output_slot.assume_init()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(c_int),
    Signal(c_int),
}

impl ExitStatus {
    pub fn from_wait_status(wait_status: c_int) -> Result<ExitStatus> {
        if libc::WIFEXITED(wait_status) {
            return Ok(ExitStatus::Code(libc::WEXITSTATUS(wait_status)));
        }
        if libc::WIFSIGNALED(wait_status) {
            return Ok(ExitStatus::Signal(libc::WTERMSIG(wait_status)));
        }

        bail!("invalid wait status")
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }

    /// The status a parent should exit with to mirror this one: the code itself, or `128 + N`
    /// for death by signal `N`.
    pub fn exit_code(&self) -> c_int {
        match *self {
            ExitStatus::Code(code) => code,
            ExitStatus::Signal(sig) => 128 + sig,
        }
    }
}

#[cfg_attr(debug_assertions, no_alloc)]
pub fn waitpid(pid: c_int) -> Result<ExitStatus> {
    let mut status: c_int = 0;
    loop {
        let result = unsafe { libc::waitpid(pid, &mut status as *mut c_int, 0) };
        if result >= 0 {
            break;
        }
        if unsafe { *libc::__errno_location() } != libc::EINTR {
            bail_errno!("waitpid failed");
        }
    }
    ExitStatus::from_wait_status(status)
}

/// Collect one exited child, any child, without blocking.
///
/// Returns `Ok(None)` when no child has exited yet, or when there are no children at all.
pub fn reap_one() -> Result<Option<(c_int, ExitStatus)>> {
    let mut status: c_int = 0;
    let pid = unsafe { libc::waitpid(-1, &mut status as *mut c_int, libc::WNOHANG) };
    match pid {
        0 => Ok(None),
        1.. => Ok(Some((pid, ExitStatus::from_wait_status(status)?))),
        _ => {
            let err = Error::last_os_error();
            if err.errno == libc::ECHILD {
                Ok(None)
            } else {
                Err(err.cause("waitpid(-1, WNOHANG) failed"))
            }
        }
    }
}

/// Build the set of signals this process should wait on: everything except the synchronous
/// fault signals, which must keep their default disposition.
pub fn forwardable_signals() -> libc::sigset_t {
    unsafe {
        let mut set = mem::MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigfillset(set.as_mut_ptr());
        let mut set = set.assume_init();
        for sig in SYNCHRONOUS_SIGNALS {
            libc::sigdelset(&mut set, sig);
        }
        set
    }
}

/// Block `set` in the calling thread, returning the mask that was in effect before.
pub fn block_signals(set: &libc::sigset_t) -> Result<libc::sigset_t> {
    let mut old = mem::MaybeUninit::<libc::sigset_t>::uninit();
    // pthread_sigmask returns the error number rather than setting errno.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, set, old.as_mut_ptr()) };
    if rc != 0 {
        return Err(Error::from_errno(rc).cause("failed to block signals"));
    }
    Ok(unsafe { old.assume_init() })
}

/// Resolve the supplementary group list of `user`, including `gid`, from the group database.
pub fn group_list(user: &std::ffi::CStr, gid: libc::gid_t) -> Result<Vec<libc::gid_t>> {
    let mut groups: Vec<libc::gid_t> = vec![0; 32];
    loop {
        let mut ngroups = groups.len() as c_int;
        let rc = unsafe {
            libc::getgrouplist(user.as_ptr(), gid, groups.as_mut_ptr(), &mut ngroups)
        };
        if rc >= 0 {
            groups.truncate(ngroups.max(0) as usize);
            return Ok(groups);
        }
        // The list was too small; `ngroups` now holds the required size.
        if (ngroups as usize) <= groups.len() {
            bail!("getgrouplist failed");
        }
        groups.resize(ngroups as usize, 0);
    }
}

/// Wait up to `timeout` for a signal in `set`. Returns `Ok(None)` on timeout or interruption.
pub fn wait_for_signal(
    set: &libc::sigset_t,
    timeout: std::time::Duration,
) -> Result<Option<c_int>> {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    let mut info = mem::MaybeUninit::<libc::siginfo_t>::uninit();
    let sig = unsafe { libc::sigtimedwait(set, info.as_mut_ptr(), &ts) };
    if sig >= 0 {
        return Ok(Some(sig));
    }
    let err = Error::last_os_error();
    match err.errno {
        libc::EAGAIN | libc::EINTR => Ok(None),
        _ => Err(err.cause("sigtimedwait failed")),
    }
}

/// Send `sig` to the process group `pgid`, falling back to the single process `pid` if the group
/// is already gone.
pub fn forward_signal(pid: c_int, pgid: c_int, sig: c_int) -> Result<()> {
    if unsafe { libc::kill(-pgid, sig) } == 0 {
        return Ok(());
    }
    let group_err = Error::last_os_error();
    if group_err.errno != libc::ESRCH {
        return Err(group_err.cause("failed to signal child process group"));
    }
    let 0 = (unsafe { libc::kill(pid, sig) }) else {
        bail_errno!("failed to signal child process");
    };
    Ok(())
}

/// Short, static name for a signal number, for logging.
pub fn signal_name(sig: c_int) -> &'static str {
    match sig {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGWINCH => "SIGWINCH",
        _ => "signal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_death_maps_to_128_plus_n() {
        assert_eq!(ExitStatus::Signal(libc::SIGTERM).exit_code(), 143);
        assert_eq!(ExitStatus::Signal(libc::SIGKILL).exit_code(), 137);
        assert_eq!(ExitStatus::Code(42).exit_code(), 42);
        assert!(ExitStatus::Code(0).success());
        assert!(!ExitStatus::Signal(libc::SIGINT).success());
    }

    #[test]
    fn forwardable_signals_exclude_faults() {
        let set = forwardable_signals();
        unsafe {
            assert_eq!(libc::sigismember(&set, libc::SIGTERM), 1);
            assert_eq!(libc::sigismember(&set, libc::SIGCHLD), 1);
            assert_eq!(libc::sigismember(&set, libc::SIGSEGV), 0);
            assert_eq!(libc::sigismember(&set, libc::SIGABRT), 0);
        }
    }

    #[test]
    fn closed_socket_reads_as_none() {
        let (a, b) = socket_pair().unwrap();
        unsafe {
            libc::close(a);
            assert_eq!(socket_recv::<c_int>(b).unwrap(), None);
            libc::close(b);
        }
    }

    #[test]
    fn socket_round_trip_carries_errno() {
        let (a, b) = socket_pair().unwrap();
        unsafe {
            socket_send::<c_int>(a, libc::ENOENT).unwrap();
            assert_eq!(socket_recv::<c_int>(b).unwrap(), Some(libc::ENOENT));
            libc::close(a);
            libc::close(b);
        }
    }
}
