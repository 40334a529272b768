use std::collections::BTreeMap;
use std::ffi::{c_char, CString, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::ptr;

use crate::error::{Error, Result};
use crate::{libc_util, spawn};

/// A command to be launched by the entrypoint, either as a child or in place of the current
/// process.
pub struct Command {
    // Exec information
    command: OsString,
    args: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,

    // User and group information.
    set_uid: Option<u32>,
    set_gid: Option<u32>,
    set_groups: Option<Vec<u32>>,

    // Process lifecycle.
    signal_mask: Option<libc::sigset_t>,
    new_process_group: bool,
}

/// A handle to a spawned child process.
#[derive(Debug)]
pub struct Child(spawn::Child);

/// The exit status of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(pub(crate) libc_util::ExitStatus);

/// C-compatible buffers for a [`Command`]. The pointers in the derived [`spawn::Context`] borrow
/// from these, so this must outlive it.
struct Prepared {
    command: CString,
    args: Vec<CString>,
    envp: Option<Vec<CString>>,
}

impl Command {
    /// Create a new command.
    pub fn new(program: impl AsRef<OsStr>) -> Command {
        Command {
            command: program.as_ref().to_owned(),
            args: vec![program.as_ref().to_owned()],
            env: BTreeMap::new(),
            set_uid: None,
            set_gid: None,
            set_groups: None,
            signal_mask: None,
            new_process_group: false,
        }
    }

    /// Append an argument.
    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Command {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Append several arguments.
    pub fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> &mut Command {
        self.args
            .extend(args.into_iter().map(|e| e.as_ref().to_owned()));
        self
    }

    /// Set the value of an environment variable in the child.
    pub fn env(&mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> &mut Command {
        let key = key.as_ref().to_owned();
        let value = value.as_ref().to_owned();
        self.env.insert(key, value);
        self
    }

    /// Sets the user ID of the process, and enables setting `uid`.
    pub fn uid(&mut self, uid: u32) -> &mut Command {
        self.set_uid = Some(uid);
        self
    }

    /// Sets the group ID of the process, and enables setting `gid`.
    pub fn gid(&mut self, gid: u32) -> &mut Command {
        self.set_gid = Some(gid);
        self
    }

    /// Sets the supplementary groups of the process.
    pub fn groups(&mut self, groups: Vec<u32>) -> &mut Command {
        self.set_groups = Some(groups);
        self
    }

    /// Install this signal mask immediately before exec.
    pub fn signal_mask(&mut self, mask: libc::sigset_t) -> &mut Command {
        self.signal_mask = Some(mask);
        self
    }

    /// Run a spawned child in its own process group, in the terminal foreground if there is one.
    pub fn new_process_group(&mut self, enabled: bool) -> &mut Command {
        self.new_process_group = enabled;
        self
    }

    /// Returns an iterator over the arguments passed to the program.
    pub fn get_args(&self) -> impl Iterator<Item = &OsStr> {
        self.args.iter().map(|e| e.as_os_str())
    }

    /// Returns the environment variable overrides for the program.
    pub fn get_envs(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.env.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    /// Gets the executable name.
    pub fn get_program(&self) -> &OsStr {
        self.command.as_os_str()
    }

    /// Gets the user ID the program will run as, if it is being changed.
    pub fn get_uid(&self) -> Option<u32> {
        self.set_uid
    }

    /// Gets the group ID the program will run as, if it is being changed.
    pub fn get_gid(&self) -> Option<u32> {
        self.set_gid
    }

    /// Spawn the subprocess, and return a handle to it.
    pub fn spawn(&self) -> Result<Child> {
        let prepared = self.prepare()?;
        let ctx = self.context(&prepared);

        // SAFETY: `prepared` outlives the call.
        let child = unsafe { spawn::spawn(ctx)? };

        Ok(Child(child))
    }

    /// Replace the current process with the command. Only returns if that fails.
    pub fn exec(&self) -> Error {
        let prepared = match self.prepare() {
            Ok(p) => p,
            Err(e) => return e,
        };
        let ctx = self.context(&prepared);

        // SAFETY: `prepared` is live for the call, and on success nothing returns.
        unsafe { spawn::exec(&ctx) }
    }

    fn prepare(&self) -> Result<Prepared> {
        // Null-terminate the command.
        let Ok(command) = CString::new(self.command.as_bytes()) else {
            return Err(Error::new().cause("command contains an interior NUL"));
        };

        let args = self
            .args
            .iter()
            .map(|e| {
                CString::new(e.as_bytes())
                    .map_err(|_| Error::new().cause("argument contains internal NUL"))
            })
            .collect::<Result<Vec<_>>>()?;

        // Only build an explicit environment if something is overridden.
        let envp = if self.env.is_empty() {
            None
        } else {
            let mut env_map: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
            env_map.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
            let envp_buf = env_map
                .into_iter()
                .map(|(k, v)| {
                    let mut kv = k.into_vec();
                    kv.push(b'=');
                    kv.extend(v.into_vec());
                    CString::new(kv).map_err(|_| Error::new().cause("env contains internal NUL"))
                })
                .collect::<Result<Vec<_>>>()?;
            Some(envp_buf)
        };

        Ok(Prepared {
            command,
            args,
            envp,
        })
    }

    fn context(&self, prepared: &Prepared) -> spawn::Context {
        let mut args: Vec<*const c_char> = prepared.args.iter().map(|a| a.as_ptr()).collect();
        args.push(ptr::null());

        let envp = prepared.envp.as_ref().map(|buf| {
            let mut envp = buf.iter().map(|e| e.as_ptr()).collect::<Vec<_>>();
            envp.push(ptr::null());
            envp
        });

        spawn::Context {
            command: prepared.command.as_ptr(),
            args,
            envp,
            set_groups: self.set_groups.clone(),
            set_gid: self.set_gid,
            set_uid: self.set_uid,
            signal_mask: self.signal_mask,
            new_process_group: self.new_process_group,
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("args", &self.args)
            .field("env", &self.env)
            .field("uid", &self.set_uid)
            .field("gid", &self.set_gid)
            .field("groups", &self.set_groups)
            .field("new_process_group", &self.new_process_group)
            .finish_non_exhaustive()
    }
}

impl Child {
    /// Process ID of the child.
    pub fn id(&self) -> i32 {
        self.0.pid()
    }

    /// Process group the child runs in.
    pub fn pgid(&self) -> i32 {
        self.0.pgid()
    }

    pub fn wait(self) -> Result<ExitStatus> {
        Ok(ExitStatus(self.0.wait()?))
    }
}

impl ExitStatus {
    /// Was termination successful?
    pub fn success(&self) -> bool {
        self.0.success()
    }

    /// The code a parent should exit with to mirror this status.
    pub fn exit_code(&self) -> i32 {
        self.0.exit_code()
    }
}
