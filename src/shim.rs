//! Hand a container's command over to a local user matching the caller's uid.
//!
//! The handoff runs strictly forward through [`Step`]s: resolve the uid, provision the account,
//! grant it passwordless root, set up its environment, then replace the current process. A
//! failure at any step ends the handoff; nothing is executed under a wrong identity.

use std::ffi::{CString, OsString};

use tracing::{debug, info, span, warn, Level};

use crate::account::{Account, TargetIdentity};
use crate::command::Command;
use crate::error::{Error, ShimError};
use crate::libc_util;
use crate::provision::AccountStore;
use crate::spawn::EXEC_FAILED;

/// Progress of a handoff. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    Start,
    ResolvingUid,
    ProvisioningUser,
    GrantingPrivilege,
    SettingEnv,
    Exec,
}

/// Drives one handoff for `identity` against an [`AccountStore`].
pub struct Shim<'a, S: AccountStore> {
    store: &'a mut S,
    identity: TargetIdentity,
    step: Step,
}

/// A fully prepared handoff: the provisioned account and the command to become.
#[derive(Debug)]
pub struct Handoff {
    pub account: Account,
    pub command: Command,
}

impl<'a, S: AccountStore> Shim<'a, S> {
    pub fn new(store: &'a mut S, identity: TargetIdentity) -> Shim<'a, S> {
        Shim {
            store,
            identity,
            step: Step::Start,
        }
    }

    /// The last step entered.
    pub fn step(&self) -> Step {
        self.step
    }

    fn enter(&mut self, step: Step) {
        debug_assert!(step > self.step, "handoff steps only move forward");
        debug!(from = ?self.step, to = ?step, "handoff step");
        self.step = step;
    }

    /// Run every step up to, but not including, the exec.
    ///
    /// `current_euid` is the effective uid of the process that will exec. Root switches to the
    /// account; a process already running as the account's uid keeps its identity; anything else
    /// cannot become the account and fails.
    pub fn prepare(
        &mut self,
        command: &[OsString],
        current_euid: u32,
    ) -> Result<Handoff, ShimError> {
        let span = span!(
            Level::DEBUG,
            "handoff",
            user = %self.identity.username,
            uid = self.identity.uid
        );
        let _span_guard = span.enter();

        // The uid was resolved when `identity` was built; record the step all the same.
        self.enter(Step::ResolvingUid);
        debug!(uid = self.identity.uid, "resolved uid");

        self.enter(Step::ProvisioningUser);
        let account = provision_user(&mut *self.store, &self.identity)?;

        self.enter(Step::GrantingPrivilege);
        self.store.grant_root(&account.name)?;

        self.enter(Step::SettingEnv);
        let command = build_command(&self.identity, &account, command, current_euid)?;

        Ok(Handoff { account, command })
    }

    /// Run every step and replace the current process. Only returns on failure.
    pub fn run(mut self, command: &[OsString]) -> ShimError {
        let euid = unsafe { libc::geteuid() };
        let handoff = match self.prepare(command, euid) {
            Ok(handoff) => handoff,
            Err(e) => return e,
        };
        self.enter(Step::Exec);
        handoff.exec()
    }
}

impl Handoff {
    /// Replace the current process with the prepared command.
    pub fn exec(self) -> ShimError {
        info!(
            user = %self.account.name,
            uid = self.account.uid,
            gid = self.account.gid,
            program = ?self.command.get_program(),
            "handing off"
        );
        let err = self.command.exec();
        if err.cause == Some(EXEC_FAILED) {
            ShimError::Exec {
                program: self.command.get_program().to_string_lossy().into_owned(),
                source: err,
            }
        } else {
            ShimError::Identity {
                user: self.account.name,
                uid: self.account.uid,
                source: err,
            }
        }
    }
}

/// Make sure an account for `identity` exists, and return it as recorded in the store.
///
/// - An account with the same name and uid is reused.
/// - An account with the same name but another uid cannot be reconciled and is an error.
/// - Other accounts already using the uid are tolerated; the new account shares the uid.
pub fn provision_user<S: AccountStore>(
    store: &mut S,
    identity: &TargetIdentity,
) -> Result<Account, ShimError> {
    let fail = |reason: String| ShimError::Provisioning {
        user: identity.username.clone(),
        uid: identity.uid,
        reason,
    };

    if let Some(existing) = store.find_by_name(&identity.username)? {
        if existing.uid == identity.uid {
            debug!(user = %existing.name, uid = existing.uid, "reusing existing account");
            return Ok(existing);
        }
        return Err(fail(format!(
            "account already exists with uid {}",
            existing.uid
        )));
    }

    for other in store.find_by_uid(identity.uid)? {
        warn!(
            uid = identity.uid,
            existing = %other.name,
            "uid already in use, creating a second account for it"
        );
    }

    store.create_user(identity)?;

    match store.find_by_name(&identity.username)? {
        Some(account) if account.uid == identity.uid => Ok(account),
        Some(account) => Err(fail(format!(
            "account was created with uid {} instead",
            account.uid
        ))),
        None => Err(fail("account missing after creation".to_owned())),
    }
}

/// Build the final command: the requested program, or the account's shell, with the account's
/// environment and identity.
fn build_command(
    identity: &TargetIdentity,
    account: &Account,
    command: &[OsString],
    current_euid: u32,
) -> Result<Command, ShimError> {
    let shell = if account.shell.as_os_str().is_empty() {
        identity.shell.clone()
    } else {
        account.shell.clone()
    };

    let mut cmd = match command.split_first() {
        Some((program, args)) => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
        None => {
            debug!(shell = %shell.display(), "no command given, running shell");
            Command::new(&shell)
        }
    };

    cmd.env("HOME", &account.home);
    cmd.env("USER", &account.name);
    cmd.env("LOGNAME", &account.name);
    cmd.env("SHELL", &shell);

    let identity_error = |source: Error| ShimError::Identity {
        user: account.name.clone(),
        uid: account.uid,
        source,
    };

    if current_euid == 0 {
        let name = CString::new(account.name.as_bytes()).map_err(|_| {
            identity_error(Error::from_errno(libc::EINVAL).cause("user name contains NUL"))
        })?;
        let groups = libc_util::group_list(&name, account.gid).map_err(identity_error)?;
        cmd.groups(groups);
        cmd.gid(account.gid);
        cmd.uid(account.uid);
    } else if current_euid == account.uid {
        debug!(uid = current_euid, "already running as the account, keeping identity");
    } else {
        return Err(identity_error(
            Error::from_errno(libc::EPERM).cause("not running as root"),
        ));
    }

    Ok(cmd)
}
