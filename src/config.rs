use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;
use tracing::warn;

use crate::account::TargetIdentity;
use crate::provision::SystemAccountStore;

/// Environment variable carrying the uid the wrapped command should run as.
pub const LOCAL_USER_ID: &str = "LOCAL_USER_ID";

/// Uid used when `LOCAL_USER_ID` is missing or unusable.
pub const DEFAULT_UID: u32 = 9001;

/// Where the uid came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UidSource {
    /// Parsed from `LOCAL_USER_ID`.
    Environment,
    /// `LOCAL_USER_ID` was not set.
    DefaultUnset,
    /// `LOCAL_USER_ID` was set to something that is not a positive uid.
    DefaultInvalid(String),
}

/// Resolve the target uid from the raw value of `LOCAL_USER_ID`.
///
/// Anything other than a positive integer that fits a uid falls back to [`DEFAULT_UID`].
pub fn resolve_uid(raw: Option<OsString>) -> (u32, UidSource) {
    let Some(raw) = raw else {
        return (DEFAULT_UID, UidSource::DefaultUnset);
    };
    let text = raw.to_string_lossy();
    match text.trim().parse::<u32>() {
        // uid_t(-1) is reserved as "no change" by setuid(2) and friends.
        Ok(uid) if uid > 0 && uid != u32::MAX => (uid, UidSource::Environment),
        _ => (DEFAULT_UID, UidSource::DefaultInvalid(text.into_owned())),
    }
}

/// Read `LOCAL_USER_ID` from the process environment, logging any fallback.
pub fn uid_from_env() -> u32 {
    let (uid, source) = resolve_uid(std::env::var_os(LOCAL_USER_ID));
    match source {
        UidSource::Environment => {}
        UidSource::DefaultUnset => {
            warn!(uid, "{LOCAL_USER_ID} is not set, using the default uid");
        }
        UidSource::DefaultInvalid(value) => {
            warn!(uid, %value, "{LOCAL_USER_ID} is not a valid uid, using the default uid");
        }
    }
    uid
}

/// Provision a local user matching `LOCAL_USER_ID`, then run a command as that user.
#[derive(Parser, Debug, Clone)]
#[command(name = "become-user", version)]
pub struct ShimArgs {
    /// Name of the account to provision.
    #[arg(long, env = "SHIM_USER_NAME", default_value = "developer")]
    pub user_name: String,

    /// Login shell of the account, also run when no command is given.
    #[arg(long, env = "SHIM_SHELL", default_value = "/bin/bash")]
    pub shell: PathBuf,

    /// Directory the account's home directory is created in.
    #[arg(long, env = "SHIM_HOME_BASE", default_value = "/home")]
    pub home_base: PathBuf,

    /// Account database to consult.
    #[arg(long, env = "SHIM_PASSWD_FILE", default_value = "/etc/passwd")]
    pub passwd_file: PathBuf,

    /// Privilege-escalation allowlist to append the grant to.
    #[arg(long, env = "SHIM_SUDOERS_FILE", default_value = "/etc/sudoers")]
    pub sudoers_file: PathBuf,

    /// Program used to create the account.
    #[arg(long, env = "SHIM_USERADD", default_value = "useradd")]
    pub useradd: PathBuf,

    /// Command to run as the provisioned user. Put `--` before it so its arguments are not
    /// read as options of this program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<OsString>,
}

impl ShimArgs {
    /// The identity to provision for `uid`.
    pub fn identity(&self, uid: u32) -> TargetIdentity {
        TargetIdentity::new(uid, &self.user_name, &self.home_base, &self.shell)
    }

    /// The account store these arguments point at.
    pub fn store(&self) -> SystemAccountStore {
        SystemAccountStore {
            passwd_file: self.passwd_file.clone(),
            sudoers_file: self.sudoers_file.clone(),
            useradd: self.useradd.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_uid_is_used() {
        assert_eq!(
            resolve_uid(Some("1000".into())),
            (1000, UidSource::Environment)
        );
        assert_eq!(
            resolve_uid(Some(" 4242\n".into())),
            (4242, UidSource::Environment)
        );
    }

    #[test]
    fn missing_uid_falls_back() {
        assert_eq!(resolve_uid(None), (DEFAULT_UID, UidSource::DefaultUnset));
    }

    #[test]
    fn unusable_uids_fall_back() {
        for bad in ["notanumber", "", "0", "-5", "1.5", "4294967295", "99999999999"] {
            let (uid, source) = resolve_uid(Some(bad.into()));
            assert_eq!(uid, DEFAULT_UID, "{bad:?}");
            assert_eq!(source, UidSource::DefaultInvalid(bad.to_owned()));
        }
    }

    #[test]
    fn args_default_to_developer() {
        let args = ShimArgs::try_parse_from(["become-user", "whoami"]).unwrap();
        assert_eq!(args.user_name, "developer");
        assert_eq!(args.command, [OsString::from("whoami")]);
        let identity = args.identity(1000);
        assert_eq!(identity.home, PathBuf::from("/home/developer"));
    }

    #[test]
    fn options_before_separator_belong_to_the_shim() {
        let args =
            ShimArgs::try_parse_from(["become-user", "--shell", "/bin/sh", "--", "env", "--version"])
                .unwrap();
        assert_eq!(args.shell, PathBuf::from("/bin/sh"));
        assert_eq!(args.command, ["env", "--version"].map(OsString::from));
    }

    #[test]
    fn command_flags_are_not_parsed_as_options() {
        let args =
            ShimArgs::try_parse_from(["become-user", "--", "ls", "-la", "--color"]).unwrap();
        assert_eq!(args.command, ["ls", "-la", "--color"].map(OsString::from));
    }
}
