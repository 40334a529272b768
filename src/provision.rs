use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;

use tracing::{debug, info};

use crate::account::{Account, TargetIdentity};
use crate::error::ShimError;

/// Access to the account database and the privilege-escalation allowlist.
pub trait AccountStore {
    /// Look up an account by name.
    fn find_by_name(&self, name: &str) -> Result<Option<Account>, ShimError>;

    /// All accounts which have `uid`.
    fn find_by_uid(&self, uid: u32) -> Result<Vec<Account>, ShimError>;

    /// Create an account for `identity`, with its home directory.
    fn create_user(&mut self, identity: &TargetIdentity) -> Result<(), ShimError>;

    /// Allow `username` to run any command as root without a password.
    fn grant_root(&mut self, username: &str) -> Result<(), ShimError>;
}

/// The sudoers rule granting `username` passwordless root.
pub fn sudoers_rule(username: &str) -> String {
    format!("{username} ALL=(ALL) NOPASSWD: ALL")
}

/// [`AccountStore`] backed by the system's passwd file, `useradd`, and sudoers file.
#[derive(Clone, Debug)]
pub struct SystemAccountStore {
    pub passwd_file: PathBuf,
    pub sudoers_file: PathBuf,
    pub useradd: PathBuf,
}

impl SystemAccountStore {
    fn read_accounts(&self, user: &str, uid: u32) -> Result<Vec<Account>, ShimError> {
        let contents =
            std::fs::read_to_string(&self.passwd_file).map_err(|e| ShimError::Provisioning {
                user: user.to_owned(),
                uid,
                reason: format!("reading {}: {e}", self.passwd_file.display()),
            })?;
        Ok(Account::parse_passwd(&contents))
    }
}

impl AccountStore for SystemAccountStore {
    fn find_by_name(&self, name: &str) -> Result<Option<Account>, ShimError> {
        Ok(self
            .read_accounts(name, 0)?
            .into_iter()
            .find(|a| a.name == name))
    }

    fn find_by_uid(&self, uid: u32) -> Result<Vec<Account>, ShimError> {
        Ok(self
            .read_accounts("", uid)?
            .into_iter()
            .filter(|a| a.uid == uid)
            .collect())
    }

    fn create_user(&mut self, identity: &TargetIdentity) -> Result<(), ShimError> {
        let fail = |reason: String| ShimError::Provisioning {
            user: identity.username.clone(),
            uid: identity.uid,
            reason,
        };

        let mut cmd = process::Command::new(&self.useradd);
        cmd.arg("--shell")
            .arg(&identity.shell)
            .arg("-u")
            .arg(identity.uid.to_string())
            .arg("-o")
            .arg("-c")
            .arg("")
            .arg("-d")
            .arg(&identity.home)
            .arg("-m")
            .arg(&identity.username);
        debug!(?cmd, "creating user");

        let output = cmd
            .output()
            .map_err(|e| fail(format!("running {}: {e}", self.useradd.display())))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!(
                "{} {}: {}",
                self.useradd.display(),
                output.status,
                stderr.trim()
            )));
        }

        info!(user = %identity.username, uid = identity.uid, "created user");
        Ok(())
    }

    fn grant_root(&mut self, username: &str) -> Result<(), ShimError> {
        let rule = sudoers_rule(username);
        let appended = append_line_once(&self.sudoers_file, &rule).map_err(|source| {
            ShimError::PrivilegeGrant {
                user: username.to_owned(),
                path: self.sudoers_file.clone(),
                source,
            }
        })?;

        if appended {
            info!(user = %username, path = %self.sudoers_file.display(), "granted passwordless root");
        } else {
            debug!(user = %username, "passwordless root already granted");
        }
        Ok(())
    }
}

/// Append `line` to the file at `path` unless an identical line is already present.
///
/// Returns whether the line was appended. The file must already exist.
fn append_line_once(path: &Path, line: &str) -> std::io::Result<bool> {
    let mut file = OpenOptions::new().read(true).append(true).open(path)?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    if contents.lines().any(|l| l.trim() == line) {
        return Ok(false);
    }

    file.seek(SeekFrom::End(0))?;
    let mut entry = String::new();
    if !contents.is_empty() && !contents.ends_with('\n') {
        entry.push('\n');
    }
    entry.push_str(line);
    entry.push('\n');
    file.write_all(entry.as_bytes())?;
    file.flush()?;

    Ok(true)
}
