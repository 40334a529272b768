use std::path::{Path, PathBuf};

/// The user the wrapped command should end up running as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetIdentity {
    pub uid: u32,
    pub username: String,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl TargetIdentity {
    /// Identity for `username` with `uid`, homed under `home_base`.
    pub fn new(
        uid: u32,
        username: impl Into<String>,
        home_base: impl AsRef<Path>,
        shell: impl Into<PathBuf>,
    ) -> TargetIdentity {
        let username = username.into();
        TargetIdentity {
            uid,
            home: home_base.as_ref().join(&username),
            username,
            shell: shell.into(),
        }
    }
}

/// A resolved entry of the account database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl Account {
    /// Parse one line in `/etc/passwd` format: `name:password:uid:gid:gecos:home:shell`.
    ///
    /// Returns None for comments, blank lines, and malformed entries.
    pub fn parse_passwd_line(line: &str) -> Option<Account> {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut fields = line.split(':');
        let name = fields.next()?;
        let _password = fields.next()?;
        let uid = fields.next()?.parse().ok()?;
        let gid = fields.next()?.parse().ok()?;
        let _gecos = fields.next()?;
        let home = fields.next()?;
        let shell = fields.next().unwrap_or("");

        if name.is_empty() {
            return None;
        }

        Some(Account {
            name: name.to_owned(),
            uid,
            gid,
            home: PathBuf::from(home),
            shell: PathBuf::from(shell),
        })
    }

    /// Parse a whole passwd-format database, skipping lines that do not parse.
    pub fn parse_passwd(contents: &str) -> Vec<Account> {
        contents.lines().filter_map(Account::parse_passwd_line).collect()
    }
}
