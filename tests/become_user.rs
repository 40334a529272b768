use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};

const ENTRYPOINT: &str = env!("CARGO_BIN_EXE_entrypoint");
const BECOME_USER: &str = env!("CARGO_BIN_EXE_become-user");

/// The uid the shim can actually hand off to from this test process, and the `LOCAL_USER_ID`
/// value that selects it.
///
/// As root any uid works, so exercise the fallback to 9001. Otherwise only our own uid works.
fn target() -> (u32, String) {
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        (9001, "notanumber".to_owned())
    } else {
        (euid, euid.to_string())
    }
}

fn shim(dir: &Path, local_user_id: &str, useradd: &str, sudoers: &Path) -> Command {
    let mut cmd = Command::new(BECOME_USER);
    cmd.env("LOCAL_USER_ID", local_user_id)
        .arg("--passwd-file")
        .arg(dir.join("passwd"))
        .arg("--sudoers-file")
        .arg(sudoers)
        .arg("--useradd")
        .arg(useradd)
        .arg("--home-base")
        .arg(dir)
        .stdin(Stdio::null());
    cmd
}

fn write_account(dir: &Path, uid: u32) {
    let home = dir.join("developer");
    fs::create_dir_all(&home).unwrap();
    fs::write(
        dir.join("passwd"),
        format!(
            "root:x:0:0:root:/root:/bin/sh\ndeveloper:x:{uid}:{uid}::{}:/bin/sh\n",
            home.display()
        ),
    )
    .unwrap();
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn failed_useradd_stops_before_exec() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("passwd"), "root:x:0:0:root:/root:/bin/sh\n")?;
    fs::write(dir.path().join("sudoers"), "")?;
    let marker = dir.path().join("ran");

    let output = shim(dir.path(), "1000", "false", &dir.path().join("sudoers"))
        .args(["--", "touch"])
        .arg(&marker)
        .output()?;

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("provisioning user"), "{}", stderr(&output));
    assert!(!marker.exists());
    assert_eq!(fs::read_to_string(dir.path().join("sudoers"))?, "");
    Ok(())
}

#[test]
fn unwritable_allowlist_stops_before_exec() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let (uid, local_user_id) = target();
    write_account(dir.path(), uid);
    let marker = dir.path().join("ran");

    let output = shim(
        dir.path(),
        &local_user_id,
        "false",
        &dir.path().join("missing").join("sudoers"),
    )
    .args(["--", "touch"])
    .arg(&marker)
    .output()?;

    assert_eq!(output.status.code(), Some(1));
    assert!(
        stderr(&output).contains("granting passwordless root"),
        "{}",
        stderr(&output)
    );
    assert!(!marker.exists());
    Ok(())
}

#[test]
fn hands_off_with_uid_and_home() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let (uid, local_user_id) = target();
    write_account(dir.path(), uid);
    let sudoers = dir.path().join("sudoers");
    fs::write(&sudoers, "")?;

    let output = shim(dir.path(), &local_user_id, "false", &sudoers)
        .args(["--", "/bin/sh", "-c", "id -u; echo \"$HOME\"; echo \"$USER\""])
        .output()?;

    assert!(output.status.success(), "{}", stderr(&output));
    let expected = format!(
        "{uid}\n{}\ndeveloper\n",
        dir.path().join("developer").display()
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout), expected);
    assert_eq!(
        fs::read_to_string(&sudoers)?,
        "developer ALL=(ALL) NOPASSWD: ALL\n"
    );
    Ok(())
}

#[test]
fn missing_command_exits_127() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let (uid, local_user_id) = target();
    write_account(dir.path(), uid);
    let sudoers = dir.path().join("sudoers");
    fs::write(&sudoers, "")?;

    let output = shim(dir.path(), &local_user_id, "false", &sudoers)
        .args(["--", "/nonexistent/cli"])
        .output()?;

    assert_eq!(output.status.code(), Some(127));
    assert!(stderr(&output).contains("executing"), "{}", stderr(&output));
    Ok(())
}

#[test]
fn exit_code_survives_the_whole_chain() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let (uid, local_user_id) = target();
    write_account(dir.path(), uid);
    let sudoers = dir.path().join("sudoers");
    fs::write(&sudoers, "")?;

    let status = Command::new(ENTRYPOINT)
        .env("LOCAL_USER_ID", &local_user_id)
        .arg("--")
        .arg(BECOME_USER)
        .arg("--passwd-file")
        .arg(dir.path().join("passwd"))
        .arg("--sudoers-file")
        .arg(&sudoers)
        .arg("--useradd")
        .arg("false")
        .args(["--", "/bin/sh", "-c", "exit 42"])
        .stdin(Stdio::null())
        .status()?;

    assert_eq!(status.code(), Some(42));
    Ok(())
}

#[test]
fn failure_diagnostic_survives_disabled_logging() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("passwd"), "root:x:0:0:root:/root:/bin/sh\n")?;
    fs::write(dir.path().join("sudoers"), "")?;

    let output = shim(dir.path(), "1000", "false", &dir.path().join("sudoers"))
        .env("ENTRYPOINT_LOG", "off")
        .args(["--", "true"])
        .output()?;

    assert_eq!(output.status.code(), Some(1));
    assert!(
        stderr(&output).starts_with("become-user: provisioning user"),
        "{}",
        stderr(&output)
    );
    Ok(())
}

#[test]
fn handed_off_command_does_not_ignore_sigpipe() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let (uid, local_user_id) = target();
    write_account(dir.path(), uid);
    let sudoers = dir.path().join("sudoers");
    fs::write(&sudoers, "")?;

    let output = shim(dir.path(), &local_user_id, "false", &sudoers)
        .args(["--", "/bin/sh", "-c", "grep SigIgn /proc/$$/status"])
        .output()?;

    assert!(output.status.success(), "{}", stderr(&output));
    let stdout = String::from_utf8(output.stdout)?;
    let mask = stdout
        .trim()
        .strip_prefix("SigIgn:")
        .ok_or_else(|| eyre::eyre!("unexpected status line {stdout:?}"))?;
    let ignored = u64::from_str_radix(mask.trim(), 16)?;
    assert_eq!(ignored & (1 << (libc::SIGPIPE - 1)), 0, "SigIgn: {mask}");
    Ok(())
}
