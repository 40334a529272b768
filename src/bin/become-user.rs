//! `become-user [OPTIONS] -- [command] [args...]`
//!
//! Creates a local account with the uid from `LOCAL_USER_ID` (default 9001), lets it use sudo
//! without a password, and replaces itself with the command running as that account.
//!
//! Put `--` before the command. Without it, a command argument that matches one of our own
//! options (`--shell`, `--version`, ...) is taken by `become-user` instead of the command.

use std::process;

use clap::Parser;
use handoff::config::{self, ShimArgs};
use handoff::logging;
use handoff::shim::Shim;
use tracing::error;

fn main() {
    logging::configure_logging();
    let args = ShimArgs::parse();

    let uid = config::uid_from_env();
    let mut store = args.store();
    let shim = Shim::new(&mut store, args.identity(uid));

    // Only returns if the handoff failed.
    let err = shim.run(&args.command);
    error!(err = %err, "become-user failed");
    eprintln!("become-user: {err}");
    process::exit(err.exit_code());
}
