//! Minimal init for containers: `entrypoint [--] <command> [args...]`.
//!
//! Runs the command as its only child, forwards signals to it, reaps zombies, and exits with the
//! command's exit code (or 128+N if it was killed by signal N).

use std::ffi::OsString;
use std::process;

use clap::Parser;
use handoff::{logging, reaper};
use tracing::error;

/// Run a command as PID 1, forwarding signals and reaping zombies.
#[derive(Parser, Debug)]
#[command(name = "entrypoint", version)]
struct Args {
    /// Command to supervise.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

fn main() {
    logging::configure_logging();
    let args = Args::parse();

    match reaper::run(&args.command) {
        Ok(status) => process::exit(status.exit_code()),
        Err(e) => {
            error!(err = %e, command = ?args.command, "entrypoint failed");
            eprintln!("entrypoint: {e}");
            process::exit(e.exit_code());
        }
    }
}
