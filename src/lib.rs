//! Container entrypoint plumbing.
//!
//! - [`reaper`] runs as PID 1: it starts one child, forwards signals to it, reaps zombies, and
//!   exits with the child's status.
//! - [`shim`] provisions a local account for the uid in `LOCAL_USER_ID`, grants it passwordless
//!   root, and replaces itself with the wrapped command running as that account.

mod libc_util;

mod error;
mod spawn;

pub mod account;
pub mod config;
pub mod logging;
pub mod provision;
pub mod reaper;
pub mod shim;

mod command;

pub use account::{Account, TargetIdentity};
pub use command::{Child, Command, ExitStatus};
pub use error::{Error, ShimError};
pub use provision::{AccountStore, SystemAccountStore};

/// In test builds, use alloc_counter to verify at runtime that the functions which must be
/// async-signal-safe do not allocate.
#[cfg(debug_assertions)]
#[global_allocator]
static ALLOC: alloc_counter::AllocCounterSystem = alloc_counter::AllocCounterSystem;
