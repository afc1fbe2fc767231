//! Error types for pty allocation and spawning.

use nix::errno::Errno;
use thiserror::Error;

/// Failure to allocate a pty master/slave pair.
///
/// Recoverable: the caller reports a failed session and moves on.
#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("Failed to look up pty slave name: {0}")]
    SlaveName(#[source] Errno),

    #[error("Failed to grant pty slave access: {0}")]
    Grant(#[source] Errno),

    #[error("Failed to unlock pty slave: {0}")]
    Unlock(#[source] Errno),

    #[error("Out of pseudo-terminal devices")]
    OutOfDevices,
}

/// Failure to spawn a child on an allocated pty, observed on the parent side.
///
/// Failures inside the forked child never surface here: the child reports
/// them on the pty (or its inherited stderr) and exits with status 1.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Command is empty")]
    EmptyCommand,

    #[error("Command contains an interior nul byte")]
    NulByte,

    #[error("Failed to fork: {0}")]
    Fork(#[source] Errno),

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] Errno),

    #[error("Failed to signal child: {0}")]
    Signal(#[source] Errno),

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}
