//! Pty allocation and child bootstrap.
//!
//! This crate gives a terminal-emulator front end the plumbing it needs to
//! drive an interactive program as if from a real terminal:
//!
//! - [`PtyPair::allocate`] opens a pty master and finds the paired slave
//!   device, via `/dev/ptmx` or the legacy BSD device scan
//! - [`ChildSpec::spawn`] forks; the parent keeps the master and a process
//!   handle, while the child becomes a session leader with the slave as its
//!   controlling terminal, rebinds stdio, drops inherited descriptors,
//!   normalizes its environment, and execs the command
//!
//! Terminal emulation itself (escape-sequence interpretation, rendering,
//! resizing) is the front end's business, not this crate's.
//!
//! ```no_run
//! use pty_spawn::{ChildSpec, PtyPair};
//!
//! let pty = PtyPair::allocate()?;
//! let child = ChildSpec::default_shell()?.spawn(&pty)?;
//! // Read child output from pty.master_fd(), signal via child.pid().
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod child;
pub mod error;
pub mod pty;

mod env;
mod fds;

pub use child::{ChildProcess, ChildSpec, DEFAULT_TERM};
pub use error::{AllocationError, SpawnError};
pub use pty::PtyPair;
