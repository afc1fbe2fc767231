//! Child process bootstrap.
//!
//! [`ChildSpec`] describes the command to run; [`ChildSpec::spawn`] forks
//! and, in the child, walks the bootstrap sequence in order: change
//! directory, become session leader, bind the slave device, acquire the
//! controlling terminal, rebind stdio, close stray descriptors, fix the
//! environment, reset signal dispositions, exec. The child branch never
//! returns: a failed step is written to whichever diagnostic sink is live
//! at that point and the child exits with status 1.

use std::ffi::{CStr, CString, OsStr};
use std::fmt;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::env;
use crate::error::SpawnError;
use crate::fds;
use crate::pty::PtyPair;

/// Terminfo identifier exported as `TERM` unless the spec overrides it.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Specification of a command to run on a pty: argv, optional working
/// directory, and the terminfo identifier to advertise. Immutable once
/// passed to [`ChildSpec::spawn`].
pub struct ChildSpec {
    /// argv[0] is the program, resolved through PATH by exec.
    argv: Vec<CString>,
    cwd: Option<PathBuf>,
    term: String,
}

impl ChildSpec {
    /// Build a spec for the given program.
    pub fn new<S: AsRef<OsStr>>(program: S) -> Result<Self, SpawnError> {
        if program.as_ref().is_empty() {
            return Err(SpawnError::EmptyCommand);
        }
        let program = to_cstring(program)?;
        Ok(ChildSpec {
            argv: vec![program],
            cwd: None,
            term: DEFAULT_TERM.to_string(),
        })
    }

    /// Build a spec for the user's shell (`$SHELL`, falling back to /bin/sh).
    pub fn default_shell() -> Result<Self, SpawnError> {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        Self::new(shell)
    }

    /// Append an argument.
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Result<Self, SpawnError> {
        self.argv.push(to_cstring(arg)?);
        Ok(self)
    }

    /// Append multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Result<Self, SpawnError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg)?;
        }
        Ok(self)
    }

    /// Working directory for the child.
    pub fn current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Terminfo identifier to export as `TERM` in the child.
    pub fn term<S: Into<String>>(mut self, term: S) -> Self {
        self.term = term.into();
        self
    }

    /// Fork and bootstrap the child on the given pty.
    ///
    /// The parent keeps the master side and gets the child's pid back. The
    /// child rebinds its standard streams to the slave and execs the
    /// command; on success the call never returns there. Bootstrap failures
    /// inside the child surface as a session that closes immediately, with
    /// the diagnostic readable from the master.
    pub fn spawn(&self, pty: &PtyPair) -> Result<ChildProcess, SpawnError> {
        // SAFETY: the child branch runs only the bootstrap sequence below
        // and then execs or exits; it never returns into caller code.
        match unsafe { unistd::fork() }.map_err(SpawnError::Fork)? {
            ForkResult::Parent { child } => {
                log::debug!(
                    "spawned {:?} as pid {} on {}",
                    self.argv[0],
                    child,
                    pty.slave_path().display()
                );
                Ok(ChildProcess { pid: child })
            }
            ForkResult::Child => self.bootstrap_child(pty),
        }
    }

    /// Allocate a fresh pty pair and spawn on it.
    pub fn spawn_with_new_pty(&self) -> Result<(ChildProcess, PtyPair), SpawnError> {
        let pty = PtyPair::allocate()?;
        let child = self.spawn(&pty)?;
        Ok((child, pty))
    }

    /// The child branch. Each step either succeeds or reports through the
    /// reporter for the state reached so far and exits.
    fn bootstrap_child(&self, pty: &PtyPair) -> ! {
        // Until the slave is open, the only place a diagnostic can go is
        // the stderr inherited from the parent.
        let mut reporter = Reporter::InheritedStderr;

        if let Some(dir) = &self.cwd {
            if let Err(errno) = unistd::chdir(dir.as_path()) {
                reporter.fail(ChildError::new("chdir", errno));
            }
        }

        if let Err(errno) = unistd::setsid() {
            reporter.fail(ChildError::new("setsid", errno));
        }

        let slave_fd = match open_slave_and_close_master(pty) {
            Ok(fd) => fd,
            Err(err) => reporter.fail(err),
        };
        // From here until stdio is rebound, diagnostics go straight to the
        // slave so they surface on the master side.
        reporter = Reporter::Slave(slave_fd);

        set_controlling_terminal(slave_fd, &reporter);
        rebind_stdio(slave_fd, &reporter);
        reporter = Reporter::Stdio;

        fds::close_inherited_fds();
        env::fix_environment(&self.term);
        reset_signal_handlers();

        // exec's success type is uninhabited: if it returns at all, it failed.
        let errno = match unistd::execvp(&self.argv[0], &self.argv) {
            Ok(never) => match never {},
            Err(errno) => errno,
        };
        reporter.fail(ChildError::exec(&self.argv[0], errno));
    }
}

fn to_cstring<S: AsRef<OsStr>>(s: S) -> Result<CString, SpawnError> {
    CString::new(s.as_ref().as_bytes()).map_err(|_| SpawnError::NulByte)
}

/// Fix ownership and permissions on the slave device, open it, and close
/// the child's copy of the master.
///
/// Ownership goes to the invoking user and the "tty" group when that group
/// resolves; permissions become owner read/write plus group write. Both are
/// best-effort: the multiplexer grant has usually done this already.
fn open_slave_and_close_master(pty: &PtyPair) -> Result<RawFd, ChildError> {
    let path = pty.slave_path();
    if let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) {
        // -1 for the group leaves it unchanged.
        let gid = tty_group_id().unwrap_or(!0);
        unsafe {
            libc::chown(cpath.as_ptr(), libc::getuid(), gid);
            libc::chmod(cpath.as_ptr(), 0o620);
        }
    }

    // O_NOCTTY: acquiring the controlling terminal is its own step.
    let slave_fd = nix::fcntl::open(path, OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty())
        .map_err(|errno| ChildError::new("open slave", errno))?;

    let _ = unistd::close(pty.master_fd());
    Ok(slave_fd)
}

/// Group id of the "tty" device group, if it can be resolved.
fn tty_group_id() -> Option<libc::gid_t> {
    nix::unistd::Group::from_name("tty")
        .ok()
        .flatten()
        .map(|group| group.gid.as_raw())
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd"
))]
fn set_controlling_terminal(slave_fd: RawFd, reporter: &Reporter) {
    // SAFETY: TIOCSCTTY on an open tty descriptor.
    if unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) } < 0 {
        reporter.fail(ChildError::new("ioctl(TIOCSCTTY)", Errno::last()));
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd"
)))]
fn set_controlling_terminal(_slave_fd: RawFd, _reporter: &Reporter) {
    // Without TIOCSCTTY, the session leader acquired the controlling
    // terminal when it opened the slave.
}

/// Duplicate the slave onto descriptors 0, 1 and 2, then retire the
/// original if it sits above them.
fn rebind_stdio(slave_fd: RawFd, reporter: &Reporter) {
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if slave_fd == target {
            continue;
        }
        if let Err(errno) = unistd::dup2(slave_fd, target) {
            reporter.fail(ChildError::new("dup2", errno));
        }
    }
    if slave_fd > libc::STDERR_FILENO {
        let _ = unistd::close(slave_fd);
    }
}

/// Reset interactive signal dispositions to their defaults.
///
/// rxvt resets these and so do we: a non-default SIGINT disposition
/// inherited from the launching environment stops ^C from working in the
/// spawned shell.
fn reset_signal_handlers() {
    for sig in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGCHLD] {
        // SAFETY: restoring the default disposition.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
}

/// Where a bootstrap diagnostic goes. The usable sink depends on how far
/// the sequence has progressed.
enum Reporter {
    /// Before the slave is open: the stderr inherited from the parent,
    /// which may or may not still be watched by anyone.
    InheritedStderr,
    /// Slave open but stdio not yet rebound: write straight to the slave so
    /// the message shows up on the master side.
    Slave(RawFd),
    /// Stdio rebound: stderr is the slave now.
    Stdio,
}

impl Reporter {
    /// Report the failure best-effort and terminate the child. Never
    /// returns into caller code: the fork cannot be undone.
    fn fail(&self, err: ChildError) -> ! {
        let msg = format!("{err}\r\n");
        let fd = match self {
            Reporter::InheritedStderr | Reporter::Stdio => libc::STDERR_FILENO,
            Reporter::Slave(fd) => *fd,
        };
        // SAFETY: a single write(2); if it fails the child exits silently.
        let _ = unsafe { libc::write(fd, msg.as_ptr().cast(), msg.len()) };
        unsafe { libc::_exit(1) }
    }
}

/// A failed bootstrap step, tagged with the step and the OS error.
struct ChildError {
    step: String,
    errno: Errno,
}

impl ChildError {
    fn new(step: &str, errno: Errno) -> Self {
        ChildError {
            step: step.to_string(),
            errno,
        }
    }

    fn exec(program: &CStr, errno: Errno) -> Self {
        ChildError {
            step: format!("exec failed for '{}'", program.to_string_lossy()),
            errno,
        }
    }
}

impl fmt::Display for ChildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error from child: {}: {}", self.step, self.errno)
    }
}

/// Handle to a spawned child, held by the parent. All child-side state is
/// private to the child's replaced address space, so this is just the pid.
pub struct ChildProcess {
    pid: Pid,
}

impl ChildProcess {
    /// The child's process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Check for termination without blocking.
    pub fn try_wait(&self) -> Result<Option<ExitStatus>, SpawnError> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Ok(Some(ExitStatus::from_raw(code << 8))),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(ExitStatus::from_raw(sig as i32))),
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(_) => Ok(None),
            // Already reaped elsewhere.
            Err(Errno::ECHILD) => Ok(Some(ExitStatus::from_raw(0))),
            Err(errno) => Err(SpawnError::Wait(errno)),
        }
    }

    /// Block until the child terminates.
    pub fn wait(&self) -> Result<ExitStatus, SpawnError> {
        match waitpid(self.pid, None) {
            Ok(WaitStatus::Exited(_, code)) => Ok(ExitStatus::from_raw(code << 8)),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(ExitStatus::from_raw(sig as i32)),
            Ok(_) => Ok(ExitStatus::from_raw(0)),
            Err(Errno::ECHILD) => Ok(ExitStatus::from_raw(0)),
            Err(errno) => Err(SpawnError::Wait(errno)),
        }
    }

    /// Send a signal to the child.
    pub fn signal(&self, sig: Signal) -> Result<(), SpawnError> {
        signal::kill(self.pid, sig).map_err(SpawnError::Signal)
    }

    /// Kill the child outright.
    pub fn kill(&self) -> Result<(), SpawnError> {
        self.signal(Signal::SIGKILL)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        // Reap if already dead, to avoid leaving a zombie.
        let _ = self.try_wait();
    }
}
