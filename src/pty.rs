//! Pty pair allocation.
//!
//! The primary path opens the `/dev/ptmx` multiplexer and asks it for the
//! paired slave device (ptsname/grantpt/unlockpt). When the multiplexer
//! device does not exist the allocator falls back to scanning the legacy
//! BSD `/dev/ptyXY` namespace and deriving the slave name from the master's.

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{read, write};

use crate::error::AllocationError;

const PTY_MULTIPLEXER: &str = "/dev/ptmx";

/// First letter of a legacy BSD pty device name.
const SCAN_LETTERS: &[u8] = b"pqrstuvwxyzPQRST";
/// Second character of a legacy BSD pty device name.
const SCAN_SUFFIXES: &[u8] = b"0123456789abcdef";

/// An allocated pty pair: the open master descriptor and the path of the
/// paired slave device.
///
/// The master is owned by the parent for the lifetime of the session; the
/// spawned child opens the slave itself and closes its inherited copy of the
/// master. Dropping the pair closes the master.
pub struct PtyPair {
    master: OwnedFd,
    slave_path: PathBuf,
}

impl PtyPair {
    /// Allocate a pty pair.
    ///
    /// Opens the pty multiplexer and derives the slave path from it. If the
    /// multiplexer device is absent, falls back to the legacy BSD device
    /// scan. On failure no descriptor is left open.
    pub fn allocate() -> Result<Self, AllocationError> {
        let master = match nix::fcntl::open(
            Path::new(PTY_MULTIPLEXER),
            OFlag::O_RDWR | OFlag::O_NOCTTY,
            Mode::empty(),
        ) {
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(err) => {
                log::debug!("open {PTY_MULTIPLEXER} failed ({err}), trying BSD device scan");
                return Self::scan_bsd_devices(Path::new("/dev"));
            }
        };

        // Dropping `master` on any early return below closes it.
        let slave_path = slave_name(master.as_raw_fd())?;

        if unsafe { libc::grantpt(master.as_raw_fd()) } != 0 {
            return Err(AllocationError::Grant(Errno::last()));
        }
        if unsafe { libc::unlockpt(master.as_raw_fd()) } != 0 {
            return Err(AllocationError::Unlock(Errno::last()));
        }

        Ok(PtyPair { master, slave_path })
    }

    /// Scan the legacy `<dev>/ptyXY` namespace for a free master.
    ///
    /// ENOENT on any candidate means the naming scheme itself does not exist
    /// on this platform, so the whole scan stops there instead of moving on
    /// to the next candidate. Other open errors mean "busy, try the next
    /// one". The slave is the `tty` twin of the master that opened.
    fn scan_bsd_devices(dev: &Path) -> Result<Self, AllocationError> {
        for &letter in SCAN_LETTERS {
            for &suffix in SCAN_SUFFIXES {
                let name = format!("pty{}{}", letter as char, suffix as char);
                let fd = match nix::fcntl::open(&dev.join(name), OFlag::O_RDWR, Mode::empty()) {
                    Ok(fd) => fd,
                    Err(Errno::ENOENT) => return Err(AllocationError::OutOfDevices),
                    Err(_) => continue,
                };
                let slave_path = dev.join(format!("tty{}{}", letter as char, suffix as char));
                return Ok(PtyPair {
                    master: unsafe { OwnedFd::from_raw_fd(fd) },
                    slave_path,
                });
            }
        }
        Err(AllocationError::OutOfDevices)
    }

    /// Raw descriptor of the master side, for registering with an event loop.
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Path of the slave device the child will open.
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Read from the master (the child's output).
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match read(self.master.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Err(io::Error::new(io::ErrorKind::WouldBlock, "would block")),
            Err(e) => Err(io::Error::other(e)),
        }
    }

    /// Write to the master (the child's input).
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match write(self.master.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Err(io::Error::new(io::ErrorKind::WouldBlock, "would block")),
            Err(e) => Err(io::Error::other(e)),
        }
    }

    /// Write the whole buffer to the master.
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Toggle non-blocking mode on the master.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let flags = fcntl(self.master.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::other)?;
        let flags = OFlag::from_bits_truncate(flags);
        let new_flags = if nonblocking {
            flags | OFlag::O_NONBLOCK
        } else {
            flags & !OFlag::O_NONBLOCK
        };
        fcntl(self.master.as_raw_fd(), FcntlArg::F_SETFL(new_flags)).map_err(io::Error::other)?;
        Ok(())
    }
}

/// Ask the multiplexer for the path of its slave device.
fn slave_name(master: RawFd) -> Result<PathBuf, AllocationError> {
    // SAFETY: ptsname returns a pointer into static storage; we copy the
    // name out immediately. Not thread-safe, but allocation happens in the
    // parent before any fork and this crate spawns no threads.
    let name = unsafe { libc::ptsname(master) };
    if name.is_null() {
        return Err(AllocationError::SlaveName(Errno::last()));
    }
    let name = unsafe { CStr::from_ptr(name) };
    Ok(PathBuf::from(std::ffi::OsStr::from_bytes(name.to_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_allocate() {
        let pty = PtyPair::allocate().expect("Failed to allocate pty");
        assert!(pty.master_fd() >= 0);
        assert!(pty.slave_path().exists());
        // The master accepts input for the (not yet opened) slave.
        pty.write_all(b"x").expect("Failed to write to master");
    }

    #[test]
    fn test_allocations_are_distinct() {
        let a = PtyPair::allocate().expect("Failed to allocate pty");
        let b = PtyPair::allocate().expect("Failed to allocate pty");
        assert_ne!(a.slave_path(), b.slave_path());
        assert_ne!(a.master_fd(), b.master_fd());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_allocate_does_not_leak_descriptors() {
        let count_fds = || fs::read_dir("/proc/self/fd").unwrap().count();
        // Warm up lazy initialization before taking the baseline.
        drop(PtyPair::allocate().unwrap());
        let before = count_fds();
        for _ in 0..8 {
            let pty = PtyPair::allocate().expect("Failed to allocate pty");
            drop(pty);
        }
        assert_eq!(count_fds(), before);
    }

    // In the scan tests a directory stands in for a busy device (opening a
    // directory O_RDWR fails, but not with ENOENT) and a regular file for a
    // free master.

    fn fill_busy(dev: &Path, except: &[&str]) {
        for &letter in SCAN_LETTERS {
            for &suffix in SCAN_SUFFIXES {
                let name = format!("pty{}{}", letter as char, suffix as char);
                if !except.contains(&name.as_str()) {
                    fs::create_dir(dev.join(name)).unwrap();
                }
            }
        }
    }

    #[test]
    fn test_scan_returns_the_free_device() {
        let dev = tempfile::tempdir().unwrap();
        fill_busy(dev.path(), &["ptyq3"]);
        fs::write(dev.path().join("ptyq3"), b"").unwrap();

        let pty = PtyPair::scan_bsd_devices(dev.path()).expect("scan should find ptyq3");
        assert_eq!(pty.slave_path(), dev.path().join("ttyq3"));
    }

    #[test]
    fn test_scan_exhaustion() {
        let dev = tempfile::tempdir().unwrap();
        fill_busy(dev.path(), &[]);

        match PtyPair::scan_bsd_devices(dev.path()) {
            Err(AllocationError::OutOfDevices) => {}
            other => panic!("Expected OutOfDevices, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_scan_missing_device_is_a_hard_stop() {
        // ptyp0 is busy, ptyp1 is missing, ptypf would be free. The missing
        // device stops the scan before the free one is ever considered.
        let dev = tempfile::tempdir().unwrap();
        fs::create_dir(dev.path().join("ptyp0")).unwrap();
        fs::write(dev.path().join("ptypf"), b"").unwrap();

        match PtyPair::scan_bsd_devices(dev.path()) {
            Err(AllocationError::OutOfDevices) => {}
            other => panic!("Expected OutOfDevices, got {:?}", other.err()),
        }
    }
}
