//! Inherited descriptor cleanup for the forked child.
//!
//! The parent is a terminal emulator and typically holds sockets, config
//! files, and other descriptors that an arbitrary externally launched
//! program must not inherit.

use std::fs;
use std::os::fd::RawFd;
use std::path::Path;

#[cfg(target_os = "macos")]
const FD_DIRECTORY: &str = "/dev/fd";
#[cfg(not(target_os = "macos"))]
const FD_DIRECTORY: &str = "/proc/self/fd";

/// Close every descriptor above stderr.
///
/// Two passes: collect the numbers first, then close them, so that closing
/// does not perturb the directory stream being read (its own descriptor is
/// among the entries). Closing that one again after the stream is dropped
/// fails with EBADF, which is ignored.
pub fn close_inherited_fds() {
    for fd in open_fds() {
        if fd > libc::STDERR_FILENO {
            // SAFETY: plain close(2); EBADF for stale entries is ignored.
            unsafe { libc::close(fd) };
        }
    }
}

/// Descriptor numbers currently open in this process, read from the
/// platform's fd directory. Unreadable or non-numeric entries are skipped.
fn open_fds() -> Vec<RawFd> {
    let mut fds = Vec::new();
    let entries = match fs::read_dir(Path::new(FD_DIRECTORY)) {
        Ok(entries) => entries,
        Err(_) => return fds,
    };
    for entry in entries.flatten() {
        if let Some(fd) = entry.file_name().to_str().and_then(|s| s.parse::<RawFd>().ok()) {
            fds.push(fd);
        }
    }
    fds
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_open_fds_sees_standard_streams() {
        let fds = open_fds();
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    #[test]
    fn test_open_fds_sees_a_new_descriptor() {
        let file = tempfile::tempfile().expect("Failed to open temp file");
        let fd = file.as_raw_fd();
        assert!(open_fds().contains(&fd));
    }
}
