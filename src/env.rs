//! Environment normalization for the spawned child.
//!
//! Programs identify their terminal through the environment, so the child
//! must advertise this emulator's terminfo entry and must not inherit the
//! identification variables of whatever launched the parent.

/// Set `TERM` and scrub terminal-identification variables inherited from
/// the launching environment.
pub fn fix_environment(term: &str) {
    std::env::set_var("TERM", term);

    // X11 terminal emulators export the id of the window they draw into.
    std::env::remove_var("WINDOWID");

    #[cfg(target_os = "macos")]
    {
        // The macOS application launcher passes dock options down through
        // variables keyed by the pid of the process it launched, which from
        // here is the parent.
        let ppid = unsafe { libc::getppid() };
        std::env::remove_var(format!("APP_ICON_{ppid}"));
        std::env::remove_var(format!("APP_NAME_{ppid}"));
        std::env::remove_var(format!("JAVA_MAIN_CLASS_{ppid}"));

        // Apple's Terminal sets these, and some programs detect it this way.
        std::env::remove_var("TERM_PROGRAM");
        std::env::remove_var("TERM_PROGRAM_VERSION");
    }

    #[cfg(not(target_os = "macos"))]
    {
        // GNOME's Terminal sets this.
        std::env::remove_var("COLORTERM");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_environment() {
        std::env::set_var("WINDOWID", "12345");
        std::env::set_var("COLORTERM", "truecolor");
        std::env::set_var("TERM", "dumb");

        fix_environment("vt220");

        assert_eq!(std::env::var("TERM").as_deref(), Ok("vt220"));
        assert!(std::env::var_os("WINDOWID").is_none());
        #[cfg(not(target_os = "macos"))]
        assert!(std::env::var_os("COLORTERM").is_none());
    }
}
