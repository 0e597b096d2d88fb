//! Daemonisation (C7): optional double-fork, session creation, stdio
//! redirection, PID-file write.
//!
//! The double fork plus `waitpid` exists so that a caller invoking the daemon
//! synchronously (a service manager, a shell script) observes the PID file on
//! disk before the outer process exits — see the design notes' "Double-fork +
//! wait" section.

use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use tracing::error;

use crate::socket_manager::SocketManager;

/// Runs the double-fork dance. Only the grandchild returns from this
/// function; the original process and the intermediate child each `_exit`
/// from inside it once their part is done.
pub fn daemonize(socket_manager: &SocketManager, booster_type: &str) -> anyhow::Result<()> {
    let first = xfork().context("unable to fork daemon")?;
    if let Some(child_pid) = first {
        // Original process: wait for the intermediate child to write the PID
        // file and exit, then exit ourselves.
        xwaitpid(child_pid);
        unsafe { libc::_exit(0) };
    }

    // Intermediate process: `second` is the grandchild's pid, not our own.
    let second = xfork().context("unable to fork daemon")?;
    if let Some(grandchild_pid) = second {
        let pidfile = socket_manager.pid_file_path(booster_type);
        if let Err(error) = write_pidfile(&pidfile, grandchild_pid) {
            error!(%error, path = %pidfile.display(), "failed to create pidfile");
        }
        unsafe { libc::_exit(0) };
    }

    // Grandchild: this is the process that keeps running as the daemon.
    unsafe {
        libc::umask(0);
    }
    if unsafe { libc::setsid() } < 0 {
        anyhow::bail!("unable to setsid");
    }
    let root = CString::new("/").unwrap();
    if unsafe { libc::chdir(root.as_ptr()) } < 0 {
        anyhow::bail!("unable to chdir to '/'");
    }
    redirect_stdio_to_dev_null();

    Ok(())
}

fn write_pidfile(path: &Path, pid: libc::pid_t) -> anyhow::Result<()> {
    let mut file = File::create(path).with_context(|| format!("{}: create failed", path.display()))?;
    writeln!(file, "{pid}").with_context(|| format!("{}: write failed", path.display()))
}

fn redirect_stdio_to_dev_null() {
    let devnull = CString::new("/dev/null").unwrap();
    for (fd, flags) in [
        (libc::STDIN_FILENO, libc::O_RDONLY),
        (libc::STDOUT_FILENO, libc::O_WRONLY),
        (libc::STDERR_FILENO, libc::O_WRONLY),
    ] {
        let newfd = unsafe { libc::open(devnull.as_ptr(), flags) };
        if newfd != -1 {
            unsafe {
                libc::dup2(newfd, fd);
                libc::close(newfd);
            }
        }
    }
}

fn xfork() -> anyhow::Result<Option<libc::pid_t>> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error()).context("fork failed");
    } else if pid == 0 {
        Ok(None)
    } else {
        Ok(Some(pid))
    }
}

fn xwaitpid(pid: libc::pid_t) {
    let mut status: libc::c_int = 0;
    loop {
        let rc = unsafe { libc::waitpid(pid, &mut status as *mut libc::c_int, 0) };
        if rc != -1 {
            return;
        }
        if std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
            return;
        }
    }
}

/// Removes `pidfile` iff its contents equal `pid`, exactly as decimal followed
/// by a newline. Used on SIGTERM to avoid racing with a successor daemon that
/// has already overwritten the file with its own pid (see P5).
pub fn remove_pidfile_if_owned(pidfile: &Path, pid: libc::pid_t) {
    let contents = match std::fs::read_to_string(pidfile) {
        Ok(c) => c,
        Err(_) => return,
    };
    let file_pid: Option<libc::pid_t> = contents.trim().parse().ok();
    if file_pid == Some(pid) {
        let _ = std::fs::remove_file(pidfile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn guarded_removal_only_matches_owner() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("qt.pid");
        std::fs::File::create(&pidfile)
            .unwrap()
            .write_all(b"12345\n")
            .unwrap();

        remove_pidfile_if_owned(&pidfile, 99999);
        assert!(pidfile.exists(), "must not remove a pidfile owned by another pid");

        remove_pidfile_if_owned(&pidfile, 12345);
        assert!(!pidfile.exists(), "must remove a pidfile that matches our pid");
    }

    #[test]
    fn missing_pidfile_is_a_silent_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("missing.pid");
        remove_pidfile_if_owned(&pidfile, 1);
    }
}
