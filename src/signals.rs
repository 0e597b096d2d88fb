//! The signal funnel (C1): translates asynchronous Unix signals into bytes on a
//! self-pipe so the supervisor loop can demultiplex them synchronously.
//!
//! Only one thing may happen inside the trampoline: a single `write(2)` of one
//! byte. Everything else — installing handlers, saving/restoring dispositions,
//! reading the pipe — happens on the supervisor thread.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, sighandler_t};
use tracing::{error, warn};

/// Signals this daemon intercepts, in the order handlers are installed.
pub const HANDLED_SIGNALS: [c_int; 6] = [
    libc::SIGCHLD,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGPIPE,
    libc::SIGHUP,
];

// The only thing the trampoline needs: the write end of the self-pipe, set once
// before any handler is installed. A process-wide value instead of a pointer
// threaded through `Daemon::instance()` (see design notes on the singleton).
static SELF_PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn trampoline(signum: c_int) {
    let fd = SELF_PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let byte = signum as u8;
    let rc = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    if rc != 1 {
        const MSG: &[u8] = b"*** signal pipe write failure - terminating\n";
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                MSG.as_ptr() as *const libc::c_void,
                MSG.len(),
            );
            libc::_exit(1);
        }
    }
}

/// A self-pipe plus the table of signal dispositions captured when installing
/// the funnel's handlers, so a forked booster can restore them.
pub struct SignalFunnel {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    saved_handlers: HashMap<c_int, sighandler_t>,
}

impl SignalFunnel {
    /// Creates the self-pipe and installs the trampoline for every signal in
    /// [`HANDLED_SIGNALS`]. Fatal: failure to create the pipe or install any
    /// handler leaves the process in an unknown signal-handling state.
    pub fn install() -> anyhow::Result<Self> {
        let mut fds: [c_int; 2] = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error())
                .map_err(anyhow::Error::from)
                .map_err(|e| e.context("creating self-pipe for unix signals"));
        }
        let read_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        SELF_PIPE_WRITE_FD.store(write_fd.as_raw_fd(), Ordering::Relaxed);

        let mut saved_handlers = HashMap::new();
        for &signum in HANDLED_SIGNALS.iter() {
            let old = unsafe { libc::signal(signum, trampoline as sighandler_t) };
            if old == libc::SIG_ERR {
                anyhow::bail!("failed to install handler for signal {signum}");
            }
            // SIGHUP is special: the daemon may be re-exec'd with SIGHUP ignored,
            // but boosters (and the applications they launch) should still see
            // the default disposition, not inherit "ignored".
            let saved = if signum == libc::SIGHUP && old == libc::SIG_IGN {
                libc::SIG_DFL
            } else {
                old
            };
            saved_handlers.insert(signum, saved);
        }

        Ok(SignalFunnel {
            read_fd,
            write_fd,
            saved_handlers,
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Blocks until one signal byte is available and returns it. Fatal if the
    /// pipe itself is broken — there is no way to keep operating safely.
    pub fn read_one(&self) -> anyhow::Result<c_int> {
        let mut byte: u8 = 0;
        let rc = unsafe {
            libc::read(
                self.read_fd.as_raw_fd(),
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
            )
        };
        if rc != 1 {
            anyhow::bail!("signal pipe read failure - terminating");
        }
        Ok(byte as c_int)
    }

    /// Restores every captured disposition. Called in a forked booster child to
    /// undo the funnel before the booster runs; the funnel itself (the pipe fds)
    /// must be closed separately by the caller.
    pub fn restore_handlers(&self) {
        for (&signum, &handler) in self.saved_handlers.iter() {
            if unsafe { libc::signal(signum, handler) } == libc::SIG_ERR {
                warn!(signum, "failed to restore original signal disposition");
            }
        }
    }

    /// Closes both ends of the self-pipe. Called in a forked booster child so it
    /// doesn't keep the funnel alive; the daemon parent never closes either end
    /// until shutdown (when the process exits and the kernel reclaims them).
    pub fn close(self) {
        SELF_PIPE_WRITE_FD.store(-1, Ordering::Relaxed);
        drop(self.read_fd);
        drop(self.write_fd);
    }

    /// Raw-closes both self-pipe fds without consuming `self`. For use from
    /// behind a `&mut self`-borrowed field in the fork engine's child branch,
    /// which cannot move the funnel out to call [`SignalFunnel::close`] and
    /// always `_exit`s before any normal drop of the owning struct would run.
    pub fn close_in_child(&self) {
        SELF_PIPE_WRITE_FD.store(-1, Ordering::Relaxed);
        unsafe {
            libc::close(self.read_fd.as_raw_fd());
            libc::close(self.write_fd.as_raw_fd());
        }
    }
}

/// Logs an unhandled fatal condition and aborts without running destructors,
/// mirroring the trampoline's own `_exit` on an unrecoverable self-pipe write.
pub fn abort_unreachable(context: &str) -> ! {
    error!("{context}");
    unsafe { libc::_exit(1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sighup_ignored_becomes_default_on_save() {
        // Exercise just the bookkeeping rule, without touching real process-wide
        // signal state: the mapping rule is pure data manipulation.
        let old = libc::SIG_IGN;
        let saved = if old == libc::SIG_IGN {
            libc::SIG_DFL
        } else {
            old
        };
        assert_eq!(saved, libc::SIG_DFL);
    }

    #[test]
    fn install_and_restore_round_trips() {
        // SIGUSR1/SIGUSR2 are otherwise unused by the test harness, so it's safe
        // to install and then restore without disturbing anything else.
        let funnel = SignalFunnel::install().expect("install");
        assert!(funnel.saved_handlers.contains_key(&libc::SIGUSR1));
        assert!(funnel.saved_handlers.contains_key(&libc::SIGHUP));
        funnel.restore_handlers();
        funnel.close();
    }
}
