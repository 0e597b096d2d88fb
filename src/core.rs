//! The supervisor loop (C4), fork/exec engine (C5), and mode & shutdown
//! controller (C6), tied together around the registry, signal funnel, and
//! booster socket pair.

use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use anyhow::Context;
use caps::CapSet;
use libc::pid_t;
use tracing::{debug, error, info, warn};

use crate::args::BoosterArgs;
use crate::booster::{Booster, SingleInstancePlugin};
use crate::daemonize;
use crate::handoff;
use crate::registry::ChildRegistry;
use crate::signals::SignalFunnel;
use crate::socket_manager::SocketManager;
use crate::systemd;

/// Default delay (seconds) before forking a replacement when a previously
/// adopted booster's exit triggers the respawn, as opposed to a delay
/// reported by the booster itself in its hand-off record.
pub const DEFAULT_WARMUP_DELAY_SECS: u64 = 2;

const SINGLE_INSTANCE_PATH: &str = "/usr/lib/booster/single-instance.so";

pub struct DaemonCore<B: Booster> {
    args: BoosterArgs,
    argv: Vec<String>,
    booster_type: String,
    socket_manager: SocketManager,
    single_instance: SingleInstancePlugin,
    signals: SignalFunnel,
    booster_socket_daemon_end: RawFd,
    booster_socket_child_end: RawFd,
    registry: ChildRegistry,
    boot_mode: bool,
    booster: B,
}

impl<B: Booster> DaemonCore<B> {
    /// Constructor-only setup: installs signal handlers and creates the
    /// booster socket pair. Mirrors the original's constructor, which does
    /// this before any argument-dependent behavior (daemonising, forking).
    pub fn new(args: BoosterArgs, booster: B) -> anyhow::Result<Self> {
        let signals = SignalFunnel::install()?;
        let (daemon_end, child_end) = handoff::create_pair()?;
        let boot_mode = args.boot_mode;
        let booster_type = args.booster_type.clone();

        // Leak the fds into raw values: both ends live for the whole process
        // lifetime (the daemon never closes either until it exits, and every
        // booster inherits the child end across fork), so there is no single
        // owner to hand an `OwnedFd` to.
        let booster_socket_daemon_end = daemon_end.as_raw_fd();
        let booster_socket_child_end = child_end.as_raw_fd();
        std::mem::forget(daemon_end);
        std::mem::forget(child_end);

        Ok(DaemonCore {
            args,
            argv: std::env::args().collect(),
            booster_type,
            socket_manager: SocketManager::new(),
            single_instance: SingleInstancePlugin::load(SINGLE_INSTANCE_PATH),
            signals,
            booster_socket_daemon_end,
            booster_socket_child_end,
            registry: ChildRegistry::new(),
            boot_mode,
            booster,
        })
    }

    /// Runs the remaining one-time setup (socket creation, daemonising,
    /// first fork, systemd readiness) and then the supervisor loop. Never
    /// returns except via an `Err` (fatal) or process exit (SIGTERM).
    pub fn start(mut self) -> anyhow::Result<()> {
        crate::logging::init(self.args.debug);

        // Make sure LD_BIND_NOW doesn't force eager binding in boosters'
        // later dlopen calls.
        std::env::remove_var("LD_BIND_NOW");

        debug!(booster_type = %self.booster_type, "initing booster socket");
        self.socket_manager.init_socket(&self.booster_type)?;

        if self.args.daemon {
            daemonize::daemonize(&self.socket_manager, &self.booster_type)?;
        }

        debug!(booster_type = %self.booster_type, "forking first booster");
        self.fork_booster(0)?;

        if self.args.systemd {
            debug!("initialization done, notifying systemd");
            if let Err(error) = systemd::notify_ready() {
                warn!(%error, "failed to notify systemd");
            }
        }

        self.run()
    }

    fn run(mut self) -> anyhow::Result<()> {
        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.booster_socket_daemon_end,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.signals.read_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context("poll on booster socket and signal pipe failed");
            }

            // Hand-off path before signal path (tie-break rule).
            if fds[0].revents & libc::POLLIN != 0 {
                self.handle_handoff()?;
            }
            if fds[1].revents & libc::POLLIN != 0 {
                self.handle_signal()?;
            }
        }
    }

    fn handle_handoff(&mut self) -> anyhow::Result<()> {
        let (record, fd) = handoff::recv(self.booster_socket_daemon_end)?;
        info!(
            invoker_pid = record.invoker_pid,
            respawn_delay = record.respawn_delay,
            "received booster hand-off"
        );

        if !record.suppresses_adoption() {
            match (self.registry.warm_booster_pid(), fd) {
                (Some(warm), Some(fd)) => {
                    self.registry.adopt(warm, record.invoker_pid, fd);
                }
                (None, _) => {
                    warn!("hand-off arrived with no warm booster to adopt");
                }
                (Some(_), None) => {
                    warn!("hand-off arrived without an ancillary fd; cannot adopt");
                }
            }
        }

        let delay = record.respawn_delay.max(0) as u64;
        self.fork_booster(delay)
    }

    fn handle_signal(&mut self) -> anyhow::Result<()> {
        let signum = self.signals.read_one()?;
        match signum {
            libc::SIGCHLD => {
                debug!("SIGCHLD received");
                self.reap_zombies()?;
            }
            libc::SIGTERM => {
                debug!("SIGTERM received");
                self.handle_sigterm();
            }
            libc::SIGUSR1 => {
                debug!("SIGUSR1 received");
                self.enter_normal_mode();
            }
            libc::SIGUSR2 => {
                debug!("SIGUSR2 received");
                self.enter_boot_mode();
            }
            libc::SIGPIPE => {
                debug!("SIGPIPE received");
            }
            libc::SIGHUP => {
                debug!("SIGHUP received (reserved for re-exec; no-op)");
            }
            other => {
                debug!(signal = other, "ignoring unrecognized signal byte");
            }
        }
        Ok(())
    }

    /// Forks a new warm booster. In the child this function never returns: it
    /// restores signal handlers, tears down inherited daemon state, and ends
    /// by calling `booster.run` and `_exit`ing with its result.
    fn fork_booster(&mut self, requested_delay_secs: u64) -> anyhow::Result<()> {
        self.registry.clear_warm();

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(std::io::Error::last_os_error()).context("forking while invoking");
        }

        if pid == 0 {
            self.run_booster_child(requested_delay_secs);
            // unreachable: run_booster_child always exits the process.
        }

        self.registry.record_forked(pid);
        Ok(())
    }

    fn run_booster_child(&mut self, requested_delay_secs: u64) -> ! {
        // Parent-side logging is not meaningfully "closed" here: the booster
        // is free to install its own subscriber once it has an identity,
        // which is out of scope for this crate (see the Booster trait).

        self.signals.restore_handlers();

        unsafe {
            libc::prctl(
                libc::PR_SET_PDEATHSIG,
                libc::SIGHUP as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            );
        }

        unsafe {
            libc::close(self.booster_socket_daemon_end);
        }
        self.signals.close_in_child();

        // Close every invoker fd inherited from earlier adoptions: a new
        // booster must never hold fds belonging to a predecessor.
        drop(self.registry.drain_invoker_fds());

        if unsafe { libc::setsid() } < 0 {
            error!("couldn't set session id");
        }

        if !self.boot_mode && requested_delay_secs > 0 {
            std::thread::sleep(Duration::from_secs(requested_delay_secs));
        }

        debug!(booster_type = %self.booster.booster_type(), "running a new booster");

        let listen_fd = self.socket_manager.find_socket(&self.booster_type);
        let init_result = self.booster.initialize(
            &self.argv,
            self.booster_socket_child_end,
            listen_fd.unwrap_or(-1),
            &self.single_instance,
            self.boot_mode,
        );
        if let Err(error) = init_result {
            error!(%error, "booster failed to initialize");
            self.dispose_booster();
            unsafe { libc::_exit(1) };
        }

        drop_capabilities();

        let retval = self.booster.run(&self.socket_manager);
        unsafe { libc::_exit(retval) };
    }

    /// Drops the booster in place. `_exit` skips destructors entirely, so any
    /// failure path that calls it must dispose the booster itself first.
    fn dispose_booster(&mut self) {
        unsafe { std::ptr::drop_in_place(&mut self.booster) };
    }

    fn reap_zombies(&mut self) -> anyhow::Result<()> {
        let candidates: Vec<pid_t> = self.registry.live_children().to_vec();

        for pid in candidates {
            let mut status: libc::c_int = 0;
            let rc = unsafe { libc::waitpid(pid, &mut status as *mut libc::c_int, libc::WNOHANG) };
            if rc <= 0 {
                continue; // still alive, or a spurious/already-reaped entry
            }

            let was_warm = self.registry.warm_booster_pid() == Some(pid);
            let invoker_pid = self.registry.invoker_pid_of(pid);
            let fd = self.registry.remove(pid);

            if let Some(invoker_pid) = invoker_pid {
                if libc_wifexited(status) {
                    let code = libc_wexitstatus(status);
                    info!(pid, code, "boosted process exited");
                    if let Some(fd) = fd {
                        if let Err(error) =
                            handoff::write_exit_notification(fd.as_raw_fd(), code as u32)
                        {
                            warn!(%error, pid, "failed to notify invoker of exit");
                        }
                        // `fd` drops (and closes) here regardless of the
                        // write's outcome.
                    }
                } else if libc_wifsignaled(status) {
                    let signal = libc_wtermsig(status);
                    info!(pid, signal, "boosted process terminated by signal");
                    drop(fd); // closed whether or not the write above ran
                    if unsafe { libc::kill(invoker_pid, signal) } != 0 {
                        error!(
                            invoker_pid,
                            error = %std::io::Error::last_os_error(),
                            "failed to kill invoker"
                        );
                    }
                }
            }

            if was_warm {
                self.fork_booster(DEFAULT_WARMUP_DELAY_SECS)?;
            }
        }

        Ok(())
    }

    fn enter_normal_mode(&mut self) {
        if self.boot_mode {
            self.boot_mode = false;
            self.kill_warm_booster();
            info!("exited boot mode");
        } else {
            info!("already in normal mode");
        }
    }

    fn enter_boot_mode(&mut self) {
        if !self.boot_mode {
            self.boot_mode = true;
            self.kill_warm_booster();
            info!("entered boot mode");
        } else {
            info!("already in boot mode");
        }
    }

    /// Kills the current warm booster so the reap path naturally forks its
    /// replacement under the new mode. `warm_booster_pid` must *not* be
    /// cleared here — see §4.6 — or a hand-off racing this signal could be
    /// misattributed to a booster already told to die.
    fn kill_warm_booster(&self) {
        if let Some(pid) = self.registry.warm_booster_pid() {
            debug!(pid, "killing warm booster for mode transition");
            if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
                error!(
                    pid,
                    error = %std::io::Error::last_os_error(),
                    "failed to kill booster"
                );
            }
        }
    }

    fn handle_sigterm(&self) -> ! {
        let pidfile = self.socket_manager.pid_file_path(&self.booster_type);
        daemonize::remove_pidfile_if_owned(&pidfile, std::process::id() as pid_t);
        std::process::exit(0);
    }
}

fn drop_capabilities() {
    if let Err(error) = caps::clear(None, CapSet::Effective) {
        warn!(%error, "failed to drop effective capabilities");
    }
    if let Err(error) = caps::clear(None, CapSet::Permitted) {
        warn!(%error, "failed to drop permitted capabilities");
    }
    if let Err(error) = caps::clear(None, CapSet::Inheritable) {
        warn!(%error, "failed to drop inheritable capabilities");
    }
}

fn libc_wifexited(status: libc::c_int) -> bool {
    (status & 0x7f) == 0
}

fn libc_wexitstatus(status: libc::c_int) -> libc::c_int {
    (status >> 8) & 0xff
}

fn libc_wifsignaled(status: libc::c_int) -> bool {
    ((status & 0x7f) + 1) as i8 >> 1 > 0
}

fn libc_wtermsig(status: libc::c_int) -> libc::c_int {
    status & 0x7f
}
