//! A trivial concrete [`Booster`] that accepts one connection on its
//! listening socket, echoes lines back until the peer closes it, then exits.
//! Demonstrates wiring a concrete booster into [`DaemonCore`].

use std::io::{BufRead, BufReader, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixListener;

use anyhow::{Context, Result};
use boosterd::{Booster, BoosterArgs, DaemonCore, HandoffRecord, SingleInstancePlugin, SocketManager};
use clap::Parser;

struct EchoBooster {
    ipc_fd: RawFd,
    listen_fd: RawFd,
}

impl EchoBooster {
    fn new() -> Self {
        EchoBooster {
            ipc_fd: -1,
            listen_fd: -1,
        }
    }
}

impl Booster for EchoBooster {
    fn booster_type(&self) -> &str {
        "echo"
    }

    fn initialize(
        &mut self,
        _args: &[String],
        ipc_fd: RawFd,
        listen_fd: RawFd,
        single_instance: &SingleInstancePlugin,
        boot_mode: bool,
    ) -> Result<()> {
        self.ipc_fd = ipc_fd;
        self.listen_fd = listen_fd;
        tracing::debug!(
            boot_mode,
            single_instance_loaded = single_instance.is_loaded(),
            "echo booster initialized"
        );
        Ok(())
    }

    fn run(&mut self, _socket_manager: &SocketManager) -> i32 {
        match self.serve_one() {
            Ok(()) => 0,
            Err(error) => {
                tracing::error!(%error, "echo booster failed");
                1
            }
        }
    }
}

impl EchoBooster {
    fn serve_one(&mut self) -> Result<()> {
        let listener = unsafe { UnixListener::from_raw_fd(self.listen_fd) };
        let (stream, _addr) = listener.accept().context("accepting a connection")?;
        // We don't own this listener past this call in a real multi-shot
        // booster, but this demo serves exactly one client then exits.
        std::mem::forget(listener);

        boosterd::handoff::send(
            self.ipc_fd,
            HandoffRecord {
                invoker_pid: std::process::id() as libc::pid_t,
                respawn_delay: 0,
            },
            None,
        )
        .context("sending hand-off record")?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).context("reading from client")?;
            if n == 0 {
                return Ok(());
            }
            writer
                .write_all(line.as_bytes())
                .context("writing to client")?;
        }
    }
}

fn main() -> Result<()> {
    let args = BoosterArgs::parse();
    DaemonCore::new(args, EchoBooster::new())?.start()
}
