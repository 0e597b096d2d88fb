/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

//! Process-level tests that spawn the real `echo-booster` example and drive
//! it the way a service manager or shell script would: polling the
//! filesystem and sending real signals, following spec.md §8's properties.

use std::io::{BufRead, BufReader, Write};
use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use anyhow::{anyhow, Context, Result};

enum Completion<T> {
    Incomplete,
    Complete(T),
}
use Completion::*;

/// Repeatedly evaluates `condition`, sleeping a bit between calls, until it
/// yields `Complete(value)`, then returns `Ok(value)`. Gives up after a while.
fn wait_until<T, F>(mut condition: F) -> Result<T>
where
    F: FnMut() -> Completion<T>,
{
    for i in 0..10 {
        if let Complete(result) = condition() {
            return Ok(result);
        }
        let ms = match i {
            0 => 10,
            1 => 100,
            _ => 1000,
        };
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
    Err(anyhow!("wait_until timed out"))
}

fn echo_booster_command() -> Result<Command> {
    let examples_dir = std::env::current_dir()?.join("target/debug/examples");
    Ok(Command::new(examples_dir.join("echo-booster")))
}

fn send_signal(pid: libc::pid_t, signal: std::os::raw::c_int) -> std::io::Result<()> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn process_exists(pid: libc::pid_t) -> std::io::Result<()> {
    send_signal(pid, 0)
}

fn wait_for_process_to_die(pid: libc::pid_t) -> Result<()> {
    wait_until(|| match process_exists(pid) {
        Ok(()) => Incomplete,
        Err(_) => Complete(()),
    })
}

fn wait_until_file_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    wait_until(|| match path.as_ref().exists() {
        true => Complete(()),
        false => Incomplete,
    })
}

fn read_pidfile<P: AsRef<Path>>(path: P) -> Result<libc::pid_t> {
    let contents = String::from_utf8(std::fs::read(path)?)?;
    Ok(contents.trim().parse()?)
}

fn check_file_does_not_exist<P: AsRef<Path>>(path: P) -> Result<()> {
    match std::fs::File::open(path.as_ref()) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => Err(anyhow!("{}: expected NotFound, got {other:?}", path.as_ref().display())),
    }
}

/// A temp directory that doubles as `BOOSTER_SOCKET_ROOT` for one test, so
/// concurrently running tests never collide on the same socket/pidfile path.
struct TestRoot {
    dir: tempfile::TempDir,
}

impl TestRoot {
    fn new() -> Result<Self> {
        Ok(TestRoot {
            dir: tempfile::tempdir()?,
        })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn pidfile(&self, booster_type: &str) -> PathBuf {
        self.path().join(format!("{booster_type}.pid"))
    }

    fn socket(&self, booster_type: &str) -> PathBuf {
        self.path().join(booster_type)
    }

    fn command(&self, booster_type: &str) -> Result<Command> {
        let mut command = echo_booster_command()?;
        command
            .env("BOOSTER_SOCKET_ROOT", self.path())
            .arg(booster_type);
        Ok(command)
    }
}

fn echo_roundtrip(socket_path: &Path, message: &str) -> Result<String> {
    let mut stream = UnixStream::connect(socket_path).context("connecting to booster socket")?;
    writeln!(stream, "{message}")?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(line.trim_end().to_string())
}

fn wait_for_child_exit(child: &mut Child) -> Result<()> {
    wait_until(|| match child.try_wait() {
        Ok(Some(_)) => Complete(()),
        Ok(None) => Incomplete,
        Err(_) => Complete(()),
    })
}

/// Exercises double-fork daemonisation end to end (spec.md §4.7, §9): the
/// pidfile must exist and name a live process by the time the invoking shell
/// sees the original process exit, and guarded removal (P5) must delete it
/// on a clean SIGTERM shutdown.
#[test]
fn daemonized_process_writes_and_removes_its_own_pidfile() -> Result<()> {
    let root = TestRoot::new()?;
    let pidfile = root.pidfile("echo");

    let mut child = root.command("echo")?.arg("--daemon").spawn()?;
    wait_for_child_exit(&mut child)?;

    wait_until_file_exists(&pidfile)?;
    let daemon_pid = read_pidfile(&pidfile)?;
    process_exists(daemon_pid).context("daemon pid should be alive after daemonising")?;
    assert_ne!(daemon_pid, child.id() as libc::pid_t);

    send_signal(daemon_pid, libc::SIGTERM)?;
    wait_for_process_to_die(daemon_pid)?;
    check_file_does_not_exist(&pidfile)?;
    Ok(())
}

/// Without `--daemon` the process stays in the foreground and writes no
/// pidfile; SIGTERM still triggers the guarded-removal code path, which must
/// be a silent no-op when there's nothing to remove.
#[test]
fn foreground_process_never_writes_a_pidfile() -> Result<()> {
    let root = TestRoot::new()?;
    let pidfile = root.pidfile("echo");
    let socket = root.socket("echo");

    let mut child = root.command("echo")?.spawn()?;
    wait_until_file_exists(&socket)?;
    assert!(!pidfile.exists());

    send_signal(child.id() as libc::pid_t, libc::SIGTERM)?;
    child.wait()?;
    assert!(!pidfile.exists());
    Ok(())
}

/// A warm booster accepts a connection, hands off to the daemon, and a fresh
/// replacement is listening again shortly after — the respawn contract of
/// spec.md §4.5/§4.6.
#[test]
fn warm_booster_is_replaced_after_handing_off() -> Result<()> {
    let root = TestRoot::new()?;
    let socket = root.socket("echo");
    let mut child = root.command("echo")?.spawn()?;
    wait_until_file_exists(&socket)?;

    assert_eq!(echo_roundtrip(&socket, "first")?, "first");
    assert_eq!(echo_roundtrip(&socket, "second")?, "second");

    send_signal(child.id() as libc::pid_t, libc::SIGTERM)?;
    child.wait()?;
    Ok(())
}
