//! The booster socket pair (C2): a datagram `socketpair(2)` between the daemon
//! and every booster it forks, carrying the hand-off record of §3 plus one
//! ancillary file descriptor (the daemon's end of the invoker↔booster command
//! channel).

use std::io;
use std::mem::{size_of, zeroed};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::{c_int, c_void, cmsghdr, iovec, msghdr, pid_t};

/// The fixed-layout message a booster sends the moment it accepts a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffRecord {
    /// Pid of the invoker, or 0 to mean "ignore; no invoker tracking".
    pub invoker_pid: pid_t,
    /// Seconds the daemon should wait before forking the replacement booster.
    pub respawn_delay: c_int,
}

impl HandoffRecord {
    pub fn suppresses_adoption(&self) -> bool {
        self.invoker_pid == 0
    }
}

/// Creates the datagram socket pair. End 0 is the daemon's read side; end 1 is
/// handed to every forked booster and inherited across `fork`.
pub fn create_pair() -> anyhow::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [0; 2];
    let rc = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr())
    };
    if rc == -1 {
        return Err(io::Error::last_os_error())
            .map_err(anyhow::Error::from)
            .map_err(|e| e.context("creating socket pair for boosters"));
    }
    Ok((unsafe { OwnedFd::from_raw_fd(fds[0]) }, unsafe {
        OwnedFd::from_raw_fd(fds[1])
    }))
}

const fn cmsg_align(len: usize) -> usize {
    let word = size_of::<usize>();
    (len + word - 1) & !(word - 1)
}

fn cmsg_space_one_fd() -> usize {
    cmsg_align(size_of::<cmsghdr>()) + cmsg_align(size_of::<c_int>())
}

/// Receives one hand-off datagram. A receive error is fatal — spec.md treats
/// communication breakdown with a booster as unrecoverable, not retryable.
pub fn recv(fd: RawFd) -> anyhow::Result<(HandoffRecord, Option<OwnedFd>)> {
    let mut invoker_pid: pid_t = 0;
    let mut respawn_delay: c_int = 0;
    let mut control = vec![0u8; cmsg_space_one_fd()];

    let mut iov = [
        iovec {
            iov_base: &mut invoker_pid as *mut pid_t as *mut c_void,
            iov_len: size_of::<pid_t>(),
        },
        iovec {
            iov_base: &mut respawn_delay as *mut c_int as *mut c_void,
            iov_len: size_of::<c_int>(),
        },
    ];

    let mut msg: msghdr = unsafe { zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;
    msg.msg_control = control.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = control.len() as _;

    let rc = unsafe { libc::recvmsg(fd, &mut msg as *mut msghdr, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error())
            .map_err(anyhow::Error::from)
            .map_err(|e| e.context("nothing read from the booster socket"));
    }

    let record = HandoffRecord {
        invoker_pid,
        respawn_delay,
    };

    let fd = unsafe { extract_fd(&msg) };
    Ok((record, fd))
}

unsafe fn extract_fd(msg: &msghdr) -> Option<OwnedFd> {
    let cmsg: *const cmsghdr = libc::CMSG_FIRSTHDR(msg as *const msghdr);
    if cmsg.is_null() {
        return None;
    }
    if (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
        return None;
    }
    let data = libc::CMSG_DATA(cmsg) as *const c_int;
    let raw_fd = data.read_unaligned();
    Some(OwnedFd::from_raw_fd(raw_fd))
}

/// Sends a hand-off datagram along with the ancillary fd. This is the
/// booster-side half of the protocol: the concrete `Booster::run` (out of
/// scope) calls this once it has accepted a launch, on the `ipc_fd` it was
/// handed by `Booster::initialize`.
pub fn send(
    fd: RawFd,
    record: HandoffRecord,
    invoker_fd: Option<RawFd>,
) -> anyhow::Result<()> {
    let mut invoker_pid = record.invoker_pid;
    let mut respawn_delay = record.respawn_delay;
    let mut iov = [
        iovec {
            iov_base: &mut invoker_pid as *mut pid_t as *mut c_void,
            iov_len: size_of::<pid_t>(),
        },
        iovec {
            iov_base: &mut respawn_delay as *mut c_int as *mut c_void,
            iov_len: size_of::<c_int>(),
        },
    ];

    let mut control = vec![0u8; cmsg_space_one_fd()];
    let mut msg: msghdr = unsafe { zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;

    if let Some(passed_fd) = invoker_fd {
        msg.msg_control = control.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = control.len() as _;
        unsafe {
            let cmsg: *mut cmsghdr = libc::CMSG_FIRSTHDR(&msg as *const msghdr as *mut msghdr);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<c_int>() as u32) as _;
            let data = libc::CMSG_DATA(cmsg) as *mut c_int;
            data.write_unaligned(passed_fd);
        }
    }

    let rc = unsafe { libc::sendmsg(fd, &msg as *const msghdr, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error())
            .map_err(anyhow::Error::from)
            .map_err(|e| e.context("sending hand-off record to daemon"));
    }
    Ok(())
}

/// The two 32-bit words written to an invoker fd when its boosted process
/// exited normally (as opposed to being killed by a signal).
pub const INVOKER_MSG_EXIT: u32 = 1;

pub fn write_exit_notification(fd: RawFd, exit_code: u32) -> io::Result<()> {
    write_u32_pair(fd, INVOKER_MSG_EXIT, exit_code)
}

fn write_u32_pair(fd: RawFd, a: u32, b: u32) -> io::Result<()> {
    write_dontcare(fd, &a.to_ne_bytes())?;
    write_dontcare(fd, &b.to_ne_bytes())
}

fn write_dontcare(fd: RawFd, bytes: &[u8]) -> io::Result<()> {
    let rc = unsafe { libc::write(fd, bytes.as_ptr() as *const c_void, bytes.len()) };
    if rc as usize != bytes.len() {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn round_trips_record_without_fd() {
        let (a, b) = create_pair().unwrap();
        let record = HandoffRecord {
            invoker_pid: 4242,
            respawn_delay: 1,
        };
        send(b.as_raw_fd(), record, None).unwrap();
        let (got, fd) = recv(a.as_raw_fd()).unwrap();
        assert_eq!(got, record);
        assert!(fd.is_none());
    }

    #[test]
    fn round_trips_record_with_fd() {
        let (a, b) = create_pair().unwrap();
        let (pipe_r, pipe_w) = {
            let mut fds = [0; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            (fds[0], fds[1])
        };
        let record = HandoffRecord {
            invoker_pid: 99,
            respawn_delay: 0,
        };
        send(b.as_raw_fd(), record, Some(pipe_r)).unwrap();
        unsafe { libc::close(pipe_r) };

        let (got, fd) = recv(a.as_raw_fd()).unwrap();
        assert_eq!(got, record);
        let fd = fd.expect("fd should have been passed");
        // The passed fd is a fresh duplicate of the reader end; writing through
        // the original writer end should be visible when we read from it.
        write_dontcare(pipe_w, b"x").unwrap();
        let mut buf = [0u8; 1];
        let n = unsafe {
            libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, 1)
        };
        assert_eq!(n, 1);
        assert_eq!(buf[0], b'x');
        unsafe { libc::close(pipe_w) };
    }

    #[test]
    fn null_invoker_pid_suppresses_adoption() {
        let record = HandoffRecord {
            invoker_pid: 0,
            respawn_delay: 3,
        };
        assert!(record.suppresses_adoption());
    }
}
