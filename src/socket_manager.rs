//! Minimal socket path discovery (C1's external `SocketManager` collaborator,
//! supplemented per SPEC_FULL.md §4.11). This is the narrowest concrete thing
//! that lets the fork/exec engine have a real listening socket to pass to a
//! booster; the invoker-side wire protocol spoken over it is out of scope.

use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::Context;

const DEFAULT_SOCKET_ROOT: &str = "/tmp";
const SOCKET_ROOT_ENV: &str = "BOOSTER_SOCKET_ROOT";

pub struct SocketManager {
    socket_root: PathBuf,
    listen_fd: Option<OwnedFd>,
}

impl SocketManager {
    pub fn new() -> Self {
        let socket_root = std::env::var(SOCKET_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_ROOT));
        SocketManager {
            socket_root,
            listen_fd: None,
        }
    }

    pub fn socket_root_path(&self) -> &Path {
        &self.socket_root
    }

    pub fn pid_file_path(&self, booster_type: &str) -> PathBuf {
        self.socket_root.join(format!("{booster_type}.pid"))
    }

    fn socket_path(&self, booster_type: &str) -> PathBuf {
        self.socket_root.join(booster_type)
    }

    /// Creates and binds the booster's application-facing listening socket,
    /// removing any stale socket file left behind by a previous instance.
    pub fn init_socket(&mut self, booster_type: &str) -> anyhow::Result<()> {
        let path = self.socket_path(booster_type);
        let _ = std::fs::remove_file(&path);

        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error())
                .context("creating booster listening socket");
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        bind_unix(&fd, &path).with_context(|| format!("binding {}", path.display()))?;
        listen(&fd).context("listen on booster socket")?;

        self.listen_fd = Some(fd);
        Ok(())
    }

    /// The fd for `booster_type`'s listening socket, if `init_socket` has run.
    pub fn find_socket(&self, _booster_type: &str) -> Option<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        self.listen_fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

impl Default for SocketManager {
    fn default() -> Self {
        Self::new()
    }
}

fn bind_unix(fd: &OwnedFd, path: &Path) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "socket path too long",
        ));
    }
    for (dst, &src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = src as libc::c_char;
    }
    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn listen(fd: &OwnedFd) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    if unsafe { libc::listen(fd.as_raw_fd(), 16) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_path_is_rooted() {
        std::env::remove_var(SOCKET_ROOT_ENV);
        let sm = SocketManager::new();
        assert_eq!(sm.pid_file_path("qt"), PathBuf::from("/tmp/qt.pid"));
    }
}
