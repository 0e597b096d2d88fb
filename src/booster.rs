//! The abstract Booster capability and the single-instance plugin loader.
//!
//! Everything about how a concrete booster preloads libraries, initializes a
//! runtime, or execs an application is out of scope here — this module only
//! defines the narrow interface the fork/exec engine needs.

use std::os::fd::RawFd;

use libloading::Library;
use tracing::warn;

use crate::socket_manager::SocketManager;

/// A pre-warmed process capability, adopted polymorphically by the fork
/// engine. Concrete implementations (Qt booster, generic booster, ...) live
/// outside this crate.
pub trait Booster {
    /// Short type tag, e.g. `"qt"` or `"generic"`, used to name this booster's
    /// socket and PID file.
    fn booster_type(&self) -> &str;

    /// Called once in a freshly forked child, after signal handlers have been
    /// restored and capabilities have not yet been dropped. `args` is the
    /// daemon's original argv, `ipc_fd` is this process's end of the booster
    /// socket pair, and `listen_fd` is the application-facing listening
    /// socket from the `SocketManager`.
    fn initialize(
        &mut self,
        args: &[String],
        ipc_fd: RawFd,
        listen_fd: RawFd,
        single_instance: &SingleInstancePlugin,
        boot_mode: bool,
    ) -> anyhow::Result<()>;

    /// Runs the booster until it adopts an application and execs it (or until
    /// it decides to exit on its own), returning the process's exit status.
    fn run(&mut self, socket_manager: &SocketManager) -> i32;
}

const VALIDATE_SYMBOL: &[u8] = b"single_instance_validate\0";

/// Loads and validates the single-instance plugin, if present. A missing or
/// invalid plugin is a recoverable, logged condition — the daemon continues
/// without single-instance support (see spec.md §7).
pub struct SingleInstancePlugin {
    // Keeping the `Library` alive is what keeps the symbol we validated valid;
    // we don't otherwise care about its contents from the daemon's side.
    _library: Option<Library>,
}

impl SingleInstancePlugin {
    /// Attempts to `dlopen`-equivalent load `path` and validate that it
    /// exports the expected entry point. Never fails outright: on any error
    /// this returns a plugin that reports itself as unavailable.
    pub fn load(path: &str) -> Self {
        let library = match unsafe { Library::new(path) } {
            Ok(lib) => lib,
            Err(error) => {
                warn!(%error, path, "dlopening single-instance plugin failed");
                return SingleInstancePlugin { _library: None };
            }
        };

        let valid = unsafe {
            library
                .get::<unsafe extern "C" fn() -> i32>(VALIDATE_SYMBOL)
                .is_ok()
        };

        if valid {
            SingleInstancePlugin {
                _library: Some(library),
            }
        } else {
            warn!(path, "invalid single-instance plugin: missing validation symbol");
            SingleInstancePlugin { _library: None }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self._library.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_plugin_is_recoverable() {
        let plugin = SingleInstancePlugin::load("/nonexistent/single-instance.so");
        assert!(!plugin.is_loaded());
    }
}
