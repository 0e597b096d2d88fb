//! A one-shot outbound readiness signal to systemd (`sd_notify(READY=1)`).
//!
//! Out of scope per spec.md §1 beyond this single call site; the FFI surface
//! mirrors the `proxmox-rest-server` crate's approach of linking directly
//! against `libsystemd` rather than hand-rolling the `$NOTIFY_SOCKET` wire
//! protocol.

use std::ffi::CString;
use std::os::raw::{c_char, c_int};

use anyhow::bail;

#[link(name = "systemd")]
extern "C" {
    fn sd_notify(unset_environment: c_int, state: *const c_char) -> c_int;
}

/// Tells systemd that startup is complete. A no-op (from systemd's point of
/// view) when `$NOTIFY_SOCKET` isn't set, e.g. when not run under systemd.
pub fn notify_ready() -> anyhow::Result<()> {
    let message = CString::new("READY=1")?;
    let rc = unsafe { sd_notify(0, message.as_ptr()) };
    if rc < 0 {
        bail!(
            "sd_notify failed: {}",
            std::io::Error::from_raw_os_error(-rc)
        );
    }
    Ok(())
}
