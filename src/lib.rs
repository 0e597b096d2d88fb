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

//! A pre-forking application launcher daemon.
//!
//! A `boosterd` process manages a single "booster type": it keeps one warm,
//! pre-initialized child process on standby and hands it off to the first
//! invoker that asks for one, amortizing the fixed cost of process startup
//! (dynamic linking, runtime initialization) across many short-lived
//! application launches.
//!
//! The pieces a consumer of this crate assembles are:
//!
//!   - [`Booster`], the trait a concrete booster type (Qt, a generic exec
//!     booster, ...) implements to describe how it initializes and how it
//!     hands off to a launched application.
//!   - [`DaemonCore`], which owns the supervisor loop: forking warm boosters,
//!     reaping them, tracking which invoker each adopted one belongs to, and
//!     reacting to `SIGUSR1`/`SIGUSR2` mode switches and `SIGTERM` shutdown.
//!   - [`BoosterArgs`], the command-line surface a binary built on this crate
//!     parses and passes to [`DaemonCore::new`].
//!
//! See `demos/echo-booster.rs` for a minimal concrete booster.

pub mod args;
pub mod booster;
pub mod core;
pub mod daemonize;
pub mod handoff;
pub mod logging;
pub mod registry;
pub mod signals;
pub mod socket_manager;
pub mod systemd;

pub use args::BoosterArgs;
pub use booster::{Booster, SingleInstancePlugin};
pub use core::DaemonCore;
pub use handoff::HandoffRecord;
pub use registry::ChildRegistry;
pub use signals::SignalFunnel;
pub use socket_manager::SocketManager;
