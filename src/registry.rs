//! The child registry (C3): in-memory bookkeeping for every child the daemon has
//! forked, plus the subset of those children that have been adopted by an invoker.
//!
//! Mutation is confined to the supervisor thread, so none of this needs locking
//! (see the concurrency model).

use std::collections::HashMap;
use std::os::fd::OwnedFd;

use libc::pid_t;

/// Tracks live children, invoker adoption, and the current warm booster.
///
/// Invariants (checked by [`ChildRegistry::debug_check_invariants`] in tests):
///   - every pid in `adopted_to_invoker_pid` also appears in `live_children`
///   - `warm_booster_pid`, if set, appears in `live_children` and is not adopted
///   - each fd in `adopted_to_invoker_fd` is closed exactly once: either here,
///     via `HashMap::remove` dropping the owned fd, or by the process exiting
#[derive(Default)]
pub struct ChildRegistry {
    live_children: Vec<pid_t>,
    adopted_to_invoker_pid: HashMap<pid_t, pid_t>,
    adopted_to_invoker_fd: HashMap<pid_t, OwnedFd>,
    warm_booster_pid: Option<pid_t>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warm_booster_pid(&self) -> Option<pid_t> {
        self.warm_booster_pid
    }

    pub fn live_children(&self) -> &[pid_t] {
        &self.live_children
    }

    pub fn is_adopted(&self, pid: pid_t) -> bool {
        self.adopted_to_invoker_pid.contains_key(&pid)
    }

    pub fn invoker_pid_of(&self, pid: pid_t) -> Option<pid_t> {
        self.adopted_to_invoker_pid.get(&pid).copied()
    }

    /// Records that `pid` was just forked and is the new warm booster.
    pub fn record_forked(&mut self, pid: pid_t) {
        self.live_children.push(pid);
        self.warm_booster_pid = Some(pid);
    }

    /// Clears the warm slot without forgetting the pid; called right before a fork
    /// attempt so that a hand-off racing with a fork failure never attributes work
    /// to a pid that is about to disappear.
    pub fn clear_warm(&mut self) {
        self.warm_booster_pid = None;
    }

    /// Moves `pid` out of the warm slot into the adopted tables. No-op (besides
    /// logging upstream) if `pid` isn't currently the warm booster — the caller is
    /// expected to have already checked `warm_booster_pid() == Some(pid)`.
    pub fn adopt(&mut self, pid: pid_t, invoker_pid: pid_t, invoker_fd: OwnedFd) {
        self.adopted_to_invoker_pid.insert(pid, invoker_pid);
        self.adopted_to_invoker_fd.insert(pid, invoker_fd);
        if self.warm_booster_pid == Some(pid) {
            self.warm_booster_pid = None;
        }
    }

    /// Removes `pid` from every table. Returns the owned invoker fd, if any —
    /// dropping it (or letting the caller drop it) closes it exactly once.
    pub fn remove(&mut self, pid: pid_t) -> Option<OwnedFd> {
        self.live_children.retain(|&p| p != pid);
        self.adopted_to_invoker_pid.remove(&pid);
        if self.warm_booster_pid == Some(pid) {
            self.warm_booster_pid = None;
        }
        self.adopted_to_invoker_fd.remove(&pid)
    }

    /// All currently owned invoker fds, draining the table. Used by the fork
    /// engine's child branch to close every fd it inherited before it can be
    /// mistaken for belonging to the new booster.
    pub fn drain_invoker_fds(&mut self) -> Vec<OwnedFd> {
        self.adopted_to_invoker_fd.drain().map(|(_, fd)| fd).collect()
    }

    #[cfg(test)]
    pub fn debug_check_invariants(&self) {
        for pid in self.adopted_to_invoker_pid.keys() {
            assert!(
                self.live_children.contains(pid),
                "adopted pid {pid} missing from live_children"
            );
        }
        if let Some(warm) = self.warm_booster_pid {
            assert!(self.live_children.contains(&warm), "warm pid not live");
            assert!(
                !self.adopted_to_invoker_pid.contains_key(&warm),
                "warm pid is also adopted"
            );
        }
    }
}
