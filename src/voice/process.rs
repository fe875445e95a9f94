//! Child process groups
//!
//! Every external audio helper (recorder, filter, player, listener) runs in its
//! own process group so a whole pipeline can be signalled at once. Outside unix
//! the group degrades to a cancellation token that driver tasks turn into
//! `Child::start_kill`.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// How a group is asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM, lets recorders flush
    Terminate,
    /// SIGKILL, used for barge-in
    Kill,
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit code zero
    Success,
    /// Non-zero exit code
    Failed(i32),
    /// No exit code (terminated by a signal)
    Signalled,
}

impl ExitKind {
    /// Classify an exit status
    #[must_use]
    pub fn classify(status: ExitStatus) -> Self {
        if status.success() {
            return Self::Success;
        }
        status.code().map_or(Self::Signalled, Self::Failed)
    }

    /// Whether this exit should be reported as a failure
    ///
    /// Anything but a clean exit is a failure unless we asked the process to stop.
    #[must_use]
    pub const fn is_failure(self, stopping: bool) -> bool {
        match self {
            Self::Success => false,
            Self::Failed(_) | Self::Signalled => !stopping,
        }
    }
}

struct GroupInner {
    name: &'static str,
    pgid: Option<u32>,
    signal: StopSignal,
    stop: CancellationToken,
    exited: AtomicBool,
}

/// Handle to a running process group
///
/// Cloning shares the same group. `terminate` is idempotent.
#[derive(Clone)]
pub struct ProcessGroup {
    inner: Arc<GroupInner>,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("name", &self.inner.name)
            .field("pgid", &self.inner.pgid)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl ProcessGroup {
    /// Wrap a group led by `pgid`
    #[must_use]
    pub fn new(name: &'static str, pgid: Option<u32>, signal: StopSignal) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                name,
                pgid,
                signal,
                stop: CancellationToken::new(),
                exited: AtomicBool::new(false),
            }),
        }
    }

    /// A group with no OS process behind it (stop only cancels the token)
    #[must_use]
    pub fn detached(name: &'static str) -> Self {
        Self::new(name, None, StopSignal::Kill)
    }

    /// Process group id, if the leader spawned
    #[must_use]
    pub fn pgid(&self) -> Option<u32> {
        self.inner.pgid
    }

    /// Name used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Signal every process in the group
    ///
    /// Safe to call repeatedly and after the processes are gone.
    pub fn terminate(&self) {
        if self.inner.stop.is_cancelled() {
            return;
        }
        self.inner.stop.cancel();

        if self.has_exited() {
            return;
        }

        #[cfg(unix)]
        if let Some(pgid) = self.inner.pgid {
            signal_group(pgid, self.inner.signal);
        }

        tracing::debug!(
            group = self.inner.name,
            pgid = ?self.inner.pgid,
            signal = ?self.inner.signal,
            "process group terminated"
        );
    }

    /// Whether `terminate` has been called
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Resolves once `terminate` is called
    pub async fn terminated(&self) {
        self.inner.stop.cancelled().await;
    }

    /// Record that the group's processes have been reaped
    pub fn mark_exited(&self) {
        self.inner.exited.store(true, Ordering::SeqCst);
    }

    /// Whether the group's processes have been reaped
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.inner.exited.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: StopSignal) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    let sig = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };

    match killpg(Pid::from_raw(raw), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, error = %e, "failed to signal process group"),
    }
}

/// Put a command in a process group
///
/// `leader` of `None` makes the spawned process the leader of a new group;
/// `Some(pgid)` joins an existing one.
pub fn in_group(command: &mut Command, leader: Option<u32>) -> &mut Command {
    #[cfg(unix)]
    {
        let pgid = leader.and_then(|p| i32::try_from(p).ok()).unwrap_or(0);
        command.process_group(pgid);
    }
    #[cfg(not(unix))]
    let _ = leader;

    command.kill_on_drop(true)
}

/// Tracks live process groups so stragglers can be cleaned up
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    groups: Arc<Mutex<HashMap<u64, ProcessGroup>>>,
    next_id: Arc<AtomicU64>,
}

impl ProcessRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a group
    pub fn register(&self, group: &ProcessGroup) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        groups.retain(|_, g| !g.has_exited());
        groups.insert(id, group.clone());
    }

    /// Number of groups whose processes have not been reaped
    #[must_use]
    pub fn live(&self) -> usize {
        let groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        groups.values().filter(|g| !g.has_exited()).count()
    }

    /// Terminate every tracked group and forget them
    pub fn terminate_all(&self) -> usize {
        let drained: Vec<ProcessGroup> = {
            let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
            groups.drain().map(|(_, g)| g).collect()
        };

        let mut count = 0;
        for group in drained.into_iter().filter(|g| !g.has_exited()) {
            group.terminate();
            count += 1;
        }

        if count > 0 {
            tracing::info!(count, "terminated straggling child processes");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn classify_exit_statuses() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(ExitKind::classify(ExitStatus::from_raw(0)), ExitKind::Success);
        // Exit code lives in the high byte of the wait status
        assert_eq!(
            ExitKind::classify(ExitStatus::from_raw(2 << 8)),
            ExitKind::Failed(2)
        );
        // SIGKILL
        assert_eq!(ExitKind::classify(ExitStatus::from_raw(9)), ExitKind::Signalled);
    }

    #[test]
    fn failure_depends_on_intent() {
        assert!(!ExitKind::Success.is_failure(false));
        assert!(ExitKind::Failed(1).is_failure(false));
        assert!(!ExitKind::Failed(1).is_failure(true));
        assert!(!ExitKind::Signalled.is_failure(true));
        assert!(ExitKind::Signalled.is_failure(false));
    }

    #[test]
    fn terminate_is_idempotent() {
        let group = ProcessGroup::detached("test");
        assert!(!group.is_terminated());
        group.terminate();
        group.terminate();
        assert!(group.is_terminated());
    }

    #[test]
    fn registry_skips_exited_groups() {
        let registry = ProcessRegistry::new();
        let live = ProcessGroup::detached("live");
        let done = ProcessGroup::detached("done");
        registry.register(&live);
        registry.register(&done);
        done.mark_exited();

        assert_eq!(registry.live(), 1);
        assert_eq!(registry.terminate_all(), 1);
        assert!(live.is_terminated());
        assert!(!done.is_terminated());
        assert_eq!(registry.live(), 0);
    }

    #[tokio::test]
    async fn terminated_resolves_after_terminate() {
        let group = ProcessGroup::detached("test");
        let waiter = group.clone();
        let task = tokio::spawn(async move { waiter.terminated().await });
        group.terminate();
        task.await.unwrap();
    }
}
