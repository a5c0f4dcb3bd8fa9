//! Watchdog registry.
//!
//! A single ticker polls every registered liveness predicate on a fixed
//! cadence. A predicate that returns `false` is dropped and never called
//! again. When no entries are registered the tick runs the idle hook instead.
//!
//! The registry runs on its own task, separate from the commander channel,
//! and only ever reports through logging.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Predicate polled on every tick; `true` means "keep watching".
pub type Liveness = Box<dyn FnMut() -> bool + Send>;

/// One registered liveness check.
pub struct WatchdogEntry {
    label: String,
    pid: Option<u32>,
    check: Liveness,
}

impl WatchdogEntry {
    pub fn new(label: impl Into<String>, check: impl FnMut() -> bool + Send + 'static) -> Self {
        Self {
            label: label.into(),
            pid: None,
            check: Box::new(check),
        }
    }

    /// Watch a user task until it can no longer be found or has been reaped.
    pub fn for_task(pid: u32) -> Self {
        Self {
            label: "user task".to_string(),
            pid: Some(pid),
            check: Box::new(move || task_alive(pid)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl std::fmt::Debug for WatchdogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogEntry")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

type IdleHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Entries {
    idle: Vec<WatchdogEntry>,
    /// Entries taken out by a tick that is still running their predicates.
    in_flight: usize,
}

/// Registry of liveness checks driven by one periodic ticker.
pub struct WatchdogRegistry {
    entries: Mutex<Entries>,
    interval: Duration,
    idle_hook: IdleHook,
}

impl WatchdogRegistry {
    /// `interval` must be non-zero.
    pub fn new(interval: Duration, idle_hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            interval,
            idle_hook: Box::new(idle_hook),
        }
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Add an entry. Safe to call from any task, including from inside a
    /// predicate during a tick.
    pub fn register(&self, entry: WatchdogEntry) {
        debug!(label = %entry.label, pid = ?entry.pid, "Registering watchdog");
        self.lock().idle.push(entry);
    }

    /// Number of registered entries, including those being checked right now.
    pub fn len(&self) -> usize {
        let entries = self.lock();
        entries.idle.len() + entries.in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one round of checks. Returns how many entries were removed.
    pub fn tick(&self) -> usize {
        // Predicates run without the lock held so they may register entries.
        let mut due = {
            let mut entries = self.lock();
            let due = std::mem::take(&mut entries.idle);
            entries.in_flight += due.len();
            due
        };
        let before = due.len();
        if before == 0 && self.is_empty() {
            (self.idle_hook)();
            return 0;
        }

        due.retain_mut(|entry| {
            let alive = (entry.check)();
            if !alive {
                info!(label = %entry.label, pid = ?entry.pid, "Stopping the watchdog");
            }
            alive
        });
        let removed = before - due.len();

        let mut entries = self.lock();
        entries.in_flight -= before;
        let registered_meanwhile = std::mem::replace(&mut entries.idle, due);
        entries.idle.extend(registered_meanwhile);
        removed
    }

    /// Start the background ticker.
    ///
    /// Runs until `stop` is cancelled. The first tick fires one interval
    /// after start.
    pub fn start(self: &Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.tick();
                    }
                }
            }
            debug!("Watchdog stopped");
        })
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Liveness check for a user task.
///
/// Reaps the child if it has exited, so finished tasks never linger as zombies.
fn task_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let pid_t = Pid::from_raw(raw);

    if kill(pid_t, None::<Signal>) == Err(Errno::ESRCH) {
        info!(pid, "User task cannot be found. Probably it has exited");
        return false;
    }

    match waitpid(pid_t, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => true,
        Ok(WaitStatus::Exited(_, status)) => {
            info!(pid, status, "User task exited");
            false
        }
        Ok(WaitStatus::Signaled(_, signal, core_dumped)) => {
            info!(pid, %signal, core_dumped, "User task was terminated by a signal");
            false
        }
        Ok(WaitStatus::Stopped(_, signal)) => {
            info!(pid, %signal, "User task stopped by signal");
            false
        }
        Ok(other) => {
            debug!(pid, status = ?other, "User task changed state");
            true
        }
        // Not our child: it cannot be reaped here, keep polling for existence.
        Err(Errno::ECHILD) => true,
        Err(e) => {
            debug!(pid, error = %e, "waitpid failed");
            true
        }
    }
}
