//! Liveness supervision of every registered worker.
//!
//! Each poll walks the registry and drives the per-record state machine:
//!
//! ```text
//! Starting --first heartbeat--> Running --missed deadline / exit report--> Stalled
//!     \--no heartbeat within grace period-------------------------------->/
//! Stalled --thread left its loop, or stop grace period elapsed--> Terminated
//! ```
//!
//! Terminated records of supervised roles are restarted within their budget;
//! client connection records are pruned.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::registry::{RegistryError, StallReason, ThreadRecord, ThreadRegistry, ThreadState};
use super::worker::{self, WorkerError, WorkerFactory, WorkerHandle};
use crate::alert::{Alert, AlertLog};
use crate::settings::WatchdogSettings;

/// Upper bound for `max_restarts`.
pub const MAX_RESTART_HISTORY: usize = 32;

/// A record can move through at most this many states in one poll.
const MAX_PASSES_PER_POLL: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    /// At most `max_restarts` restarts within any rolling `window`.
    Budget { max_restarts: u32, window: Duration },
}

/// A named role the watchdog keeps alive.
pub struct Supervised {
    pub name: String,
    pub factory: WorkerFactory,
    pub policy: RestartPolicy,
    /// Escalation of a critical role makes the process unhealthy.
    pub critical: bool,
}

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("failed to build worker: {0}")]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct Role {
    supervised: Supervised,
    restarts: VecDeque<Instant>,
    given_up_on: Option<u64>,
    retry_at: Option<Instant>,
}

pub struct Watchdog {
    registry: Arc<ThreadRegistry>,
    alerts: Arc<AlertLog>,
    settings: WatchdogSettings,
    roles: Vec<Role>,
}

impl Watchdog {
    pub fn new(
        registry: Arc<ThreadRegistry>,
        alerts: Arc<AlertLog>,
        settings: WatchdogSettings,
    ) -> Self {
        Self {
            registry,
            alerts,
            settings,
            roles: Vec::new(),
        }
    }

    /// Builds and starts the first incarnation of a supervised role.
    pub fn supervise(&mut self, supervised: Supervised) -> Result<WorkerHandle, WatchdogError> {
        let worker = (supervised.factory)()?;
        let handle = worker::spawn(&self.registry, &supervised.name, worker)?;
        info!(worker = %supervised.name, critical = supervised.critical, "supervising worker");
        self.roles.push(Role {
            supervised,
            restarts: VecDeque::new(),
            given_up_on: None,
            retry_at: None,
        });
        Ok(handle)
    }

    /// Runs one supervision round at `now` and returns the number of state
    /// changes applied.
    pub fn poll(&mut self, now: Instant) -> usize {
        let mut total = 0;
        for _ in 0..MAX_PASSES_PER_POLL {
            let changes: usize = self
                .registry
                .snapshot()
                .iter()
                .map(|record| usize::from(self.examine(record, now)))
                .sum();
            total += changes;
            if changes == 0 {
                break;
            }
        }
        total
    }

    /// Time until the next poll is due: the poll interval, or sooner when a
    /// stalled worker's stop grace period runs out first.
    pub fn next_wake(&self, now: Instant) -> Duration {
        let stop_grace = self.settings.stop_grace_period();
        self.registry
            .snapshot()
            .iter()
            .filter(|r| r.state == ThreadState::Stalled)
            .filter_map(|r| r.stalled_at)
            .map(|at| (at + stop_grace).saturating_duration_since(now))
            .fold(self.settings.poll_interval(), Duration::min)
    }

    pub fn run(mut self, stop: &AtomicBool) {
        info!(
            poll_ms = self.settings.poll_interval_ms,
            timeout_ms = self.settings.heartbeat_timeout_ms,
            "watchdog running"
        );
        while !stop.load(Ordering::SeqCst) {
            self.poll(Instant::now());
            let wake = self.next_wake(Instant::now()).max(Duration::from_millis(1));
            thread::sleep(wake);
        }
        info!("watchdog stopped");
    }

    pub fn spawn(self) -> io::Result<WatchdogHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || self.run(&flag))?;
        Ok(WatchdogHandle {
            stop,
            thread: Some(thread),
        })
    }

    fn examine(&mut self, record: &ThreadRecord, now: Instant) -> bool {
        match record.state {
            ThreadState::Starting => {
                if let Some(exit) = &record.exit {
                    self.stall(record, StallReason::Exited(exit.clone()), now)
                } else if record.last_heartbeat.is_some() {
                    let moved = self.registry.transition(
                        &record.name,
                        record.generation,
                        ThreadState::Running,
                        None,
                        now,
                    );
                    if moved {
                        debug!(worker = %record.name, generation = record.generation, "worker running");
                    }
                    moved
                } else if now.saturating_duration_since(record.registered_at)
                    > self.settings.grace_period()
                {
                    self.stall(record, StallReason::NoFirstHeartbeat, now)
                } else {
                    false
                }
            }
            ThreadState::Running => {
                if let Some(exit) = &record.exit {
                    return self.stall(record, StallReason::Exited(exit.clone()), now);
                }
                let deadline = record
                    .heartbeat_interval
                    .unwrap_or_else(|| self.settings.heartbeat_timeout());
                let age = record.heartbeat_age(now).unwrap_or_default();
                if age > deadline {
                    self.stall(
                        record,
                        StallReason::HeartbeatTimeout {
                            age_ms: age.as_millis() as u64,
                        },
                        now,
                    )
                } else {
                    false
                }
            }
            ThreadState::Stalled => {
                let stalled_for = record
                    .stalled_at
                    .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
                if !record.handle.is_alive() {
                    info!(worker = %record.name, "stalled worker stopped");
                    self.terminate(record, now)
                } else if stalled_for >= self.settings.stop_grace_period() {
                    warn!(
                        worker = %record.name,
                        generation = record.generation,
                        "worker ignored stop request, revoking and detaching it"
                    );
                    self.terminate(record, now)
                } else {
                    false
                }
            }
            ThreadState::Terminated => self.settle(record, now),
        }
    }

    fn stall(&self, record: &ThreadRecord, reason: StallReason, now: Instant) -> bool {
        let moved = self.registry.transition(
            &record.name,
            record.generation,
            ThreadState::Stalled,
            Some(reason.clone()),
            now,
        );
        if moved {
            error!(
                worker = %record.name,
                generation = record.generation,
                ?reason,
                "worker stalled, requesting stop"
            );
            record.handle.request_stop();
        }
        moved
    }

    fn terminate(&self, record: &ThreadRecord, now: Instant) -> bool {
        record.handle.request_stop();
        self.registry.transition(
            &record.name,
            record.generation,
            ThreadState::Terminated,
            None,
            now,
        )
    }

    fn settle(&mut self, record: &ThreadRecord, now: Instant) -> bool {
        let Some(role) = self
            .roles
            .iter_mut()
            .find(|role| role.supervised.name == record.name)
        else {
            let removed = self.registry.remove(&record.name).is_some();
            if removed {
                debug!(worker = %record.name, "pruned finished worker");
            }
            return removed;
        };

        if role.given_up_on == Some(record.generation) {
            return false;
        }
        if role.retry_at.is_some_and(|at| now < at) {
            return false;
        }

        let (max_restarts, window) = match role.supervised.policy {
            RestartPolicy::Never => {
                info!(worker = %record.name, "worker terminated, not restarting");
                role.given_up_on = Some(record.generation);
                return true;
            }
            RestartPolicy::Budget {
                max_restarts,
                window,
            } => (max_restarts, window),
        };

        while role
            .restarts
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= window)
        {
            role.restarts.pop_front();
        }

        if role.restarts.len() >= max_restarts as usize {
            role.given_up_on = Some(record.generation);
            self.alerts.raise(
                Alert::WatchdogEscalation {
                    worker: record.name.clone(),
                    restarts: role.restarts.len() as u32,
                    window_ms: window.as_millis() as u64,
                },
                role.supervised.critical,
            );
            return true;
        }

        role.restarts.push_back(now);
        match restart(&self.registry, &role.supervised) {
            Ok(generation) => {
                role.retry_at = None;
                warn!(
                    worker = %record.name,
                    generation,
                    attempt = role.restarts.len(),
                    "worker restarted"
                );
            }
            Err(err) => {
                role.retry_at = Some(now + self.settings.grace_period());
                error!(worker = %record.name, error = %err, "worker restart failed");
            }
        }
        true
    }
}

fn restart(registry: &Arc<ThreadRegistry>, supervised: &Supervised) -> Result<u64, WatchdogError> {
    let worker = (supervised.factory)()?;
    let handle = WorkerHandle::new();
    let generation = registry.reinstate(&supervised.name, handle.clone(), worker.heartbeat_interval())?;
    worker::launch(registry, &supervised.name, generation, handle, worker)?;
    Ok(generation)
}

/// Owner side of a running watchdog thread.
#[derive(Debug)]
pub struct WatchdogHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops supervision. Workers keep running; stop them through the registry.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
