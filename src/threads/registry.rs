use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::worker::WorkerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadState {
    Starting,
    Running,
    Stalled,
    Terminated,
}

/// Abnormal end of a worker loop, reported by the worker itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerExit {
    Error(String),
    Panicked(String),
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::Error(msg) => write!(f, "failed: {msg}"),
            WorkerExit::Panicked(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StallReason {
    NoFirstHeartbeat,
    HeartbeatTimeout { age_ms: u64 },
    Exited(WorkerExit),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a worker named '{0}' is already registered")]
    Duplicate(String),
    #[error("no worker named '{0}' is registered")]
    Unknown(String),
    #[error("worker '{0}' has not terminated")]
    NotTerminated(String),
    #[error("failed to spawn thread for worker '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub name: String,
    pub handle: WorkerHandle,
    pub generation: u64,
    pub state: ThreadState,
    pub registered_at: Instant,
    pub last_heartbeat: Option<Instant>,
    /// Stall deadline overriding the watchdog default.
    pub heartbeat_interval: Option<Duration>,
    pub exit: Option<WorkerExit>,
    pub stall: Option<StallReason>,
    pub stalled_at: Option<Instant>,
    pub restarts: u32,
}

impl ThreadRecord {
    pub fn heartbeat_age(&self, now: Instant) -> Option<Duration> {
        self.last_heartbeat
            .map(|at| now.saturating_duration_since(at))
    }

    pub fn status(&self, now: Instant) -> ThreadStatus {
        ThreadStatus {
            name: self.name.clone(),
            state: self.state,
            generation: self.generation,
            restarts: self.restarts,
            heartbeat_age_ms: self
                .heartbeat_age(now)
                .map(|age| age.as_millis() as u64),
            stall: self.stall.clone(),
        }
    }
}

/// Serializable view of a [`ThreadRecord`] for clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStatus {
    pub name: String,
    pub state: ThreadState,
    pub generation: u64,
    pub restarts: u32,
    pub heartbeat_age_ms: Option<u64>,
    pub stall: Option<StallReason>,
}

#[derive(Debug, Default)]
struct Records {
    records: Vec<ThreadRecord>,
    last_generation: u64,
}

impl Records {
    fn find_mut(&mut self, name: &str, generation: u64) -> Option<&mut ThreadRecord> {
        self.records
            .iter_mut()
            .find(|r| r.name == name && r.generation == generation)
    }

    fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }
}

/// Directory of every supervised worker, shared by the workers (own
/// heartbeat and exit only) and the watchdog (state transitions).
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    inner: Mutex<Records>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(
        &self,
        name: &str,
        handle: WorkerHandle,
        heartbeat_interval: Option<Duration>,
    ) -> Result<u64, RegistryError> {
        let mut inner = self.lock();
        if inner.records.iter().any(|r| r.name == name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }

        let generation = inner.next_generation();
        inner.records.push(ThreadRecord {
            name: name.to_string(),
            handle,
            generation,
            state: ThreadState::Starting,
            registered_at: Instant::now(),
            last_heartbeat: None,
            heartbeat_interval,
            exit: None,
            stall: None,
            stalled_at: None,
            restarts: 0,
        });
        debug!(worker = name, generation, "worker registered");
        Ok(generation)
    }

    /// Records a liveness signal. `false` tells the caller its incarnation is
    /// stale or terminated and it must leave its loop.
    pub fn heartbeat(&self, name: &str, generation: u64, at: Instant) -> bool {
        let mut inner = self.lock();
        match inner.find_mut(name, generation) {
            Some(record) if record.state != ThreadState::Terminated => {
                record.last_heartbeat = Some(at);
                true
            }
            _ => false,
        }
    }

    pub fn report_exit(&self, name: &str, generation: u64, exit: WorkerExit) -> bool {
        let mut inner = self.lock();
        match inner.find_mut(name, generation) {
            Some(record) if record.state != ThreadState::Terminated => {
                record.exit = Some(exit);
                true
            }
            _ => false,
        }
    }

    /// Clean shutdown of the calling worker.
    pub fn mark_terminated(&self, name: &str, generation: u64) -> bool {
        let mut inner = self.lock();
        match inner.find_mut(name, generation) {
            Some(record) if record.state != ThreadState::Terminated => {
                record.state = ThreadState::Terminated;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<ThreadRecord> {
        self.lock().records.iter().find(|r| r.name == name).cloned()
    }

    pub fn snapshot(&self) -> Vec<ThreadRecord> {
        self.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn request_stop_all(&self) {
        for record in &self.lock().records {
            record.handle.request_stop();
        }
    }

    /// Waits until every registered thread has left its loop.
    pub fn wait_all_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let alive = self.lock().records.iter().any(|r| r.handle.is_alive());
            if !alive {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Applies a watchdog transition. Only forward moves along
    /// Starting -> Running -> Stalled -> Terminated (plus Starting -> Stalled)
    /// are accepted.
    pub(crate) fn transition(
        &self,
        name: &str,
        generation: u64,
        to: ThreadState,
        stall: Option<StallReason>,
        at: Instant,
    ) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.find_mut(name, generation) else {
            return false;
        };

        let allowed = matches!(
            (record.state, to),
            (ThreadState::Starting, ThreadState::Running)
                | (ThreadState::Starting, ThreadState::Stalled)
                | (ThreadState::Running, ThreadState::Stalled)
                | (ThreadState::Stalled, ThreadState::Terminated)
        );
        if !allowed {
            return false;
        }

        if to == ThreadState::Stalled {
            record.stalled_at = Some(at);
            record.stall = stall;
        }
        record.state = to;
        true
    }

    /// Gives a terminated record a new incarnation for a restart.
    pub(crate) fn reinstate(
        &self,
        name: &str,
        handle: WorkerHandle,
        heartbeat_interval: Option<Duration>,
    ) -> Result<u64, RegistryError> {
        let mut inner = self.lock();
        let generation = inner.next_generation();
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
        if record.state != ThreadState::Terminated {
            return Err(RegistryError::NotTerminated(name.to_string()));
        }

        record.handle = handle;
        record.generation = generation;
        record.state = ThreadState::Starting;
        record.registered_at = Instant::now();
        record.last_heartbeat = None;
        record.heartbeat_interval = heartbeat_interval;
        record.exit = None;
        record.stall = None;
        record.stalled_at = None;
        record.restarts += 1;
        Ok(generation)
    }

    /// Drops a terminated record.
    pub(crate) fn remove(&self, name: &str) -> Option<ThreadRecord> {
        let mut inner = self.lock();
        let index = inner
            .records
            .iter()
            .position(|r| r.name == name && r.state == ThreadState::Terminated)?;
        Some(inner.records.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_generation_is_rejected() {
        let registry = ThreadRegistry::new();
        let gen = registry.register("logic", WorkerHandle::new(), None).unwrap();
        let now = Instant::now();
        assert!(registry.heartbeat("logic", gen, now));

        assert!(registry.transition("logic", gen, ThreadState::Stalled, None, now));
        assert!(registry.transition("logic", gen, ThreadState::Terminated, None, now));
        assert!(!registry.heartbeat("logic", gen, now));

        let next = registry.reinstate("logic", WorkerHandle::new(), None).unwrap();
        assert!(next > gen);
        assert!(!registry.heartbeat("logic", gen, now));
        assert!(registry.heartbeat("logic", next, now));
        assert_eq!(registry.get("logic").unwrap().restarts, 1);
    }

    #[test]
    fn test_backward_transitions_refused() {
        let registry = ThreadRegistry::new();
        let gen = registry.register("serial-io", WorkerHandle::new(), None).unwrap();
        let now = Instant::now();
        assert!(!registry.transition("serial-io", gen, ThreadState::Terminated, None, now));
        assert!(registry.transition("serial-io", gen, ThreadState::Running, None, now));
        assert!(!registry.transition("serial-io", gen, ThreadState::Starting, None, now));
        assert!(registry.remove("serial-io").is_none());
    }
}
