use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

use super::registry::{RegistryError, ThreadRegistry, WorkerExit};
use crate::link::LinkError;
use crate::protocol::ProtocolError;

/// Longest uninterrupted nap inside [`WorkerContext::sleep`].
const SLEEP_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// The worker is done; it leaves its loop and marks itself terminated.
    Finished,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Failed(String),
}

/// A unit of recurring work run on its own supervised thread.
pub trait Worker: Send {
    fn on_start(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    fn run_iteration(&mut self, ctx: &WorkerContext) -> Result<Step, WorkerError>;

    fn on_stop(&mut self, _ctx: &WorkerContext) {}

    /// Stall deadline for this worker; `None` uses the watchdog default.
    fn heartbeat_interval(&self) -> Option<Duration> {
        None
    }
}

/// Builds a fresh worker for every (re)start of a supervised role.
pub type WorkerFactory = Arc<dyn Fn() -> Result<Box<dyn Worker>, WorkerError> + Send + Sync>;

/// Control side of a worker thread.
#[derive(Debug, Clone, Default)]
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

struct AliveGuard(WorkerHandle);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.set_alive(false);
    }
}

/// What a running worker sees of its supervision.
pub struct WorkerContext {
    name: String,
    generation: u64,
    registry: Arc<ThreadRegistry>,
    handle: WorkerHandle,
}

impl WorkerContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn stop_requested(&self) -> bool {
        self.handle.stop_requested()
    }

    /// Reports liveness. Returns `false` once this incarnation has been
    /// revoked, after which the worker must return promptly.
    pub fn heartbeat(&self) -> bool {
        let current = self
            .registry
            .heartbeat(&self.name, self.generation, Instant::now());
        if !current {
            self.handle.request_stop();
        }
        current
    }

    /// Sleeps up to `duration`, heartbeating along the way. Returns `false`
    /// when woken early by a stop request.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stop_requested() || !self.heartbeat() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Registers `worker` as Starting and runs it on a new OS thread.
pub fn spawn(
    registry: &Arc<ThreadRegistry>,
    name: &str,
    worker: Box<dyn Worker>,
) -> Result<WorkerHandle, RegistryError> {
    let handle = WorkerHandle::new();
    let generation = registry.register(name, handle.clone(), worker.heartbeat_interval())?;
    launch(registry, name, generation, handle.clone(), worker)?;
    Ok(handle)
}

/// Starts the thread for an already registered incarnation.
pub(crate) fn launch(
    registry: &Arc<ThreadRegistry>,
    name: &str,
    generation: u64,
    handle: WorkerHandle,
    worker: Box<dyn Worker>,
) -> Result<(), RegistryError> {
    let ctx = WorkerContext {
        name: name.to_string(),
        generation,
        registry: Arc::clone(registry),
        handle: handle.clone(),
    };

    handle.set_alive(true);
    let spawned = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run_protected(ctx, worker));

    // The join handle is dropped: a thread the watchdog gives up on stays
    // detached and can no longer touch its successor's record.
    match spawned {
        Ok(_) => Ok(()),
        Err(source) => {
            handle.set_alive(false);
            registry.report_exit(name, generation, WorkerExit::Error(source.to_string()));
            Err(RegistryError::Spawn {
                name: name.to_string(),
                source,
            })
        }
    }
}

fn run_protected(ctx: WorkerContext, mut worker: Box<dyn Worker>) {
    let guard = AliveGuard(ctx.handle.clone());
    info!(worker = %ctx.name, generation = ctx.generation, "worker started");
    ctx.heartbeat();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| drive(&ctx, worker.as_mut())));
    let exit = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(WorkerExit::Error(err.to_string())),
        Err(payload) => Some(WorkerExit::Panicked(panic_message(payload.as_ref()))),
    };

    if panic::catch_unwind(AssertUnwindSafe(|| worker.on_stop(&ctx))).is_err() {
        warn!(worker = %ctx.name, "on_stop panicked");
    }

    match exit {
        None => {
            ctx.registry.mark_terminated(&ctx.name, ctx.generation);
            info!(worker = %ctx.name, generation = ctx.generation, "worker stopped");
        }
        Some(exit) => {
            error!(worker = %ctx.name, generation = ctx.generation, %exit, "worker left its loop");
            ctx.registry.report_exit(&ctx.name, ctx.generation, exit);
        }
    }
    drop(guard);
}

fn drive(ctx: &WorkerContext, worker: &mut dyn Worker) -> Result<(), WorkerError> {
    worker.on_start(ctx)?;
    while !ctx.stop_requested() {
        if !ctx.heartbeat() {
            break;
        }
        let step = worker.run_iteration(ctx)?;
        if !ctx.heartbeat() || step == Step::Finished {
            break;
        }
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::registry::ThreadState;

    struct Countdown(u32);

    impl Worker for Countdown {
        fn run_iteration(&mut self, _ctx: &WorkerContext) -> Result<Step, WorkerError> {
            self.0 -= 1;
            Ok(if self.0 == 0 { Step::Finished } else { Step::Continue })
        }
    }

    struct Boom;

    impl Worker for Boom {
        fn run_iteration(&mut self, _ctx: &WorkerContext) -> Result<Step, WorkerError> {
            panic!("sensor table corrupt");
        }
    }

    fn wait_dead(handle: &WorkerHandle) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_finished_worker_marks_itself_terminated() {
        let registry = Arc::new(ThreadRegistry::new());
        let handle = spawn(&registry, "countdown", Box::new(Countdown(3))).unwrap();
        wait_dead(&handle);
        let record = registry.get("countdown").unwrap();
        assert_eq!(record.state, ThreadState::Terminated);
        assert!(record.exit.is_none());
    }

    #[test]
    fn test_panic_is_reported_not_propagated() {
        let registry = Arc::new(ThreadRegistry::new());
        let handle = spawn(&registry, "boom", Box::new(Boom)).unwrap();
        wait_dead(&handle);
        let record = registry.get("boom").unwrap();
        assert_eq!(
            record.exit,
            Some(WorkerExit::Panicked("sensor table corrupt".into()))
        );
        assert_ne!(record.state, ThreadState::Terminated);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = Arc::new(ThreadRegistry::new());
        let handle = spawn(&registry, "dup", Box::new(Countdown(1))).unwrap();
        assert!(matches!(
            spawn(&registry, "dup", Box::new(Countdown(1))),
            Err(RegistryError::Duplicate(_))
        ));
        wait_dead(&handle);
    }
}
