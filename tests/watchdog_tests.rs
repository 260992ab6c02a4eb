use hvacd::alert::*;
use hvacd::settings::WatchdogSettings;
use hvacd::threads::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Heartbeats once, then blocks without heartbeating.
struct Hang(Duration);

impl Worker for Hang {
    fn run_iteration(&mut self, _ctx: &WorkerContext) -> Result<Step, WorkerError> {
        thread::sleep(self.0);
        Ok(Step::Continue)
    }
}

/// Fails on its first iteration.
struct Fail;

impl Worker for Fail {
    fn run_iteration(&mut self, _ctx: &WorkerContext) -> Result<Step, WorkerError> {
        Err(WorkerError::Failed("board table missing".into()))
    }
}

/// Fails after a short delay.
struct SlowFail;

impl Worker for SlowFail {
    fn run_iteration(&mut self, _ctx: &WorkerContext) -> Result<Step, WorkerError> {
        thread::sleep(Duration::from_millis(20));
        Err(WorkerError::Failed("sensor timeout".into()))
    }
}

/// Heartbeats forever through the cooperative sleep.
struct Idle;

impl Worker for Idle {
    fn run_iteration(&mut self, ctx: &WorkerContext) -> Result<Step, WorkerError> {
        ctx.sleep(Duration::from_millis(10));
        Ok(Step::Continue)
    }
}

struct Once;

impl Worker for Once {
    fn run_iteration(&mut self, _ctx: &WorkerContext) -> Result<Step, WorkerError> {
        Ok(Step::Finished)
    }
}

fn settings() -> WatchdogSettings {
    WatchdogSettings {
        poll_interval_ms: 100,
        grace_period_ms: 2_000,
        heartbeat_timeout_ms: 2_000,
        stop_grace_period_ms: 1_000,
        max_restarts: 3,
        restart_window_ms: 60_000,
    }
}

fn watchdog() -> (Watchdog, Arc<ThreadRegistry>, Arc<AlertLog>) {
    let registry = Arc::new(ThreadRegistry::new());
    let alerts = Arc::new(AlertLog::new());
    let watchdog = Watchdog::new(Arc::clone(&registry), Arc::clone(&alerts), settings());
    (watchdog, registry, alerts)
}

fn factory<W, F>(build: F) -> WorkerFactory
where
    W: Worker + 'static,
    F: Fn() -> W + Send + Sync + 'static,
{
    Arc::new(move || -> Result<Box<dyn Worker>, WorkerError> { Ok(Box::new(build())) })
}

/// Polls with the real clock until `done` holds or five seconds pass.
fn poll_until<F: Fn() -> bool>(watchdog: &mut Watchdog, done: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        watchdog.poll(Instant::now());
        thread::sleep(Duration::from_millis(5));
    }
}

fn state(registry: &ThreadRegistry, name: &str) -> ThreadState {
    registry.get(name).unwrap().state
}

#[test]
fn test_first_heartbeat_moves_to_running() {
    let (mut watchdog, registry, _) = watchdog();
    let handle = watchdog
        .supervise(Supervised {
            name: "idle".into(),
            factory: factory(|| Idle),
            policy: RestartPolicy::Never,
            critical: false,
        })
        .unwrap();

    poll_until(&mut watchdog, || state(&registry, "idle") == ThreadState::Running);
    handle.request_stop();
}

#[test]
fn test_hang_detected_within_timeout_plus_poll() {
    let (mut watchdog, registry, _) = watchdog();
    watchdog
        .supervise(Supervised {
            name: "hang".into(),
            factory: factory(|| Hang(Duration::from_secs(30))),
            policy: RestartPolicy::Never,
            critical: false,
        })
        .unwrap();
    poll_until(&mut watchdog, || state(&registry, "hang") == ThreadState::Running);

    let last = registry.get("hang").unwrap().last_heartbeat.unwrap();
    let timeout = Duration::from_millis(2_000);
    let poll = Duration::from_millis(100);

    // Still inside the heartbeat deadline
    watchdog.poll(last + timeout - Duration::from_millis(50));
    assert_eq!(state(&registry, "hang"), ThreadState::Running);

    // First poll past the deadline catches it
    watchdog.poll(last + timeout + poll);
    let record = registry.get("hang").unwrap();
    assert_eq!(record.state, ThreadState::Stalled);
    assert!(matches!(record.stall, Some(StallReason::HeartbeatTimeout { .. })));
    assert!(record.handle.stop_requested());
}

#[test]
fn test_unresponsive_worker_forcibly_terminated_after_stop_grace() {
    let (mut watchdog, registry, _) = watchdog();
    watchdog
        .supervise(Supervised {
            name: "hang".into(),
            factory: factory(|| Hang(Duration::from_secs(30))),
            policy: RestartPolicy::Never,
            critical: false,
        })
        .unwrap();
    poll_until(&mut watchdog, || state(&registry, "hang") == ThreadState::Running);

    let last = registry.get("hang").unwrap().last_heartbeat.unwrap();
    let stalled_at = last + Duration::from_millis(2_100);
    watchdog.poll(stalled_at);
    assert_eq!(state(&registry, "hang"), ThreadState::Stalled);

    // The stuck thread ignores the stop request
    watchdog.poll(stalled_at + Duration::from_millis(999));
    assert_eq!(state(&registry, "hang"), ThreadState::Stalled);

    let next = watchdog.next_wake(stalled_at + Duration::from_millis(950));
    assert_eq!(next, Duration::from_millis(50));

    watchdog.poll(stalled_at + Duration::from_millis(1_000));
    let record = registry.get("hang").unwrap();
    assert_eq!(record.state, ThreadState::Terminated);
    assert!(record.handle.is_alive(), "thread is detached, not joined");

    // The detached incarnation can no longer heartbeat
    assert!(!registry.heartbeat("hang", record.generation, Instant::now()));
}

#[test]
fn test_missing_first_heartbeat_stalls_after_grace_period() {
    let (mut watchdog, registry, _) = watchdog();

    // Registered but never launched, so it can never heartbeat
    registry.register("mute", WorkerHandle::new(), None).unwrap();
    let registered = registry.get("mute").unwrap().registered_at;

    watchdog.poll(registered + Duration::from_millis(1_900));
    assert_eq!(state(&registry, "mute"), ThreadState::Starting);

    // Stalled, then terminated at once (no live thread), then pruned
    let changes = watchdog.poll(registered + Duration::from_millis(2_100));
    assert_eq!(changes, 3);
    assert!(registry.get("mute").is_none());
}

#[test]
fn test_restart_budget_then_escalation() {
    let (mut watchdog, registry, alerts) = watchdog();
    let builds = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&builds);
    watchdog
        .supervise(Supervised {
            name: "flaky".into(),
            factory: factory(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Fail
            }),
            policy: RestartPolicy::Budget {
                max_restarts: 3,
                window: Duration::from_secs(60),
            },
            critical: false,
        })
        .unwrap();

    poll_until(&mut watchdog, || !alerts.escalations().is_empty());

    // Initial start plus exactly three restarts
    assert_eq!(builds.load(Ordering::SeqCst), 4);
    let record = registry.get("flaky").unwrap();
    assert_eq!(record.state, ThreadState::Terminated);
    assert_eq!(record.restarts, 3);

    let escalations = alerts.escalations();
    assert_eq!(escalations.len(), 1);
    assert!(!escalations[0].fatal);
    assert!(alerts.is_healthy());
    assert_eq!(
        escalations[0].alert,
        Alert::WatchdogEscalation {
            worker: "flaky".into(),
            restarts: 3,
            window_ms: 60_000,
        }
    );

    // Further polls neither restart nor escalate again
    for _ in 0..5 {
        watchdog.poll(Instant::now());
    }
    assert_eq!(builds.load(Ordering::SeqCst), 4);
    assert_eq!(alerts.escalations().len(), 1);
}

#[test]
fn test_critical_escalation_makes_process_unhealthy() {
    let (mut watchdog, registry, alerts) = watchdog();
    watchdog
        .supervise(Supervised {
            name: "serial-io".into(),
            factory: factory(|| Fail),
            policy: RestartPolicy::Budget {
                max_restarts: 0,
                window: Duration::from_secs(60),
            },
            critical: true,
        })
        .unwrap();

    poll_until(&mut watchdog, || alerts.has_fatal());
    assert!(!alerts.is_healthy());
    assert_eq!(state(&registry, "serial-io"), ThreadState::Terminated);

    let record = registry.get("serial-io").unwrap();
    assert_eq!(record.restarts, 0);
    assert!(matches!(
        record.stall,
        Some(StallReason::Exited(WorkerExit::Error(_)))
    ));
}

#[test]
fn test_restart_window_forgets_old_restarts() {
    let (mut watchdog, registry, alerts) = watchdog();
    watchdog
        .supervise(Supervised {
            name: "flaky".into(),
            factory: factory(|| SlowFail),
            policy: RestartPolicy::Budget {
                max_restarts: 1,
                window: Duration::from_millis(200),
            },
            critical: false,
        })
        .unwrap();

    // With a short window, restarts age out before the budget fills
    let deadline = Instant::now() + Duration::from_millis(1_500);
    while Instant::now() < deadline {
        watchdog.poll(Instant::now());
        thread::sleep(Duration::from_millis(250));
    }
    assert!(registry.get("flaky").unwrap().restarts >= 2);
    assert!(alerts.escalations().is_empty());
}

#[test]
fn test_finished_unsupervised_workers_are_pruned() {
    let (mut watchdog, registry, _) = watchdog();
    let handle = spawn(&registry, "client-1", Box::new(Once)).unwrap();

    poll_until(&mut watchdog, || !handle.is_alive());
    poll_until(&mut watchdog, || registry.get("client-1").is_none());
    assert!(registry.is_empty());
}

#[test]
fn test_stale_incarnation_cannot_touch_successor() {
    let registry = Arc::new(ThreadRegistry::new());
    let old = registry.register("logic", WorkerHandle::new(), None).unwrap();

    // A stale thread reporting for an old generation is ignored
    assert!(!registry.report_exit("logic", old + 1, WorkerExit::Error("late".into())));
    assert!(!registry.mark_terminated("logic", old + 1));
    assert!(registry.get("logic").unwrap().exit.is_none());
    assert!(registry.mark_terminated("logic", old));
}
