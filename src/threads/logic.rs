use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::worker::{Step, Worker, WorkerContext, WorkerError};
use crate::cache::{BoardStateCache, Snapshot};
use crate::config::{Configurator, SetPoint};
use crate::now_millis;
use crate::payload::BoardCommand;
use crate::queue::CommandQueue;
use crate::rules::{self, Decision, RuleEvaluationError};

pub const LOGIC_WORKER_NAME: &str = "logic";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LogicStatus {
    pub iterations: u64,
    pub commands_issued: u64,
    pub rule_errors: u64,
    pub last_tick_ms: Option<u64>,
    pub last_error: Option<String>,
}

pub type SharedLogicStatus = Arc<RwLock<LogicStatus>>;

#[derive(Debug, Default, PartialEq)]
pub struct TickOutcome {
    pub commands: Vec<BoardCommand>,
    pub errors: Vec<RuleEvaluationError>,
}

/// Rule evaluation state carried between ticks.
#[derive(Debug, Default)]
pub struct ControlLoop {
    last_commanded: HashMap<String, f64>,
}

impl ControlLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_commanded(&self, point_id: &str) -> Option<f64> {
        self.last_commanded.get(point_id).copied()
    }

    /// Evaluates every set point against `snapshot`. A failing set point is
    /// skipped without affecting the others.
    pub fn evaluate_tick(&mut self, snapshot: &Snapshot, set_points: &[SetPoint]) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        for set_point in set_points {
            let value = match rules::evaluate(snapshot, set_point) {
                Ok(Decision::Drive(value)) => value,
                Ok(Decision::Hold) => continue,
                Err(err) => {
                    outcome.errors.push(err);
                    continue;
                }
            };

            for output in &set_point.outputs {
                if self.last_commanded.get(output) == Some(&value) {
                    continue;
                }
                self.last_commanded.insert(output.clone(), value);
                outcome.commands.push(BoardCommand::new(output, value));
            }
        }
        outcome
    }
}

pub struct LogicWorker {
    config: Arc<Configurator>,
    cache: Arc<BoardStateCache>,
    queue: Arc<CommandQueue>,
    status: SharedLogicStatus,
    control: ControlLoop,
    tick: Duration,
    next_tick: Option<Instant>,
}

impl LogicWorker {
    pub fn new(
        config: Arc<Configurator>,
        cache: Arc<BoardStateCache>,
        queue: Arc<CommandQueue>,
        status: SharedLogicStatus,
        tick: Duration,
    ) -> Self {
        Self {
            config,
            cache,
            queue,
            status,
            control: ControlLoop::new(),
            tick,
            next_tick: None,
        }
    }

    fn tick_once(&mut self) {
        let snapshot = self.cache.read_all();
        let set_points = self.config.set_points();
        let outcome = self.control.evaluate_tick(&snapshot, &set_points);

        for err in &outcome.errors {
            warn!(error = %err, "rule evaluation failed");
        }
        for command in &outcome.commands {
            debug!(point_id = %command.point_id, value = command.value, "queueing command");
            self.queue.push(command.clone());
        }

        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.iterations += 1;
        status.commands_issued += outcome.commands.len() as u64;
        status.rule_errors += outcome.errors.len() as u64;
        status.last_tick_ms = Some(now_millis());
        if let Some(err) = outcome.errors.last() {
            status.last_error = Some(err.to_string());
        }
    }
}

impl Worker for LogicWorker {
    fn run_iteration(&mut self, ctx: &WorkerContext) -> Result<Step, WorkerError> {
        self.tick_once();

        let now = Instant::now();
        let next = match self.next_tick {
            Some(previous) if previous + self.tick > now => previous + self.tick,
            _ => now + self.tick,
        };
        self.next_tick = Some(next);
        ctx.sleep(next.saturating_duration_since(now));
        Ok(Step::Continue)
    }
}
