use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::now_millis;

const MAX_ALERT_HISTORY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum Alert {
    #[error("worker '{worker}' exceeded its restart budget ({restarts} restarts within {window_ms} ms)")]
    WatchdogEscalation {
        worker: String,
        restarts: u32,
        window_ms: u64,
    },
    #[error("board link {link} still down after {attempts} reconnect attempts")]
    LinkRetriesExhausted { link: String, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: u32,
    pub alert: Alert,
    pub timestamp_ms: u64,
    pub fatal: bool,
    pub resolved: bool,
}

#[derive(Debug)]
struct AlertHistory {
    records: BoundedVec<AlertRecord, MAX_ALERT_HISTORY>,
    next_id: u32,
}

/// Process-wide alert history. A fatal alert makes the daemon unhealthy for
/// the rest of its life.
#[derive(Debug)]
pub struct AlertLog {
    history: Mutex<AlertHistory>,
    fatal: AtomicBool,
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertLog {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(AlertHistory {
                records: BoundedVec::new(),
                next_id: 1,
            }),
            fatal: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AlertHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn raise(&self, alert: Alert, fatal: bool) -> u32 {
        if fatal {
            error!(%alert, "fatal alert raised");
            self.fatal.store(true, Ordering::SeqCst);
        } else {
            error!(%alert, "alert raised");
        }

        let mut history = self.lock();
        let id = history.next_id;
        history.next_id = history.next_id.wrapping_add(1);

        if history.records.is_full() {
            history.records.remove(0);
        }
        let _ = history.records.push(AlertRecord {
            id,
            alert,
            timestamp_ms: now_millis(),
            fatal,
            resolved: false,
        });
        id
    }

    pub fn resolve(&self, id: u32) -> bool {
        let mut history = self.lock();
        match history.records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.resolved = true;
                true
            }
            None => false,
        }
    }

    pub fn records(&self) -> Vec<AlertRecord> {
        self.lock().records.iter().cloned().collect()
    }

    pub fn active(&self) -> Vec<AlertRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| !r.resolved)
            .cloned()
            .collect()
    }

    pub fn escalations(&self) -> Vec<AlertRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| matches!(r.alert, Alert::WatchdogEscalation { .. }))
            .cloned()
            .collect()
    }

    pub fn has_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        !self.has_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn escalation(worker: &str) -> Alert {
        Alert::WatchdogEscalation {
            worker: worker.into(),
            restarts: 3,
            window_ms: 60_000,
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let log = AlertLog::new();
        for _ in 0..MAX_ALERT_HISTORY + 5 {
            log.raise(escalation("logic"), false);
        }
        let records = log.records();
        assert_eq!(records.len(), MAX_ALERT_HISTORY);
        assert_eq!(records[0].id, 6);
        assert!(log.is_healthy());
    }

    #[test]
    fn test_fatal_alert_sticks() {
        let log = AlertLog::new();
        let id = log.raise(escalation("serial-io"), true);
        assert!(log.resolve(id));
        assert!(log.active().is_empty());
        assert!(!log.is_healthy());
    }
}
