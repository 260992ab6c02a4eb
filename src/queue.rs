use std::sync::{Mutex, MutexGuard, PoisonError};

use heapless::Vec as BoundedVec;
use tracing::warn;

use crate::payload::BoardCommand;

pub const COMMAND_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Queued,
    /// A pending command for the same point was replaced.
    Superseded(BoardCommand),
    /// The queue was full and its oldest command was discarded.
    DroppedOldest(BoardCommand),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub superseded: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BoundedVec<BoardCommand, COMMAND_QUEUE_CAPACITY>,
    superseded: u64,
    dropped: u64,
}

/// Commands waiting for the serial link. Many producers, one consumer.
///
/// At most one command per point is pending: the newest one wins.
#[derive(Debug, Default)]
pub struct CommandQueue {
    state: Mutex<QueueState>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, command: BoardCommand) -> PushOutcome {
        let mut state = self.lock();

        let outcome = if let Some(index) = state
            .pending
            .iter()
            .position(|c| c.point_id == command.point_id)
        {
            state.superseded += 1;
            PushOutcome::Superseded(state.pending.remove(index))
        } else if state.pending.is_full() {
            state.dropped += 1;
            let oldest = state.pending.remove(0);
            warn!(point_id = %oldest.point_id, "command queue full, dropping oldest command");
            PushOutcome::DroppedOldest(oldest)
        } else {
            PushOutcome::Queued
        };

        // Room was made above.
        let _ = state.pending.push(command);
        outcome
    }

    pub fn pop(&self) -> Option<BoardCommand> {
        let mut state = self.lock();
        if state.pending.is_empty() {
            None
        } else {
            Some(state.pending.remove(0))
        }
    }

    /// Puts back a command the link failed to deliver, unless a newer command
    /// for the same point arrived meanwhile or the queue is full.
    pub fn requeue_front(&self, command: BoardCommand) -> bool {
        let mut state = self.lock();
        if state
            .pending
            .iter()
            .any(|c| c.point_id == command.point_id)
        {
            return false;
        }
        state.pending.insert(0, command).is_ok()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            pending: state.pending.len(),
            superseded: state.superseded,
            dropped: state.dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_command_replaces_pending() {
        let queue = CommandQueue::new();
        queue.push(BoardCommand::new("heater", 1.0));
        queue.push(BoardCommand::new("fan", 1.0));
        let outcome = queue.push(BoardCommand::new("heater", 0.0));

        assert_eq!(outcome, PushOutcome::Superseded(BoardCommand::new("heater", 1.0)));
        assert_eq!(queue.pop(), Some(BoardCommand::new("fan", 1.0)));
        assert_eq!(queue.pop(), Some(BoardCommand::new("heater", 0.0)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = CommandQueue::new();
        for i in 0..COMMAND_QUEUE_CAPACITY {
            assert_eq!(queue.push(BoardCommand::new(format!("p{i}"), 1.0)), PushOutcome::Queued);
        }
        let outcome = queue.push(BoardCommand::new("late", 1.0));
        assert_eq!(outcome, PushOutcome::DroppedOldest(BoardCommand::new("p0", 1.0)));
        assert_eq!(queue.len(), COMMAND_QUEUE_CAPACITY);
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_requeue_yields_to_newer_command() {
        let queue = CommandQueue::new();
        queue.push(BoardCommand::new("heater", 0.0));
        assert!(!queue.requeue_front(BoardCommand::new("heater", 1.0)));
        assert!(queue.requeue_front(BoardCommand::new("fan", 1.0)));
        assert_eq!(queue.pop().unwrap().point_id, "fan");
    }
}
