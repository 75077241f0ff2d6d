//! Pending-task bookkeeping for the main process.
//!
//! A task id is present here exactly until its outcome has been delivered to
//! the submitting client, whether that outcome came over the wire or was
//! synthesized by the supervisor. Everything in the map is replayable: the
//! original payload is kept so a restarted worker can be handed the same
//! work again.
use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::protocol::{TaskId, TaskOutcome, TaskPayload};

struct PendingTask {
    payload: TaskPayload,
    reply: oneshot::Sender<TaskOutcome>,
}

/// Map of in-flight submissions to their payloads and reply slots.
#[derive(Default)]
pub struct TaskRegistry {
    pending: BTreeMap<TaskId, PendingTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submission. Ids are allocated from a monotonic counter and
    /// never reused, so a collision is a caller bug.
    pub fn insert(&mut self, id: TaskId, payload: TaskPayload, reply: oneshot::Sender<TaskOutcome>) {
        let previous = self.pending.insert(id, PendingTask { payload, reply });
        debug_assert!(previous.is_none(), "task id {} reused", id);
    }

    /// Deliver an outcome to the submitter and drop the entry. Returns
    /// `false` for an unknown id, which means the reply is stale: the task
    /// was already resolved, typically by a synthesized timeout.
    pub fn complete(&mut self, id: TaskId, outcome: TaskOutcome) -> bool {
        match self.pending.remove(&id) {
            Some(entry) => {
                // The submitter may have dropped its handle; that is fine.
                let _ = entry.reply.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Snapshot of every pending request in ascending id order, for replay
    /// after a worker restart.
    pub fn pending_requests(&self) -> Vec<(TaskId, TaskPayload)> {
        self.pending
            .iter()
            .map(|(id, entry)| (*id, entry.payload.clone()))
            .collect()
    }

    /// Drop every entry without delivering outcomes. Only used on full
    /// application shutdown; awaiting handles observe the closed channel.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
