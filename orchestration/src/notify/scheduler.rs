//! Durable escalation schedule.
//!
//! A min-heap of [`ScheduledTask`] ordered by due time, then insertion
//! sequence. Tasks carry only what is needed to find the notification again;
//! whether a task still has work to do is decided at fire time against the
//! persisted record.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{DeliveryMethod, NotificationPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TaskAction {
    /// Redeliver if still unopened and unexpired
    Escalate {
        rule_index: usize,
        method: DeliveryMethod,
        priority: NotificationPriority,
    },
    /// Retry a failed initial delivery on the fallback channel
    Fallback { method: DeliveryMethod },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub due_at: DateTime<Utc>,
    pub seq: u64,
    pub notification_id: String,
    pub action: TaskAction,
}

// BinaryHeap is a max-heap; invert so the earliest task is on top.
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct EscalationScheduler {
    heap: BinaryHeap<ScheduledTask>,
    next_seq: u64,
}

impl EscalationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted tasks.
    pub fn from_tasks(tasks: Vec<ScheduledTask>) -> Self {
        let next_seq = tasks.iter().map(|t| t.seq + 1).max().unwrap_or(0);
        Self {
            heap: tasks.into_iter().collect(),
            next_seq,
        }
    }

    pub fn schedule(
        &mut self,
        due_at: DateTime<Utc>,
        notification_id: impl Into<String>,
        action: TaskAction,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledTask {
            due_at,
            seq,
            notification_id: notification_id.into(),
            action,
        });
        seq
    }

    /// Remove and return every task due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<ScheduledTask> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|t| t.due_at <= now) {
            if let Some(task) = self.heap.pop() {
                due.push(task);
            }
        }
        due
    }

    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|t| t.due_at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pending tasks in firing order.
    pub fn tasks(&self) -> Vec<ScheduledTask> {
        let mut tasks = self.heap.clone().into_vec();
        tasks.sort_by(|a, b| b.cmp(a));
        tasks
    }
}
