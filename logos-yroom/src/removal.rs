//! One-shot idle-removal timers.
//!
//! When a room loses its last connection a timer is armed; when it fires the
//! coordinator re-checks the room and evicts it. Timer tasks never touch
//! room state themselves: they only report a [`RemovalDue`] through the
//! notify callback. Each arm gets a fresh generation so a fire from a timer
//! that was replaced or cancelled in the meantime is recognised as stale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A removal timer went off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalDue {
    pub room: String,
    pub generation: u64,
}

type Notify = Arc<dyn Fn(RemovalDue) + Send + Sync>;

struct Pending {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct RemovalTimers {
    pending: HashMap<String, Pending>,
    next_generation: u64,
    notify: Notify,
}

impl RemovalTimers {
    pub fn new(notify: impl Fn(RemovalDue) + Send + Sync + 'static) -> Self {
        Self {
            pending: HashMap::new(),
            next_generation: 1,
            notify: Arc::new(notify),
        }
    }

    /// Arm the timer for `room`, replacing any timer already armed.
    pub fn schedule(&mut self, room: &str, delay: Duration) -> u64 {
        self.cancel(room);

        let generation = self.next_generation;
        self.next_generation += 1;

        let notify = self.notify.clone();
        let due = RemovalDue {
            room: room.to_string(),
            generation,
        };
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            notify(due);
        });

        log::debug!("Room {room} is empty, removing in {delay:?}");
        self.pending
            .insert(room.to_string(), Pending { generation, task });
        generation
    }

    /// Disarm the timer for `room`. Returns whether one was armed.
    pub fn cancel(&mut self, room: &str) -> bool {
        match self.pending.remove(room) {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }

    /// Consume a fire. `false` if the timer was cancelled or replaced since.
    pub fn take(&mut self, due: &RemovalDue) -> bool {
        match self.pending.get(&due.room) {
            Some(pending) if pending.generation == due.generation => {
                self.pending.remove(&due.room);
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, room: &str) -> bool {
        self.pending.contains_key(room)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Disarm everything. Returns how many timers were armed.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            pending.task.abort();
        }
        count
    }
}

impl Drop for RemovalTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
