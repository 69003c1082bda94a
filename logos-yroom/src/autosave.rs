//! Debounced autosave.
//!
//! Every edit to a room calls [`Autosave::nudge`], which pushes the room's
//! due time to `now + autosave_delay`. One waiter task per room sleeps until
//! the due time, re-reading it on every wake, and fires the snapshot trigger
//! once the room has been quiet for the whole delay. A steady stream of
//! edits therefore produces one save after the stream stops, not one save
//! per edit.
//!
//! ```text
//! nudge ──► due = now + delay ──► waiter running? ──yes──► waiter picks up new due
//!                                        │
//!                                        no ──► spawn waiter
//! waiter: sleep_until(due) ─► due moved? ─yes─► sleep again
//!                                 │
//!                                 no ──► trigger(room), exit
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::{ConfigError, Settings};

/// Receives "this room is due for a snapshot".
///
/// Called from the waiter task, so implementations should only hand the
/// request off (e.g. onto the dispatch queue) and return.
pub trait SnapshotTrigger: Send + Sync + 'static {
    fn trigger(&self, room: &str);
}

impl<F> SnapshotTrigger for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn trigger(&self, room: &str) {
        self(room)
    }
}

struct Waiter {
    due: watch::Sender<Instant>,
    task: JoinHandle<()>,
}

impl Waiter {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// How waiters ended when [`Autosave::cancel_all`] stopped them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelReport {
    /// Waiters that were still sleeping
    pub cancelled: usize,
    /// Waiters that had already fired
    pub completed: usize,
    /// Waiters that panicked
    pub failed: usize,
}

/// Per-room debounced snapshot scheduler.
pub struct Autosave {
    settings: Arc<Settings>,
    trigger: Arc<dyn SnapshotTrigger>,
    waiters: HashMap<String, Waiter>,
}

impl Autosave {
    pub fn new(settings: Arc<Settings>, trigger: impl SnapshotTrigger) -> Self {
        Self {
            settings,
            trigger: Arc::new(trigger),
            waiters: HashMap::new(),
        }
    }

    /// Record activity in `room`.
    ///
    /// No-op when autosave is disabled for the room. A non-positive delay is
    /// a configuration error and is returned to the caller.
    pub fn nudge(&mut self, room: &str) -> Result<(), ConfigError> {
        let Some(delay) = self.settings.room(room).autosave_delay_for(room)? else {
            return Ok(());
        };
        let due = Instant::now() + delay;

        if let Some(waiter) = self.waiters.get(room) {
            // A waiter that already fired has dropped its receiver
            if waiter.is_running() && waiter.due.send(due).is_ok() {
                return Ok(());
            }
        }

        log::trace!("Arming autosave for {room} in {delay:?}");
        let waiter = self.spawn_waiter(room.to_string(), due);
        self.waiters.insert(room.to_string(), waiter);
        Ok(())
    }

    fn spawn_waiter(&self, room: String, due: Instant) -> Waiter {
        let (due_tx, mut due_rx) = watch::channel(due);
        let trigger = self.trigger.clone();
        let task = tokio::spawn(async move {
            loop {
                let due = *due_rx.borrow_and_update();
                if Instant::now() >= due {
                    break;
                }
                sleep_until(due).await;
            }
            drop(due_rx);
            log::debug!("Autosave due for {room}");
            trigger.trigger(&room);
        });
        Waiter { due: due_tx, task }
    }

    /// Drop any pending autosave for `room` without triggering it.
    pub fn forget(&mut self, room: &str) {
        if let Some(waiter) = self.waiters.remove(room) {
            waiter.task.abort();
        }
    }

    /// Whether a waiter for `room` is still pending.
    pub fn is_armed(&self, room: &str) -> bool {
        self.waiters.get(room).is_some_and(Waiter::is_running)
    }

    /// Number of tracked waiters, including ones that already fired.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Drop bookkeeping for waiters that have already fired.
    pub fn reap(&mut self) -> usize {
        let before = self.waiters.len();
        self.waiters.retain(|_, waiter| waiter.is_running());
        before - self.waiters.len()
    }

    /// Stop every waiter and wait for each to terminate.
    pub async fn cancel_all(&mut self) -> CancelReport {
        let mut report = CancelReport::default();
        for (room, waiter) in self.waiters.drain() {
            waiter.task.abort();
            match waiter.task.await {
                Ok(()) => report.completed += 1,
                Err(e) if e.is_cancelled() => report.cancelled += 1,
                Err(e) => {
                    log::error!("Autosave waiter for {room} failed: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

impl Drop for Autosave {
    fn drop(&mut self) {
        for waiter in self.waiters.values() {
            waiter.task.abort();
        }
    }
}
