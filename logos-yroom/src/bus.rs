//! Message bus between client connections and the room worker.
//!
//! The bus moves opaque frames between named channels. Every channel is a
//! FIFO queue with a single consumer; groups are named sets of channels used
//! for fan-out (one group per room, one per connection).
//!
//! [`LocalBus`] is the in-process implementation: unbounded tokio mpsc queues
//! per channel, group membership behind an async `RwLock`. Stats are tracked
//! with atomics so sends never take a lock for bookkeeping.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Channel {0} is closed")]
    Closed(String),
}

/// Transport used by the worker, the gateway and RPC callers.
pub trait MessageBus: Send + Sync + 'static {
    /// Wait for the next frame on `channel`.
    fn receive(&self, channel: &str) -> impl Future<Output = Result<Vec<u8>, BusError>> + Send;

    /// Deliver a frame to a single channel.
    fn send(&self, channel: &str, frame: Vec<u8>) -> impl Future<Output = Result<(), BusError>> + Send;

    fn group_add(&self, group: &str, channel: &str) -> impl Future<Output = ()> + Send;

    fn group_discard(&self, group: &str, channel: &str) -> impl Future<Output = ()> + Send;

    /// Deliver a frame to every channel in `group`. Returns the number of receivers.
    fn group_send(&self, group: &str, frame: Vec<u8>) -> impl Future<Output = usize> + Send;

    /// Allocate a fresh, unique channel name. Once closed it stays closed.
    fn new_channel(&self, prefix: &str) -> impl Future<Output = String> + Send;

    /// Drop a channel and any frames still queued on it.
    fn close_channel(&self, channel: &str) -> impl Future<Output = ()> + Send;
}

/// Bus statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub frames_sent: u64,
    pub group_sends: u64,
    pub channels: usize,
    pub groups: usize,
}

struct AtomicBusStats {
    frames_sent: AtomicU64,
    group_sends: AtomicU64,
}

struct Queue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// Separates the prefix of a [`MessageBus::new_channel`] name from its unique part.
const PRIVATE_MARKER: char = '!';

/// In-process bus.
///
/// Well-known channels are created lazily on first send or receive, so a
/// producer may address a channel before its consumer starts listening.
/// Channels from `new_channel` exist only between creation and close; frames
/// for them afterwards fail with [`BusError::Closed`].
pub struct LocalBus {
    channels: RwLock<HashMap<String, Queue>>,
    groups: RwLock<HashMap<String, HashSet<String>>>,
    stats: AtomicBusStats,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            stats: AtomicBusStats {
                frames_sent: AtomicU64::new(0),
                group_sends: AtomicU64::new(0),
            },
        }
    }

    async fn sender(&self, channel: &str) -> Result<mpsc::UnboundedSender<Vec<u8>>, BusError> {
        {
            let channels = self.channels.read().await;
            if let Some(queue) = channels.get(channel) {
                return Ok(queue.tx.clone());
            }
        }
        let mut channels = self.channels.write().await;
        Ok(Self::queue(&mut channels, channel)?.tx.clone())
    }

    async fn receiver(
        &self,
        channel: &str,
    ) -> Result<Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>, BusError> {
        let mut channels = self.channels.write().await;
        Ok(Self::queue(&mut channels, channel)?.rx.clone())
    }

    /// Existing queue for `channel`, or a new one if the name is well-known.
    fn queue<'a>(
        channels: &'a mut HashMap<String, Queue>,
        channel: &str,
    ) -> Result<&'a Queue, BusError> {
        if !channels.contains_key(channel) && channel.contains(PRIVATE_MARKER) {
            return Err(BusError::Closed(channel.to_string()));
        }
        Ok(channels
            .entry(channel.to_string())
            .or_insert_with(Queue::new))
    }

    /// Members of `group`.
    pub async fn group_members(&self, group: &str) -> Vec<String> {
        self.groups
            .read()
            .await
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> BusStats {
        BusStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            group_sends: self.stats.group_sends.load(Ordering::Relaxed),
            channels: self.channels.read().await.len(),
            groups: self.groups.read().await.len(),
        }
    }
}

impl MessageBus for LocalBus {
    async fn receive(&self, channel: &str) -> Result<Vec<u8>, BusError> {
        let rx = self.receiver(channel).await?;
        let mut rx = rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| BusError::Closed(channel.to_string()))
    }

    async fn send(&self, channel: &str, frame: Vec<u8>) -> Result<(), BusError> {
        self.sender(channel)
            .await?
            .send(frame)
            .map_err(|_| BusError::Closed(channel.to_string()))?;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn group_add(&self, group: &str, channel: &str) {
        let mut groups = self.groups.write().await;
        groups
            .entry(group.to_string())
            .or_default()
            .insert(channel.to_string());
    }

    async fn group_discard(&self, group: &str, channel: &str) {
        let mut groups = self.groups.write().await;
        if let Some(members) = groups.get_mut(group) {
            members.remove(channel);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    async fn group_send(&self, group: &str, frame: Vec<u8>) -> usize {
        let members = self.group_members(group).await;
        self.stats.group_sends.fetch_add(1, Ordering::Relaxed);

        let channels = self.channels.read().await;
        let mut delivered = 0;
        for member in &members {
            // Members without a live queue have already closed
            if let Some(queue) = channels.get(member) {
                if queue.tx.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        self.stats
            .frames_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    async fn new_channel(&self, prefix: &str) -> String {
        let name = format!("{prefix}{PRIVATE_MARKER}{}", Uuid::new_v4().simple());
        self.channels
            .write()
            .await
            .insert(name.clone(), Queue::new());
        name
    }

    async fn close_channel(&self, channel: &str) {
        self.channels.write().await.remove(channel);
        let mut groups = self.groups.write().await;
        groups.retain(|_, members| {
            members.remove(channel);
            !members.is_empty()
        });
    }
}
