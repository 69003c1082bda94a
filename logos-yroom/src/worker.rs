//! Worker run-loop.
//!
//! ```text
//!              ┌──────────┐  frames   ┌─────────┐  events   ┌──────────┐
//!  bus chan ──►│  intake  │ ────────► │  queue  │ ────────► │ dispatch │──► RoomCoordinator
//!              │  (task)  │           │ (FIFO)  │ ◄──────── │  (loop)  │
//!              └──────────┘           └─────────┘   timers  └──────────┘
//! ```
//!
//! The intake task only decodes frames and enqueues them. The dispatch loop
//! hands one event at a time to the coordinator and waits for it to finish
//! before taking the next.
//!
//! Shutdown is two-phase. A termination signal, a fatal intake error or a
//! dispatch error stops the loop; the coordinator is then asked to save every
//! room and acknowledges on a oneshot. If the flush itself fails the worker
//! gives up and cancels everything that is left.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::bus::{BusError, MessageBus};
use crate::config::Settings;
use crate::coordinator::{Event, RoomCoordinator};
use crate::engine::DocumentEngine;
use crate::protocol::{ChannelMessage, ProtocolError};
use crate::storage::StoreRegistry;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("Worker received bad frame: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Dispatch queue closed")]
    QueueClosed,
    #[error("Intake task failed: {0}")]
    IntakeFailed(String),
}

/// Why the worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// Termination signal, by name
    Signal(String),
    /// Error that ended the run loop
    Fatal(String),
}

/// How the shutdown went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every loaded room was saved
    Flushed { rooms: usize },
    /// The flush failed; remaining work was cancelled
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub cause: ShutdownCause,
    pub outcome: ShutdownOutcome,
    /// Events handled before shutdown began
    pub dispatched: u64,
}

pub struct Worker<E, B> {
    bus: Arc<B>,
    channel: String,
    coordinator: RoomCoordinator<E, B>,
    queue_tx: mpsc::UnboundedSender<Event>,
    queue_rx: mpsc::UnboundedReceiver<Event>,
}

impl<E: DocumentEngine, B: MessageBus> Worker<E, B> {
    pub fn new(
        bus: Arc<B>,
        channel: impl Into<String>,
        engine: E,
        settings: Arc<Settings>,
        stores: Arc<StoreRegistry>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let coordinator =
            RoomCoordinator::new(engine, bus.clone(), settings, stores, queue_tx.clone());
        Self {
            bus,
            channel: channel.into(),
            coordinator,
            queue_tx,
            queue_rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Run until `shutdown` resolves or a fatal error occurs, then flush.
    ///
    /// `shutdown` resolves to the name of the signal that requested the stop.
    pub async fn run<S>(self, shutdown: S) -> ShutdownReport
    where
        S: Future<Output = String> + Send,
    {
        let Worker {
            bus,
            channel,
            mut coordinator,
            queue_tx,
            mut queue_rx,
        } = self;

        log::info!("Worker listening on {channel}");
        let mut intake = tokio::spawn(intake(bus, channel, queue_tx));
        let mut shutdown = Box::pin(shutdown);

        let mut dispatched = 0u64;
        let cause = loop {
            tokio::select! {
                biased;

                signal = &mut shutdown => {
                    log::info!("Received signal {signal}...");
                    break ShutdownCause::Signal(signal);
                }

                Some(event) = queue_rx.recv() => {
                    dispatched += 1;
                    if let Err(e) = coordinator.handle(event).await {
                        log::error!("Caught exception: {e}");
                        log::info!("Shutting down...");
                        break ShutdownCause::Fatal(e.to_string());
                    }
                }

                result = &mut intake => {
                    let e = result.unwrap_or_else(|e| WorkerError::IntakeFailed(e.to_string()));
                    log::error!("Caught exception: {e}");
                    log::info!("Shutting down...");
                    break ShutdownCause::Fatal(e.to_string());
                }
            }
        };

        // Stop listening for signals and stop relaying frames; anything
        // still queued is dropped
        drop(shutdown);
        intake.abort();

        log::info!("Sending shutdown to coordinator...");
        let (ack_tx, ack_rx) = oneshot::channel();
        let flush = tokio::spawn(async move {
            match coordinator.shutdown().await {
                Ok(rooms) => {
                    let _ = ack_tx.send(rooms);
                }
                Err(e) => log::error!("Caught exception while shutting down: {e}"),
            }
        });

        log::info!("Waiting on cleanup...");
        let outcome = match ack_rx.await {
            Ok(rooms) => ShutdownOutcome::Flushed { rooms },
            Err(_) => {
                log::info!("Cancelling all tasks and stopping...");
                flush.abort();
                ShutdownOutcome::Forced
            }
        };

        if let Err(e) = flush.await {
            if !e.is_cancelled() {
                log::error!("Shutdown task failed: {e}");
            }
        }
        log::info!("Shutdown worker complete");

        ShutdownReport {
            cause,
            outcome,
            dispatched,
        }
    }
}

/// Decode frames from `channel` onto the queue until something goes wrong.
async fn intake<B: MessageBus>(
    bus: Arc<B>,
    channel: String,
    queue: mpsc::UnboundedSender<Event>,
) -> WorkerError {
    loop {
        let frame = match bus.receive(&channel).await {
            Ok(frame) => frame,
            Err(e) => return e.into(),
        };
        let message = match ChannelMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => return e.into(),
        };
        log::trace!("Queued {:?} for {}", message.kind(), message.room());
        if queue.send(Event::Channel(message)).is_err() {
            return WorkerError::QueueClosed;
        }
    }
}
