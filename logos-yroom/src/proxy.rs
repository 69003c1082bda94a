//! Read-only handle on a room's document from outside the worker.
//!
//! Each call allocates a private reply channel, sends an [`RpcRequest`]
//! to the worker channel configured for the room, and waits for the
//! [`RpcReply`]. Rooms that are not loaded are restored by the worker for the
//! duration of the call.
//!
//! [`RpcRequest`]: crate::protocol::RpcRequest

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::bus::{BusError, MessageBus};
use crate::config::Settings;
use crate::protocol::{AdminOp, ChannelMessage, ProtocolError, RpcReply};

/// How long to wait for the worker by default.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Room not loaded and not restorable, or the shared type does not exist
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),
    #[error("Worker does not support {0}")]
    Unsupported(String),
    #[error("Worker did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Exported {name} is not valid JSON: {source}")]
    InvalidJson {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

pub struct DocumentProxy<B> {
    bus: Arc<B>,
    room: String,
    worker_channel: String,
    timeout: Duration,
}

impl<B: MessageBus> DocumentProxy<B> {
    /// Proxy for `room`, talking to the worker channel its settings name.
    pub fn new(bus: Arc<B>, settings: &Settings, room: impl Into<String>) -> Self {
        let room = room.into();
        let worker_channel = settings.room(&room).channel_name.clone();
        Self {
            bus,
            room,
            worker_channel,
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub async fn export_text(&self, name: &str) -> Result<String, ProxyError> {
        self.export(AdminOp::ExportText(name.to_string())).await
    }

    pub async fn export_xml_fragment(&self, name: &str) -> Result<String, ProxyError> {
        self.export(AdminOp::ExportXmlFragment(name.to_string())).await
    }

    pub async fn export_map(&self, name: &str) -> Result<serde_json::Value, ProxyError> {
        self.export_json(AdminOp::ExportMap(name.to_string())).await
    }

    pub async fn export_array(&self, name: &str) -> Result<serde_json::Value, ProxyError> {
        self.export_json(AdminOp::ExportArray(name.to_string())).await
    }

    async fn export_json(&self, op: AdminOp) -> Result<serde_json::Value, ProxyError> {
        let name = op.name().to_string();
        let data = self.export(op).await?;
        serde_json::from_str(&data).map_err(|source| ProxyError::InvalidJson { name, source })
    }

    async fn export(&self, op: AdminOp) -> Result<String, ProxyError> {
        match self.call(&op).await? {
            RpcReply::Ok(data) => Ok(data),
            RpcReply::Unavailable => Err(ProxyError::DataUnavailable(op.name().to_string())),
            RpcReply::Unsupported(method) => Err(ProxyError::Unsupported(method)),
        }
    }

    /// Send one call and wait for its reply.
    pub async fn call(&self, op: &AdminOp) -> Result<RpcReply, ProxyError> {
        let reply_channel = self.bus.new_channel("yroom-rpc").await;
        let request = ChannelMessage::rpc(&self.room, &reply_channel, op).encode()?;
        log::debug!("Calling {} on {} via {}", op.method(), self.room, self.worker_channel);

        let result = match self.bus.send(&self.worker_channel, request).await {
            Ok(()) => tokio::time::timeout(self.timeout, self.bus.receive(&reply_channel))
                .await
                .map_err(|_| ProxyError::Timeout(self.timeout)),
            Err(e) => Err(e.into()),
        };
        self.bus.close_channel(&reply_channel).await;

        Ok(RpcReply::decode(&result??)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::config::RoomSettings;
    use crate::protocol::RpcRequest;

    /// Answers the next call on `channel` with `reply`.
    fn answer_once(bus: Arc<LocalBus>, channel: &'static str, reply: RpcReply) -> tokio::task::JoinHandle<RpcRequest> {
        tokio::spawn(async move {
            let frame = bus.receive(channel).await.unwrap();
            let ChannelMessage::Rpc(request) = ChannelMessage::decode(&frame).unwrap() else {
                panic!("expected rpc frame");
            };
            bus.send(&request.reply_channel, reply.encode().unwrap())
                .await
                .unwrap();
            request
        })
    }

    #[tokio::test]
    async fn test_export_text() {
        let bus = Arc::new(LocalBus::new());
        let responder = answer_once(bus.clone(), "yroom", RpcReply::Ok("hello".into()));

        let proxy = DocumentProxy::new(bus.clone(), &Settings::new(), "notes.a");
        assert_eq!(proxy.export_text("content").await.unwrap(), "hello");

        let request = responder.await.unwrap();
        assert_eq!(request.room, "notes.a");
        assert_eq!(request.method, "get_text");
        assert_eq!(request.params, vec!["content".to_string()]);
        // Reply channel is released after the call
        assert_eq!(bus.stats().await.channels, 1);
    }

    #[tokio::test]
    async fn test_uses_channel_from_room_settings() {
        let bus = Arc::new(LocalBus::new());
        let settings = Settings::new().with_namespace(
            "notes",
            RoomSettings {
                channel_name: "notes-worker".into(),
                ..RoomSettings::default()
            },
        );
        let responder = answer_once(bus.clone(), "notes-worker", RpcReply::Ok("{\"a\":1}".into()));

        let proxy = DocumentProxy::new(bus, &settings, "notes.a");
        let map = proxy.export_map("settings").await.unwrap();
        assert_eq!(map["a"], 1);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_and_unsupported() {
        let bus = Arc::new(LocalBus::new());
        let proxy = DocumentProxy::new(bus.clone(), &Settings::new(), "r");

        answer_once(bus.clone(), "yroom", RpcReply::Unavailable);
        assert!(matches!(
            proxy.export_array("items").await,
            Err(ProxyError::DataUnavailable(name)) if name == "items"
        ));

        answer_once(bus.clone(), "yroom", RpcReply::Unsupported("get_xml_fragment".into()));
        assert!(matches!(
            proxy.export_xml_fragment("body").await,
            Err(ProxyError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let bus = Arc::new(LocalBus::new());
        answer_once(bus.clone(), "yroom", RpcReply::Ok("not json".into()));
        let proxy = DocumentProxy::new(bus, &Settings::new(), "r");
        assert!(matches!(
            proxy.export_map("m").await,
            Err(ProxyError::InvalidJson { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_worker() {
        let bus = Arc::new(LocalBus::new());
        let proxy = DocumentProxy::new(bus.clone(), &Settings::new(), "r")
            .with_timeout(Duration::from_secs(2));
        assert!(matches!(
            proxy.export_text("content").await,
            Err(ProxyError::Timeout(_))
        ));
        // Only the unanswered worker channel is left
        assert_eq!(bus.stats().await.channels, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_after_timeout_is_dropped() {
        let bus = Arc::new(LocalBus::new());
        let proxy = DocumentProxy::new(bus.clone(), &Settings::new(), "r")
            .with_timeout(Duration::from_secs(1));
        assert!(matches!(
            proxy.export_text("content").await,
            Err(ProxyError::Timeout(_))
        ));

        // The worker finally answers the abandoned call
        let frame = bus.receive("yroom").await.unwrap();
        let ChannelMessage::Rpc(request) = ChannelMessage::decode(&frame).unwrap() else {
            panic!("expected rpc frame");
        };
        let late = bus
            .send(&request.reply_channel, RpcReply::Unavailable.encode().unwrap())
            .await;
        assert!(matches!(late, Err(BusError::Closed(_))));
        assert_eq!(bus.stats().await.channels, 1);
    }
}
