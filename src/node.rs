//! The per-broker connection contract.
//!
//! The coordinator owns one [`Node`] per live broker. Nodes are materialized
//! through a [`NodeFactory`] and report their lifecycle through the
//! [`NodeEventSink`] handed to the factory, which funnels every signal into
//! the coordinator mailbox so that all reactions run on its serializing
//! agent.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::cluster::agent::Message;
use crate::cluster::HostPort;
use crate::metadata::{ErrorCode, MetadataResponse};
use crate::router::{FetchAck, OffsetAck, ProduceAck};

/// Error surfaced by a node operation.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("request was cancelled")]
    Cancelled,

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("cannot decode response: {0}")]
    Decode(String),

    #[error("protocol error code {}", .0.code())]
    Protocol(ErrorCode),

    #[error("{0}")]
    Unknown(String),
}

/// An owned handle to one broker connection.
///
/// The connection, request pipelining and wire codec behind this trait are
/// not part of this crate; the coordinator only creates nodes, asks them for
/// metadata and stops them.
#[async_trait]
pub trait Node: std::fmt::Debug + Send + Sync {
    /// Stable name used for logging.
    fn name(&self) -> &str;

    /// Fetch cluster metadata from this broker.
    ///
    /// `topic` restricts the response to one topic; `None` requests all
    /// topics.
    async fn fetch_metadata(&self, topic: Option<&str>) -> Result<MetadataResponse, NodeError>;

    /// Tear down the connection. Idempotent.
    async fn stop(&self);
}

/// Creates [`Node`]s for the coordinator.
///
/// The factory must wire `events` into the node so that the signals of
/// [`NodeEvent`] are reported as they happen.
pub trait NodeFactory: Send + Sync {
    fn create(&self, host: &str, port: u16, events: NodeEventSink) -> Arc<dyn Node>;
}

/// A signal emitted by a node.
#[derive(Debug)]
pub enum NodeEvent {
    /// The node gave up on its connection for good.
    Dead,
    ConnectError(NodeError),
    ReadError(NodeError),
    WriteError(NodeError),
    DecodeError(NodeError),
    Connected,
    RequestSent,
    ResponseReceived,
    /// A produce acknowledgement to forward to the produce router.
    ProduceAck(ProduceAck),
    /// A fetch acknowledgement to forward to the consume router.
    FetchAck(FetchAck),
    /// An offsets acknowledgement to forward to the consume router.
    OffsetAck(OffsetAck),
}

/// Reports node events into the coordinator mailbox.
///
/// Cheap to clone; safe to use from any task. Events reported after the
/// coordinator stopped are dropped.
#[derive(Debug, Clone)]
pub struct NodeEventSink {
    key: HostPort,
    tx: mpsc::Sender<Message>,
}

impl NodeEventSink {
    pub(crate) fn new(key: HostPort, tx: mpsc::Sender<Message>) -> Self {
        Self { key, tx }
    }

    /// Report an event on behalf of the node this sink was created for.
    pub async fn emit(&self, event: NodeEvent) {
        let _ = self
            .tx
            .send(Message::NodeEvent {
                key: self.key.clone(),
                event,
            })
            .await;
    }
}
