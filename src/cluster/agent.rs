//! The coordinator's serializing agent.
//!
//! One task consumes the mailbox strictly in arrival order and is the only
//! writer of the broker registry and the routing table. The sole suspension
//! points are the metadata RPCs themselves; while one is in flight further
//! messages queue up, which is what makes the registry single-writer without
//! locks.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metadata::{ErrorCode, MetadataResponse};
use crate::node::{Node, NodeError, NodeEvent, NodeEventSink, NodeFactory};
use crate::router::{ConsumeAck, ConsumeRouter, ProduceRouter};

use super::registry::{BrokerMeta, BrokerRegistry, HostPort};
use super::routing::RoutingTable;
use super::statistics::Statistics;
use super::Cancelled;

pub(crate) type TableWaiter = oneshot::Sender<Result<Arc<RoutingTable>, Cancelled>>;
pub(crate) type PartitionsWaiter = oneshot::Sender<Result<Vec<i32>, Cancelled>>;

pub(crate) type RoutingTableSubscriber = Box<dyn Fn(&Arc<RoutingTable>) + Send + Sync>;
pub(crate) type InternalErrorSubscriber = Box<dyn Fn(&NodeError) + Send + Sync>;

/// One mailbox message.
pub(crate) enum Message {
    /// Refresh the full cluster view, optionally resolving a waiter with the
    /// resulting routing table.
    FullMetadata { waiter: Option<TableWaiter> },

    /// Resolve the partition ids of one topic.
    TopicMetadata {
        topic: String,
        waiter: PartitionsWaiter,
    },

    /// A signal from the node registered under `key`.
    NodeEvent { key: HostPort, event: NodeEvent },

    /// Close and drain the mailbox, then exit.
    Stop,
}

/// Everything the agent shares with the facade: routers, subscriber hooks
/// and the statistics taps.
pub(crate) struct Shared {
    pub(crate) produce_router: Option<Arc<dyn ProduceRouter>>,
    pub(crate) consume_router: Option<Arc<dyn ConsumeRouter>>,
    pub(crate) on_routing_table_change: Vec<RoutingTableSubscriber>,
    pub(crate) on_internal_error: Vec<InternalErrorSubscriber>,
    pub(crate) statistics: Arc<Statistics>,
}

pub(crate) struct Agent {
    registry: BrokerRegistry,
    seeds: Vec<HostPort>,
    factory: Arc<dyn NodeFactory>,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Message>,
    /// In-flight shutdowns of retired nodes; awaited when the cluster stops.
    shutdowns: Vec<JoinHandle<()>>,
}

impl Agent {
    pub(crate) fn new(
        seeds: Vec<HostPort>,
        factory: Arc<dyn NodeFactory>,
        shared: Arc<Shared>,
        tx: mpsc::Sender<Message>,
    ) -> Self {
        let mut agent = Self {
            registry: BrokerRegistry::default(),
            seeds,
            factory,
            shared,
            tx,
            shutdowns: Vec::new(),
        };
        agent.bootstrap_seeds();
        agent
    }

    /// Consumes the mailbox until [`Message::Stop`], then drains it.
    ///
    /// Returns itself so the caller can shut down the nodes it still owns.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Message>) -> Self {
        while let Some(message) = rx.recv().await {
            match message {
                Message::FullMetadata { waiter } => self.handle_full_metadata(waiter).await,
                Message::TopicMetadata { topic, waiter } => {
                    self.handle_topic_metadata(&topic, waiter).await
                }
                Message::NodeEvent { key, event } => self.handle_node_event(key, event),
                Message::Stop => break,
            }
        }

        // Refuse new messages, then fail every queued waiter.
        rx.close();
        while let Some(message) = rx.recv().await {
            match message {
                Message::FullMetadata {
                    waiter: Some(waiter),
                } => {
                    let _ = waiter.send(Err(Cancelled));
                }
                Message::TopicMetadata { waiter, .. } => {
                    let _ = waiter.send(Err(Cancelled));
                }
                _ => {}
            }
        }

        debug!("coordinator agent exited");
        self.shared.statistics.record_exited();
        self
    }

    async fn handle_full_metadata(&mut self, waiter: Option<TableWaiter>) {
        match self.fetch(None).await {
            Ok(response) => {
                self.reconcile(&response);
                let table = Arc::new(RoutingTable::build(&response, &self.registry));
                self.publish(&table);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(table));
                }
                self.check_no_more_nodes();
            }
            Err(error) => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(Cancelled));
                }
                self.report(error);
            }
        }
    }

    async fn handle_topic_metadata(&mut self, topic: &str, waiter: PartitionsWaiter) {
        match self.fetch(Some(topic)).await {
            Ok(response) => {
                // First matching entry; ids keep the response order.
                match response.topics.iter().find(|t| t.name == topic) {
                    Some(entry) => {
                        let ids = entry
                            .partitions
                            .iter()
                            .map(|partition| partition.partition_index)
                            .collect();
                        let _ = waiter.send(Ok(ids));
                    }
                    None => {
                        let _ = waiter.send(Err(Cancelled));
                        self.report(NodeError::Protocol(ErrorCode::UnknownTopicOrPartition));
                    }
                }
            }
            Err(error) => {
                let _ = waiter.send(Err(Cancelled));
                self.report(error);
            }
        }
    }

    /// Asks a randomly chosen broker for metadata.
    async fn fetch(&self, topic: Option<&str>) -> Result<MetadataResponse, NodeError> {
        let (key, node) = self
            .registry
            .random()
            .ok_or_else(|| NodeError::Unknown("no brokers registered".to_owned()))?;
        debug!(broker = %key, ?topic, "requesting metadata");
        node.fetch_metadata(topic).await
    }

    fn handle_node_event(&mut self, key: HostPort, event: NodeEvent) {
        let statistics = &self.shared.statistics;
        match event {
            NodeEvent::Dead => {
                warn!(broker = %key, "node died");
                if let Some(registered) = self.registry.remove(&key) {
                    self.shutdowns
                        .push(tokio::spawn(async move { registered.node.stop().await }));
                }
                statistics.record_node_dead();
                self.check_no_more_nodes();
                self.post_refresh();
            }
            NodeEvent::ConnectError(e) => {
                warn!(broker = %key, e = %e, "failed to connect, retrying");
                statistics.record_error();
            }
            NodeEvent::ReadError(e) => {
                error!(broker = %key, e = %e, "read failed");
                statistics.record_error();
            }
            NodeEvent::WriteError(e) => {
                error!(broker = %key, e = %e, "write failed");
                statistics.record_error();
            }
            NodeEvent::DecodeError(e) => {
                error!(broker = %key, e = %e, "cannot decode response");
                statistics.record_error();
            }
            NodeEvent::Connected => {
                let name = self
                    .registry
                    .get(&key)
                    .map(|registered| registered.node.name().to_owned())
                    .unwrap_or_else(|| key.to_string());
                info!(broker = %name, "connected");
            }
            NodeEvent::RequestSent => statistics.record_request_sent(),
            NodeEvent::ResponseReceived => statistics.record_response_received(),
            NodeEvent::ProduceAck(ack) => {
                if let Some(router) = &self.shared.produce_router {
                    router.acknowledge(ack);
                }
            }
            NodeEvent::FetchAck(ack) => {
                if let Some(router) = &self.shared.consume_router {
                    router.acknowledge(ConsumeAck::Fetch(ack));
                }
            }
            NodeEvent::OffsetAck(ack) => {
                if let Some(router) = &self.shared.consume_router {
                    router.acknowledge(ConsumeAck::Offsets(ack));
                }
            }
        }
    }

    /// Mutates the registry to match the advertised broker list; retired
    /// nodes are shut down off the agent so the mailbox keeps moving.
    fn reconcile(&mut self, response: &MetadataResponse) {
        let factory = Arc::clone(&self.factory);
        let tx = self.tx.clone();
        let retired = self.registry.reconcile(&response.brokers, |host, port| {
            let sink = NodeEventSink::new(HostPort::new(host, port), tx.clone());
            factory.create(host, port, sink)
        });
        for node in retired {
            self.shutdowns
                .push(tokio::spawn(async move { node.stop().await }));
        }
        debug!(brokers = self.registry.len(), "reconciled topology");
    }

    fn register_seed(&mut self, seed: &HostPort) {
        let sink = NodeEventSink::new(seed.clone(), self.tx.clone());
        let node = self.factory.create(&seed.host, seed.port, sink);
        self.registry.register(
            BrokerMeta {
                id: None,
                host: seed.host.clone(),
                port: seed.port,
            },
            node,
        );
    }

    fn bootstrap_seeds(&mut self) {
        for seed in self.seeds.clone() {
            if !self.registry.contains(&seed) {
                self.register_seed(&seed);
            }
        }
    }

    /// Last-resort recovery: with the registry empty nothing could answer
    /// the next metadata request, so fall back to the configured seeds.
    fn check_no_more_nodes(&mut self) {
        if self.registry.is_empty() {
            error!("no brokers left in the cluster view, falling back to seed brokers");
            self.bootstrap_seeds();
        }
    }

    /// Posts an unsolicited full refresh without blocking the agent.
    fn post_refresh(&self) {
        if let Err(e) = self.tx.try_send(Message::FullMetadata { waiter: None }) {
            // A full mailbox means a refresh is already queued behind us.
            debug!(e = %e, "not posting metadata refresh");
        }
    }

    fn publish(&self, table: &Arc<RoutingTable>) {
        debug!(topics = table.len(), "publishing new routing table");
        if let Some(router) = &self.shared.produce_router {
            router.change_routing_table(Arc::clone(table));
        }
        if let Some(router) = &self.shared.consume_router {
            router.change_routing_table(Arc::clone(table));
        }
        for subscriber in &self.shared.on_routing_table_change {
            subscriber(table);
        }
    }

    /// Failure policy for both metadata paths: the waiter has already been
    /// cancelled; any cause other than a cancellation fans out on the
    /// internal-error hook.
    fn report(&self, error: NodeError) {
        if matches!(error, NodeError::Cancelled) {
            debug!("metadata request cancelled");
            return;
        }
        error!(e = %error, "metadata request failed");
        for subscriber in &self.shared.on_internal_error {
            subscriber(&error);
        }
    }

    /// Hands back everything that still needs shutting down.
    pub(crate) fn into_shutdown(self) -> (Vec<Arc<dyn Node>>, Vec<JoinHandle<()>>) {
        (self.registry.nodes(), self.shutdowns)
    }
}
