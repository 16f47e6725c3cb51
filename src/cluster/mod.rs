//! The cluster coordinator.
//!
//! [`Cluster`] discovers the live topology of a Kafka-family broker cluster
//! from a set of bootstrap seeds and publishes a [`RoutingTable`] mapping
//! every topic to its partition leaders. All topology mutations run on one
//! serializing agent, so observers never see a torn view; when every broker
//! dies the coordinator falls back to its seeds.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::{parse_seeds, ClientConfig, ConfigError};
use crate::node::NodeFactory;
use crate::router::{ConsumeRouter, ProduceRouter};

pub(crate) mod agent;
mod registry;
mod routing;
mod statistics;

use agent::{Agent, InternalErrorSubscriber, Message, RoutingTableSubscriber, Shared};

pub use registry::{BrokerMeta, HostPort};
pub use routing::{Partition, RoutingTable};
pub use statistics::{Statistics, StatisticsSnapshot};

/// How often the coordinator refreshes cluster metadata on its own.
const REFRESH_PERIOD: Duration = Duration::from_secs(600);

/// Mailbox capacity; senders briefly back off once the agent falls this far
/// behind.
const MAILBOX_CAPACITY: usize = 128;

/// The metadata request backing a waiter did not complete.
///
/// The cause, when there is one beyond cancellation, is broadcast through
/// the internal-error hook instead of the waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("metadata request was cancelled")]
pub struct Cancelled;

enum State {
    Created {
        agent: Agent,
        rx: mpsc::Receiver<Message>,
    },
    Started {
        agent: JoinHandle<Agent>,
        refresher: JoinHandle<()>,
    },
    Stopped,
}

/// Builder for [`Cluster`].
pub struct ClusterBuilder {
    config: ClientConfig,
    factory: Arc<dyn NodeFactory>,
    produce_router: Option<Arc<dyn ProduceRouter>>,
    consume_router: Option<Arc<dyn ConsumeRouter>>,
    on_routing_table_change: Vec<RoutingTableSubscriber>,
    on_internal_error: Vec<InternalErrorSubscriber>,
}

impl ClusterBuilder {
    pub fn new(config: ClientConfig, factory: Arc<dyn NodeFactory>) -> Self {
        Self {
            config,
            factory,
            produce_router: None,
            consume_router: None,
            on_routing_table_change: Vec::new(),
            on_internal_error: Vec::new(),
        }
    }

    /// Router receiving produce acknowledgements and routing-table changes.
    pub fn produce_router(mut self, router: Arc<dyn ProduceRouter>) -> Self {
        self.produce_router = Some(router);
        self
    }

    /// Router receiving fetch/offsets acknowledgements and routing-table
    /// changes.
    pub fn consume_router(mut self, router: Arc<dyn ConsumeRouter>) -> Self {
        self.consume_router = Some(router);
        self
    }

    /// Subscribes to every routing-table publication. Called synchronously
    /// on the agent task.
    pub fn on_routing_table_change(
        mut self,
        subscriber: impl Fn(&Arc<RoutingTable>) + Send + Sync + 'static,
    ) -> Self {
        self.on_routing_table_change.push(Box::new(subscriber));
        self
    }

    /// Subscribes to internal errors the coordinator absorbs on behalf of
    /// its waiters.
    pub fn on_internal_error(
        mut self,
        subscriber: impl Fn(&crate::node::NodeError) + Send + Sync + 'static,
    ) -> Self {
        self.on_internal_error.push(Box::new(subscriber));
        self
    }

    /// Parses the seeds and materializes their nodes.
    ///
    /// Fails if the seed list yields no usable broker.
    pub fn build(self) -> Result<Cluster, ConfigError> {
        let seeds = parse_seeds(&self.config.seeds)?;

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let statistics = Arc::new(Statistics::default());
        let shared = Arc::new(Shared {
            produce_router: self.produce_router,
            consume_router: self.consume_router,
            on_routing_table_change: self.on_routing_table_change,
            on_internal_error: self.on_internal_error,
            statistics: Arc::clone(&statistics),
        });

        let agent = Agent::new(seeds, self.factory, Arc::clone(&shared), tx.clone());

        Ok(Cluster {
            tx,
            statistics,
            shared,
            config: self.config,
            state: Mutex::new(State::Created { agent, rx }),
        })
    }
}

impl std::fmt::Debug for ClusterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterBuilder").finish_non_exhaustive()
    }
}

/// The cluster coordinator.
///
/// Create with [`Cluster::builder`], then [`start`](Self::start) it. All
/// operations are posted into the agent mailbox and processed strictly in
/// arrival order.
pub struct Cluster {
    tx: mpsc::Sender<Message>,
    statistics: Arc<Statistics>,
    shared: Arc<Shared>,
    config: ClientConfig,
    state: Mutex<State>,
}

impl Cluster {
    pub fn builder(config: ClientConfig, factory: Arc<dyn NodeFactory>) -> ClusterBuilder {
        ClusterBuilder::new(config, factory)
    }

    /// Spawns the agent, posts the initial metadata fetch and arms the
    /// refresh timer. Idempotent.
    pub fn start(&self) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, State::Stopped) {
            State::Created { agent, rx } => {
                let agent = tokio::spawn(agent.run(rx));

                if self.tx.try_send(Message::FullMetadata { waiter: None }).is_err() {
                    warn!("could not post initial metadata fetch");
                }

                let tx = self.tx.clone();
                let refresher = tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(REFRESH_PERIOD).await;
                        debug!("posting periodic metadata refresh");
                        if tx.send(Message::FullMetadata { waiter: None }).await.is_err() {
                            break;
                        }
                    }
                });

                *state = State::Started { agent, refresher };
            }
            other => {
                debug!("start on a cluster that is not freshly created");
                *state = other;
            }
        }
    }

    /// Stops the coordinator: timer first, then the routers (consume before
    /// produce), then the mailbox is closed and drained, then every node is
    /// shut down. Idempotent.
    pub async fn stop(&self) {
        let taken = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, State::Stopped)
        };

        match taken {
            State::Started { agent, refresher } => {
                refresher.abort();
                self.stop_routers().await;

                let _ = self.tx.send(Message::Stop).await;
                match agent.await {
                    Ok(agent) => Self::stop_nodes(agent).await,
                    Err(e) => error!(e = %e, "coordinator agent panicked"),
                }
            }
            State::Created { agent, .. } => {
                // never started; there is still a set of seed nodes to tear
                // down
                self.stop_routers().await;
                Self::stop_nodes(agent).await;
            }
            State::Stopped => {}
        }
    }

    async fn stop_routers(&self) {
        if let Some(router) = &self.shared.consume_router {
            router.stop().await;
        }
        if let Some(router) = &self.shared.produce_router {
            router.stop().await;
        }
    }

    async fn stop_nodes(agent: Agent) {
        let (nodes, shutdowns) = agent.into_shutdown();
        join_all(nodes.iter().map(|node| node.stop())).await;
        for handle in shutdowns {
            let _ = handle.await;
        }
    }

    /// Forces a metadata refresh and resolves with the routing table it
    /// produced.
    pub async fn require_new_routing_table(&self) -> Result<Arc<RoutingTable>, Cancelled> {
        self.handle().require_new_routing_table().await
    }

    /// Resolves with the partition ids of `topic`, in the order the broker
    /// reported them.
    pub async fn require_all_partitions_for_topic(
        &self,
        topic: impl Into<String> + Send,
    ) -> Result<Vec<i32>, Cancelled> {
        self.handle().require_all_partitions_for_topic(topic).await
    }

    /// Lock-free value copy of the current counters.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// The live counters, for router implementations to tap.
    pub fn shared_statistics(&self) -> Arc<Statistics> {
        Arc::clone(&self.statistics)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A cheap handle exposing the metadata operations.
    ///
    /// Routers hold this instead of the [`Cluster`] itself, which keeps the
    /// ownership one-directional.
    pub fn handle(&self) -> ClusterHandle {
        ClusterHandle {
            tx: self.tx.clone(),
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        // a dropped cluster must not leave its tasks behind
        if let State::Started { agent, refresher } = &*self.state.lock() {
            agent.abort();
            refresher.abort();
        }
    }
}

/// Clonable access to the coordinator's metadata operations.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    tx: mpsc::Sender<Message>,
}

impl ClusterHandle {
    /// See [`Cluster::require_new_routing_table`].
    pub async fn require_new_routing_table(&self) -> Result<Arc<RoutingTable>, Cancelled> {
        let (waiter, rx) = oneshot::channel();
        self.tx
            .send(Message::FullMetadata {
                waiter: Some(waiter),
            })
            .await
            .map_err(|_| Cancelled)?;
        rx.await.unwrap_or(Err(Cancelled))
    }

    /// See [`Cluster::require_all_partitions_for_topic`].
    pub async fn require_all_partitions_for_topic(
        &self,
        topic: impl Into<String> + Send,
    ) -> Result<Vec<i32>, Cancelled> {
        let (waiter, rx) = oneshot::channel();
        self.tx
            .send(Message::TopicMetadata {
                topic: topic.into(),
                waiter,
            })
            .await
            .map_err(|_| Cancelled)?;
        rx.await.unwrap_or(Err(Cancelled))
    }
}
