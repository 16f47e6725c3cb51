//! End-to-end coordinator scenarios driven through the public API, with the
//! node layer replaced by scripted fakes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use rscluster::cluster::{Cancelled, Cluster, RoutingTable};
use rscluster::config::ClientConfig;
use rscluster::metadata::{
    ErrorCode, MetadataResponse, MetadataResponseBroker, MetadataResponsePartition,
    MetadataResponseTopic,
};
use rscluster::node::{Node, NodeError, NodeEvent, NodeEventSink, NodeFactory};
use rscluster::router::{
    ConsumeAck, ConsumeRouter, FetchAck, OffsetAck, ProduceAck, ProduceRouter,
};

type Script = Arc<Mutex<VecDeque<Result<MetadataResponse, NodeError>>>>;

#[derive(Debug)]
struct FakeNode {
    name: String,
    responses: Script,
    events: NodeEventSink,
    stopped: AtomicBool,
}

impl FakeNode {
    async fn emit(&self, event: NodeEvent) {
        self.events.emit(event).await;
    }
}

#[async_trait]
impl Node for FakeNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_metadata(&self, _topic: Option<&str>) -> Result<MetadataResponse, NodeError> {
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(NodeError::Unknown("no scripted response".to_owned())))
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Creates [`FakeNode`]s that all answer from one shared script, the way any
/// live broker may answer a metadata request.
#[derive(Debug, Default)]
struct FakeFactory {
    responses: Script,
    created: Mutex<Vec<Arc<FakeNode>>>,
}

impl FakeFactory {
    fn script(&self, response: Result<MetadataResponse, NodeError>) {
        self.responses.lock().push_back(response);
    }

    fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    fn node(&self, name: &str) -> Arc<FakeNode> {
        self.created
            .lock()
            .iter()
            .find(|node| node.name == name)
            .cloned()
            .unwrap_or_else(|| panic!("no node named {name}"))
    }

    fn all_stopped(&self) -> bool {
        self.created
            .lock()
            .iter()
            .all(|node| node.stopped.load(Ordering::SeqCst))
    }
}

impl NodeFactory for FakeFactory {
    fn create(&self, host: &str, port: u16, events: NodeEventSink) -> Arc<dyn Node> {
        let node = Arc::new(FakeNode {
            name: format!("{host}:{port}"),
            responses: Arc::clone(&self.responses),
            events,
            stopped: AtomicBool::new(false),
        });
        self.created.lock().push(Arc::clone(&node));
        node
    }
}

#[derive(Debug, Default)]
struct MockProduceRouter {
    acks: Mutex<Vec<ProduceAck>>,
    tables: Mutex<Vec<Arc<RoutingTable>>>,
    stop_order: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl ProduceRouter for MockProduceRouter {
    fn acknowledge(&self, ack: ProduceAck) {
        self.acks.lock().push(ack);
    }

    fn change_routing_table(&self, table: Arc<RoutingTable>) {
        self.tables.lock().push(table);
    }

    async fn stop(&self) {
        self.stop_order.lock().push("produce");
    }
}

#[derive(Debug, Default)]
struct MockConsumeRouter {
    acks: Mutex<Vec<ConsumeAck>>,
    tables: Mutex<Vec<Arc<RoutingTable>>>,
    stop_order: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl ConsumeRouter for MockConsumeRouter {
    fn acknowledge(&self, ack: ConsumeAck) {
        self.acks.lock().push(ack);
    }

    fn change_routing_table(&self, table: Arc<RoutingTable>) {
        self.tables.lock().push(table);
    }

    async fn stop(&self) {
        self.stop_order.lock().push("consume");
    }
}

fn config(seeds: &str) -> ClientConfig {
    ClientConfig {
        seeds: seeds.to_owned(),
        ..Default::default()
    }
}

fn broker(id: i32, host: &str) -> MetadataResponseBroker {
    MetadataResponseBroker {
        node_id: id,
        host: host.to_owned(),
        port: 9092,
        rack: None,
    }
}

fn partition(id: i32, leader: i32) -> MetadataResponsePartition {
    MetadataResponsePartition {
        error: ErrorCode::None,
        partition_index: id,
        leader_id: leader,
    }
}

fn topic(name: &str, partitions: Vec<MetadataResponsePartition>) -> MetadataResponseTopic {
    MetadataResponseTopic {
        error: ErrorCode::None,
        name: name.to_owned(),
        partitions,
    }
}

fn two_broker_response() -> MetadataResponse {
    MetadataResponse {
        brokers: vec![broker(1, "h1"), broker(2, "h2")],
        topics: vec![topic("T", vec![partition(0, 1), partition(1, 2)])],
    }
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_seed_bootstrap() {
    let factory = Arc::new(FakeFactory::default());
    let cluster = Cluster::builder(config("h1:9092,h2:9092"), Arc::clone(&factory) as _)
        .build()
        .unwrap();

    assert_eq!(factory.created_count(), 2);
    factory.node("h1:9092");
    factory.node("h2:9092");
    assert_eq!(cluster.statistics().errors, 0);

    // stopping an unstarted cluster still tears the seed nodes down
    cluster.stop().await;
    assert!(factory.all_stopped());
}

#[tokio::test]
async fn test_invalid_seeds_fail_construction() {
    let factory = Arc::new(FakeFactory::default());
    assert!(Cluster::builder(config(",,"), factory).build().is_err());
}

#[tokio::test]
async fn test_refresh_publishes_routing_table() {
    let factory = Arc::new(FakeFactory::default());
    factory.script(Ok(two_broker_response()));
    factory.script(Ok(two_broker_response()));

    let changes: Arc<Mutex<Vec<Arc<RoutingTable>>>> = Default::default();
    let cluster = Cluster::builder(config("h1:9092,h2:9092"), Arc::clone(&factory) as _)
        .on_routing_table_change({
            let changes = Arc::clone(&changes);
            move |table| changes.lock().push(Arc::clone(table))
        })
        .build()
        .unwrap();
    cluster.start();

    // the fetch posted by start()
    wait_for("initial refresh", || changes.lock().len() == 1).await;

    // an on-demand refresh resolves with the table it published
    let table = cluster.require_new_routing_table().await.unwrap();
    assert_eq!(changes.lock().len(), 2);
    assert!(Arc::ptr_eq(&table, &changes.lock()[1]));

    let partitions = table.partitions("T").unwrap();
    assert_eq!(partitions.len(), 2);
    assert_eq!(partitions[0].id, 0);
    assert_eq!(partitions[0].leader.name(), "h1:9092");
    assert_eq!(partitions[1].id, 1);
    assert_eq!(partitions[1].leader.name(), "h2:9092");

    // the seed connections were reused, not recreated
    assert_eq!(factory.created_count(), 2);

    cluster.stop().await;
}

#[tokio::test]
async fn test_topic_query_preserves_response_order() {
    let factory = Arc::new(FakeFactory::default());
    factory.script(Ok(two_broker_response()));
    factory.script(Ok(MetadataResponse {
        brokers: vec![broker(1, "h1"), broker(2, "h2")],
        topics: vec![topic(
            "T",
            vec![partition(5, 1), partition(0, 2), partition(2, 1)],
        )],
    }));

    let cluster = Cluster::builder(config("h1:9092,h2:9092"), Arc::clone(&factory) as _)
        .build()
        .unwrap();
    cluster.start();

    let ids = cluster.require_all_partitions_for_topic("T").await.unwrap();
    assert_eq!(ids, vec![5, 0, 2]);

    cluster.stop().await;
}

#[tokio::test]
async fn test_dead_nodes_trigger_refresh_then_reseed() {
    let factory = Arc::new(FakeFactory::default());
    factory.script(Ok(two_broker_response()));
    // the view after h1 died
    factory.script(Ok(MetadataResponse {
        brokers: vec![broker(2, "h2")],
        topics: vec![topic("T", vec![partition(0, 2)])],
    }));

    let changes: Arc<Mutex<Vec<Arc<RoutingTable>>>> = Default::default();
    let cluster = Cluster::builder(config("h1:9092,h2:9092"), Arc::clone(&factory) as _)
        .on_routing_table_change({
            let changes = Arc::clone(&changes);
            move |table| changes.lock().push(Arc::clone(table))
        })
        .build()
        .unwrap();
    cluster.start();
    wait_for("initial refresh", || changes.lock().len() == 1).await;

    // h1 dies: the dead node is dropped and a refresh is posted
    factory.node("h1:9092").emit(NodeEvent::Dead).await;
    wait_for("refresh after death", || changes.lock().len() == 2).await;
    assert_eq!(cluster.statistics().node_dead, 1);

    let table = Arc::clone(&changes.lock()[1]);
    let partitions = table.partitions("T").unwrap();
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].leader.name(), "h2:9092");
    wait_for("h1 shut down", || {
        factory.node("h1:9092").stopped.load(Ordering::SeqCst)
    })
    .await;

    // h2 dies too: the registry empties and the seeds come back
    factory.node("h2:9092").emit(NodeEvent::Dead).await;
    wait_for("seed re-bootstrap", || factory.created_count() == 4).await;
    assert_eq!(cluster.statistics().node_dead, 2);

    cluster.stop().await;
}

#[tokio::test]
async fn test_failed_fetch_cancels_waiter_and_fans_out() {
    let factory = Arc::new(FakeFactory::default());
    factory.script(Err(NodeError::Decode("truncated frame".to_owned())));

    let internal_errors: Arc<Mutex<Vec<String>>> = Default::default();
    let cluster = Cluster::builder(config("h1:9092"), Arc::clone(&factory) as _)
        .on_internal_error({
            let internal_errors = Arc::clone(&internal_errors);
            move |error| internal_errors.lock().push(error.to_string())
        })
        .build()
        .unwrap();
    cluster.start();

    // the initial fetch consumes the scripted decode failure
    wait_for("internal error fan-out", || internal_errors.lock().len() == 1).await;
    assert!(internal_errors.lock()[0].contains("truncated frame"));

    // an unscripted fetch fails too; the waiter only ever sees cancellation
    let result = cluster.require_new_routing_table().await;
    assert!(matches!(result, Err(Cancelled)));
    wait_for("second fan-out", || internal_errors.lock().len() == 2).await;

    cluster.stop().await;
}

#[tokio::test]
async fn test_acknowledgements_forwarded_to_routers() {
    let factory = Arc::new(FakeFactory::default());
    let stop_order: Arc<Mutex<Vec<&'static str>>> = Default::default();
    let produce_router = Arc::new(MockProduceRouter {
        stop_order: Arc::clone(&stop_order),
        ..Default::default()
    });
    let consume_router = Arc::new(MockConsumeRouter {
        stop_order: Arc::clone(&stop_order),
        ..Default::default()
    });

    let cluster = Cluster::builder(config("h1:9092"), Arc::clone(&factory) as _)
        .produce_router(Arc::clone(&produce_router) as _)
        .consume_router(Arc::clone(&consume_router) as _)
        .build()
        .unwrap();
    cluster.start();

    let node = factory.node("h1:9092");
    node.emit(NodeEvent::ProduceAck(ProduceAck {
        topic: "T".to_owned(),
        partition: 0,
        base_offset: 42,
        error: ErrorCode::None,
    }))
    .await;
    node.emit(NodeEvent::FetchAck(FetchAck {
        topic: "T".to_owned(),
        partition: 0,
        high_watermark: 7,
        error: ErrorCode::None,
    }))
    .await;
    node.emit(NodeEvent::OffsetAck(OffsetAck {
        topic: "T".to_owned(),
        partition: 1,
        offset: 3,
        error: ErrorCode::None,
    }))
    .await;

    wait_for("acks forwarded", || {
        produce_router.acks.lock().len() == 1 && consume_router.acks.lock().len() == 2
    })
    .await;

    assert_eq!(produce_router.acks.lock()[0].base_offset, 42);
    assert!(matches!(
        &consume_router.acks.lock()[..],
        [ConsumeAck::Fetch(_), ConsumeAck::Offsets(_)]
    ));

    cluster.stop().await;
}

#[tokio::test]
async fn test_node_events_update_statistics() {
    let factory = Arc::new(FakeFactory::default());
    let cluster = Cluster::builder(config("h1:9092"), Arc::clone(&factory) as _)
        .build()
        .unwrap();
    cluster.start();

    let node = factory.node("h1:9092");
    node.emit(NodeEvent::Connected).await;
    node.emit(NodeEvent::RequestSent).await;
    node.emit(NodeEvent::ResponseReceived).await;
    node.emit(NodeEvent::ConnectError(NodeError::Connect(
        "connection refused".to_owned(),
    )))
    .await;

    wait_for("statistics", || {
        let snapshot = cluster.statistics();
        snapshot.requests_sent == 1 && snapshot.responses_received == 1 && snapshot.errors == 1
    })
    .await;

    cluster.stop().await;
}

#[tokio::test]
async fn test_stop_lifecycle() {
    let factory = Arc::new(FakeFactory::default());
    factory.script(Ok(two_broker_response()));

    let stop_order: Arc<Mutex<Vec<&'static str>>> = Default::default();
    let produce_router = Arc::new(MockProduceRouter {
        stop_order: Arc::clone(&stop_order),
        ..Default::default()
    });
    let consume_router = Arc::new(MockConsumeRouter {
        stop_order: Arc::clone(&stop_order),
        ..Default::default()
    });

    let cluster = Cluster::builder(config("h1:9092,h2:9092"), Arc::clone(&factory) as _)
        .produce_router(Arc::clone(&produce_router) as _)
        .consume_router(Arc::clone(&consume_router) as _)
        .build()
        .unwrap();
    cluster.start();

    // both routers saw the published table
    wait_for("routers saw the table", || {
        !produce_router.tables.lock().is_empty() && !consume_router.tables.lock().is_empty()
    })
    .await;

    cluster.stop().await;

    // consume router stops before the produce router, then the nodes
    assert_eq!(&*stop_order.lock(), &["consume", "produce"]);
    assert!(factory.all_stopped());
    assert_eq!(cluster.statistics().exited, 1);

    // requests after stop surface as cancellation
    let result = cluster.require_new_routing_table().await;
    assert!(matches!(result, Err(Cancelled)));

    // stop is idempotent
    cluster.stop().await;
    assert_eq!(cluster.statistics().exited, 1);
}

#[tokio::test]
async fn test_same_caller_operations_keep_order() {
    let factory = Arc::new(FakeFactory::default());
    factory.script(Ok(two_broker_response()));
    factory.script(Ok(MetadataResponse {
        brokers: vec![broker(1, "h1"), broker(2, "h2")],
        topics: vec![topic("T", vec![partition(9, 1)])],
    }));

    let cluster = Cluster::builder(config("h1:9092,h2:9092"), Arc::clone(&factory) as _)
        .build()
        .unwrap();
    cluster.start();

    // enqueued after the initial refresh, so it consumes the second script
    let handle = cluster.handle();
    let ids = handle.require_all_partitions_for_topic("T").await.unwrap();
    assert_eq!(ids, vec![9]);

    cluster.stop().await;
}
