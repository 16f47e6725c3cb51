//! Contracts for the producer and consumer routers.
//!
//! Routers batch, retry and track offsets; none of that lives here. The
//! coordinator only publishes routing-table changes to them and forwards
//! broker acknowledgements, so this module pins down exactly that surface.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::RoutingTable;
use crate::metadata::ErrorCode;

/// Broker acknowledgement for a produced batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceAck {
    pub topic: String,
    pub partition: i32,
    /// Offset assigned to the first record of the batch.
    pub base_offset: i64,
    pub error: ErrorCode,
}

/// Broker response to a fetch request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchAck {
    pub topic: String,
    pub partition: i32,
    pub high_watermark: i64,
    pub error: ErrorCode,
}

/// Broker response to an offsets request.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetAck {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub error: ErrorCode,
}

/// Either kind of response the consume router acknowledges.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeAck {
    Fetch(FetchAck),
    Offsets(OffsetAck),
}

/// The produce router as seen by the coordinator.
///
/// `acknowledge` and `change_routing_table` are called synchronously on the
/// coordinator's agent task and must not block; implementations hand the
/// payload off to their own machinery.
#[async_trait]
pub trait ProduceRouter: std::fmt::Debug + Send + Sync {
    fn acknowledge(&self, ack: ProduceAck);

    fn change_routing_table(&self, table: Arc<RoutingTable>);

    async fn stop(&self);
}

/// The consume router as seen by the coordinator.
#[async_trait]
pub trait ConsumeRouter: std::fmt::Debug + Send + Sync {
    fn acknowledge(&self, ack: ConsumeAck);

    fn change_routing_table(&self, table: Arc<RoutingTable>);

    async fn stop(&self);
}
