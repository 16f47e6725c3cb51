//! Cluster coordination for Kafka-family log broker clients.
//!
//! Given a list of bootstrap seeds, [`cluster::Cluster`] continuously
//! discovers the live topology (brokers, topics, partition leaders) and
//! publishes an immutable [`cluster::RoutingTable`] that producer and
//! consumer routers consult to reach the right leader. Connections, the wire
//! codec and the routers themselves stay behind the contracts in [`node`]
//! and [`router`].

pub mod cluster;
pub mod config;
pub mod metadata;
pub mod node;
pub mod router;
