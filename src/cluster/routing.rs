//! The immutable routing table consulted for every produce and fetch.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::metadata::MetadataResponse;
use crate::node::Node;

use super::registry::BrokerRegistry;

/// One partition of a topic together with the node currently leading it.
#[derive(Debug, Clone)]
pub struct Partition {
    pub id: i32,
    pub leader: Arc<dyn Node>,
}

impl PartialEq for Partition {
    /// Partitions are equal when they route to the same node handle.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.leader, &other.leader)
    }
}

/// Immutable snapshot mapping each topic to its partitions in leader order.
///
/// Built wholesale from a metadata response, published to every subscriber,
/// and never mutated afterwards; a refresh replaces the table as a unit.
#[derive(Debug, Default, PartialEq)]
pub struct RoutingTable {
    topics: BTreeMap<String, Vec<Partition>>,
}

impl RoutingTable {
    /// Builds a routing table from `response`, resolving partition leaders
    /// against the already reconciled `registry`.
    ///
    /// Topics and partitions whose error code is not usable by clients are
    /// dropped, as are partitions without a current leader. A topic with no
    /// routable partition is absent from the table.
    pub(crate) fn build(response: &MetadataResponse, registry: &BrokerRegistry) -> Self {
        let mut topics = BTreeMap::new();

        for topic in &response.topics {
            if !topic.error.is_ok_for_client() {
                debug!(topic = %topic.name, error = topic.error.code(), "topic excluded from routing");
                continue;
            }

            let mut partitions: Vec<Partition> = topic
                .partitions
                .iter()
                .filter(|partition| partition.error.is_ok_for_client() && partition.leader_id >= 0)
                .filter_map(|partition| {
                    let leader = registry.get_by_id(partition.leader_id)?;
                    Some(Partition {
                        id: partition.partition_index,
                        leader: Arc::clone(&leader.node),
                    })
                })
                .collect();

            if partitions.is_empty() {
                debug!(topic = %topic.name, "no routable partitions, topic excluded");
                continue;
            }

            partitions.sort_by_key(|partition| partition.id);
            topics.insert(topic.name.clone(), partitions);
        }

        Self { topics }
    }

    /// Partitions of `topic`, ascending by id.
    pub fn partitions(&self, topic: &str) -> Option<&[Partition]> {
        self.topics.get(topic).map(Vec::as_slice)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
