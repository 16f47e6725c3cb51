//! The live broker set and its reconciliation against metadata responses.

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use rand::prelude::*;
use tracing::{debug, info};

use crate::metadata::MetadataResponseBroker;
use crate::node::Node;

/// Identity of a broker: its advertised `(host, port)` pair.
///
/// Broker ids are only learned from metadata responses, so everything keyed
/// before the first response uses this identity instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Display for HostPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What the coordinator knows about one broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMeta {
    /// Broker id, `None` until the first metadata response names it.
    pub id: Option<i32>,

    pub host: String,

    pub port: u16,
}

impl BrokerMeta {
    pub fn host_port(&self) -> HostPort {
        HostPort::new(self.host.clone(), self.port)
    }
}

/// A broker together with its owned connection handle.
#[derive(Debug)]
pub(crate) struct RegisteredBroker {
    pub(crate) node: Arc<dyn Node>,
    pub(crate) meta: BrokerMeta,
}

/// The live broker set.
///
/// The primary map is keyed by broker identity (`host:port`); the id index
/// points at primary keys and never holds an id the primary map does not
/// know. Mutated only by the coordinator agent.
#[derive(Debug, Default)]
pub(crate) struct BrokerRegistry {
    brokers: HashMap<HostPort, RegisteredBroker>,
    by_id: HashMap<i32, HostPort>,
}

impl BrokerRegistry {
    /// Registers a broker, replacing any previous occupant of its identity.
    pub(crate) fn register(&mut self, meta: BrokerMeta, node: Arc<dyn Node>) {
        let key = meta.host_port();
        if let Some(id) = meta.id {
            self.by_id.insert(id, key.clone());
        }
        self.brokers.insert(key, RegisteredBroker { node, meta });
    }

    /// Removes the broker registered under `key`, pruning the id index.
    pub(crate) fn remove(&mut self, key: &HostPort) -> Option<RegisteredBroker> {
        let registered = self.brokers.remove(key)?;
        if let Some(id) = registered.meta.id {
            self.by_id.remove(&id);
        }
        Some(registered)
    }

    pub(crate) fn get(&self, key: &HostPort) -> Option<&RegisteredBroker> {
        self.brokers.get(key)
    }

    pub(crate) fn get_by_id(&self, id: i32) -> Option<&RegisteredBroker> {
        self.brokers.get(self.by_id.get(&id)?)
    }

    /// Picks a broker uniformly at random.
    ///
    /// Any broker can answer a metadata request; random selection spreads
    /// the load and avoids pinning to a dead broker.
    pub(crate) fn random(&self) -> Option<(HostPort, Arc<dyn Node>)> {
        self.brokers
            .iter()
            .choose(&mut thread_rng())
            .map(|(key, registered)| (key.clone(), Arc::clone(&registered.node)))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.brokers.len()
    }

    pub(crate) fn contains(&self, key: &HostPort) -> bool {
        self.brokers.contains_key(key)
    }

    pub(crate) fn nodes(&self) -> Vec<Arc<dyn Node>> {
        self.brokers
            .values()
            .map(|registered| Arc::clone(&registered.node))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn metas(&self) -> Vec<BrokerMeta> {
        self.brokers
            .values()
            .map(|registered| registered.meta.clone())
            .collect()
    }

    /// Mutates the registry in place to equal the advertised broker list.
    ///
    /// Brokers already registered under a still-advertised identity keep
    /// their node handle so open connections are reused; ids are refreshed
    /// from the response. Brokers no longer advertised are dropped and
    /// returned so the caller can shut them down.
    pub(crate) fn reconcile(
        &mut self,
        advertised: &[MetadataResponseBroker],
        mut create: impl FnMut(&str, u16) -> Arc<dyn Node>,
    ) -> Vec<Arc<dyn Node>> {
        let advertised_keys: HashSet<HostPort> = advertised
            .iter()
            .map(|broker| HostPort::new(broker.host.clone(), broker.port))
            .collect();
        let advertised_ids: HashSet<i32> = advertised.iter().map(|broker| broker.node_id).collect();

        for broker in advertised {
            let key = HostPort::new(broker.host.clone(), broker.port);
            let entry = self.brokers.entry(key.clone()).or_insert_with(|| {
                info!(broker = %key, id = broker.node_id, "discovered new broker");
                RegisteredBroker {
                    node: create(&broker.host, broker.port),
                    meta: BrokerMeta {
                        id: None,
                        host: broker.host.clone(),
                        port: broker.port,
                    },
                }
            });
            if entry.meta.id != Some(broker.node_id) {
                debug!(broker = %key, id = broker.node_id, "learned broker id");
            }
            entry.meta.id = Some(broker.node_id);
            self.by_id.insert(broker.node_id, key);
        }

        self.by_id.retain(|id, _| advertised_ids.contains(id));

        let mut retired = Vec::new();
        self.brokers.retain(|key, registered| {
            if advertised_keys.contains(key) {
                return true;
            }
            info!(broker = %key, "broker no longer advertised, dropping");
            retired.push(Arc::clone(&registered.node));
            false
        });

        retired
    }
}
