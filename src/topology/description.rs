//! Server and topology descriptions.

use crate::config::TopologyConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Role a server reported in its last hello reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerType {
    Unknown,
    Standalone,
    Mongos,
    RsPrimary,
    RsSecondary,
    RsArbiter,
    RsOther,
    RsGhost,
}

impl ServerType {
    /// Replica set member types that carry a set name.
    pub fn is_replica_set_member(&self) -> bool {
        matches!(
            self,
            ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::RsArbiter
                | ServerType::RsOther
        )
    }

    pub fn all() -> [ServerType; 8] {
        [
            ServerType::Unknown,
            ServerType::Standalone,
            ServerType::Mongos,
            ServerType::RsPrimary,
            ServerType::RsSecondary,
            ServerType::RsArbiter,
            ServerType::RsOther,
            ServerType::RsGhost,
        ]
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerType::Unknown => write!(f, "Unknown"),
            ServerType::Standalone => write!(f, "Standalone"),
            ServerType::Mongos => write!(f, "Mongos"),
            ServerType::RsPrimary => write!(f, "RSPrimary"),
            ServerType::RsSecondary => write!(f, "RSSecondary"),
            ServerType::RsArbiter => write!(f, "RSArbiter"),
            ServerType::RsOther => write!(f, "RSOther"),
            ServerType::RsGhost => write!(f, "RSGhost"),
        }
    }
}

/// Overall shape of the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyType {
    Unknown,
    Single,
    Sharded,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
}

impl fmt::Display for TopologyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyType::Unknown => write!(f, "Unknown"),
            TopologyType::Single => write!(f, "Single"),
            TopologyType::Sharded => write!(f, "Sharded"),
            TopologyType::ReplicaSetNoPrimary => write!(f, "ReplicaSetNoPrimary"),
            TopologyType::ReplicaSetWithPrimary => write!(f, "ReplicaSetWithPrimary"),
        }
    }
}

/// Server process identity plus a counter that process increments on every
/// state change it reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopologyVersion {
    pub process_id: Uuid,
    pub counter: i64,
}

impl TopologyVersion {
    pub fn new(process_id: Uuid, counter: i64) -> Self {
        Self {
            process_id,
            counter,
        }
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process_id, self.counter)
    }
}

/// Whether an observation carrying `incoming` is older than one carrying `last`.
///
/// Only a lower counter from the same process is stale. A missing version on
/// either side, or a different process (a restart), never is.
pub fn is_stale(last: Option<&TopologyVersion>, incoming: Option<&TopologyVersion>) -> bool {
    match (last, incoming) {
        (Some(last), Some(incoming)) => {
            last.process_id == incoming.process_id && incoming.counter < last.counter
        }
        _ => false,
    }
}

/// One observation of one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    pub address: String,
    pub server_type: ServerType,
    pub topology_version: Option<TopologyVersion>,
    pub set_name: Option<String>,
    pub set_version: Option<i64>,
    pub election_id: Option<u64>,
    /// The address the server reports for itself.
    pub me: Option<String>,
    /// Replica set hosts as seen by the server.
    pub hosts: Vec<String>,
    /// Error of the failed check that produced this description.
    pub error: Option<String>,
    /// Stamped by the tracker when the description is applied.
    pub last_update: Option<Instant>,
}

impl ServerDescription {
    /// A description of a server that has not been checked yet.
    pub fn unknown(address: impl Into<String>) -> Self {
        Self::new(address, ServerType::Unknown)
    }

    pub fn new(address: impl Into<String>, server_type: ServerType) -> Self {
        Self {
            address: address.into(),
            server_type,
            topology_version: None,
            set_name: None,
            set_version: None,
            election_id: None,
            me: None,
            hosts: Vec::new(),
            error: None,
            last_update: None,
        }
    }

    /// A failed check. The server type becomes `Unknown`.
    pub fn failed(address: impl Into<String>, error: impl Into<String>) -> Self {
        let mut description = Self::unknown(address);
        description.error = Some(error.into());
        description
    }

    pub fn with_topology_version(mut self, version: TopologyVersion) -> Self {
        self.topology_version = Some(version);
        self
    }

    pub fn with_set_name(mut self, name: impl Into<String>) -> Self {
        self.set_name = Some(name.into());
        self
    }

    pub fn with_set_version(mut self, version: i64) -> Self {
        self.set_version = Some(version);
        self
    }

    pub fn with_election_id(mut self, id: u64) -> Self {
        self.election_id = Some(id);
        self
    }

    pub fn with_me(mut self, me: impl Into<String>) -> Self {
        self.me = Some(me.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into());
        self
    }

    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts.extend(hosts.into_iter().map(Into::into));
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Immutable snapshot of the known deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyDescription {
    pub(super) topology_type: TopologyType,
    pub(super) set_name: Option<String>,
    pub(super) seed_count: usize,
    pub(super) servers: BTreeMap<String, ServerDescription>,
    pub(super) max_set_version: Option<i64>,
    pub(super) max_election_id: Option<u64>,
}

impl TopologyDescription {
    /// Initial description: every seed as an unknown server.
    pub fn new(config: &TopologyConfig) -> Self {
        let topology_type = if config.direct_connection {
            TopologyType::Single
        } else if config.set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };
        Self {
            topology_type,
            set_name: config.set_name.clone(),
            seed_count: config.seeds.len(),
            servers: config
                .seeds
                .iter()
                .map(|seed| (seed.clone(), ServerDescription::unknown(seed.clone())))
                .collect(),
            max_set_version: None,
            max_election_id: None,
        }
    }

    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn max_set_version(&self) -> Option<i64> {
        self.max_set_version
    }

    pub fn max_election_id(&self) -> Option<u64> {
        self.max_election_id
    }

    pub fn server(&self, address: &str) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    /// Servers ordered by address.
    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|s| s.server_type == ServerType::RsPrimary)
    }

    /// Force the topology type. Used to set up discovery scenarios.
    pub fn set_topology_type(&mut self, topology_type: TopologyType) {
        self.topology_type = topology_type;
    }
}
