use std::{collections::HashMap, fmt};

use bson::oid::ObjectId;

use crate::{
    description::topology::TopologyType,
    options::ServerAddress,
    public::ServerInfo,
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// A description of the most up-to-date information known about a topology. Further details
/// can be found in the [Server Discovery and Monitoring specification](https://specifications.readthedocs.io/en/latest/server-discovery-and-monitoring/server-discovery-and-monitoring/).
#[derive(Clone)]
pub struct TopologyDescription {
    pub(crate) description: crate::description::topology::TopologyDescription,
}

impl From<crate::description::topology::TopologyDescription> for TopologyDescription {
    fn from(description: crate::description::topology::TopologyDescription) -> Self {
        Self { description }
    }
}

impl TopologyDescription {
    /// Whether this topology has a readable server available that satisfies the specified
    /// selection criteria.
    pub fn has_readable_server(&self, selection_criteria: Option<SelectionCriteria>) -> bool {
        match self.description.suitable_servers_in_latency_window(
            &selection_criteria
                .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary)),
        ) {
            Ok(servers) => !servers.is_empty(),
            Err(_) => false,
        }
    }

    /// Whether this topology has a writable server available.
    pub fn has_writable_server(&self) -> bool {
        match self.description.topology_type {
            TopologyType::Unknown | TopologyType::ReplicaSetNoPrimary => false,
            TopologyType::Single | TopologyType::Sharded => {
                self.description.has_available_servers()
            }
            TopologyType::ReplicaSetWithPrimary => true,
        }
    }

    /// Gets the unique ID of the topology.
    pub fn id(&self) -> ObjectId {
        self.description.id
    }

    /// Gets the type of the topology.
    pub fn topology_type(&self) -> TopologyType {
        self.description.topology_type
    }

    /// Gets the set name of the topology.
    pub fn set_name(&self) -> Option<&String> {
        self.description.set_name.as_ref()
    }

    /// Gets the max set version of the topology.
    pub fn max_set_version(&self) -> Option<i32> {
        self.description.max_set_version
    }

    /// Gets the max election ID of the topology.
    pub fn max_election_id(&self) -> Option<ObjectId> {
        self.description.max_election_id
    }

    /// Whether every server in this topology has a wire version range compatible with this
    /// library's.
    pub fn is_compatible(&self) -> bool {
        self.description.is_compatible()
    }

    /// Gets the compatibility error of the topology, if any server's wire version range is
    /// incompatible with this library's.
    pub fn compatibility_error(&self) -> Option<&String> {
        self.description.compatibility_error.as_ref()
    }

    /// Gets the time that a session remains active after its most recent use, as reported by
    /// the data-bearing servers of the topology.
    pub fn logical_session_timeout(&self) -> Option<std::time::Duration> {
        self.description.logical_session_timeout
    }

    /// Gets the servers in the topology.
    pub fn servers(&self) -> HashMap<&ServerAddress, ServerInfo> {
        self.description
            .servers
            .iter()
            .map(|(address, description)| (address, ServerInfo::new_borrowed(description)))
            .collect()
    }
}

impl fmt::Debug for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        f.debug_struct("Topology Description")
            .field("Type", &self.topology_type())
            .field("Set Name", &self.set_name())
            .field("Max Set Version", &self.max_set_version())
            .field("Max Election ID", &self.max_election_id())
            .field("Compatibility Error", &self.compatibility_error())
            .field("Servers", &self.servers().values())
            .finish()
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        fmt::Display::fmt(&self.description, f)
    }
}
