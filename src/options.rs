//! Contains the types needed to configure a [`TopologyManager`](crate::TopologyManager).

use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    description::topology::TopologyType,
    error::{Error, ErrorKind, Result},
    event::SdamEventHandler,
    monitor::MIN_HEARTBEAT_FREQUENCY,
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// The address of a MongoDB server, a hostname and port combination.
///
/// Hostnames are normalized to lowercase when parsed; an absent port is equivalent to the
/// default port (27017) for comparison and hashing purposes.
#[derive(Clone, Debug, Eq, Serialize)]
#[non_exhaustive]
pub struct ServerAddress {
    /// The hostname or IP address where the server can be found.
    pub host: String,

    /// The TCP port that the server is listening on.
    ///
    /// The default is 27017.
    pub port: Option<u16>,
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str())
            .map_err(|e| <D::Error as serde::de::Error>::custom(format!("{}", e)))
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port.unwrap_or(DEFAULT_PORT) == other.port.unwrap_or(DEFAULT_PORT)
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.host.hash(state);
        self.port.unwrap_or(DEFAULT_PORT).hash(state);
    }
}

impl FromStr for ServerAddress {
    type Err = Error;
    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let hostname = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(ErrorKind::InvalidSeedList {
                    message: format!(
                        "invalid server address: \"{}\"; hostname cannot be empty",
                        address
                    ),
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| ErrorKind::InvalidSeedList {
                    message: format!(
                        "port must be valid 16-bit unsigned integer, instead got: {}",
                        part
                    ),
                })?;

                if port == 0 {
                    return Err(ErrorKind::InvalidSeedList {
                        message: format!(
                            "invalid server address: \"{}\"; port must be non-zero",
                            address
                        ),
                    }
                    .into());
                }
                if parts.next().is_some() {
                    return Err(ErrorKind::InvalidSeedList {
                        message: format!(
                            "address \"{}\" contains more than one unescaped ':'",
                            address
                        ),
                    }
                    .into());
                }

                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress {
            host: hostname.to_lowercase(),
            port,
        })
    }

    pub(crate) fn normalized(&self) -> ServerAddress {
        ServerAddress {
            host: self.host.to_lowercase(),
            port: self.port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port.unwrap_or(DEFAULT_PORT))
    }
}

/// Contains the options that can be used to configure a
/// [`TopologyManager`](crate::TopologyManager).
#[derive(Clone, TypedBuilder)]
#[non_exhaustive]
pub struct SdamOptions {
    /// The initial list of seed addresses that the topology should be populated with.
    ///
    /// The other members of the deployment will be discovered automatically from the seeds'
    /// heartbeat replies.
    pub seed_list: Vec<ServerAddress>,

    /// The type the topology starts out as. Only `Unknown`, `Single`, `Sharded`, and
    /// `ReplicaSetNoPrimary` are valid starting types.
    ///
    /// The default is `Unknown`.
    #[builder(default)]
    pub initial_topology_type: TopologyType,

    /// The name of the replica set the topology is expected to belong to.
    ///
    /// Required when the initial topology type is `ReplicaSetNoPrimary` and forbidden for all
    /// other starting types except `Single`.
    #[builder(default)]
    pub set_name: Option<String>,

    /// The amount of time each monitor should wait between server checks.
    ///
    /// The default is 10 seconds; the minimum is 500 milliseconds.
    #[builder(default)]
    pub heartbeat_frequency: Option<Duration>,

    /// The amount of latency beyond that of the suitable server with the minimum latency that
    /// is acceptable for a read operation.
    ///
    /// The default is 15 milliseconds.
    #[builder(default)]
    pub local_threshold: Option<Duration>,

    /// The default amount of time server selection waits for a suitable server to appear
    /// before failing.
    ///
    /// The default is 30 seconds.
    #[builder(default)]
    pub server_selection_timeout: Option<Duration>,

    /// The amount of time allowed to establish a connection for a heartbeat.
    ///
    /// Together with `socket_timeout` this bounds each probe. The default is 10 seconds.
    #[builder(default)]
    pub connect_timeout: Option<Duration>,

    /// The amount of time allowed for a heartbeat reply to arrive once a connection is
    /// established.
    ///
    /// The default is 10 seconds.
    #[builder(default)]
    pub socket_timeout: Option<Duration>,

    /// A handler that will be invoked for every SDAM event emitted by the topology.
    #[builder(default)]
    pub sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,

    /// Overrides the floor on the probe cadence used in expedited mode. Only settable from
    /// within the crate's own tests.
    #[builder(default, setter(skip))]
    pub(crate) min_heartbeat_frequency: Option<Duration>,
}

impl fmt::Debug for SdamOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SdamOptions")
            .field("seed_list", &self.seed_list)
            .field("initial_topology_type", &self.initial_topology_type)
            .field("set_name", &self.set_name)
            .field("heartbeat_frequency", &self.heartbeat_frequency)
            .field("local_threshold", &self.local_threshold)
            .field("server_selection_timeout", &self.server_selection_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .finish()
    }
}

impl SdamOptions {
    /// Ensures the options form a valid configuration, per the allowed combinations laid out
    /// in the SDAM specification.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.seed_list.is_empty() {
            return Err(ErrorKind::InvalidSeedList {
                message: "the seed list must contain at least one address".to_string(),
            }
            .into());
        }

        match self.initial_topology_type {
            TopologyType::Unknown | TopologyType::Sharded => {
                if self.set_name.is_some() {
                    return Err(ErrorKind::InvalidTopologyType {
                        message: format!(
                            "a replica set name cannot be specified for the {} topology type",
                            self.initial_topology_type
                        ),
                    }
                    .into());
                }
            }
            TopologyType::Single => {
                if self.seed_list.len() != 1 {
                    return Err(ErrorKind::InvalidSeedList {
                        message: format!(
                            "the Single topology type requires exactly one seed, but {} were \
                             provided",
                            self.seed_list.len()
                        ),
                    }
                    .into());
                }
            }
            TopologyType::ReplicaSetNoPrimary => {
                if self.set_name.is_none() {
                    return Err(ErrorKind::InvalidTopologyType {
                        message: "a replica set name is required for the ReplicaSetNoPrimary \
                                  topology type"
                            .to_string(),
                    }
                    .into());
                }
            }
            TopologyType::ReplicaSetWithPrimary => {
                return Err(ErrorKind::InvalidTopologyType {
                    message: "a topology cannot start out as ReplicaSetWithPrimary".to_string(),
                }
                .into());
            }
        }

        let min_frequency = self.min_heartbeat_frequency();
        if let Some(frequency) = self.heartbeat_frequency {
            if frequency < min_frequency {
                return Err(ErrorKind::InvalidHeartbeatFrequency {
                    message: format!(
                        "the heartbeat frequency must be at least {}ms, but {}ms was provided",
                        min_frequency.as_millis(),
                        frequency.as_millis()
                    ),
                }
                .into());
            }
        }

        Ok(())
    }

    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_frequency
            .unwrap_or(crate::monitor::DEFAULT_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn min_heartbeat_frequency(&self) -> Duration {
        self.min_heartbeat_frequency
            .unwrap_or(MIN_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn server_selection_timeout(&self) -> Duration {
        self.server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT)
    }

    pub(crate) fn heartbeat_timeout(&self) -> Duration {
        let connect = self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let socket = self.socket_timeout.unwrap_or(DEFAULT_SOCKET_TIMEOUT);
        connect.checked_add(socket).unwrap_or(Duration::MAX)
    }
}
