//! Public, read-only views over the monitor's internal descriptions.

use std::{borrow::Cow, fmt, time::Duration};

use bson::DateTime;

use crate::{
    description::server::{ServerDescription, ServerType},
    hello::OpTime,
    options::ServerAddress,
    selection_criteria::TagSet,
};

/// A description of the most up-to-date information known about a server. Further details can
/// be found in the [Server Discovery and Monitoring specification](https://specifications.readthedocs.io/en/latest/server-discovery-and-monitoring/server-discovery-and-monitoring/).
#[derive(Clone)]
pub struct ServerInfo<'a> {
    pub(crate) description: Cow<'a, ServerDescription>,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a ServerDescription) -> Self {
        Self {
            description: Cow::Borrowed(description),
        }
    }

    pub(crate) fn new_owned(description: ServerDescription) -> Self {
        Self {
            description: Cow::Owned(description),
        }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the weighted average of the time it has taken for a server check to round-trip
    /// from the monitor to the server.
    ///
    /// This is the value that the monitor uses internally to determine the latency window as
    /// part of server selection.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the last time that the monitor's view of the server was updated.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.description.last_update_time
    }

    /// Gets the maximum wire version that the server supports.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.description.max_wire_version().ok().flatten()
    }

    /// Gets the minimum wire version that the server supports.
    pub fn min_wire_version(&self) -> Option<i32> {
        self.description.min_wire_version().ok().flatten()
    }

    /// Gets the name of the replica set that the server is part of.
    pub fn replica_set_name(&self) -> Option<&str> {
        self.description.set_name_str()
    }

    /// Gets the version of the replica set that the server is part of.
    pub fn replica_set_version(&self) -> Option<i32> {
        self.description.set_version().ok().flatten()
    }

    /// Get the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the tags associated with the server.
    pub fn tags(&self) -> Option<&TagSet> {
        self.description.tags()
    }

    /// Gets the optime of the server's most recent write operation, if it reported one.
    pub fn op_time(&self) -> Option<OpTime> {
        self.description.op_time().ok().flatten()
    }

    /// Gets the error that occurred during the last heartbeat against the server, if the
    /// heartbeat failed.
    pub fn error(&self) -> Option<&crate::error::Error> {
        self.description.error()
    }
}

impl fmt::Debug for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server Description")
            .field("Address", self.address())
            .field("Type", &self.server_type())
            .field("Average RTT", &self.average_round_trip_time())
            .field("Last Update Time", &self.last_update_time())
            .field("Max Wire Version", &self.max_wire_version())
            .field("Min Wire Version", &self.min_wire_version())
            .field("Replica Set Name", &self.replica_set_name())
            .field("Replica Set Version", &self.replica_set_version())
            .field("Tags", &self.tags())
            .field("Error", &self.error())
            .finish()
    }
}

impl fmt::Display for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ Address: {}, Type: {:?}",
            self.address(),
            self.server_type()
        )?;

        if let Some(error) = self.error() {
            write!(f, ", Error: {}", error)?;
        }

        write!(f, " }}")
    }
}
