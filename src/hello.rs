//! The heartbeat reply model and the prober interface through which heartbeats are issued.
//!
//! The wire protocol itself is out of scope for this crate; collaborators implement
//! [`HeartbeatProber`] and the monitor consumes the outcomes.

use std::time::Duration;

use bson::{oid::ObjectId, DateTime, Document, Timestamp};
use futures_core::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    description::server::ServerType,
    error::{Error, Result},
    options::ServerAddress,
    selection_criteria::TagSet,
};

/// The name of the command that a heartbeat reply answers. `hello` replaced the legacy
/// `isMaster` name in server 5.0; the reply documents are compatible for the fields this
/// crate consumes.
pub const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// Issues the server-health probe for the monitor.
///
/// Implementations own the transport: connection establishment, authentication, and running
/// the `hello`/`isMaster` command are their concern. The monitor bounds each probe with the
/// configured timeouts and measures its round-trip time, so implementations do not need to
/// enforce deadlines of their own.
pub trait HeartbeatProber: Send + Sync + 'static {
    /// Runs a single health probe against the server at `address`, resolving to the reply
    /// document or the failure that prevented one.
    fn probe(&self, address: ServerAddress) -> BoxFuture<'static, Result<HelloReply>>;
}

/// The outcome of a single heartbeat, as routed from a monitor to the topology.
#[derive(Clone, Debug)]
pub enum HeartbeatOutcome {
    /// The probe produced a reply.
    Success {
        /// The address the probe was issued against.
        address: ServerAddress,

        /// The reply document.
        reply: HelloReply,

        /// How long the probe took.
        round_trip_time: Duration,
    },

    /// The probe failed.
    Failure {
        /// The address the probe was issued against.
        address: ServerAddress,

        /// The error that caused the failure.
        error: Error,

        /// How long the probe ran before failing, if it got far enough to be measured.
        round_trip_time: Option<Duration>,
    },
}

impl HeartbeatOutcome {
    /// The address the probe was issued against.
    pub fn address(&self) -> &ServerAddress {
        match self {
            Self::Success { address, .. } => address,
            Self::Failure { address, .. } => address,
        }
    }
}

/// A reply to a `hello` or legacy `isMaster` command.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct HelloReply {
    /// The typed fields consumed by the topology.
    pub command_response: HelloCommandResponse,

    /// The raw reply document, carried for event consumers.
    pub raw_command_response: Document,
}

impl HelloReply {
    /// Parses a raw reply document into a `HelloReply`. Unrecognized fields are ignored.
    pub fn parse(raw: Document) -> Result<HelloReply> {
        let command_response = bson::from_document(raw.clone())
            .map_err(|e| Error::invalid_response(format!("invalid hello reply: {}", e)))?;
        Ok(HelloReply {
            command_response,
            raw_command_response: raw,
        })
    }
}

/// The typed view of a `hello` command response.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/command/hello/) for more details.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct HelloCommandResponse {
    /// Whether the command completed successfully on the server. Anything other than `1`
    /// classifies the server as `Unknown`.
    pub ok: Option<f64>,

    /// Whether the server is writable. If true, this instance is a primary in a replica set,
    /// a mongos instance, or a standalone mongod.
    pub is_writable_primary: Option<bool>,

    /// Legacy name for the `is_writable_primary` field.
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,

    /// The list of all hosts.
    pub hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a mongos.
    pub msg: Option<String>,

    /// The address of the server that returned this response, as it knows itself.
    pub me: Option<String>,

    /// The current replica set config version.
    pub set_version: Option<i32>,

    /// The name of the current replica set.
    pub set_name: Option<String>,

    /// Whether the server is hidden.
    pub hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub arbiter_only: Option<bool>,

    /// Whether the server is a member of an uninitialized replica set.
    #[serde(rename = "isreplicaset")]
    pub is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub election_id: Option<ObjectId>,

    /// The address of the current primary member of the replica set, as this server
    /// believes it to be.
    pub primary: Option<String>,
}

impl HelloCommandResponse {
    /// Derives the server type from the response, per the SDAM classification rules.
    pub(crate) fn server_type(&self) -> ServerType {
        if self.ok.map(|ok| ok as i64) != Some(1) {
            ServerType::Unknown
        } else if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_none()
            && self.msg.is_none()
            && self.is_replica_set != Some(true)
        {
            ServerType::Standalone
        } else if self.set_name.is_some() {
            if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else if self.hidden == Some(true) {
                ServerType::RsOther
            } else {
                ServerType::Unknown
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Unknown
        }
    }
}

/// Optime and date information for a server's most recent write operation.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct LastWrite {
    /// The date of the most recent write operation.
    pub last_write_date: DateTime,

    /// The replication optime of the most recent write operation.
    #[serde(default)]
    pub op_time: Option<OpTime>,
}

/// A replication optime, an opaque ordered pair of oplog timestamp and term.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[non_exhaustive]
pub struct OpTime {
    /// The oplog timestamp.
    pub ts: Timestamp,

    /// The election term.
    pub t: i32,
}
