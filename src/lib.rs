#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use ::bson;

mod description;
pub mod error;
pub mod event;
mod hello;
mod manager;
mod monitor;
mod options;
mod public;
mod registry;
mod runtime;
mod selection_criteria;
#[cfg(test)]
mod test;
mod topology;

pub use crate::{
    description::{server::ServerType, topology::TopologyType},
    hello::{
        HeartbeatOutcome,
        HeartbeatProber,
        HelloCommandResponse,
        HelloReply,
        LastWrite,
        OpTime,
        LEGACY_HELLO_COMMAND_NAME,
    },
    manager::TopologyManager,
    options::{SdamOptions, ServerAddress},
    public::ServerInfo,
    registry::MonitorRegistry,
    selection_criteria::{Predicate, ReadPreference, SelectionCriteria, TagSet},
};
