//! Contains the events and functionality for monitoring the behavior of the SDAM engine.

mod topology_description;

use std::{sync::Arc, time::Duration};

use bson::{oid::ObjectId, Document};

use crate::{error::Error, options::ServerAddress, public::ServerInfo, runtime};

pub use topology_description::TopologyDescription;

/// A description of the most up-to-date information known about a server, as carried by
/// server-level SDAM events.
pub type ServerDescription = ServerInfo<'static>;

/// Published when a server description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The server's previous description.
    pub previous_description: ServerDescription,

    /// The server's new description.
    pub new_description: ServerDescription,
}

/// Published when a server is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The ID of the topology.
    pub topology_id: ObjectId,

    /// The topology's previous description.
    pub previous_description: TopologyDescription,

    /// The topology's new description.
    pub new_description: TopologyDescription,
}

/// Published when a topology is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology is closed. This is the last event published by a topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server monitor's heartbeat is started.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Published when a server monitor's heartbeat succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The execution time of the heartbeat.
    pub duration: Duration,

    /// The raw reply to the heartbeat command.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Published when a server monitor's heartbeat fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The execution time of the heartbeat.
    pub duration: Duration,

    /// The failure that occurred.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,
}

/// An SDAM event.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum SdamEvent {
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

/// Applications can implement this trait to specify custom logic to run on each SDAM event
/// sent by the topology.
///
/// Events are delivered by a dedicated background task, in the order they were emitted; a
/// slow handler delays later events but never topology updates themselves.
pub trait SdamEventHandler: Send + Sync {
    /// Invoked when a server description changes.
    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {}

    /// Invoked when a server is initialized.
    fn handle_server_opening_event(&self, _event: ServerOpeningEvent) {}

    /// Invoked when a server is closed.
    fn handle_server_closed_event(&self, _event: ServerClosedEvent) {}

    /// Invoked when a topology description changes.
    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {}

    /// Invoked when a topology is initialized.
    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {}

    /// Invoked when a topology is closed.
    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {}

    /// Invoked when a server heartbeat begins.
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    /// Invoked when a server heartbeat succeeds.
    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    /// Invoked when a server heartbeat fails.
    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}
}

/// Forwards events to the user's handler from a dedicated task, so that delivery never runs
/// under the topology's locks and a panicking or blocking handler cannot stall monitoring.
#[derive(Clone, Debug)]
pub(crate) struct SdamEventEmitter {
    sender: tokio::sync::mpsc::UnboundedSender<SdamEvent>,
}

impl SdamEventEmitter {
    pub(crate) fn new(handler: Arc<dyn SdamEventHandler>) -> Self {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<SdamEvent>();
        runtime::execute(async move {
            while let Some(event) = receiver.recv().await {
                dispatch_event(handler.as_ref(), event);
            }
        });
        Self { sender }
    }

    /// Queues an event for delivery. Delivery is fire-and-forget; if the dispatch task has
    /// already exited, the event is dropped.
    pub(crate) fn emit(&self, event: SdamEvent) {
        let _ = self.sender.send(event);
    }
}

fn dispatch_event(handler: &dyn SdamEventHandler, event: SdamEvent) {
    match event {
        SdamEvent::ServerDescriptionChanged(e) => {
            handler.handle_server_description_changed_event(*e)
        }
        SdamEvent::ServerOpening(e) => handler.handle_server_opening_event(e),
        SdamEvent::ServerClosed(e) => handler.handle_server_closed_event(e),
        SdamEvent::TopologyDescriptionChanged(e) => {
            handler.handle_topology_description_changed_event(*e)
        }
        SdamEvent::TopologyOpening(e) => handler.handle_topology_opening_event(e),
        SdamEvent::TopologyClosed(e) => handler.handle_topology_closed_event(e),
        SdamEvent::ServerHeartbeatStarted(e) => handler.handle_server_heartbeat_started_event(e),
        SdamEvent::ServerHeartbeatSucceeded(e) => {
            handler.handle_server_heartbeat_succeeded_event(e)
        }
        SdamEvent::ServerHeartbeatFailed(e) => handler.handle_server_heartbeat_failed_event(e),
    }
}
