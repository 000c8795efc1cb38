use std::{sync::Arc, time::Duration};

use bson::oid::ObjectId;
use tokio::sync::{
    broadcast,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    watch,
};

use crate::{
    description::{
        server::ServerDescription,
        topology::{TopologyDescription, TopologyType},
    },
    error::Error,
    event::{
        SdamEvent,
        SdamEventEmitter,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    hello::{HeartbeatOutcome, HeartbeatProber},
    monitor::Monitor,
    options::{SdamOptions, ServerAddress},
    public::ServerInfo,
    runtime::{AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
};

/// A struct providing access to the topology's current state: the handles used to read,
/// update, and expedite the monitoring of it.
///
/// When this is dropped, monitors will stop performing checks and the worker will exit.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    check_requester: TopologyCheckRequester,
    _worker_handle: WorkerHandle,
}

impl Topology {
    /// Starts the topology worker from validated options, publishing the initial description
    /// and spawning a monitor per seed.
    pub(crate) fn new(options: SdamOptions, prober: Arc<dyn HeartbeatProber>) -> Topology {
        let description = TopologyDescription::new(&options);

        let event_emitter = options
            .sdam_event_handler
            .as_ref()
            .map(|handler| SdamEventEmitter::new(handler.clone()));

        let (updater, update_receiver) = TopologyUpdater::channel();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();
        let check_requester = TopologyCheckRequester::new();

        let state = TopologyState { description };
        let (state_publisher, state_receiver) = watch::channel(state);

        let watcher = TopologyWatcher {
            receiver: state_receiver,
        };

        let worker = TopologyWorker {
            id: ObjectId::new(),
            update_receiver,
            publisher: state_publisher,
            handle_listener,
            watcher: watcher.clone(),
            updater: updater.clone(),
            check_requester: check_requester.clone(),
            event_emitter,
            prober,
            options,
        };

        worker.start();

        Topology {
            watcher,
            updater,
            check_requester,
            _worker_handle: worker_handle,
        }
    }

    pub(crate) fn watcher(&self) -> TopologyWatcher {
        self.watcher.clone()
    }

    /// Requests that all monitors check their servers as soon as possible, putting them in
    /// expedited mode until the topology settles.
    pub(crate) fn request_check(&self) {
        self.check_requester.request();
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
    ) -> bool {
        self.updater.handle_application_error(address, error).await
    }

    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }
}

/// The current state of the topology, as published to watchers after every applied update.
#[derive(Clone, Debug)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
}

#[derive(Debug)]
pub(crate) enum UpdateMessage {
    /// The outcome of a heartbeat, routed from a monitor.
    HeartbeatOutcome(Box<HeartbeatOutcome>),

    /// An error encountered by a higher layer while using the given server.
    ApplicationError {
        address: ServerAddress,
        error: Error,
    },

    /// Stop the worker, closing the topology.
    Shutdown,
}

/// Handle used to update the topology. Updates are applied by the worker strictly in the
/// order they were sent; the returned boolean indicates whether the topology changed as a
/// result of the update.
#[derive(Clone, Debug)]
pub(crate) struct TopologyUpdater {
    sender: UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    pub(crate) fn channel() -> (
        TopologyUpdater,
        UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
    ) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (TopologyUpdater { sender }, receiver)
    }

    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub(crate) async fn update(&self, outcome: HeartbeatOutcome) -> bool {
        self.send_message(UpdateMessage::HeartbeatOutcome(Box::new(outcome)))
            .await
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError { address, error })
            .await
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Shutdown).await;
    }
}

/// A handle to a shared, immutable snapshot of the topology. Observing or waiting never
/// blocks the worker; a new snapshot is installed with a pointer swap.
#[derive(Clone, Debug)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    /// Whether the topology is still being monitored, i.e. the worker has not exited.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    /// Clone the latest state, marking it as seen so that `wait_for_update` only resolves
    /// for states installed after this call.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Clone the latest state without affecting which states `wait_for_update` resolves for.
    pub(crate) fn peek_latest(&self) -> TopologyState {
        self.receiver.borrow().clone()
    }

    /// Wait for a new state to be published or for the timeout to elapse, whichever comes
    /// first. Returns whether a new state was published; also returns false if the topology
    /// was closed.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        crate::runtime::timeout(timeout, self.receiver.changed())
            .await
            .map(|changed| changed.is_ok())
            .unwrap_or(false)
    }

    pub(crate) fn server_exists(&self, address: &ServerAddress) -> bool {
        self.receiver.borrow().description.servers.contains_key(address)
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.receiver.borrow().description.topology_type
    }
}

/// Handle used to request immediate checks from all monitors.
#[derive(Clone, Debug)]
pub(crate) struct TopologyCheckRequester {
    sender: broadcast::Sender<()>,
}

impl TopologyCheckRequester {
    fn new() -> TopologyCheckRequester {
        let (sender, _) = broadcast::channel(1);
        TopologyCheckRequester { sender }
    }

    /// Notify the monitors that they should check their servers as soon as possible. A no-op
    /// if no monitor is listening.
    fn request(&self) {
        let _: std::result::Result<_, _> = self.sender.send(());
    }

    fn subscribe(&self) -> TopologyCheckRequestReceiver {
        TopologyCheckRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiver used by monitors to listen for check requests.
pub(crate) struct TopologyCheckRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl TopologyCheckRequestReceiver {
    /// Waits for either `timeout` to elapse or a check request to arrive. Returns whether a
    /// request arrived.
    pub(crate) async fn wait_for_check_request(&mut self, timeout: Duration) -> bool {
        let wait = crate::runtime::timeout(timeout, self.receiver.recv()).await;
        matches!(wait, Ok(Ok(())) | Ok(Err(broadcast::error::RecvError::Lagged(_))))
    }

    /// Discards any queued check requests: an outstanding probe satisfies them.
    pub(crate) fn clear_check_requests(&mut self) {
        loop {
            match self.receiver.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }
}

/// The worker that owns the only mutable `TopologyDescription`. Updates are processed one at
/// a time, in the order received; the resulting descriptions are published as immutable
/// snapshots, so readers never block this task.
struct TopologyWorker {
    id: ObjectId,
    update_receiver: UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
    publisher: watch::Sender<TopologyState>,
    handle_listener: WorkerHandleListener,
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    check_requester: TopologyCheckRequester,
    event_emitter: Option<SdamEventEmitter>,
    prober: Arc<dyn HeartbeatProber>,
    options: SdamOptions,
}

impl TopologyWorker {
    fn start(mut self) {
        crate::runtime::execute(async move {
            self.initialize();
            self.run().await;
        });
    }

    /// Publish the initial events and start a monitor for each seed.
    fn initialize(&mut self) {
        let description = self.publisher.borrow().description.clone();

        self.emit(SdamEvent::TopologyOpening(TopologyOpeningEvent {
            topology_id: self.id,
        }));
        self.emit(SdamEvent::TopologyDescriptionChanged(Box::new(
            TopologyDescriptionChangedEvent {
                topology_id: self.id,
                previous_description: description.cleared().into(),
                new_description: description.clone().into(),
            },
        )));

        for address in description.servers.keys() {
            self.emit(SdamEvent::ServerOpening(ServerOpeningEvent {
                address: address.clone(),
                topology_id: self.id,
            }));
            self.start_monitor(address.clone());
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(message) = self.update_receiver.recv() => {
                    let (message, ack) = message.into_parts();

                    let mut shutdown = false;
                    let changed = match message {
                        UpdateMessage::HeartbeatOutcome(outcome) => {
                            self.apply_heartbeat_outcome(*outcome)
                        }
                        UpdateMessage::ApplicationError { address, error } => {
                            self.handle_application_error(address, error)
                        }
                        UpdateMessage::Shutdown => {
                            shutdown = true;
                            true
                        }
                    };

                    ack.acknowledge(changed);

                    if shutdown {
                        break;
                    }
                }
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    break
                }
            }
        }

        let description = self.publisher.borrow().description.clone();
        for address in description.servers.keys() {
            self.emit(SdamEvent::ServerClosed(ServerClosedEvent {
                address: address.clone(),
                topology_id: self.id,
            }));
        }
        self.emit(SdamEvent::TopologyClosed(TopologyClosedEvent {
            topology_id: self.id,
        }));

        // Dropping the publisher closes the watch channel, which stops the monitors and wakes
        // any parked server selection operations.
    }

    /// Build the new server description from a heartbeat outcome, carrying the previous
    /// average round-trip time through the EWMA, and apply it.
    fn apply_heartbeat_outcome(&mut self, outcome: HeartbeatOutcome) -> bool {
        let state = self.publisher.borrow().clone();

        let previous_rtt = state
            .description
            .get_server_description(outcome.address())
            .and_then(|server| server.average_round_trip_time);

        let server_description = ServerDescription::from_heartbeat(outcome, previous_rtt);
        self.update_server(state, server_description)
    }

    /// Mark the given server as unknown if warranted by the error, per the SDAM error
    /// handling rules, and expedite monitoring to re-discover it.
    fn handle_application_error(&mut self, address: ServerAddress, error: Error) -> bool {
        if error.is_state_change_error() || error.is_non_timeout_network_error() {
            let state = self.publisher.borrow().clone();
            let description = ServerDescription::new_from_error(&address, error);
            let changed = self.update_server(state, description);
            if changed {
                self.check_requester.request();
            }
            changed
        } else {
            tracing::debug!(
                address = %address,
                error = %error,
                "operation failure does not affect the topology"
            );
            false
        }
    }

    /// Apply a new server description to a clone of the current topology description and, if
    /// anything changed, install the clone and broadcast the changes.
    fn update_server(
        &mut self,
        mut state: TopologyState,
        server_description: ServerDescription,
    ) -> bool {
        let old_description = state.description.clone();

        if let Err(error) = state.description.update(server_description) {
            // The transition functions only inspect replies of available servers, so this
            // only happens when a server reports unparseable host names.
            tracing::warn!(error = %error, "could not apply server description");
            return false;
        }

        let diff = old_description.diff(&state.description);
        let changed = diff.is_some();

        if let Some(diff) = diff {
            let added: Vec<_> = diff.added_addresses.into_iter().cloned().collect();
            let removed: Vec<_> = diff.removed_addresses.into_iter().cloned().collect();
            let changed_servers: Vec<_> = diff
                .changed_servers
                .into_iter()
                .map(|(address, (previous, new))| {
                    (address.clone(), previous.clone(), new.clone())
                })
                .collect();

            // Install the new snapshot before delivering events or starting monitors, so
            // that anything woken by them observes the state that woke it.
            self.publisher.send_replace(state);

            for address in added {
                self.emit(SdamEvent::ServerOpening(ServerOpeningEvent {
                    address: address.clone(),
                    topology_id: self.id,
                }));
                self.start_monitor(address);
            }

            for (address, previous, new) in changed_servers {
                self.emit(SdamEvent::ServerDescriptionChanged(Box::new(
                    ServerDescriptionChangedEvent {
                        address,
                        topology_id: self.id,
                        previous_description: ServerInfo::new_owned(previous),
                        new_description: ServerInfo::new_owned(new),
                    },
                )));
            }

            for address in removed {
                self.emit(SdamEvent::ServerClosed(ServerClosedEvent {
                    address,
                    topology_id: self.id,
                }));
            }

            self.emit(SdamEvent::TopologyDescriptionChanged(Box::new(
                TopologyDescriptionChangedEvent {
                    topology_id: self.id,
                    previous_description: old_description.into(),
                    new_description: self.publisher.borrow().description.clone().into(),
                },
            )));
        } else {
            self.publisher.send_replace(state);
        }

        changed
    }

    fn start_monitor(&self, address: ServerAddress) {
        Monitor::start(
            address,
            self.prober.clone(),
            self.updater.clone(),
            self.watcher.clone(),
            self.event_emitter.clone(),
            self.check_requester.subscribe(),
            self.options.clone(),
        );
    }

    fn emit(&self, event: SdamEvent) {
        if let Some(ref emitter) = self.event_emitter {
            emitter.emit(event);
        }
    }
}
