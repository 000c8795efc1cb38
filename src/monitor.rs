use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    description::topology::TopologyType,
    event::{
        SdamEvent,
        SdamEventEmitter,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{HeartbeatOutcome, HeartbeatProber},
    options::{SdamOptions, ServerAddress},
    runtime,
    topology::{TopologyCheckRequestReceiver, TopologyUpdater, TopologyWatcher},
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// Monitor that performs regular heartbeats to determine server status.
///
/// One monitor task runs per server in the topology; it exits on its own once its address
/// leaves the topology or the topology shuts down.
pub(crate) struct Monitor {
    address: ServerAddress,
    prober: Arc<dyn HeartbeatProber>,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    sdam_event_emitter: Option<SdamEventEmitter>,
    check_request_receiver: TopologyCheckRequestReceiver,
    options: SdamOptions,

    /// Whether this monitor is probing at the minimum cadence because a server selection
    /// operation is parked. Cleared once the topology settles.
    expedited: bool,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        address: ServerAddress,
        prober: Arc<dyn HeartbeatProber>,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        sdam_event_emitter: Option<SdamEventEmitter>,
        check_request_receiver: TopologyCheckRequestReceiver,
        options: SdamOptions,
    ) {
        let monitor = Self {
            address,
            prober,
            topology_updater,
            topology_watcher,
            sdam_event_emitter,
            check_request_receiver,
            options,
            expedited: false,
        };
        runtime::execute(monitor.execute())
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self.options.heartbeat_frequency();
        let min_frequency = self.options.min_heartbeat_frequency();

        tracing::debug!(address = %self.address, "starting monitor");

        while self.is_alive() {
            self.check_server().await;

            if self.expedited && self.topology_settled() {
                tracing::debug!(address = %self.address, "leaving expedited monitoring mode");
                self.expedited = false;
            }

            runtime::delay_for(min_frequency).await;

            if !self.expedited {
                let wait = heartbeat_frequency.saturating_sub(min_frequency);
                if self.check_request_receiver.wait_for_check_request(wait).await {
                    tracing::debug!(
                        address = %self.address,
                        "monitoring in expedited mode until the topology settles"
                    );
                    self.expedited = true;
                }
            }
        }

        tracing::debug!(address = %self.address, "stopping monitor");
    }

    fn is_alive(&self) -> bool {
        self.topology_watcher.is_alive() && self.topology_watcher.server_exists(&self.address)
    }

    /// Whether the topology has reached a state in which the fast probing cadence no longer
    /// buys anything: a usable primary is known, or the comparable condition for
    /// non-replica-set topologies.
    fn topology_settled(&self) -> bool {
        matches!(
            self.topology_watcher.topology_type(),
            TopologyType::Single | TopologyType::Sharded | TopologyType::ReplicaSetWithPrimary
        )
    }

    /// Checks the server by issuing a heartbeat through the prober and routing the outcome to
    /// the topology.
    async fn check_server(&mut self) {
        // An immediate-check request that arrives while this probe is outstanding is
        // satisfied by this probe; drain pending requests first.
        self.check_request_receiver.clear_check_requests();

        self.emit_event(|| {
            SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
            })
        });

        let timeout = self.options.heartbeat_timeout();
        let start = Instant::now();
        let result = runtime::timeout(timeout, self.prober.probe(self.address.clone()))
            .await
            .and_then(|probe_result| probe_result);
        let duration = start.elapsed();

        let outcome = match result {
            Ok(reply) => {
                self.emit_event(|| {
                    SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply.raw_command_response.clone(),
                        server_address: self.address.clone(),
                    })
                });
                HeartbeatOutcome::Success {
                    address: self.address.clone(),
                    reply,
                    round_trip_time: duration,
                }
            }
            Err(error) => {
                tracing::debug!(
                    address = %self.address,
                    error = %error,
                    "heartbeat failed"
                );
                self.emit_event(|| {
                    SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                        duration,
                        failure: error.clone(),
                        server_address: self.address.clone(),
                    })
                });
                HeartbeatOutcome::Failure {
                    address: self.address.clone(),
                    error,
                    round_trip_time: Some(duration),
                }
            }
        };

        self.topology_updater.update(outcome).await;
    }

    fn emit_event<F>(&self, event: F)
    where
        F: FnOnce() -> SdamEvent,
    {
        if let Some(ref emitter) = self.sdam_event_emitter {
            emitter.emit(event())
        }
    }
}
