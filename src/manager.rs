use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    description::topology::choose_n,
    error::{Error, ErrorKind, Result},
    event::TopologyDescription,
    hello::HeartbeatProber,
    options::{SdamOptions, ServerAddress},
    selection_criteria::SelectionCriteria,
    topology::Topology,
};

/// The entry point of the SDAM engine: maintains a continuously updated view of a deployment
/// and selects servers from it on demand.
///
/// Constructing a manager spawns one monitor task per seed; the monitors discover the rest of
/// the deployment from heartbeat replies, and the manager keeps an immutable snapshot of the
/// resulting topology available at all times. Server selection parks the caller until the
/// snapshot satisfies its read preference or the timeout elapses.
///
/// All handles to the manager (and all clones of the data it hands out) can be dropped at any
/// time; background tasks shut themselves down once the manager itself is dropped.
#[derive(Debug)]
pub struct TopologyManager {
    topology: Topology,
    options: SdamOptions,
    closed: AtomicBool,
}

impl TopologyManager {
    /// Starts monitoring the deployment described by `options`, issuing heartbeats through
    /// `prober`.
    ///
    /// Must be called from within a tokio runtime. Returns an error if the options are not a
    /// valid configuration.
    pub fn new(options: SdamOptions, prober: Arc<dyn HeartbeatProber>) -> Result<Self> {
        options.validate()?;

        let topology = Topology::new(options.clone(), prober);

        Ok(Self {
            topology,
            options,
            closed: AtomicBool::new(false),
        })
    }

    /// Gets a snapshot of the manager's current view of the topology.
    pub fn topology_description(&self) -> TopologyDescription {
        self.topology.watcher().peek_latest().description.into()
    }

    /// Returns the address of a server satisfying `criteria`, waiting up to `max_wait` for
    /// one to appear.
    ///
    /// When several servers within the latency window satisfy the criteria, one is chosen
    /// uniformly at random. If `max_wait` is `None`, the configured server selection timeout
    /// is used.
    pub async fn get_host_or_refresh(
        &self,
        criteria: &SelectionCriteria,
        max_wait: impl Into<Option<Duration>>,
    ) -> Result<ServerAddress> {
        let hosts = self.get_hosts_or_refresh(criteria, max_wait).await?;
        let chosen = choose_n(&hosts, 1)
            .next()
            .cloned()
            .ok_or_else(|| Error::internal("server selection returned an empty list"));
        chosen
    }

    /// Returns the addresses of all servers satisfying `criteria` within the latency window,
    /// waiting up to `max_wait` for at least one to appear.
    ///
    /// On success the returned list is non-empty. Fails with a server selection error if no
    /// suitable server appeared before the deadline, or immediately if the topology contains
    /// an incompatible server or the manager has been shut down.
    pub async fn get_hosts_or_refresh(
        &self,
        criteria: &SelectionCriteria,
        max_wait: impl Into<Option<Duration>>,
    ) -> Result<Vec<ServerAddress>> {
        if self.is_closed() {
            return Err(ErrorKind::ShuttingDown.into());
        }

        let timeout = max_wait
            .into()
            .unwrap_or_else(|| self.options.server_selection_timeout());
        let start_time = Instant::now();
        let mut watcher = self.topology.watcher();

        loop {
            let state = watcher.observe_latest();

            let in_window = state
                .description
                .suitable_servers_in_latency_window(criteria)?;
            if !in_window.is_empty() {
                return Ok(in_window
                    .into_iter()
                    .map(|server| server.address.clone())
                    .collect());
            }

            // Nothing suitable yet: expedite monitoring and park until the topology changes
            // or the deadline passes. A wake-up always observes the snapshot that woke it.
            self.topology.request_check();

            let remaining = timeout.saturating_sub(start_time.elapsed());
            if remaining.is_zero() || !watcher.wait_for_update(remaining).await {
                if !watcher.is_alive() {
                    return Err(ErrorKind::ShuttingDown.into());
                }

                return Err(ErrorKind::ServerSelection {
                    message: state
                        .description
                        .server_selection_timeout_error_message(criteria),
                }
                .into());
            }
        }
    }

    /// Reports that an application operation against `address` failed with `error`.
    ///
    /// State-change errors ("not writable primary", "node is recovering") and non-timeout
    /// network errors mark the server as unknown and expedite monitoring so it is
    /// re-discovered promptly; other errors have no topology effect. Returns whether the
    /// topology changed as a result.
    pub async fn failed_host(&self, address: ServerAddress, error: Error) -> bool {
        if self.is_closed() {
            return false;
        }
        self.topology.handle_application_error(address, error).await
    }

    /// Requests that all monitors check their servers as soon as possible.
    ///
    /// Server selection does this automatically whenever it cannot be satisfied immediately;
    /// this is exposed for tests and for callers with out-of-band knowledge that the topology
    /// has changed.
    pub fn request_immediate_check(&self) {
        if self.is_closed() {
            return;
        }
        self.topology.request_check();
    }

    /// Stops monitoring: cancels the monitors, wakes any parked server selection operations
    /// with an error, and publishes the topology closed event. Subsequent calls on this
    /// manager are no-ops that fail with a shutdown error where applicable.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.topology.shutdown().await;
    }

    /// Whether [`shutdown`](TopologyManager::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
