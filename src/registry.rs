use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
    },
};

use bson::{doc, Document};

use crate::{
    error::{ErrorKind, Result},
    hello::HeartbeatProber,
    manager::TopologyManager,
    options::SdamOptions,
};

/// Manages the lifetime of a set of topology monitors, keyed by deployment name.
///
/// A process that talks to several deployments (for example, a router that watches many
/// replica sets) constructs one registry and creates or retrieves managers through it.
/// There is deliberately no process-global instance; callers own their registry and tests
/// build their own.
pub struct MonitorRegistry {
    prober: Arc<dyn HeartbeatProber>,
    monitors: Mutex<HashMap<String, Arc<TopologyManager>>>,
    is_shutdown: AtomicBool,
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MonitorRegistry")
            .field("monitors", &self.monitor_names())
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}

impl MonitorRegistry {
    /// Creates an empty registry whose managers will all probe through `prober`.
    pub fn new(prober: Arc<dyn HeartbeatProber>) -> Self {
        Self {
            prober,
            monitors: Mutex::new(HashMap::new()),
            is_shutdown: AtomicBool::new(false),
        }
    }

    /// Retrieves the manager registered under `name`, if there is one.
    pub fn get_monitor(&self, name: &str) -> Option<Arc<TopologyManager>> {
        self.monitors.lock().unwrap().get(name).cloned()
    }

    /// Creates a manager for `name` from `options`, or retrieves the existing one.
    ///
    /// The options are only used when no manager is registered under `name` yet.
    pub fn get_or_create_monitor(
        &self,
        name: &str,
        options: SdamOptions,
    ) -> Result<Arc<TopologyManager>> {
        if self.is_shutdown() {
            return Err(ErrorKind::ShuttingDown.into());
        }

        let mut monitors = self.monitors.lock().unwrap();
        if let Some(existing) = monitors.get(name) {
            return Ok(existing.clone());
        }

        tracing::debug!(name = %name, "starting a new topology monitor");
        let manager = Arc::new(TopologyManager::new(options, self.prober.clone())?);
        monitors.insert(name.to_string(), manager.clone());
        Ok(manager)
    }

    /// The names of all deployments tracked by this registry.
    pub fn monitor_names(&self) -> Vec<String> {
        self.monitors.lock().unwrap().keys().cloned().collect()
    }

    /// Stops and unregisters the manager under `name`, if it exists.
    ///
    /// Callers still holding the manager see its operations fail with a shutdown error.
    pub async fn remove_monitor(&self, name: &str) {
        let removed = self.monitors.lock().unwrap().remove(name);
        if let Some(manager) = removed {
            manager.shutdown().await;
        }
    }

    /// Stops and unregisters every manager. The registry refuses to create new ones
    /// afterwards.
    pub async fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::SeqCst);

        let monitors: Vec<_> = self.monitors.lock().unwrap().drain().collect();
        for (name, manager) in monitors {
            tracing::debug!(name = %name, "shutting down topology monitor");
            manager.shutdown().await;
        }
    }

    /// Whether [`shutdown`](MonitorRegistry::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Reports information about the deployments tracked by this registry, for diagnostic
    /// purposes.
    pub fn report(&self) -> Document {
        let monitors = self.monitors.lock().unwrap();

        let mut sets = Document::new();
        for (name, manager) in monitors.iter() {
            let description = manager.topology_description();

            let mut servers = Vec::new();
            for (address, server) in description.servers() {
                let mut server_doc = doc! {
                    "address": address.to_string(),
                    "type": format!("{:?}", server.server_type()),
                };
                if let Some(rtt) = server.average_round_trip_time() {
                    server_doc.insert(
                        "averageRttMillis",
                        i64::try_from(rtt.as_millis()).unwrap_or(i64::MAX),
                    );
                }
                servers.push(server_doc);
            }

            sets.insert(
                name.clone(),
                doc! {
                    "topologyType": description.topology_type().to_string(),
                    "compatible": description.is_compatible(),
                    "servers": servers,
                },
            );
        }

        doc! {
            "numMonitors": monitors.len() as i32,
            "monitors": sets,
        }
    }
}
