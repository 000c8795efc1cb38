use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bson::{doc, oid::ObjectId, Bson, Document};
use futures_core::future::BoxFuture;
use futures_util::FutureExt;

use crate::{
    error::{CommandError, ErrorKind, Result},
    event::{
        SdamEventHandler,
        ServerClosedEvent,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    hello::{HeartbeatProber, HelloReply},
    manager::TopologyManager,
    options::{SdamOptions, ServerAddress},
    registry::MonitorRegistry,
    selection_criteria::{ReadPreference, SelectionCriteria},
    ServerType,
    TopologyType,
};

fn address(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

fn primary_criteria() -> SelectionCriteria {
    SelectionCriteria::ReadPreference(ReadPreference::Primary)
}

/// A prober that replies from a scripted table of canned responses. Addresses without an
/// entry fail as if unreachable.
#[derive(Clone, Default)]
struct ScriptedProber {
    responses: Arc<Mutex<HashMap<ServerAddress, Result<Document>>>>,
}

impl ScriptedProber {
    fn new() -> Self {
        Default::default()
    }

    fn respond(&self, addr: &str, reply: Document) {
        self.responses
            .lock()
            .unwrap()
            .insert(address(addr), Ok(reply));
    }

    fn fail(&self, addr: &str) {
        self.responses.lock().unwrap().insert(
            address(addr),
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into()),
        );
    }
}

impl HeartbeatProber for ScriptedProber {
    fn probe(&self, address: ServerAddress) -> BoxFuture<'static, Result<HelloReply>> {
        let result = self
            .responses
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_else(|| {
                Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into())
            });
        async move { result.and_then(HelloReply::parse) }.boxed()
    }
}

fn hosts(members: &[&str]) -> Vec<Bson> {
    members.iter().map(|m| Bson::from(*m)).collect()
}

fn primary_reply(members: &[&str], primary: &str) -> Document {
    doc! {
        "ok": 1,
        "ismaster": true,
        "setName": "rs",
        "hosts": hosts(members),
        "primary": primary,
        "maxWireVersion": 17,
    }
}

fn secondary_reply(members: &[&str], primary: &str) -> Document {
    doc! {
        "ok": 1,
        "secondary": true,
        "setName": "rs",
        "hosts": hosts(members),
        "primary": primary,
        "maxWireVersion": 17,
    }
}

/// Options with a fast probe cadence so the tests complete quickly. The heartbeat frequency
/// stays deliberately long relative to the expedited cadence to make expedited behavior
/// observable.
fn fast_options(seeds: &[&str], heartbeat_frequency: Duration) -> SdamOptions {
    let mut options = SdamOptions::builder()
        .seed_list(seeds.iter().map(|s| address(s)).collect())
        .heartbeat_frequency(Some(heartbeat_frequency))
        .build();
    options.min_heartbeat_frequency = Some(Duration::from_millis(10));
    options
}

fn manager(options: SdamOptions, prober: &ScriptedProber) -> TopologyManager {
    TopologyManager::new(options, Arc::new(prober.clone())).unwrap()
}

#[derive(Clone, Default)]
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventCollector {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn contains(&self, event: &str) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == event)
    }
}

impl SdamEventHandler for EventCollector {
    fn handle_server_description_changed_event(&self, event: ServerDescriptionChangedEvent) {
        self.push(format!("server description changed {}", event.address));
    }

    fn handle_server_opening_event(&self, event: ServerOpeningEvent) {
        self.push(format!("server opening {}", event.address));
    }

    fn handle_server_closed_event(&self, event: ServerClosedEvent) {
        self.push(format!("server closed {}", event.address));
    }

    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {
        self.push("topology description changed");
    }

    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {
        self.push("topology opening");
    }

    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {
        self.push("topology closed");
    }

    fn handle_server_heartbeat_started_event(&self, event: ServerHeartbeatStartedEvent) {
        self.push(format!("heartbeat started {}", event.server_address));
    }

    fn handle_server_heartbeat_succeeded_event(&self, event: ServerHeartbeatSucceededEvent) {
        self.push(format!("heartbeat succeeded {}", event.server_address));
    }

    fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {
        self.push(format!("heartbeat failed {}", event.server_address));
    }
}

#[tokio::test]
async fn discovery_from_single_seed() {
    let members = &["a:1", "b:1", "c:1"];
    let prober = ScriptedProber::new();
    prober.respond("a:1", primary_reply(members, "a:1"));
    prober.respond("b:1", secondary_reply(members, "a:1"));
    prober.respond("c:1", secondary_reply(members, "a:1"));

    let manager = manager(
        fast_options(&["a:1"], Duration::from_millis(50)),
        &prober,
    );

    let host = manager
        .get_host_or_refresh(&primary_criteria(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(host, address("a:1"));

    // The monitors discover the rest of the set from the primary's reply.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let description = manager.topology_description();
        let servers = description.servers();
        if description.topology_type() == TopologyType::ReplicaSetWithPrimary
            && servers.len() == 3
            && servers
                .values()
                .all(|server| server.server_type() != ServerType::Unknown)
        {
            break;
        }
        assert!(Instant::now() < deadline, "discovery did not complete");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn parked_caller_is_woken_by_heartbeat() {
    let prober = ScriptedProber::new();
    prober.fail("a:1");

    // The heartbeat frequency is far longer than the test: only an expedited monitor can
    // satisfy the parked caller in time.
    let manager = manager(fast_options(&["a:1"], Duration::from_secs(10)), &prober);

    let flipper = prober.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        flipper.respond("a:1", primary_reply(&["a:1"], "a:1"));
    });

    let start = Instant::now();
    let host = manager
        .get_host_or_refresh(&primary_criteria(), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(host, address("a:1"));
    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(3),
        "caller should be woken promptly, took {:?}",
        elapsed
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn server_selection_times_out() {
    let prober = ScriptedProber::new();
    prober.fail("a:1");

    let manager = manager(fast_options(&["a:1"], Duration::from_millis(50)), &prober);

    let start = Instant::now();
    let error = manager
        .get_host_or_refresh(&primary_criteria(), Duration::from_millis(500))
        .await
        .unwrap_err();

    assert!(error.is_server_selection_error(), "got {:?}", error);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(400), "returned too early");
    assert!(elapsed < Duration::from_secs(3), "returned too late");

    manager.shutdown().await;
}

#[tokio::test]
async fn primary_failover() {
    let members = &["a:1", "b:1"];
    let prober = ScriptedProber::new();
    prober.respond("a:1", primary_reply(members, "a:1"));
    prober.respond("b:1", secondary_reply(members, "a:1"));

    let manager = manager(fast_options(&["a:1"], Duration::from_millis(50)), &prober);

    let host = manager
        .get_host_or_refresh(&primary_criteria(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(host, address("a:1"));

    // a goes down and b is elected.
    prober.fail("a:1");
    let mut elected = primary_reply(members, "b:1");
    elected.insert("setVersion", 2);
    elected.insert("electionId", ObjectId::from_bytes([2; 12]));
    prober.respond("b:1", elected);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let host = manager
            .get_host_or_refresh(&primary_criteria(), Duration::from_secs(5))
            .await
            .unwrap();
        if host == address("b:1") {
            break;
        }
        assert!(Instant::now() < deadline, "failover was not observed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn failed_host_demotes_server() {
    let members = &["a:1", "b:1"];
    let prober = ScriptedProber::new();
    prober.respond("a:1", primary_reply(members, "a:1"));
    prober.respond("b:1", secondary_reply(members, "a:1"));

    let manager = manager(fast_options(&["a:1"], Duration::from_secs(10)), &prober);

    manager
        .get_host_or_refresh(&primary_criteria(), Duration::from_secs(5))
        .await
        .unwrap();

    // Take the primary down before reporting the failure so the next heartbeat cannot
    // immediately undo the demotion.
    prober.fail("a:1");

    let changed = manager
        .failed_host(
            address("a:1"),
            std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into(),
        )
        .await;
    assert!(changed);

    let description = manager.topology_description();
    assert_ne!(
        description.topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );
    let servers = description.servers();
    assert_eq!(
        servers.get(&address("a:1")).unwrap().server_type(),
        ServerType::Unknown
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn failed_host_with_state_change_error_demotes_server() {
    let members = &["a:1"];
    let prober = ScriptedProber::new();
    prober.respond("a:1", primary_reply(members, "a:1"));

    let manager = manager(fast_options(&["a:1"], Duration::from_secs(10)), &prober);
    manager
        .get_host_or_refresh(&primary_criteria(), Duration::from_secs(5))
        .await
        .unwrap();

    prober.fail("a:1");
    let not_primary = CommandError {
        code: 10107,
        code_name: "NotWritablePrimary".to_string(),
        message: "not primary".to_string(),
    };
    assert!(manager.failed_host(address("a:1"), not_primary.into()).await);

    let description = manager.topology_description();
    let servers = description.servers();
    assert_eq!(
        servers.get(&address("a:1")).unwrap().server_type(),
        ServerType::Unknown
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn failed_host_ignores_ordinary_command_errors() {
    let members = &["a:1"];
    let prober = ScriptedProber::new();
    prober.respond("a:1", primary_reply(members, "a:1"));

    let manager = manager(fast_options(&["a:1"], Duration::from_secs(10)), &prober);
    manager
        .get_host_or_refresh(&primary_criteria(), Duration::from_secs(5))
        .await
        .unwrap();

    let ordinary = CommandError {
        code: 59,
        code_name: "CommandNotFound".to_string(),
        message: "no such command".to_string(),
    };
    assert!(!manager.failed_host(address("a:1"), ordinary.into()).await);

    let description = manager.topology_description();
    let servers = description.servers();
    assert_eq!(
        servers.get(&address("a:1")).unwrap().server_type(),
        ServerType::RsPrimary
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn removed_server_is_dropped_from_topology() {
    let members = &["a:1", "b:1", "c:1"];
    let prober = ScriptedProber::new();
    prober.respond("a:1", primary_reply(members, "a:1"));
    prober.respond("b:1", secondary_reply(members, "a:1"));
    prober.respond("c:1", secondary_reply(members, "a:1"));

    let events = EventCollector::default();
    let mut options = fast_options(&["a:1"], Duration::from_millis(50));
    options.sdam_event_handler = Some(Arc::new(events.clone()));
    let manager = manager(options, &prober);

    manager
        .get_host_or_refresh(&primary_criteria(), Duration::from_secs(5))
        .await
        .unwrap();

    // A new replica set config drops c.
    prober.respond("a:1", primary_reply(&["a:1", "b:1"], "a:1"));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let description = manager.topology_description();
        if !description.servers().contains_key(&address("c:1")) {
            break;
        }
        assert!(Instant::now() < deadline, "c:1 was not removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Give event delivery a moment to drain.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.contains("server closed c:1"));

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_wakes_parked_callers_and_rejects_new_ones() {
    let prober = ScriptedProber::new();
    prober.fail("a:1");

    let manager = Arc::new(manager(
        fast_options(&["a:1"], Duration::from_millis(50)),
        &prober,
    ));

    let parked = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .get_host_or_refresh(&primary_criteria(), Duration::from_secs(30))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(1), parked)
        .await
        .expect("parked caller should be woken by shutdown")
        .unwrap();
    assert!(matches!(
        result.unwrap_err().kind.as_ref(),
        ErrorKind::ShuttingDown
    ));

    let error = manager
        .get_host_or_refresh(&primary_criteria(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(error.kind.as_ref(), ErrorKind::ShuttingDown));

    // Shutting down twice is a no-op.
    manager.shutdown().await;
}

#[tokio::test]
async fn sdam_events_are_published() {
    let prober = ScriptedProber::new();
    prober.respond("a:1", primary_reply(&["a:1"], "a:1"));

    let events = EventCollector::default();
    let mut options = fast_options(&["a:1"], Duration::from_millis(50));
    options.sdam_event_handler = Some(Arc::new(events.clone()));
    let manager = manager(options, &prober);

    manager
        .get_host_or_refresh(&primary_criteria(), Duration::from_secs(5))
        .await
        .unwrap();
    manager.shutdown().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    for expected in [
        "topology opening",
        "server opening a:1",
        "topology description changed",
        "heartbeat started a:1",
        "heartbeat succeeded a:1",
        "server description changed a:1",
        "server closed a:1",
        "topology closed",
    ] {
        assert!(events.contains(expected), "missing event: {}", expected);
    }
}

#[tokio::test]
async fn heartbeat_failed_events_are_published() {
    let prober = ScriptedProber::new();
    prober.fail("a:1");

    let events = EventCollector::default();
    let mut options = fast_options(&["a:1"], Duration::from_millis(50));
    options.sdam_event_handler = Some(Arc::new(events.clone()));
    let manager = manager(options, &prober);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.contains("heartbeat failed a:1"));

    manager.shutdown().await;
}

#[test]
fn configuration_validation() {
    let empty_seeds = SdamOptions::builder().seed_list(Vec::new()).build();
    assert!(matches!(
        empty_seeds.validate().unwrap_err().kind.as_ref(),
        ErrorKind::InvalidSeedList { .. }
    ));

    let single_with_two_seeds = SdamOptions::builder()
        .seed_list(vec![address("a:1"), address("b:1")])
        .initial_topology_type(TopologyType::Single)
        .build();
    assert!(matches!(
        single_with_two_seeds.validate().unwrap_err().kind.as_ref(),
        ErrorKind::InvalidSeedList { .. }
    ));

    let replica_set_without_name = SdamOptions::builder()
        .seed_list(vec![address("a:1")])
        .initial_topology_type(TopologyType::ReplicaSetNoPrimary)
        .build();
    assert!(matches!(
        replica_set_without_name.validate().unwrap_err().kind.as_ref(),
        ErrorKind::InvalidTopologyType { .. }
    ));

    let sharded_with_name = SdamOptions::builder()
        .seed_list(vec![address("a:1")])
        .initial_topology_type(TopologyType::Sharded)
        .set_name(Some("rs".to_string()))
        .build();
    assert!(matches!(
        sharded_with_name.validate().unwrap_err().kind.as_ref(),
        ErrorKind::InvalidTopologyType { .. }
    ));

    let starts_with_primary = SdamOptions::builder()
        .seed_list(vec![address("a:1")])
        .initial_topology_type(TopologyType::ReplicaSetWithPrimary)
        .build();
    assert!(matches!(
        starts_with_primary.validate().unwrap_err().kind.as_ref(),
        ErrorKind::InvalidTopologyType { .. }
    ));

    let too_frequent = SdamOptions::builder()
        .seed_list(vec![address("a:1")])
        .heartbeat_frequency(Some(Duration::from_millis(100)))
        .build();
    assert!(matches!(
        too_frequent.validate().unwrap_err().kind.as_ref(),
        ErrorKind::InvalidHeartbeatFrequency { .. }
    ));

    let valid = SdamOptions::builder()
        .seed_list(vec![address("a:1")])
        .set_name(Some("rs".to_string()))
        .initial_topology_type(TopologyType::ReplicaSetNoPrimary)
        .build();
    assert!(valid.validate().is_ok());
}

#[tokio::test]
async fn get_hosts_returns_all_servers_in_window() {
    let members = &["m1:1", "m2:1"];
    let prober = ScriptedProber::new();
    prober.respond("m1:1", doc! { "ok": 1, "msg": "isdbgrid", "maxWireVersion": 17 });
    prober.respond("m2:1", doc! { "ok": 1, "msg": "isdbgrid", "maxWireVersion": 17 });

    let manager = manager(
        fast_options(members, Duration::from_millis(50)),
        &prober,
    );

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest {
        tag_sets: None,
        max_staleness: None,
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let hosts = manager
            .get_hosts_or_refresh(&criteria, Duration::from_secs(5))
            .await
            .unwrap();
        if hosts.len() == 2 {
            assert!(hosts.contains(&address("m1:1")));
            assert!(hosts.contains(&address("m2:1")));
            break;
        }
        assert!(Instant::now() < deadline, "both mongos should be selectable");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(
        manager.topology_description().topology_type(),
        TopologyType::Sharded
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn registry_creates_and_reuses_monitors() {
    let prober = ScriptedProber::new();
    prober.respond("a:1", primary_reply(&["a:1"], "a:1"));
    prober.respond("m:1", doc! { "ok": 1, "msg": "isdbgrid", "maxWireVersion": 17 });

    let registry = MonitorRegistry::new(Arc::new(prober.clone()));

    let rs = registry
        .get_or_create_monitor("rs", fast_options(&["a:1"], Duration::from_millis(50)))
        .unwrap();
    let sharded = registry
        .get_or_create_monitor("cluster", fast_options(&["m:1"], Duration::from_millis(50)))
        .unwrap();

    // Asking again returns the registered manager, ignoring the new options.
    let rs_again = registry
        .get_or_create_monitor("rs", fast_options(&["z:1"], Duration::from_millis(50)))
        .unwrap();
    assert!(Arc::ptr_eq(&rs, &rs_again));
    assert!(registry.get_monitor("nonexistent").is_none());

    let mut names = registry.monitor_names();
    names.sort();
    assert_eq!(names, vec!["cluster".to_string(), "rs".to_string()]);

    rs.get_host_or_refresh(&primary_criteria(), Duration::from_secs(5))
        .await
        .unwrap();

    let report = registry.report();
    assert_eq!(report.get_i32("numMonitors").unwrap(), 2);
    let monitors = report.get_document("monitors").unwrap();
    assert!(monitors.contains_key("rs"));
    assert!(monitors.contains_key("cluster"));

    registry.remove_monitor("rs").await;
    assert!(rs.is_closed());
    assert!(registry.get_monitor("rs").is_none());

    registry.shutdown().await;
    assert!(sharded.is_closed());
    assert!(matches!(
        registry
            .get_or_create_monitor("rs", fast_options(&["a:1"], Duration::from_millis(50)))
            .unwrap_err()
            .kind
            .as_ref(),
        ErrorKind::ShuttingDown
    ));
}

#[tokio::test]
async fn monitors_respect_the_heartbeat_frequency_when_idle() {
    let prober = ScriptedProber::new();
    prober.respond("a:1", primary_reply(&["a:1"], "a:1"));

    let events = EventCollector::default();
    let mut options = fast_options(&["a:1"], Duration::from_millis(200));
    options.sdam_event_handler = Some(Arc::new(events.clone()));
    let _manager = manager(options, &prober);

    // No selection is parked, so after the initial check the monitor should settle into
    // the configured cadence rather than the expedited one.
    tokio::time::sleep(Duration::from_millis(700)).await;

    let started = events
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.as_str() == "heartbeat started a:1")
        .count();
    assert!(started >= 2, "expected periodic checks, saw {}", started);
    assert!(started <= 8, "checks arrived too fast: {}", started);
}
