use std::time::Duration;

use bson::{doc, oid::ObjectId, Bson, Document};

use super::{TopologyDescription, TopologyType};
use crate::{
    description::server::{ServerDescription, ServerType},
    hello::{HeartbeatOutcome, HelloReply},
    options::{SdamOptions, ServerAddress},
};

fn address(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

fn topology(seeds: &[&str]) -> TopologyDescription {
    let options = SdamOptions::builder()
        .seed_list(seeds.iter().map(|s| address(s)).collect())
        .build();
    TopologyDescription::new(&options)
}

fn replica_set_topology(seeds: &[&str], set_name: &str) -> TopologyDescription {
    let options = SdamOptions::builder()
        .seed_list(seeds.iter().map(|s| address(s)).collect())
        .initial_topology_type(TopologyType::ReplicaSetNoPrimary)
        .set_name(Some(set_name.to_string()))
        .build();
    TopologyDescription::new(&options)
}

fn description(addr: &str, reply: Document) -> ServerDescription {
    ServerDescription::from_heartbeat(
        HeartbeatOutcome::Success {
            address: address(addr),
            reply: HelloReply::parse(reply).unwrap(),
            round_trip_time: Duration::from_millis(10),
        },
        None,
    )
}

fn failed_description(addr: &str) -> ServerDescription {
    ServerDescription::new_from_error(
        &address(addr),
        std::io::Error::from(std::io::ErrorKind::ConnectionReset).into(),
    )
}

fn primary_reply(set_name: &str, hosts: &[&str], primary: &str) -> Document {
    doc! {
        "ok": 1,
        "ismaster": true,
        "setName": set_name,
        "hosts": hosts.iter().map(|h| Bson::from(*h)).collect::<Vec<_>>(),
        "primary": primary,
        "maxWireVersion": 17,
    }
}

fn secondary_reply(set_name: &str, hosts: &[&str]) -> Document {
    doc! {
        "ok": 1,
        "secondary": true,
        "setName": set_name,
        "hosts": hosts.iter().map(|h| Bson::from(*h)).collect::<Vec<_>>(),
        "maxWireVersion": 17,
    }
}

fn server_type(topology: &TopologyDescription, addr: &str) -> Option<ServerType> {
    topology
        .get_server_description(&address(addr))
        .map(|server| server.server_type)
}

fn assert_invariants(topology: &TopologyDescription) {
    let primaries = topology
        .servers
        .values()
        .filter(|server| server.server_type == ServerType::RsPrimary)
        .count();
    if topology.topology_type == TopologyType::ReplicaSetWithPrimary {
        assert_eq!(primaries, 1, "ReplicaSetWithPrimary must have one primary");
    } else {
        assert_eq!(primaries, 0, "{} cannot have a primary", topology.topology_type);
    }

    for (address, server) in topology.servers.iter() {
        assert_eq!(address, &server.address);
        assert_eq!(address.host, address.host.to_lowercase());
    }

    if topology.topology_type == TopologyType::Single {
        assert_eq!(topology.servers.len(), 1);
    }
}

#[test]
fn discovery_from_single_seed() {
    let mut topology = topology(&["a:1"]);
    assert_eq!(topology.topology_type(), TopologyType::Unknown);

    topology
        .update(description(
            "a:1",
            primary_reply("rs", &["a:1", "b:1", "c:1"], "a:1"),
        ))
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.set_name.as_deref(), Some("rs"));
    assert_eq!(topology.servers.len(), 3);
    assert_eq!(server_type(&topology, "a:1"), Some(ServerType::RsPrimary));
    assert_eq!(server_type(&topology, "b:1"), Some(ServerType::Unknown));
    assert_eq!(server_type(&topology, "c:1"), Some(ServerType::Unknown));
    assert_invariants(&topology);
}

#[test]
fn primary_failover_and_election_monotonicity() {
    let mut topology = topology(&["a:1"]);
    topology
        .update(description(
            "a:1",
            primary_reply("rs", &["a:1", "b:1", "c:1"], "a:1"),
        ))
        .unwrap();

    // The primary goes down.
    topology.update(failed_description("a:1")).unwrap();
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);
    assert_eq!(server_type(&topology, "a:1"), Some(ServerType::Unknown));
    assert_invariants(&topology);

    // b wins the election.
    let election_id = ObjectId::from_bytes([2; 12]);
    let mut new_primary = primary_reply("rs", &["a:1", "b:1", "c:1"], "b:1");
    new_primary.insert("setVersion", 2);
    new_primary.insert("electionId", election_id);
    topology.update(description("b:1", new_primary)).unwrap();

    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(server_type(&topology, "b:1"), Some(ServerType::RsPrimary));
    assert_eq!(topology.max_set_version, Some(2));
    assert_eq!(topology.max_election_id, Some(election_id));
    assert_invariants(&topology);

    // The old primary comes back with a stale report and is rejected.
    let mut stale = primary_reply("rs", &["a:1", "b:1", "c:1"], "a:1");
    stale.insert("setVersion", 1);
    stale.insert("electionId", ObjectId::from_bytes([1; 12]));
    topology.update(description("a:1", stale)).unwrap();

    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(server_type(&topology, "a:1"), Some(ServerType::Unknown));
    assert_eq!(server_type(&topology, "b:1"), Some(ServerType::RsPrimary));
    assert_eq!(topology.max_set_version, Some(2));
    assert_eq!(topology.max_election_id, Some(election_id));
    assert_invariants(&topology);
}

#[test]
fn stale_election_id_with_equal_set_version_is_rejected() {
    let mut topology = topology(&["a:1"]);
    let mut reply = primary_reply("rs", &["a:1", "b:1"], "a:1");
    reply.insert("setVersion", 1);
    reply.insert("electionId", ObjectId::from_bytes([5; 12]));
    topology.update(description("a:1", reply)).unwrap();

    let mut stale = primary_reply("rs", &["a:1", "b:1"], "b:1");
    stale.insert("setVersion", 1);
    stale.insert("electionId", ObjectId::from_bytes([3; 12]));
    topology.update(description("b:1", stale)).unwrap();

    assert_eq!(server_type(&topology, "b:1"), Some(ServerType::Unknown));
    assert_eq!(server_type(&topology, "a:1"), Some(ServerType::RsPrimary));
    assert_eq!(topology.max_election_id, Some(ObjectId::from_bytes([5; 12])));
    assert_invariants(&topology);
}

#[test]
fn newer_election_id_demotes_previous_primary() {
    let mut topology = topology(&["a:1"]);
    let mut reply = primary_reply("rs", &["a:1", "b:1"], "a:1");
    reply.insert("setVersion", 1);
    reply.insert("electionId", ObjectId::from_bytes([3; 12]));
    topology.update(description("a:1", reply)).unwrap();

    let mut newer = primary_reply("rs", &["a:1", "b:1"], "b:1");
    newer.insert("setVersion", 1);
    newer.insert("electionId", ObjectId::from_bytes([4; 12]));
    topology.update(description("b:1", newer)).unwrap();

    assert_eq!(server_type(&topology, "b:1"), Some(ServerType::RsPrimary));
    assert_eq!(server_type(&topology, "a:1"), Some(ServerType::Unknown));
    assert_eq!(topology.max_election_id, Some(ObjectId::from_bytes([4; 12])));
    assert_invariants(&topology);
}

#[test]
fn mongos_discovery() {
    let mut topology = topology(&["m1:1", "m2:1"]);

    topology
        .update(description("m1:1", doc! { "ok": 1, "msg": "isdbgrid", "maxWireVersion": 17 }))
        .unwrap();
    assert_eq!(topology.topology_type(), TopologyType::Sharded);

    topology
        .update(description("m2:1", doc! { "ok": 1, "msg": "isdbgrid", "maxWireVersion": 17 }))
        .unwrap();

    assert_eq!(topology.servers.len(), 2);
    assert_eq!(server_type(&topology, "m1:1"), Some(ServerType::Mongos));
    assert_eq!(server_type(&topology, "m2:1"), Some(ServerType::Mongos));
    assert_invariants(&topology);
}

#[test]
fn non_mongos_is_removed_from_sharded_topology() {
    let mut topology = topology(&["m1:1", "m2:1"]);
    topology
        .update(description("m1:1", doc! { "ok": 1, "msg": "isdbgrid" }))
        .unwrap();

    topology
        .update(description("m2:1", primary_reply("rs", &["m2:1"], "m2:1")))
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::Sharded);
    assert!(topology.get_server_description(&address("m2:1")).is_none());
}

#[test]
fn standalone_in_multi_seed_topology_is_removed() {
    let mut topology = topology(&["a:1", "b:1"]);
    topology
        .update(description("a:1", doc! { "ok": 1, "maxWireVersion": 17 }))
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::Unknown);
    assert!(topology.get_server_description(&address("a:1")).is_none());
    assert!(topology.get_server_description(&address("b:1")).is_some());
}

#[test]
fn standalone_single_seed_becomes_single() {
    let mut topology = topology(&["a:1"]);
    topology
        .update(description("a:1", doc! { "ok": 1, "maxWireVersion": 17 }))
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::Single);
    assert_eq!(server_type(&topology, "a:1"), Some(ServerType::Standalone));
    assert_invariants(&topology);
}

#[test]
fn set_name_mismatch_removes_server() {
    let mut topology = replica_set_topology(&["a:1", "b:1"], "rs");

    topology
        .update(description("b:1", secondary_reply("other", &["b:1"])))
        .unwrap();

    assert!(topology.get_server_description(&address("b:1")).is_none());
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);
}

#[test]
fn invalid_me_removes_server() {
    let mut topology = replica_set_topology(&["a:1"], "rs");

    let mut reply = secondary_reply("rs", &["a:1", "b:1", "c:1"]);
    reply.insert("me", "someone-else:1");
    topology.update(description("a:1", reply)).unwrap();

    // The hosts it reported are retained, but the server itself is dropped.
    assert!(topology.get_server_description(&address("a:1")).is_none());
    assert!(topology.get_server_description(&address("b:1")).is_some());
    assert!(topology.get_server_description(&address("c:1")).is_some());
}

#[test]
fn ghost_does_not_change_topology() {
    let mut topology = replica_set_topology(&["a:1"], "rs");
    let before = topology.clone();

    topology
        .update(description("a:1", doc! { "ok": 1, "isreplicaset": true }))
        .unwrap();

    assert_eq!(topology.topology_type(), before.topology_type());
    assert_eq!(topology.servers.len(), before.servers.len());
    assert_eq!(server_type(&topology, "a:1"), Some(ServerType::RsGhost));
}

#[test]
fn demoted_servers_are_removed_when_primary_reports_new_hosts() {
    let mut topology = topology(&["a:1"]);
    topology
        .update(description(
            "a:1",
            primary_reply("rs", &["a:1", "b:1", "c:1"], "a:1"),
        ))
        .unwrap();

    // A new config drops c.
    topology
        .update(description("a:1", primary_reply("rs", &["a:1", "b:1"], "a:1")))
        .unwrap();

    assert_eq!(topology.servers.len(), 2);
    assert!(topology.get_server_description(&address("c:1")).is_none());
    assert_invariants(&topology);
}

#[test]
fn reapplying_the_same_outcome_is_idempotent() {
    let mut topology = topology(&["a:1"]);
    let reply = primary_reply("rs", &["a:1", "b:1"], "a:1");

    topology.update(description("a:1", reply.clone())).unwrap();
    let first = topology.clone();

    topology.update(description("a:1", reply)).unwrap();
    assert_eq!(topology, first);
    assert!(first.diff(&topology).is_none());
}

#[test]
fn updates_for_unknown_addresses_are_ignored() {
    let mut topology = topology(&["a:1"]);
    let before = topology.clone();

    topology
        .update(description("z:1", secondary_reply("rs", &["z:1"])))
        .unwrap();

    assert_eq!(topology, before);
}

#[test]
fn compatibility_error_is_recorded_and_cleared() {
    let mut topology = topology(&["a:1"]);

    let mut reply = primary_reply("rs", &["a:1"], "a:1");
    reply.insert("minWireVersion", 0);
    reply.insert("maxWireVersion", 2);
    topology.update(description("a:1", reply)).unwrap();

    assert!(!topology.is_compatible());
    assert!(topology.compatibility_error().is_some());

    topology
        .update(description("a:1", primary_reply("rs", &["a:1"], "a:1")))
        .unwrap();
    assert!(topology.is_compatible());
}

#[test]
fn logical_session_timeout_is_minimum_across_data_bearing_servers() {
    let mut topology = topology(&["a:1"]);

    let mut primary = primary_reply("rs", &["a:1", "b:1", "c:1"], "a:1");
    primary.insert("logicalSessionTimeoutMinutes", 30);
    topology.update(description("a:1", primary)).unwrap();
    assert_eq!(
        topology.logical_session_timeout,
        Some(Duration::from_secs(30 * 60))
    );

    let mut secondary = secondary_reply("rs", &["a:1", "b:1", "c:1"]);
    secondary.insert("logicalSessionTimeoutMinutes", 20);
    topology.update(description("b:1", secondary)).unwrap();
    assert_eq!(
        topology.logical_session_timeout,
        Some(Duration::from_secs(20 * 60))
    );

    // A data-bearing server without a value forces the topology's to None.
    let secondary = secondary_reply("rs", &["a:1", "b:1", "c:1"]);
    topology.update(description("c:1", secondary)).unwrap();
    assert_eq!(topology.logical_session_timeout, None);
}

#[test]
fn single_topology_with_mismatched_set_name_marks_server_unknown() {
    let options = SdamOptions::builder()
        .seed_list(vec![address("a:1")])
        .initial_topology_type(TopologyType::Single)
        .set_name(Some("rs".to_string()))
        .build();
    let mut topology = TopologyDescription::new(&options);

    topology
        .update(description("a:1", primary_reply("other", &["a:1"], "a:1")))
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::Single);
    assert_eq!(server_type(&topology, "a:1"), Some(ServerType::Unknown));
    assert!(topology
        .get_server_description(&address("a:1"))
        .unwrap()
        .error()
        .is_some());
}

#[test]
fn max_set_version_never_decreases() {
    let mut topology = topology(&["a:1"]);
    let mut observed = Vec::new();

    for (addr, set_version, election) in [
        ("a:1", 1, 1u8),
        ("a:1", 3, 2),
        ("a:1", 2, 3),
        ("a:1", 5, 4),
        ("a:1", 4, 5),
    ] {
        let mut reply = primary_reply("rs", &["a:1"], "a:1");
        reply.insert("setVersion", set_version);
        reply.insert("electionId", ObjectId::from_bytes([election; 12]));
        topology.update(description(addr, reply)).unwrap();
        observed.push(topology.max_set_version.unwrap());
    }

    assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(topology.max_set_version, Some(5));
}
