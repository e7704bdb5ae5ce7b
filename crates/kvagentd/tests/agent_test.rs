//! End-to-end tests of the agent against the simulated dataplane.

use kvagentd::descriptors::{bd_interface, bridge_domain, interface, l2_fib, BridgeDomain, Interface};
use kvagentd::{AgentConfig, AgentDaemon, SimDataplane};
use kvagentd::descriptors::{FibEntry, InterfaceKind};
use kvscheduler::{value, KeyValuePair, TransactionError, TxnOperation, TxnReport, ValueOrigin, ValueState};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

const DESIRED: &str = r#"
interfaces:
  - name: tap1
    enabled: true
bridge_domains:
  - name: bd1
    interfaces: [tap1, eth0]
fib_entries:
  - bridge_domain: bd1
    mac: "02:00:00:00:00:aa"
    outgoing_interface: tap1
"#;

fn desired_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

async fn start(file: &NamedTempFile) -> (AgentDaemon, Arc<SimDataplane>) {
    let dataplane = Arc::new(SimDataplane::with_physical_ports(["eth0"]));
    let mut config = AgentConfig::default();
    config.agent.desired_config = Some(file.path().to_path_buf());
    config.agent.log_status_updates = false;
    let mut daemon = AgentDaemon::new(config, dataplane.clone()).unwrap();
    daemon.init().await.unwrap();
    (daemon, dataplane)
}

fn member_names(dp: &SimDataplane, bd: &str) -> BTreeSet<String> {
    let bd_index = dp.bridge_domain_index(bd).unwrap();
    dp.bridge_domain(bd_index)
        .unwrap()
        .members
        .iter()
        .map(|idx| dp.interface(*idx).unwrap().name)
        .collect()
}

/// Agent without a desired-state file.
async fn bare_agent() -> (AgentDaemon, Arc<SimDataplane>) {
    let dataplane = Arc::new(SimDataplane::with_physical_ports(["eth0"]));
    let mut config = AgentConfig::default();
    config.agent.log_status_updates = false;
    let mut daemon = AgentDaemon::new(config, dataplane.clone()).unwrap();
    daemon.init().await.unwrap();
    (daemon, dataplane)
}

fn fib(bd: &str, mac: &str, iface: &str) -> KeyValuePair {
    KeyValuePair::new(
        l2_fib::key(bd, mac),
        value(FibEntry {
            bridge_domain: bd.into(),
            mac: mac.into(),
            outgoing_interface: iface.into(),
        }),
    )
}

fn tap(name: &str) -> KeyValuePair {
    KeyValuePair::new(interface::key(name), value(Interface::tap(name)))
}

fn bd(name: &str, interfaces: &[&str]) -> KeyValuePair {
    KeyValuePair::new(
        bridge_domain::key(name),
        value(BridgeDomain::new(name, interfaces.iter().copied())),
    )
}

/// Operations of a transaction that reached the dataplane, in order.
fn applied(report: &TxnReport) -> Vec<(TxnOperation, String)> {
    report
        .executed
        .iter()
        .filter(|op| !op.noop)
        .map(|op| (op.operation, op.key.clone()))
        .collect()
}

async fn state_of(daemon: &AgentDaemon, key: &str) -> Option<ValueState> {
    daemon.scheduler().get_value_status(key).await.map(|s| s.state)
}

// ==== start-up ====

#[tokio::test]
async fn test_startup_applies_desired_state() {
    let file = desired_file(DESIRED);
    let (daemon, dp) = start(&file).await;

    assert!(dp.interface_index("tap1").is_some());
    assert_eq!(
        member_names(&dp, "bd1"),
        BTreeSet::from(["eth0".to_string(), "tap1".to_string()])
    );
    let fib = dp.dump_fib();
    assert_eq!(fib.len(), 1);
    assert!(fib[0].static_mac);

    assert_eq!(state_of(&daemon, &interface::key("eth0")).await, Some(ValueState::Obtained));
    assert_eq!(state_of(&daemon, &interface::key("tap1")).await, Some(ValueState::Configured));
    assert_eq!(
        state_of(&daemon, &bd_interface::key("bd1", "eth0")).await,
        Some(ValueState::Configured)
    );
    assert_eq!(
        state_of(&daemon, &l2_fib::key("bd1", "02:00:00:00:00:aa")).await,
        Some(ValueState::Configured)
    );
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_restart_adopts_existing_objects() {
    let file = desired_file(DESIRED);
    let (daemon, dp) = start(&file).await;
    daemon.shutdown().await;
    let calls = dp.call_count();

    // a second agent on the same dataplane finds everything in place
    let mut config = AgentConfig::default();
    config.agent.desired_config = Some(file.path().to_path_buf());
    config.agent.log_status_updates = false;
    let mut daemon = AgentDaemon::new(config, dp.clone()).unwrap();
    daemon.init().await.unwrap();

    assert_eq!(dp.call_count(), calls);
    assert_eq!(state_of(&daemon, &interface::key("tap1")).await, Some(ValueState::Configured));
    daemon.shutdown().await;
}

// ==== reload ====

#[tokio::test]
async fn test_reload_applies_changes() {
    let file = desired_file(DESIRED);
    let (mut daemon, dp) = start(&file).await;
    assert!(!daemon.reload().await.unwrap());

    std::fs::write(
        file.path(),
        r#"
interfaces:
  - name: tap1
    enabled: true
  - name: tap2
bridge_domains:
  - name: bd1
    interfaces: [tap2]
"#,
    )
    .unwrap();
    assert!(daemon.reload().await.unwrap());

    assert!(dp.dump_fib().is_empty());
    assert_eq!(member_names(&dp, "bd1"), BTreeSet::from(["tap2".to_string()]));
    let tap2 = dp.interface(dp.interface_index("tap2").unwrap()).unwrap();
    assert!(!tap2.admin_up);
    assert_eq!(state_of(&daemon, &bd_interface::key("bd1", "tap1")).await, None);
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_reload_removes_bridge_domain_with_members() {
    let file = desired_file(DESIRED);
    let (mut daemon, dp) = start(&file).await;

    std::fs::write(file.path(), "interfaces: [{name: tap1, enabled: true}]").unwrap();
    assert!(daemon.reload().await.unwrap());

    assert!(dp.dump_bridge_domains().is_empty());
    assert!(dp.interface_index("tap1").is_some());
    // physical ports are never removed
    assert!(dp.interface_index("eth0").is_some());
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_invalid_desired_value_is_reported() {
    let file = desired_file(DESIRED);
    let (mut daemon, dp) = start(&file).await;

    std::fs::write(
        file.path(),
        "interfaces: [{name: tap1, enabled: true}, {name: tap2, mtu: 20}]",
    )
    .unwrap();
    daemon.reload().await.unwrap();

    let status = daemon
        .scheduler()
        .get_value_status(&interface::key("tap2"))
        .await
        .unwrap();
    assert_eq!(status.state, ValueState::Invalid);
    assert!(dp.interface_index("tap2").is_none());
    daemon.shutdown().await;
}

// ==== southbound drift ====

#[tokio::test]
async fn test_learned_fib_entries_are_obtained() {
    let file = desired_file(DESIRED);
    let (daemon, dp) = start(&file).await;

    let bd_index = dp.bridge_domain_index("bd1").unwrap();
    let eth0 = dp.interface_index("eth0").unwrap();
    dp.learn(bd_index, "02:00:00:00:00:bb", eth0);
    daemon.scheduler().downstream_resync().await.unwrap();

    let learned = l2_fib::key("bd1", "02:00:00:00:00:bb");
    assert_eq!(state_of(&daemon, &learned).await, Some(ValueState::Obtained));
    let values = daemon.scheduler().list_values("l2-fib").await;
    let origins: Vec<(String, ValueOrigin)> = values.into_iter().map(|kv| (kv.key, kv.origin)).collect();
    assert_eq!(
        origins,
        vec![
            (l2_fib::key("bd1", "02:00:00:00:00:aa"), ValueOrigin::FromNb),
            (learned.clone(), ValueOrigin::FromSb),
        ]
    );

    // a full resync leaves learned entries alone
    daemon
        .scheduler()
        .resync_config(kvagentd::DesiredState::parse(DESIRED).unwrap().to_kvs())
        .await
        .unwrap();
    assert_eq!(dp.dump_fib().len(), 2);
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_downstream_resync_restores_dropped_interface() {
    let file = desired_file(DESIRED);
    let (daemon, dp) = start(&file).await;

    dp.drop_interface("tap1");
    daemon.scheduler().downstream_resync().await.unwrap();

    assert!(dp.interface_index("tap1").is_some());
    assert_eq!(
        member_names(&dp, "bd1"),
        BTreeSet::from(["eth0".to_string(), "tap1".to_string()])
    );
    assert_eq!(state_of(&daemon, &interface::key("tap1")).await, Some(ValueState::Configured));
    daemon.shutdown().await;
}

// ==== northbound transactions ====

#[tokio::test]
async fn test_reverted_transaction_leaves_dataplane_untouched() {
    let file = desired_file(DESIRED);
    let (daemon, dp) = start(&file).await;
    dp.inject_failure("bd2", 1, false);

    let err = daemon
        .scheduler()
        .start_change()
        .update(interface::key("tap3"), value(Interface::tap("tap3")))
        .update(bridge_domain::key("bd2"), value(BridgeDomain::new("bd2", ["tap3"])))
        .with_revert()
        .send()
        .await
        .unwrap_err();

    match err {
        TransactionError::Failed { reverted, errors, .. } => {
            assert!(reverted);
            assert_eq!(errors[0].key, bridge_domain::key("bd2"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(dp.interface_index("tap3").is_none());
    assert!(dp.bridge_domain_index("bd2").is_none());
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_reverted_recreate_rebinds_dependents() {
    let (daemon, dp) = bare_agent().await;
    daemon
        .scheduler()
        .resync_config(vec![tap("tap1"), bd("bd1", &["tap1"]), fib("bd1", "02:00:00:00:00:aa", "tap1")])
        .await
        .unwrap();
    let before = daemon.scheduler().current_graph().await;
    dp.inject_failure("tap9", 1, false);

    let mut loopback = Interface::tap("tap1");
    loopback.kind = InterfaceKind::Loopback;
    let err = daemon
        .scheduler()
        .start_change()
        .update(interface::key("tap1"), value(loopback))
        .update(interface::key("tap9"), value(Interface::tap("tap9")))
        .with_revert()
        .send()
        .await
        .unwrap_err();
    let seq = match err {
        TransactionError::Failed { reverted, seq_num, .. } => {
            assert!(reverted);
            seq_num
        }
        other => panic!("unexpected error: {other}"),
    };

    let index = dp.interface_index("tap1").unwrap();
    assert_eq!(dp.interface(index).unwrap().if_type, kvagentd::SimInterfaceType::Tap);
    assert_eq!(member_names(&dp, "bd1"), BTreeSet::from(["tap1".to_string()]));
    let fib_entries = dp.dump_fib();
    assert_eq!(fib_entries.len(), 1);
    assert_eq!(fib_entries[0].sw_if_index, index);
    assert!(dp.interface_index("tap9").is_none());

    let by_index = daemon
        .scheduler()
        .metadata()
        .lookup_by_index("interface", "sw_if_index", &index.to_string());
    assert_eq!(by_index.len(), 1);
    assert_eq!(by_index[0].0, "tap1");

    // apart from the new interface index the graph is back where it was
    let strip = |nodes: Vec<kvscheduler::RecordedNode>| -> Vec<kvscheduler::RecordedNode> {
        nodes
            .into_iter()
            .map(|mut n| {
                if n.key == interface::key("tap1") {
                    n.metadata = None;
                }
                n
            })
            .collect()
    };
    assert_eq!(strip(daemon.scheduler().current_graph().await), strip(before));

    let record = daemon.scheduler().recorded_transaction(seq).unwrap();
    assert!(record.executed.iter().filter(|op| op.is_revert).all(|op| op.new_err.is_none()));
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_ethernet_interface_cannot_be_requested() {
    let file = desired_file(DESIRED);
    let (daemon, _dp) = start(&file).await;

    let mut eth1 = Interface::tap("eth1");
    eth1.kind = kvagentd::descriptors::InterfaceKind::Ethernet;
    let result = daemon
        .scheduler()
        .start_change()
        .update(interface::key("eth1"), value(eth1))
        .send()
        .await;

    assert!(result.is_ok());
    assert_eq!(state_of(&daemon, &interface::key("eth1")).await, Some(ValueState::Invalid));
    daemon.shutdown().await;
}

// ==== dependency scenarios ====

const MAC: &str = "02:00:00:00:00:aa";

#[tokio::test]
async fn test_pending_values_resolved_by_later_update() {
    let (daemon, dp) = bare_agent().await;
    daemon
        .scheduler()
        .resync_config(vec![tap("tap1"), bd("bd1", &["tap1", "tap2"]), fib("bd1", MAC, "tap2")])
        .await
        .unwrap();

    assert_eq!(state_of(&daemon, &interface::key("tap1")).await, Some(ValueState::Configured));
    assert_eq!(
        state_of(&daemon, &bd_interface::key("bd1", "tap1")).await,
        Some(ValueState::Configured)
    );
    assert_eq!(
        state_of(&daemon, &bd_interface::key("bd1", "tap2")).await,
        Some(ValueState::Pending)
    );
    assert_eq!(state_of(&daemon, &l2_fib::key("bd1", MAC)).await, Some(ValueState::Pending));
    assert!(dp.dump_fib().is_empty());

    let report = daemon
        .scheduler()
        .start_change()
        .update(interface::key("tap2"), value(Interface::tap("tap2")))
        .send()
        .await
        .unwrap();
    assert_eq!(
        applied(&report),
        vec![
            (TxnOperation::Create, interface::key("tap2")),
            (TxnOperation::Create, bd_interface::key("bd1", "tap2")),
            (TxnOperation::Create, l2_fib::key("bd1", MAC)),
        ]
    );
    assert_eq!(state_of(&daemon, &l2_fib::key("bd1", MAC)).await, Some(ValueState::Configured));
    assert_eq!(dp.dump_fib().len(), 1);
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_kind_change_recreates_dependents() {
    let (daemon, dp) = bare_agent().await;
    daemon
        .scheduler()
        .resync_config(vec![tap("tap1"), bd("bd1", &["tap1"]), fib("bd1", MAC, "tap1")])
        .await
        .unwrap();
    let old_index = dp.interface_index("tap1").unwrap();

    let mut loopback = Interface::tap("tap1");
    loopback.kind = InterfaceKind::Loopback;
    let report = daemon
        .scheduler()
        .start_change()
        .update(interface::key("tap1"), value(loopback))
        .send()
        .await
        .unwrap();

    let binding = bd_interface::key("bd1", "tap1");
    let entry = l2_fib::key("bd1", MAC);
    assert_eq!(
        applied(&report),
        vec![
            (TxnOperation::Delete, entry.clone()),
            (TxnOperation::Delete, binding.clone()),
            (TxnOperation::Delete, interface::key("tap1")),
            (TxnOperation::Create, interface::key("tap1")),
            (TxnOperation::Create, binding),
            (TxnOperation::Create, entry),
        ]
    );

    let new_index = dp.interface_index("tap1").unwrap();
    assert_ne!(new_index, old_index);
    assert_eq!(dp.interface(new_index).unwrap().if_type, kvagentd::SimInterfaceType::Loopback);
    assert_eq!(member_names(&dp, "bd1"), BTreeSet::from(["tap1".to_string()]));
    assert_eq!(dp.dump_fib()[0].sw_if_index, new_index);
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_invalid_interface_then_fixed() {
    let (daemon, dp) = bare_agent().await;
    let mut bad = Interface::tap("tap1");
    bad.mac = Some("02:00:zz:00:00:01".into());
    daemon
        .scheduler()
        .resync_config(vec![
            KeyValuePair::new(interface::key("tap1"), value(bad)),
            bd("bd1", &["tap1"]),
            fib("bd1", MAC, "tap1"),
        ])
        .await
        .unwrap();

    let status = daemon
        .scheduler()
        .get_value_status(&interface::key("tap1"))
        .await
        .unwrap();
    assert_eq!(status.state, ValueState::Invalid);
    assert_eq!(status.details, vec!["mac".to_string()]);
    assert_eq!(
        state_of(&daemon, &bd_interface::key("bd1", "tap1")).await,
        Some(ValueState::Pending)
    );
    assert_eq!(state_of(&daemon, &l2_fib::key("bd1", MAC)).await, Some(ValueState::Pending));
    assert!(dp.interface_index("tap1").is_none());

    let mut fixed = Interface::tap("tap1");
    fixed.mac = Some("02:00:00:00:00:01".into());
    daemon
        .scheduler()
        .start_change()
        .update(interface::key("tap1"), value(fixed))
        .send()
        .await
        .unwrap();

    assert_eq!(state_of(&daemon, &interface::key("tap1")).await, Some(ValueState::Configured));
    assert_eq!(
        state_of(&daemon, &bd_interface::key("bd1", "tap1")).await,
        Some(ValueState::Configured)
    );
    assert_eq!(state_of(&daemon, &l2_fib::key("bd1", MAC)).await, Some(ValueState::Configured));
    let iface = dp.interface(dp.interface_index("tap1").unwrap()).unwrap();
    assert_eq!(iface.mac, "02:00:00:00:00:01");
    daemon.shutdown().await;
}
