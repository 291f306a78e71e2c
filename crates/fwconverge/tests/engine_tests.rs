//! End-to-end tests for engine documents.

mod common;

use serde_json::json;

use common::Harness;
use fwconverge::{Action, Attributes, ConvergeError, EngineSpec};

const BRANCH_ENGINE: &str = r#"
name: fw-branch
type: single_fw
antivirus: true
default_nat: false
location: branch-nat
snmp:
  snmp_agent: monitoring
  snmp_location: rack 4
  snmp_interface: ["0"]
interfaces:
  - interface_id: "0"
    zone_ref: external
    nodes: [{address: 192.0.2.10, network_value: 192.0.2.0/24}]
  - interface_id: "1"
    nodes: [{address: 10.1.0.1, network_value: 10.1.0.0/24}]
    vlans:
      - vlan_id: 20
        nodes: [{address: 10.20.0.1, network_value: 10.20.0.0/24}]
  - interface_id: "2"
    type: tunnel
primary_mgt: "1"
bgp:
  router_id: 192.0.2.10
  autonomous_system: as-65001
  announced_networks: [{network: branch-lan}]
  bgp_peering:
    - {name: uplink, interface_id: "0", peer: {external_bgp_peer: isp-a}}
static_routes:
  - interface_id: "0"
    gateway: {router: isp-gw}
    destinations: [{network: branch-lan}]
antispoofing_network:
  network: [branch-lan]
policy_vpn:
  - {name: corp, satellite_node: true}
tags: [branch, emea]
"#;

fn seed_references(harness: &Harness) {
    for (type_tag, name) in [
        ("location", "branch-nat"),
        ("snmp_agent", "monitoring"),
        ("interface_zone", "external"),
        ("autonomous_system", "as-65001"),
        ("network", "branch-lan"),
        ("bgp_peering", "uplink"),
        ("external_bgp_peer", "isp-a"),
        ("router", "isp-gw"),
        ("policy_vpn", "corp"),
        ("category", "branch"),
    ] {
        harness.store.seed(type_tag, name, Attributes::new());
    }
}

fn load_spec(harness: &Harness, content: &str) -> EngineSpec {
    let path = harness.write_document("engines/fw-branch.yaml", content);
    EngineSpec::load(&path).unwrap()
}

#[tokio::test]
async fn test_full_engine_document_converges_stage_by_stage() {
    let harness = Harness::new();
    seed_references(&harness);
    let spec = load_spec(&harness, BRANCH_ENGINE);

    let outcome = harness.converge_engine(&spec).await.unwrap();

    let mut scopes: Vec<&str> = Vec::new();
    for record in &outcome.state {
        let scope = record.scope.as_deref().unwrap_or("");
        if scopes.last() != Some(&scope) {
            scopes.push(scope);
        }
    }
    assert_eq!(
        scopes,
        vec![
            "engine",
            "snmp",
            "location",
            "interfaces",
            "dynamic_routing",
            "routing_attachments",
            "antispoofing",
            "policy_vpn",
            "tags",
        ]
    );
    assert!(outcome.failures().next().is_none());

    let engine_ref = harness.store.reference_of("single_fw", "fw-branch").unwrap();
    let engine = harness.store.attributes_of("single_fw", "fw-branch").unwrap();
    assert_eq!(engine["antivirus"], json!(true));
    assert_eq!(engine["default_nat"], json!(false));
    assert_eq!(engine["primary_mgt"], json!("1"));
    assert_eq!(engine["snmp"]["snmp_location"], json!("rack 4"));
    assert_eq!(engine["tags"].as_array().map(Vec::len), Some(2));

    let mut interfaces: Vec<String> = harness
        .store
        .children_of(&engine_ref, "interface")
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    interfaces.sort();
    assert_eq!(interfaces, vec!["0", "1", "1.20", "2"]);

    let emea = harness.store.reference_of("category", "emea");
    assert!(emea.is_some());
}

#[tokio::test]
async fn test_converged_engine_needs_no_second_pass() {
    let harness = Harness::new();
    seed_references(&harness);
    let spec = load_spec(&harness, BRANCH_ENGINE);

    harness.converge_engine(&spec).await.unwrap();
    harness.store.clear_journal();

    let outcome = harness.converge_engine(&spec).await.unwrap();
    assert!(!outcome.changed, "unexpected changes: {:?}", outcome.state);
    assert!(harness.store.mutations().is_empty());
}

#[tokio::test]
async fn test_missing_reference_in_a_late_stage_blocks_early_stages() {
    let harness = Harness::new();
    seed_references(&harness);
    let spec = load_spec(&harness, &BRANCH_ENGINE.replace("name: corp", "name: no-such-vpn"));

    let err = harness.converge_engine(&spec).await.unwrap_err();

    assert!(matches!(err, ConvergeError::Validation(_)));
    assert!(err.to_string().contains("policy_vpn/no-such-vpn"));
    assert!(harness.store.mutations().is_empty());
}

#[tokio::test]
async fn test_failed_engine_update_stops_the_pass() {
    let harness = Harness::new();
    seed_references(&harness);
    harness.store.seed("single_fw", "fw-branch", Attributes::new());
    harness.store.fail_mutations_of("single_fw", "fw-branch");
    let spec = load_spec(&harness, BRANCH_ENGINE);

    let err = harness.converge_engine(&spec).await.unwrap_err();

    match err {
        ConvergeError::Aborted { stage, applied, .. } => {
            assert_eq!(stage, "general");
            assert_eq!(applied.len(), 1);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(harness.store.reference_of("category", "emea").is_none());
}

#[tokio::test]
async fn test_undeclared_interfaces_need_the_opt_in() {
    let harness = Harness::new();
    let engine = harness.store.seed("single_fw", "fw-small", Attributes::new());
    for id in ["0", "3", "3.30"] {
        harness.store.seed_child(
            &engine,
            "interface",
            id,
            json!({"interface_id": id, "type": "physical"})
                .as_object()
                .cloned()
                .unwrap(),
        );
    }
    let document = |opt_in: bool| {
        format!(
            "name: fw-small\ninterfaces:\n  - interface_id: \"0\"\ndelete_undefined_interfaces: {}\n",
            opt_in
        )
    };

    let kept = harness
        .converge_engine(&load_spec(&harness, &document(false)))
        .await
        .unwrap();
    assert!(kept.state.iter().all(|r| r.action != Action::Deleted));
    assert_eq!(harness.store.children_of(&engine, "interface").len(), 3);

    let pruned = harness
        .converge_engine(&load_spec(&harness, &document(true)))
        .await
        .unwrap();
    let deleted: Vec<&str> = pruned
        .state
        .iter()
        .filter(|r| r.action == Action::Deleted)
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(deleted, vec!["3.30", "3"]);
    assert_eq!(harness.store.children_of(&engine, "interface").len(), 1);
}

#[tokio::test]
async fn test_references_to_interfaces_the_pass_deletes_are_rejected() {
    let harness = Harness::new();
    seed_references(&harness);
    let engine = harness.store.seed("single_fw", "fw-edge", Attributes::new());
    for id in ["0", "5"] {
        harness.store.seed_child(
            &engine,
            "interface",
            id,
            json!({"interface_id": id, "type": "physical"})
                .as_object()
                .cloned()
                .unwrap(),
        );
    }
    let document = r#"
name: fw-edge
interfaces:
  - interface_id: "0"
    nodes: [{address: 192.0.2.10, network_value: 192.0.2.0/24}]
  - interface_id: "5.10"
    nodes: [{address: 10.5.10.1, network_value: 10.5.10.0/24}]
primary_mgt: "5"
bgp:
  autonomous_system: as-65001
  bgp_peering:
    - {name: uplink, interface_id: "5", peer: {external_bgp_peer: isp-a}}
delete_undefined_interfaces: true
"#;
    let path = harness.write_document("engines/fw-edge.yaml", document);
    let spec = EngineSpec::load(&path).unwrap();

    let err = harness.converge_engine(&spec).await.unwrap_err();

    match err {
        ConvergeError::Validation(report) => {
            assert_eq!(report.len(), 3, "{:?}", report.issues());
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(harness.store.mutations().is_empty());
    assert_eq!(harness.store.children_of(&engine, "interface").len(), 2);
}
