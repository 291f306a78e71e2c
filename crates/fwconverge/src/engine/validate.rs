//! Structural checks and reference collection for engine documents.

use std::collections::{BTreeSet, HashSet};

use super::spec::{EngineSpec, InterfaceId, TypedRef};
use crate::document::Identity;
use crate::registry::Registry;
use crate::validation::ValidationIssue;

const ANNOUNCED_TARGETS: &[&str] = &["network", "host", "address_range", "group", "ip_list"];
const PEER_TARGETS: &[&str] = &["external_bgp_peer", "single_fw", "fw_cluster"];
const GATEWAY_TARGETS: &[&str] = &["router", "host"];
const DESTINATION_TARGETS: &[&str] = &["network", "host", "address_range", "group"];
const ANTISPOOFING_TARGETS: &[&str] = &["network", "host", "address_range", "group"];

/// A reference made by an engine document, with the field that makes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EngineReference {
    pub field: &'static str,
    pub identity: Identity,
}

fn reference(field: &'static str, type_tag: &str, name: &str) -> EngineReference {
    EngineReference {
        field,
        identity: Identity::new(type_tag, name),
    }
}

/// Every element the engine document references, categories excluded.
pub(crate) fn references(spec: &EngineSpec) -> Vec<EngineReference> {
    let mut refs = Vec::new();

    if let Some(location) = &spec.location {
        refs.push(reference("location", "location", location));
    }
    if let Some(agent) = spec.snmp.as_ref().and_then(|s| s.snmp_agent.as_ref()) {
        refs.push(reference("snmp.snmp_agent", "snmp_agent", agent));
    }
    for interface in spec.declared_interfaces() {
        if let Some(zone) = &interface.zone_ref {
            refs.push(reference("interfaces.zone_ref", "interface_zone", zone));
        }
    }

    if let Some(bgp) = &spec.bgp {
        if let Some(system) = &bgp.autonomous_system {
            refs.push(reference("bgp.autonomous_system", "autonomous_system", system));
        }
        if let Some(profile) = &bgp.bgp_profile {
            refs.push(reference("bgp.bgp_profile", "bgp_profile", profile));
        }
        for network in &bgp.announced_networks {
            refs.push(EngineReference {
                field: "bgp.announced_networks",
                identity: network.identity().clone(),
            });
        }
        for peering in &bgp.bgp_peering {
            refs.push(reference("bgp.bgp_peering", "bgp_peering", &peering.name));
            refs.push(EngineReference {
                field: "bgp.bgp_peering.peer",
                identity: peering.peer.identity().clone(),
            });
        }
    }

    if let Some(ospf) = &spec.ospf {
        if let Some(profile) = &ospf.ospf_profile {
            refs.push(reference("ospf.ospf_profile", "ospfv2_profile", profile));
        }
        for area in &ospf.ospf_areas {
            refs.push(reference("ospf.ospf_areas", "ospfv2_area", &area.name));
        }
    }

    for netlink in &spec.netlinks {
        refs.push(reference("netlinks", "static_netlink", &netlink.name));
    }
    for route in &spec.static_routes {
        refs.push(EngineReference {
            field: "static_routes.gateway",
            identity: route.gateway.identity().clone(),
        });
        for destination in &route.destinations {
            refs.push(EngineReference {
                field: "static_routes.destinations",
                identity: destination.identity().clone(),
            });
        }
    }

    for identity in spec.antispoofing_refs() {
        refs.push(EngineReference {
            field: "antispoofing_network",
            identity,
        });
    }
    for vpn in &spec.policy_vpn {
        refs.push(reference("policy_vpn", "policy_vpn", &vpn.name));
    }

    refs
}

/// Category tags the engine should carry. Missing ones are created.
pub(crate) fn categories(spec: &EngineSpec) -> Vec<Identity> {
    let mut seen = HashSet::new();
    spec.tags
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .map(|name| Identity::new("category", name.clone()))
        .collect()
}

struct Checker<'a> {
    engine: Identity,
    registry: &'a Registry,
    issues: Vec<ValidationIssue>,
}

impl Checker<'_> {
    fn invalid(&mut self, message: String) {
        self.issues
            .push(ValidationIssue::invalid(self.engine.to_string(), message));
    }

    fn target(&mut self, field: &str, target: &TypedRef, allowed: &[&str]) {
        let identity = target.identity();
        if self.registry.lookup(&identity.type_tag).is_none() {
            self.issues.push(ValidationIssue::UnknownType {
                identity: identity.clone(),
            });
        } else if !allowed.contains(&identity.type_tag.as_str()) {
            self.issues.push(ValidationIssue::InvalidTarget {
                identity: self.engine.clone(),
                field: field.to_string(),
                target: identity.clone(),
            });
        }
    }

    fn interface(&mut self, field: &str, id: &str, interfaces: &KnownInterfaces) {
        let id = InterfaceId::normalize(id);
        if interfaces.removed.contains(&id) {
            self.invalid(format!(
                "{} refers to interface {} which is not declared and is deleted by delete_undefined_interfaces",
                field, id
            ));
        } else if !interfaces.known.contains(&id) {
            self.invalid(format!(
                "{} refers to interface {} which is neither declared nor present on the engine",
                field, id
            ));
        }
    }
}

/// Interfaces that exist once the interface stage has run.
struct KnownInterfaces {
    known: BTreeSet<String>,
    /// Live interfaces the pass deletes.
    removed: BTreeSet<String>,
}

impl KnownInterfaces {
    fn new(spec: &EngineSpec, declared: &BTreeSet<String>, live_interfaces: &[String]) -> Self {
        let live = live_interfaces.iter().map(|id| InterfaceId::normalize(id));
        let mut known = declared.clone();
        let mut removed = BTreeSet::new();
        if spec.delete_undefined_interfaces {
            removed.extend(live.filter(|id| !declared.contains(id)));
        } else {
            known.extend(live);
        }
        Self { known, removed }
    }
}

/// Checks an engine document for problems that need no lookups.
///
/// `live_interfaces` holds the interface ids the engine already has.
pub(crate) fn check(
    spec: &EngineSpec,
    registry: &Registry,
    live_interfaces: &[String],
) -> Vec<ValidationIssue> {
    let mut checker = Checker {
        engine: spec.identity(),
        registry,
        issues: Vec::new(),
    };

    if spec.name.trim().is_empty() {
        checker.invalid("engine name must not be empty".to_string());
    }
    if registry.lookup(spec.engine_type.tag()).is_none() {
        checker.issues.push(ValidationIssue::UnknownType {
            identity: spec.identity(),
        });
    }

    // Interfaces.
    let declared = spec.declared_interfaces();
    let mut declared_ids = BTreeSet::new();
    let mut parsed = Vec::new();
    for interface in &declared {
        match interface.id.parse::<InterfaceId>() {
            Ok(id) => parsed.push((id, interface)),
            Err(message) => checker.issues.push(ValidationIssue::Malformed {
                identity: checker.engine.clone(),
                field: "interfaces.interface_id".to_string(),
                message,
            }),
        }
        if !declared_ids.insert(interface.id.clone()) {
            checker.invalid(format!("interface {} is declared more than once", interface.id));
        }
    }

    let known = KnownInterfaces::new(spec, &declared_ids, live_interfaces);

    for (id, interface) in &parsed {
        if let Some(parent) = id.parent() {
            let parent = parent.to_string();
            if known.removed.contains(&parent) {
                checker.invalid(format!(
                    "VLAN {} needs parent interface {}, which is not declared and is deleted by delete_undefined_interfaces",
                    id, parent
                ));
            } else if !known.known.contains(&parent) {
                checker.invalid(format!("VLAN {} needs parent interface {}", id, parent));
            }
        }

        if spec.engine_type.is_cluster() {
            let mut node_ids = HashSet::new();
            for node in &interface.nodes {
                if !node_ids.insert(node.nodeid) {
                    checker.invalid(format!(
                        "interface {} assigns node {} more than one address",
                        id, node.nodeid
                    ));
                }
            }
        } else {
            if interface.nodes.len() > 1 {
                checker.invalid(format!(
                    "interface {} of a single firewall can carry one node address",
                    id
                ));
            }
            if interface.cluster_virtual.is_some() {
                checker.invalid(format!(
                    "interface {} has a cluster virtual address but the engine is not a cluster",
                    id
                ));
            }
        }
    }

    // Management roles.
    for (field, role) in [
        ("primary_mgt", &spec.primary_mgt),
        ("backup_mgt", &spec.backup_mgt),
        ("primary_heartbeat", &spec.primary_heartbeat),
    ] {
        if let Some(id) = role {
            checker.interface(field, id, &known);
        }
    }
    if spec.primary_heartbeat.is_some() && !spec.engine_type.is_cluster() {
        checker.invalid("primary_heartbeat can only be set on a cluster".to_string());
    }
    if let (Some(primary), Some(backup)) = (&spec.primary_mgt, &spec.backup_mgt) {
        if InterfaceId::normalize(primary) == InterfaceId::normalize(backup) {
            checker.invalid(format!(
                "interface {} cannot be both primary and backup management",
                primary
            ));
        }
    }

    // Routing.
    if let Some(snmp) = &spec.snmp {
        for id in &snmp.snmp_interface {
            checker.interface("snmp.snmp_interface", id, &known);
        }
    }
    if let Some(bgp) = &spec.bgp {
        if bgp.enabled && bgp.autonomous_system.is_none() {
            checker.issues.push(ValidationIssue::MissingField {
                identity: checker.engine.clone(),
                field: "bgp.autonomous_system".to_string(),
            });
        }
        for network in &bgp.announced_networks {
            checker.target("bgp.announced_networks", network, ANNOUNCED_TARGETS);
        }
        for peering in &bgp.bgp_peering {
            checker.interface("bgp.bgp_peering", &peering.interface_id, &known);
            checker.target("bgp.bgp_peering.peer", &peering.peer, PEER_TARGETS);
        }
    }
    if let Some(ospf) = &spec.ospf {
        for area in &ospf.ospf_areas {
            checker.interface("ospf.ospf_areas", &area.interface_id, &known);
        }
    }
    for netlink in &spec.netlinks {
        checker.interface("netlinks", &netlink.interface_id, &known);
    }
    for route in &spec.static_routes {
        checker.interface("static_routes", &route.interface_id, &known);
        checker.target("static_routes.gateway", &route.gateway, GATEWAY_TARGETS);
        for destination in &route.destinations {
            checker.target("static_routes.destinations", destination, DESTINATION_TARGETS);
        }
    }

    for (tag, names) in &spec.antispoofing_network {
        if let Some(name) = names.first() {
            checker.target(
                "antispoofing_network",
                &TypedRef::new(tag.clone(), name.clone()),
                ANTISPOOFING_TARGETS,
            );
        }
    }

    // Policy VPN.
    let mut vpn_names = HashSet::new();
    for vpn in &spec.policy_vpn {
        if !vpn_names.insert(vpn.name.as_str()) {
            checker.invalid(format!("policy VPN {} is listed more than once", vpn.name));
        }
        if vpn.central_node == vpn.satellite_node {
            checker.invalid(format!(
                "policy VPN {}: set exactly one of central_node and satellite_node",
                vpn.name
            ));
        }
    }

    if spec.tags.iter().any(|t| t.trim().is_empty()) {
        checker.invalid("tag names must not be empty".to_string());
    }

    checker.issues
}
