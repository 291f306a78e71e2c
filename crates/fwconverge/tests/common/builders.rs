//! Element descriptor shorthands.

#![allow(dead_code)]

use serde_json::{json, Value};

use fwconverge::ElementDescriptor;

pub fn host(name: &str, address: &str) -> ElementDescriptor {
    ElementDescriptor::new("host", name).with_attribute("address", address)
}

pub fn network(name: &str, cidr: &str) -> ElementDescriptor {
    ElementDescriptor::new("network", name).with_attribute("ipv4_network", cidr)
}

/// A group whose members are all of one type.
pub fn group(name: &str, member_type: &str, members: &[&str]) -> ElementDescriptor {
    ElementDescriptor::new("group", name).with_attribute("members", json!({ member_type: members }))
}

pub fn autonomous_system(name: &str, number: u32) -> ElementDescriptor {
    ElementDescriptor::new("autonomous_system", name).with_attribute("as_number", number)
}

pub fn external_bgp_peer(name: &str, system: &str, address: &str) -> ElementDescriptor {
    ElementDescriptor::new("external_bgp_peer", name)
        .with_attribute("neighbor_as", system)
        .with_attribute("neighbor_ip", address)
}

/// An external gateway with one VPN site per `(site, networks)` pair.
pub fn external_gateway(name: &str, sites: &[(&str, &[&str])]) -> ElementDescriptor {
    let sites: Vec<Value> = sites
        .iter()
        .map(|(site, networks)| json!({"name": site, "site_element": {"network": networks}}))
        .collect();
    ElementDescriptor::new("external_gateway", name).with_attribute("vpn_site", Value::Array(sites))
}
