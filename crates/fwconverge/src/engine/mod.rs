//! Engine convergence.
//!
//! An engine is a composite element: one top-level object plus nested
//! interfaces, routing attachments and VPN memberships. It is converged in
//! fixed stages, each gated by whether the document asks for it at all:
//!
//! | stage                 | touches                                   |
//! |-----------------------|-------------------------------------------|
//! | `general`             | antivirus, default NAT, file reputation   |
//! | `snmp`                | SNMP agent settings                       |
//! | `location`            | NAT location                              |
//! | `interfaces`          | interfaces, VLANs, management roles       |
//! | `dynamic_routing`     | BGP and OSPF settings                     |
//! | `routing_attachments` | peerings, areas, netlinks, static routes  |
//! | `antispoofing`        | antispoofing networks                     |
//! | `policy_vpn`          | policy VPN gateway membership             |
//! | `tags`                | category tags                             |
//!
//! Every reference of every stage is validated before the first mutation.

mod interfaces;
mod orchestrator;
mod routing;
pub mod spec;
mod validate;
mod vpn;

pub use orchestrator::EngineOrchestrator;
pub use spec::{
    BgpPeeringSpec, BgpSpec, EngineSpec, EngineType, InterfaceId, InterfaceKind, InterfaceSpec,
    NetlinkSpec, NodeAddress, OspfAreaSpec, OspfSpec, PolicyVpnSpec, SnmpSpec, StaticRouteSpec,
    TypedRef, VlanSpec,
};

/// One engine convergence stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    GeneralFeatures,
    Snmp,
    Location,
    Interfaces,
    DynamicRouting,
    RoutingAttachments,
    Antispoofing,
    PolicyVpn,
    Tags,
}

impl Stage {
    /// Stages in execution order.
    pub const ORDER: [Stage; 9] = [
        Stage::GeneralFeatures,
        Stage::Snmp,
        Stage::Location,
        Stage::Interfaces,
        Stage::DynamicRouting,
        Stage::RoutingAttachments,
        Stage::Antispoofing,
        Stage::PolicyVpn,
        Stage::Tags,
    ];

    /// Scope name used in change records.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::GeneralFeatures => "general",
            Stage::Snmp => "snmp",
            Stage::Location => "location",
            Stage::Interfaces => "interfaces",
            Stage::DynamicRouting => "dynamic_routing",
            Stage::RoutingAttachments => "routing_attachments",
            Stage::Antispoofing => "antispoofing",
            Stage::PolicyVpn => "policy_vpn",
            Stage::Tags => "tags",
        }
    }

    /// Returns true if the document asks for this stage.
    pub fn is_requested(&self, spec: &EngineSpec) -> bool {
        match self {
            Stage::GeneralFeatures => {
                spec.antivirus.is_some() || spec.default_nat.is_some() || spec.file_reputation.is_some()
            }
            Stage::Snmp => spec.snmp.is_some(),
            Stage::Location => spec.location.is_some(),
            Stage::Interfaces => {
                !spec.interfaces.is_empty()
                    || spec.delete_undefined_interfaces
                    || spec.primary_mgt.is_some()
                    || spec.backup_mgt.is_some()
                    || spec.primary_heartbeat.is_some()
            }
            Stage::DynamicRouting => spec.bgp.is_some() || spec.ospf.is_some(),
            Stage::RoutingAttachments => {
                spec.bgp.as_ref().is_some_and(|b| !b.bgp_peering.is_empty())
                    || spec.ospf.as_ref().is_some_and(|o| !o.ospf_areas.is_empty())
                    || !spec.netlinks.is_empty()
                    || !spec.static_routes.is_empty()
            }
            Stage::Antispoofing => !spec.antispoofing_network.is_empty(),
            Stage::PolicyVpn => !spec.policy_vpn.is_empty(),
            Stage::Tags => !spec.tags.is_empty(),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
