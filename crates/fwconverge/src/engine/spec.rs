//! Engine descriptions.
//!
//! ```yaml
//! name: fw-branch-1
//! type: single_fw
//! antivirus: true
//! location: branch-nat
//! interfaces:
//!   - interface_id: "0"
//!     zone_ref: external
//!     nodes: [{address: 192.0.2.10, network_value: 192.0.2.0/24}]
//!     vlans:
//!       - vlan_id: 10
//!         nodes: [{address: 10.10.0.1, network_value: 10.10.0.0/24}]
//! primary_mgt: "0"
//! bgp:
//!   enabled: true
//!   router_id: 192.0.2.10
//!   autonomous_system: as-65001
//!   announced_networks: [{network: branch-lan}]
//!   bgp_peering:
//!     - name: uplink
//!       interface_id: "0"
//!       peer: {external_bgp_peer: isp-a}
//! tags: [branch, emea]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::document::{DocumentError, Identity};

const VLAN_IDS: RangeInclusive<u32> = 1..=4094;

static INTERFACE_ID: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^(\d+)(?:\.(\d+))?$"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    #[default]
    SingleFw,
    FwCluster,
}

impl EngineType {
    pub fn tag(&self) -> &'static str {
        match self {
            EngineType::SingleFw => "single_fw",
            EngineType::FwCluster => "fw_cluster",
        }
    }

    pub fn is_cluster(&self) -> bool {
        *self == EngineType::FwCluster
    }
}

/// A `{type_tag: name}` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct TypedRef(pub Identity);

impl TypedRef {
    pub fn new(type_tag: impl Into<String>, name: impl Into<String>) -> Self {
        Self(Identity::new(type_tag, name))
    }

    pub fn identity(&self) -> &Identity {
        &self.0
    }
}

impl TryFrom<BTreeMap<String, String>> for TypedRef {
    type Error = String;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        let mut entries = map.into_iter();
        match (entries.next(), entries.next()) {
            (Some((tag, name)), None) => Ok(Self::new(tag, name)),
            _ => Err("a reference must be a single {type: name} pair".to_string()),
        }
    }
}

impl From<TypedRef> for BTreeMap<String, String> {
    fn from(reference: TypedRef) -> Self {
        BTreeMap::from([(reference.0.type_tag, reference.0.name)])
    }
}

/// Interface identifier: `N` for a physical or tunnel interface, `N.V` for
/// VLAN `V` on interface `N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId {
    pub base: u32,
    pub vlan: Option<u32>,
}

impl InterfaceId {
    pub fn parent(&self) -> Option<InterfaceId> {
        self.vlan.map(|_| InterfaceId {
            base: self.base,
            vlan: None,
        })
    }

    pub fn is_vlan(&self) -> bool {
        self.vlan.is_some()
    }

    /// Canonical form of an id, so `01` and `1` name the same interface.
    /// Ids that do not parse are only trimmed.
    pub fn normalize(raw: &str) -> String {
        raw.parse::<InterfaceId>()
            .map(|id| id.to_string())
            .unwrap_or_else(|_| raw.trim().to_string())
    }
}

impl FromStr for InterfaceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pattern = INTERFACE_ID
            .as_ref()
            .map_err(|e| format!("interface id pattern: {}", e))?;
        let caps = pattern
            .captures(s.trim())
            .ok_or_else(|| format!("'{}' is not an interface id (expected N or N.V)", s))?;

        let number = |index: usize| -> Result<Option<u32>, String> {
            caps.get(index)
                .map(|m| {
                    m.as_str()
                        .parse::<u32>()
                        .map_err(|_| format!("'{}' is out of range", s))
                })
                .transpose()
        };

        let vlan = number(2)?;
        if let Some(vlan) = vlan.filter(|v| !VLAN_IDS.contains(v)) {
            return Err(format!(
                "'{}' has VLAN {} outside {}..={}",
                s,
                vlan,
                VLAN_IDS.start(),
                VLAN_IDS.end()
            ));
        }

        Ok(InterfaceId {
            base: number(1)?.unwrap_or_default(),
            vlan,
        })
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vlan {
            Some(vlan) => write!(f, "{}.{}", self.base, vlan),
            None => write!(f, "{}", self.base),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    #[default]
    Physical,
    Tunnel,
}

impl InterfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceKind::Physical => "physical",
            InterfaceKind::Tunnel => "tunnel",
        }
    }
}

fn default_node_id() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeAddress {
    pub address: String,
    pub network_value: String,
    #[serde(default = "default_node_id")]
    pub nodeid: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VlanSpec {
    pub vlan_id: u32,
    #[serde(default)]
    pub zone_ref: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeAddress>,
    #[serde(default)]
    pub cluster_virtual: Option<String>,
    #[serde(default)]
    pub network_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceSpec {
    pub interface_id: String,
    #[serde(rename = "type", default)]
    pub kind: InterfaceKind,
    #[serde(default)]
    pub zone_ref: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Per-node addresses.
    #[serde(default)]
    pub nodes: Vec<NodeAddress>,
    /// Cluster virtual address, shared by all nodes.
    #[serde(default)]
    pub cluster_virtual: Option<String>,
    #[serde(default)]
    pub network_value: Option<String>,
    #[serde(default)]
    pub macaddress: Option<String>,
    #[serde(default)]
    pub vlans: Vec<VlanSpec>,
}

impl InterfaceSpec {
    /// The interface and its VLANs as flat declarations.
    pub fn flatten(&self) -> Vec<DeclaredInterface> {
        let mut declared = vec![DeclaredInterface {
            id: InterfaceId::normalize(&self.interface_id),
            kind: self.kind,
            zone_ref: self.zone_ref.clone(),
            comment: self.comment.clone(),
            nodes: self.nodes.clone(),
            cluster_virtual: self.cluster_virtual.clone(),
            network_value: self.network_value.clone(),
            macaddress: self.macaddress.clone(),
        }];

        let base = InterfaceId::normalize(&self.interface_id);
        declared.extend(self.vlans.iter().map(|vlan| DeclaredInterface {
            id: InterfaceId::normalize(&format!("{}.{}", base, vlan.vlan_id)),
            kind: self.kind,
            zone_ref: vlan.zone_ref.clone(),
            comment: vlan.comment.clone(),
            nodes: vlan.nodes.clone(),
            cluster_virtual: vlan.cluster_virtual.clone(),
            network_value: vlan.network_value.clone(),
            macaddress: None,
        }));

        declared
    }
}

/// One interface or VLAN after flattening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredInterface {
    pub id: String,
    pub kind: InterfaceKind,
    pub zone_ref: Option<String>,
    pub comment: Option<String>,
    pub nodes: Vec<NodeAddress>,
    pub cluster_virtual: Option<String>,
    pub network_value: Option<String>,
    pub macaddress: Option<String>,
}

impl DeclaredInterface {
    /// Returns true if the interface carries at least one address.
    pub fn has_address(&self) -> bool {
        !self.nodes.is_empty() || self.cluster_virtual.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnmpSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub snmp_agent: Option<String>,
    #[serde(default)]
    pub snmp_location: Option<String>,
    /// Interfaces the agent listens on.
    #[serde(default)]
    pub snmp_interface: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BgpPeeringSpec {
    /// Name of the `bgp_peering` element.
    pub name: String,
    pub interface_id: String,
    pub peer: TypedRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BgpSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub router_id: Option<String>,
    #[serde(default)]
    pub autonomous_system: Option<String>,
    #[serde(default)]
    pub bgp_profile: Option<String>,
    #[serde(default)]
    pub announced_networks: Vec<TypedRef>,
    #[serde(default)]
    pub bgp_peering: Vec<BgpPeeringSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OspfAreaSpec {
    /// Name of the `ospfv2_area` element.
    pub name: String,
    pub interface_id: String,
    /// Restricts the area to one network of the interface.
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OspfSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub router_id: Option<String>,
    #[serde(default)]
    pub ospf_profile: Option<String>,
    #[serde(default)]
    pub ospf_areas: Vec<OspfAreaSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetlinkSpec {
    /// Name of the `static_netlink` element.
    pub name: String,
    pub interface_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticRouteSpec {
    pub interface_id: String,
    pub gateway: TypedRef,
    #[serde(default)]
    pub destinations: Vec<TypedRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyVpnSpec {
    /// Name of the `policy_vpn` element.
    pub name: String,
    #[serde(default)]
    pub central_node: bool,
    #[serde(default)]
    pub satellite_node: bool,
    #[serde(default)]
    pub mobile_gateway: bool,
}

impl PolicyVpnSpec {
    pub fn role(&self) -> &'static str {
        if self.central_node {
            "central"
        } else {
            "satellite"
        }
    }
}

/// Desired configuration of one engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub engine_type: EngineType,

    #[serde(default)]
    pub antivirus: Option<bool>,
    #[serde(default)]
    pub default_nat: Option<bool>,
    #[serde(default)]
    pub file_reputation: Option<bool>,

    #[serde(default)]
    pub snmp: Option<SnmpSpec>,
    /// Name of a `location` element.
    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
    #[serde(default)]
    pub primary_mgt: Option<String>,
    #[serde(default)]
    pub backup_mgt: Option<String>,
    #[serde(default)]
    pub primary_heartbeat: Option<String>,
    /// Delete live interfaces that are not declared.
    #[serde(default)]
    pub delete_undefined_interfaces: bool,

    #[serde(default)]
    pub bgp: Option<BgpSpec>,
    #[serde(default)]
    pub ospf: Option<OspfSpec>,
    #[serde(default)]
    pub netlinks: Vec<NetlinkSpec>,
    #[serde(default)]
    pub static_routes: Vec<StaticRouteSpec>,

    /// Elements added to antispoofing, keyed by type tag.
    #[serde(default)]
    pub antispoofing_network: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub policy_vpn: Vec<PolicyVpnSpec>,
    /// Category tag names.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Replace announced networks and antispoofing lists instead of merging.
    #[serde(default)]
    pub overwrite_existing: bool,
}

impl EngineSpec {
    pub fn identity(&self) -> Identity {
        Identity::new(self.engine_type.tag(), self.name.clone())
    }

    /// All interfaces and VLANs, in declaration order.
    pub fn declared_interfaces(&self) -> Vec<DeclaredInterface> {
        self.interfaces.iter().flat_map(InterfaceSpec::flatten).collect()
    }

    /// Antispoofing entries as references.
    pub fn antispoofing_refs(&self) -> Vec<Identity> {
        self.antispoofing_network
            .iter()
            .flat_map(|(tag, names)| names.iter().map(move |name| Identity::new(tag.clone(), name.clone())))
            .collect()
    }

    pub fn from_yaml(content: &str, path: &Path) -> Result<Self, DocumentError> {
        serde_yaml::from_str(content).map_err(|e| DocumentError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        if !path.exists() {
            return Err(DocumentError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|e| DocumentError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml(&content, path)
    }
}
