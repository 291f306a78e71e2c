//! Element type registry.
//!
//! Maps a symbolic type tag (`host`, `external_bgp_peer`, ...) to the
//! description of that kind of element: its API entry point, the attributes
//! it accepts and which of them reference other elements. The table is
//! populated once at startup from [`CATALOG`]; lookups never inspect Rust
//! types.
//!
//! Reference fields accept three notations in a document:
//!
//! ```yaml
//! neighbor_as: as-200                 # bare name, field has a single target type
//! gateway: {router: branch-gw}        # typed single reference
//! members: {host: [web01, web02]}     # typed reference list
//! members:                            # list of typed references
//!   - host: web01
//!   - network: dmz
//! ```

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use crate::document::{ElementDescriptor, Identity};
use crate::store::Attributes;
use crate::validation::ValidationIssue;

/// Shape of one declared attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    /// A single value compared as a whole.
    Scalar,
    /// A list of plain values.
    List,
    /// A reference to one element of one of the listed types.
    Ref(&'static [&'static str]),
    /// A list of references.
    RefList(&'static [&'static str]),
}

impl FieldShape {
    /// Returns true for list-valued shapes.
    pub fn is_collection(&self) -> bool {
        matches!(self, FieldShape::List | FieldShape::RefList(_))
    }

    /// Element types a reference field may target.
    pub fn targets(&self) -> &'static [&'static str] {
        match self {
            FieldShape::Ref(targets) | FieldShape::RefList(targets) => targets,
            FieldShape::Scalar | FieldShape::List => &[],
        }
    }

    /// Parses the declared value of a reference field.
    ///
    /// Plain fields never carry references and yield an empty list.
    pub fn parse_references(&self, value: &Value) -> Result<Vec<Identity>, String> {
        match self {
            FieldShape::Scalar | FieldShape::List => Ok(Vec::new()),
            FieldShape::Ref(targets) => match value {
                Value::String(_) => Ok(vec![bare_reference(value, targets)?]),
                Value::Object(map) if map.len() == 1 => {
                    let refs = typed_references(map)?;
                    if refs.len() == 1 {
                        Ok(refs)
                    } else {
                        Err("expected exactly one referenced element".to_string())
                    }
                }
                _ => Err("expected an element name or a single {type: name} map".to_string()),
            },
            FieldShape::RefList(targets) => match value {
                Value::Array(items) => {
                    let mut refs = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Value::String(_) => refs.push(bare_reference(item, targets)?),
                            Value::Object(map) if map.len() == 1 => {
                                refs.extend(typed_references(map)?)
                            }
                            other => {
                                return Err(format!(
                                    "list entries must be names or {{type: name}} maps, found {}",
                                    other
                                ))
                            }
                        }
                    }
                    Ok(refs)
                }
                Value::Object(map) => typed_references(map),
                _ => Err("expected a {type: [names]} map or a list of references".to_string()),
            },
        }
    }
}

fn bare_reference(value: &Value, targets: &[&str]) -> Result<Identity, String> {
    let name = value.as_str().unwrap_or_default();
    match targets {
        [only] => Ok(Identity::new(*only, name)),
        _ => Err(format!(
            "'{}' is ambiguous, write it as {{type: name}} with type one of [{}]",
            name,
            targets.join(", ")
        )),
    }
}

fn typed_references(map: &serde_json::Map<String, Value>) -> Result<Vec<Identity>, String> {
    let mut refs = Vec::new();
    for (tag, names) in map {
        match names {
            Value::String(name) => refs.push(Identity::new(tag.clone(), name.clone())),
            Value::Array(names) => {
                for name in names {
                    let name = name
                        .as_str()
                        .ok_or_else(|| format!("{} names must be strings, found {}", tag, name))?;
                    refs.push(Identity::new(tag.clone(), name));
                }
            }
            other => return Err(format!("{} must name elements, found {}", tag, other)),
        }
    }
    Ok(refs)
}

/// One attribute an element kind accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub shape: FieldShape,
    pub required: bool,
}

const fn field(name: &'static str, shape: FieldShape) -> FieldSpec {
    FieldSpec {
        name,
        shape,
        required: false,
    }
}

const fn required(name: &'static str, shape: FieldShape) -> FieldSpec {
    FieldSpec {
        name,
        shape,
        required: true,
    }
}

/// A nested collection reconciled below its parent element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSpec {
    /// Attribute holding the declared children.
    pub field: &'static str,
    /// Child kind as known to the store.
    pub kind: &'static str,
    /// Attribute of each child listing its member references.
    pub member_field: &'static str,
    pub targets: &'static [&'static str],
}

impl ChildSpec {
    /// Parses the declared children: a list of `{name, <member_field>}` maps.
    pub fn parse(&self, value: &Value) -> Result<Vec<DeclaredChild>, String> {
        let items = value
            .as_array()
            .ok_or_else(|| format!("{} must be a list", self.field))?;

        let mut children = Vec::with_capacity(items.len());
        for item in items {
            let map = item
                .as_object()
                .ok_or_else(|| format!("{} entries must be maps", self.field))?;

            let name = match map.get("name") {
                Some(Value::String(name)) if !name.trim().is_empty() => name.clone(),
                _ => return Err(format!("{} entries need a name", self.field)),
            };

            if let Some(key) = map
                .keys()
                .find(|k| k.as_str() != "name" && k.as_str() != self.member_field)
            {
                return Err(format!("{} '{}': unknown attribute '{}'", self.field, name, key));
            }

            let members = match map.get(self.member_field) {
                Some(value) => FieldShape::RefList(self.targets)
                    .parse_references(value)
                    .map_err(|e| format!("{} '{}': {}", self.field, name, e))?,
                None => Vec::new(),
            };

            children.push(DeclaredChild { name, members });
        }
        Ok(children)
    }
}

/// A child parsed from a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredChild {
    pub name: String,
    pub members: Vec<Identity>,
}

/// Description of one element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementKind {
    pub tag: &'static str,
    /// Collection name of the management API.
    pub entry_point: &'static str,
    pub fields: &'static [FieldSpec],
    pub children: Option<&'static ChildSpec>,
    /// Composite kinds (engines) are reconciled by the engine orchestrator.
    pub composite: bool,
}

impl ElementKind {
    const fn new(tag: &'static str, entry_point: &'static str, fields: &'static [FieldSpec]) -> Self {
        Self {
            tag,
            entry_point,
            fields,
            children: None,
            composite: false,
        }
    }

    const fn with_children(mut self, children: &'static ChildSpec) -> Self {
        self.children = Some(children);
        self
    }

    const fn composite(mut self) -> Self {
        self.composite = true;
        self
    }

    /// Looks up the declaration of one attribute.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checks declared attributes against this kind.
    pub fn check(&self, identity: &Identity, attributes: &Attributes) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for (key, value) in attributes {
            if let Some(children) = self.children.filter(|c| c.field == key) {
                match children.parse(value) {
                    Ok(declared) => {
                        for member in declared.iter().flat_map(|c| &c.members) {
                            check_target(identity, key, children.targets, member, &mut issues);
                        }
                    }
                    Err(message) => issues.push(ValidationIssue::Malformed {
                        identity: identity.clone(),
                        field: key.clone(),
                        message,
                    }),
                }
                continue;
            }

            let Some(spec) = self.field(key) else {
                issues.push(ValidationIssue::UnknownField {
                    identity: identity.clone(),
                    field: key.clone(),
                });
                continue;
            };

            match spec.shape {
                FieldShape::Scalar if value.is_array() => issues.push(ValidationIssue::Malformed {
                    identity: identity.clone(),
                    field: key.clone(),
                    message: "expected a single value, found a list".to_string(),
                }),
                FieldShape::List if !value.is_array() => issues.push(ValidationIssue::Malformed {
                    identity: identity.clone(),
                    field: key.clone(),
                    message: "expected a list".to_string(),
                }),
                FieldShape::Ref(targets) | FieldShape::RefList(targets) => {
                    match spec.shape.parse_references(value) {
                        Ok(refs) => {
                            for reference in &refs {
                                check_target(identity, key, targets, reference, &mut issues);
                            }
                        }
                        Err(message) => issues.push(ValidationIssue::Malformed {
                            identity: identity.clone(),
                            field: key.clone(),
                            message,
                        }),
                    }
                }
                _ => {}
            }
        }

        for spec in self.fields.iter().filter(|f| f.required) {
            let missing = attributes.get(spec.name).map_or(true, Value::is_null);
            if missing {
                issues.push(ValidationIssue::MissingField {
                    identity: identity.clone(),
                    field: spec.name.to_string(),
                });
            }
        }

        issues
    }

    /// Every element referenced by the declared attributes, in attribute
    /// order and without duplicates. Malformed values are skipped; they are
    /// reported by [`ElementKind::check`].
    pub fn references(&self, attributes: &Attributes) -> Vec<Identity> {
        let mut seen = HashSet::new();
        let mut refs = Vec::new();

        for (key, value) in attributes {
            let found = if let Some(children) = self.children.filter(|c| c.field == key) {
                children
                    .parse(value)
                    .map(|declared| declared.into_iter().flat_map(|c| c.members).collect())
                    .unwrap_or_default()
            } else {
                self.field(key)
                    .and_then(|spec| spec.shape.parse_references(value).ok())
                    .unwrap_or_default()
            };

            for reference in found {
                if seen.insert(reference.clone()) {
                    refs.push(reference);
                }
            }
        }

        refs
    }

    /// Renders declared attributes into their remote form: references become
    /// hrefs, child collections are left out. Fails with the first reference
    /// `href_of` cannot resolve.
    pub fn render(
        &self,
        attributes: &Attributes,
        href_of: &dyn Fn(&Identity) -> Option<String>,
    ) -> Result<Attributes, Identity> {
        let mut rendered = Attributes::new();

        for (key, value) in attributes {
            if self.children.is_some_and(|c| c.field == key) {
                continue;
            }

            let shape = self.field(key).map_or(FieldShape::Scalar, |f| f.shape);
            let value = match shape {
                FieldShape::Ref(_) => {
                    let refs = shape.parse_references(value).unwrap_or_default();
                    match refs.first() {
                        Some(reference) => Value::String(href_of(reference).ok_or_else(|| reference.clone())?),
                        None => value.clone(),
                    }
                }
                FieldShape::RefList(_) => {
                    let mut hrefs = Vec::new();
                    for reference in shape.parse_references(value).unwrap_or_default() {
                        let href = href_of(&reference).ok_or(reference)?;
                        hrefs.push(Value::String(href));
                    }
                    Value::Array(hrefs)
                }
                FieldShape::Scalar | FieldShape::List => value.clone(),
            };
            rendered.insert(key.clone(), value);
        }

        Ok(rendered)
    }
}

fn check_target(
    identity: &Identity,
    field: &str,
    targets: &[&str],
    reference: &Identity,
    issues: &mut Vec<ValidationIssue>,
) {
    if !targets.contains(&reference.type_tag.as_str()) {
        issues.push(ValidationIssue::InvalidTarget {
            identity: identity.clone(),
            field: field.to_string(),
            target: reference.clone(),
        });
    }
}

const NETWORK_ELEMENTS: &[&str] = &[
    "host",
    "network",
    "address_range",
    "router",
    "domain_name",
    "group",
    "ip_list",
];

const SERVICES: &[&str] = &["tcp_service", "udp_service", "service_group"];

const VPN_SITE: ChildSpec = ChildSpec {
    field: "vpn_site",
    kind: "vpn_site",
    member_field: "site_element",
    targets: &["host", "network", "address_range", "group"],
};

use FieldShape::{List, Ref, RefList, Scalar};

const FILTERS: &[&str] = &["ip_access_list", "ip_prefix_list"];

const COMMENT_ONLY: &[FieldSpec] = &[field("comment", Scalar)];

const HOST_FIELDS: &[FieldSpec] = &[
    required("address", Scalar),
    field("ipv6_address", Scalar),
    field("secondary", List),
    field("comment", Scalar),
];

const NETWORK_FIELDS: &[FieldSpec] = &[
    field("ipv4_network", Scalar),
    field("ipv6_network", Scalar),
    field("comment", Scalar),
];

const ADDRESS_RANGE_FIELDS: &[FieldSpec] = &[required("ip_range", Scalar), field("comment", Scalar)];

const IP_LIST_FIELDS: &[FieldSpec] = &[field("iplist", List), field("comment", Scalar)];

const GROUP_FIELDS: &[FieldSpec] = &[
    field("members", RefList(NETWORK_ELEMENTS)),
    field("comment", Scalar),
];

const PORT_SERVICE_FIELDS: &[FieldSpec] = &[
    required("min_dst_port", Scalar),
    field("max_dst_port", Scalar),
    field("comment", Scalar),
];

const SERVICE_GROUP_FIELDS: &[FieldSpec] =
    &[field("members", RefList(SERVICES)), field("comment", Scalar)];

const SNMP_AGENT_FIELDS: &[FieldSpec] = &[
    field("version", Scalar),
    field("monitoring_community", Scalar),
    field("comment", Scalar),
];

const AUTONOMOUS_SYSTEM_FIELDS: &[FieldSpec] =
    &[required("as_number", Scalar), field("comment", Scalar)];

const BGP_PROFILE_FIELDS: &[FieldSpec] = &[
    field("external_distance", Scalar),
    field("internal_distance", Scalar),
    field("local_distance", Scalar),
    field("port", Scalar),
    field("comment", Scalar),
];

const BGP_PEERING_FIELDS: &[FieldSpec] = &[
    field("inbound_rules", RefList(FILTERS)),
    field("outbound_rules", RefList(FILTERS)),
    field("local_as_option", Scalar),
    field("comment", Scalar),
];

const EXTERNAL_BGP_PEER_FIELDS: &[FieldSpec] = &[
    required("neighbor_as", Ref(&["autonomous_system"])),
    required("neighbor_ip", Scalar),
    field("neighbor_port", Scalar),
    field("comment", Scalar),
];

const FILTER_LIST_FIELDS: &[FieldSpec] = &[field("entries", List), field("comment", Scalar)];

const OSPF_INTERFACE_SETTINGS_FIELDS: &[FieldSpec] = &[
    field("hello_interval", Scalar),
    field("dead_interval", Scalar),
    field("authentication_type", Scalar),
    field("comment", Scalar),
];

const OSPF_AREA_FIELDS: &[FieldSpec] = &[
    field("area_id", Scalar),
    field("area_type", Scalar),
    field("interface_settings_ref", Ref(&["ospfv2_interface_settings"])),
    field("inbound_filters", RefList(FILTERS)),
    field("outbound_filters", RefList(FILTERS)),
    field("comment", Scalar),
];

const OSPF_PROFILE_FIELDS: &[FieldSpec] = &[
    field("external_distance", Scalar),
    field("inter_distance", Scalar),
    field("intra_distance", Scalar),
    field("comment", Scalar),
];

const NETLINK_FIELDS: &[FieldSpec] = &[
    required("gateway", Ref(&["router", "host"])),
    required("network", RefList(&["network"])),
    field("probe_address", List),
    field("domain_server_address", List),
    field("comment", Scalar),
];

const EXTERNAL_GATEWAY_FIELDS: &[FieldSpec] =
    &[field("external_endpoint", List), field("comment", Scalar)];

/// Built-in element kinds.
pub const CATALOG: &[ElementKind] = &[
    ElementKind::new("host", "host", HOST_FIELDS),
    ElementKind::new("network", "network", NETWORK_FIELDS),
    ElementKind::new("address_range", "address_range", ADDRESS_RANGE_FIELDS),
    ElementKind::new("router", "router", HOST_FIELDS),
    ElementKind::new("domain_name", "domain_name", COMMENT_ONLY),
    ElementKind::new("ip_list", "ip_list", IP_LIST_FIELDS),
    ElementKind::new("interface_zone", "interface_zone", COMMENT_ONLY),
    ElementKind::new("group", "group", GROUP_FIELDS),
    ElementKind::new("tcp_service", "tcp_service", PORT_SERVICE_FIELDS),
    ElementKind::new("udp_service", "udp_service", PORT_SERVICE_FIELDS),
    ElementKind::new("service_group", "service_group", SERVICE_GROUP_FIELDS),
    ElementKind::new("category", "category_tag", COMMENT_ONLY),
    ElementKind::new("location", "location", COMMENT_ONLY),
    ElementKind::new("snmp_agent", "snmp_agent", SNMP_AGENT_FIELDS),
    ElementKind::new("autonomous_system", "autonomous_system", AUTONOMOUS_SYSTEM_FIELDS),
    ElementKind::new("bgp_profile", "bgp_profile", BGP_PROFILE_FIELDS),
    ElementKind::new("bgp_peering", "bgp_peering", BGP_PEERING_FIELDS),
    ElementKind::new("external_bgp_peer", "external_bgp_peer", EXTERNAL_BGP_PEER_FIELDS),
    ElementKind::new("ip_access_list", "ip_access_list", FILTER_LIST_FIELDS),
    ElementKind::new("ip_prefix_list", "ip_prefix_list", FILTER_LIST_FIELDS),
    ElementKind::new(
        "ospfv2_interface_settings",
        "ospfv2_interface_settings",
        OSPF_INTERFACE_SETTINGS_FIELDS,
    ),
    ElementKind::new("ospfv2_area", "ospfv2_area", OSPF_AREA_FIELDS),
    ElementKind::new("ospfv2_profile", "ospfv2_profile", OSPF_PROFILE_FIELDS),
    ElementKind::new("static_netlink", "netlink", NETLINK_FIELDS),
    ElementKind::new("external_gateway", "external_gateway", EXTERNAL_GATEWAY_FIELDS)
        .with_children(&VPN_SITE),
    ElementKind::new("policy_vpn", "vpn", COMMENT_ONLY),
    ElementKind::new("single_fw", "single_fw", &[]).composite(),
    ElementKind::new("fw_cluster", "fw_cluster", &[]).composite(),
];

/// Tag-to-kind table.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    kinds: BTreeMap<&'static str, ElementKind>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every kind of [`CATALOG`].
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for kind in CATALOG {
            registry.register(*kind);
        }
        registry
    }

    /// Adds or replaces a kind.
    pub fn register(&mut self, kind: ElementKind) {
        self.kinds.insert(kind.tag, kind);
    }

    pub fn lookup(&self, tag: &str) -> Option<&ElementKind> {
        self.kinds.get(tag)
    }

    /// References declared by an element. Removal requests reference nothing.
    pub fn references_of(&self, element: &ElementDescriptor) -> Vec<Identity> {
        if element.is_absent() {
            return Vec::new();
        }
        self.lookup(element.type_tag())
            .map(|kind| kind.references(&element.attributes))
            .unwrap_or_default()
    }

    /// Registered tags in sorted order.
    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kinds.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_builtin_registry() {
        let registry = Registry::builtin();
        assert!(registry.lookup("external_bgp_peer").is_some());
        assert!(registry.lookup("single_fw").is_some_and(|k| k.composite));
        assert!(registry.lookup("teleporter").is_none());
        assert_eq!(registry.tags().count(), CATALOG.len());
    }

    #[test]
    fn test_parse_reference_notations() {
        let single = FieldShape::Ref(&["autonomous_system"]);
        assert_eq!(
            single.parse_references(&json!("as-200")).unwrap(),
            vec![Identity::new("autonomous_system", "as-200")]
        );

        let multi = FieldShape::Ref(&["router", "host"]);
        assert!(multi.parse_references(&json!("gw")).is_err());
        assert_eq!(
            multi.parse_references(&json!({"router": "gw"})).unwrap(),
            vec![Identity::new("router", "gw")]
        );

        let list = FieldShape::RefList(NETWORK_ELEMENTS);
        let typed_map = list
            .parse_references(&json!({"host": ["a", "b"], "network": "n"}))
            .unwrap();
        assert_eq!(typed_map.len(), 3);
        let typed_list = list
            .parse_references(&json!([{"host": "a"}, {"network": "n"}]))
            .unwrap();
        assert_eq!(typed_list[1], Identity::new("network", "n"));
        assert!(list.parse_references(&json!(42)).is_err());
    }

    #[test]
    fn test_check_reports_every_problem() {
        let registry = Registry::builtin();
        let kind = registry.lookup("static_netlink").unwrap();
        let identity = Identity::new("static_netlink", "nl1");

        let issues = kind.check(
            &identity,
            &attrs(json!({
                "gateway": {"network": "oops"},
                "probe_address": "10.0.0.1",
                "mtu": 1500,
            })),
        );

        // invalid gateway target, probe_address not a list, unknown mtu, missing network
        assert_eq!(issues.len(), 4, "{:?}", issues);
    }

    #[test]
    fn test_references_include_child_members() {
        let registry = Registry::builtin();
        let kind = registry.lookup("external_gateway").unwrap();
        let refs = kind.references(&attrs(json!({
            "external_endpoint": [{"address": "1.1.1.1"}],
            "vpn_site": [
                {"name": "site-a", "site_element": {"network": ["n1", "n2"]}},
                {"name": "site-b", "site_element": {"network": ["n1"], "host": ["h1"]}},
            ],
        })));
        assert_eq!(
            refs,
            vec![
                Identity::new("network", "n1"),
                Identity::new("network", "n2"),
                Identity::new("host", "h1"),
            ]
        );
    }

    #[test]
    fn test_child_parse_rejects_unknown_keys() {
        let err = VPN_SITE
            .parse(&json!([{"name": "site-a", "members": {"network": ["n1"]}}]))
            .unwrap_err();
        assert!(err.contains("members"));
    }

    #[test]
    fn test_render_replaces_references_with_hrefs() {
        let registry = Registry::builtin();
        let kind = registry.lookup("external_bgp_peer").unwrap();
        let declared = attrs(json!({"neighbor_as": "as-200", "neighbor_ip": "9.9.9.9"}));

        let rendered = kind
            .render(&declared, &|id| Some(format!("mem://{}", id)))
            .unwrap();
        assert_eq!(rendered["neighbor_as"], "mem://autonomous_system/as-200");
        assert_eq!(rendered["neighbor_ip"], "9.9.9.9");

        let unresolved = kind.render(&declared, &|_| None).unwrap_err();
        assert_eq!(unresolved, Identity::new("autonomous_system", "as-200"));
    }
}
