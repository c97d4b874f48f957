//! Rule, route and group model types
//!
//! These are the owned, structured values that flow between the store, the
//! compiler and the group manager. Text encodings (`as_str`) are the ones used
//! both in the state store and in the JSON exchange format.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// Maximum number of firewall plus routing rules in a single group
pub const MAX_RULES_PER_GROUP: usize = 1000;

/// Routing table ids with fixed names in iproute2
const RESERVED_TABLES: [(&str, u32); 4] =
    [("unspec", 0), ("default", 253), ("main", 254), ("local", 255)];

/// Filter chain a rule is installed in
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    #[strum(serialize = "input")]
    Input,
    #[strum(serialize = "output")]
    Output,
    #[strum(serialize = "forward")]
    Forward,
    /// Source NAT, installed in the postrouting hook
    #[strum(serialize = "nat")]
    Nat,
}

impl Chain {
    pub const fn as_str(self) -> &'static str {
        match self {
            Chain::Input => "input",
            Chain::Output => "output",
            Chain::Forward => "forward",
            Chain::Nat => "nat",
        }
    }

    /// Name of the base chain inside the managed nftables table
    pub const fn nft_chain(self) -> &'static str {
        match self {
            Chain::Input => "input",
            Chain::Output => "output",
            Chain::Forward => "forward",
            Chain::Nat => "postrouting",
        }
    }

    pub fn from_nft_chain(name: &str) -> Option<Self> {
        match name {
            "input" => Some(Chain::Input),
            "output" => Some(Chain::Output),
            "forward" => Some(Chain::Forward),
            "postrouting" => Some(Chain::Nat),
            _ => None,
        }
    }
}

/// Verdict of a firewall rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    #[strum(serialize = "accept")]
    Accept,
    #[strum(serialize = "drop")]
    Drop,
    #[strum(serialize = "masquerade")]
    Masquerade,
}

impl RuleType {
    pub const fn as_str(self) -> &'static str {
        match self {
            RuleType::Accept => "accept",
            RuleType::Drop => "drop",
            RuleType::Masquerade => "masquerade",
        }
    }
}

/// Address family
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    #[strum(serialize = "ipv4")]
    Ipv4,
    #[strum(serialize = "ipv6")]
    Ipv6,
}

impl Family {
    pub const fn as_str(self) -> &'static str {
        match self {
            Family::Ipv4 => "ipv4",
            Family::Ipv6 => "ipv6",
        }
    }

    /// `AF_INET` / `AF_INET6` as used by the C ABI
    pub const fn from_af(af: u8) -> Option<Self> {
        match af {
            2 => Some(Family::Ipv4),
            10 => Some(Family::Ipv6),
            _ => None,
        }
    }

    /// nft payload protocol for address matches
    pub const fn payload_protocol(self) -> &'static str {
        match self {
            Family::Ipv4 => "ip",
            Family::Ipv6 => "ip6",
        }
    }

    /// iproute2 family flag
    pub const fn ip_flag(self) -> &'static str {
        match self {
            Family::Ipv4 => "-4",
            Family::Ipv6 => "-6",
        }
    }

    pub fn of(network: &IpNetwork) -> Self {
        match network {
            IpNetwork::V4(_) => Family::Ipv4,
            IpNetwork::V6(_) => Family::Ipv6,
        }
    }
}

/// Layer-4 protocol matched by a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    #[strum(to_string = "any", serialize = "")]
    Any,
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "icmp")]
    Icmp,
    #[strum(to_string = "icmpv6", serialize = "ipv6-icmp")]
    Icmpv6,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Any => "any",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Icmpv6 => "icmpv6",
        }
    }

    /// Value of `meta l4proto` in nft JSON
    pub const fn nft_name(self) -> Option<&'static str> {
        match self {
            Protocol::Any => None,
            Protocol::Tcp => Some("tcp"),
            Protocol::Udp => Some("udp"),
            Protocol::Icmp => Some("icmp"),
            Protocol::Icmpv6 => Some("ipv6-icmp"),
        }
    }

    pub const fn has_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

/// Connection tracking state
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum CtState {
    #[strum(serialize = "new")]
    New,
    #[strum(serialize = "established")]
    Established,
    #[strum(serialize = "related")]
    Related,
    #[strum(serialize = "invalid")]
    Invalid,
}

impl CtState {
    pub const fn as_str(self) -> &'static str {
        match self {
            CtState::New => "new",
            CtState::Established => "established",
            CtState::Related => "related",
            CtState::Invalid => "invalid",
        }
    }
}

/// Parses a comma separated conntrack state list such as `established,related`.
///
/// The result is sorted and deduplicated so equal sets compare equal.
pub fn parse_states(text: &str) -> std::result::Result<Vec<CtState>, String> {
    let mut states = text
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<CtState>()
                .map_err(|_| format!("unknown conntrack state '{s}'"))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    states.sort();
    states.dedup();
    Ok(states)
}

pub fn format_states(states: &[CtState]) -> String {
    states
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Kind of routing rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    /// `ip rule`: selects a routing table
    #[strum(serialize = "policy")]
    Policy,
    /// `ip route` inside a table
    #[strum(serialize = "route")]
    Route,
}

impl RouteType {
    pub const fn as_str(self) -> &'static str {
        match self {
            RouteType::Policy => "policy",
            RouteType::Route => "route",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Descriptors
// ═══════════════════════════════════════════════════════════════════════════

/// Firewall rule descriptor, before the store assigns an id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FirewallRuleSpec {
    pub chain: Chain,
    pub rule_type: RuleType,
    #[serde(default)]
    pub family: Family,
    #[serde(default)]
    pub proto: Protocol,
    #[serde(default)]
    pub dport: Option<u16>,
    #[serde(default)]
    pub source: Option<IpNetwork>,
    #[serde(default)]
    pub destination: Option<IpNetwork>,
    #[serde(default)]
    pub in_iface: Option<String>,
    #[serde(default)]
    pub out_iface: Option<String>,
    #[serde(default)]
    pub state_match: Vec<CtState>,
}

impl FirewallRuleSpec {
    pub fn new(chain: Chain, rule_type: RuleType) -> Self {
        Self {
            chain,
            rule_type,
            family: Family::Ipv4,
            proto: Protocol::Any,
            dport: None,
            source: None,
            destination: None,
            in_iface: None,
            out_iface: None,
            state_match: Vec::new(),
        }
    }

    pub fn accept(chain: Chain) -> Self {
        Self::new(chain, RuleType::Accept)
    }

    pub fn drop(chain: Chain) -> Self {
        Self::new(chain, RuleType::Drop)
    }

    pub fn masquerade() -> Self {
        Self::new(Chain::Nat, RuleType::Masquerade)
    }

    pub fn family(mut self, family: Family) -> Self {
        self.family = family;
        self
    }

    pub fn port(mut self, proto: Protocol, dport: u16) -> Self {
        self.proto = proto;
        self.dport = Some(dport);
        self
    }

    pub fn proto(mut self, proto: Protocol) -> Self {
        self.proto = proto;
        self
    }

    pub fn source(mut self, network: IpNetwork) -> Self {
        self.family = Family::of(&network);
        self.source = Some(network);
        self
    }

    pub fn destination(mut self, network: IpNetwork) -> Self {
        self.family = Family::of(&network);
        self.destination = Some(network);
        self
    }

    pub fn in_iface(mut self, iface: impl Into<String>) -> Self {
        self.in_iface = Some(iface.into());
        self
    }

    pub fn out_iface(mut self, iface: impl Into<String>) -> Self {
        self.out_iface = Some(iface.into());
        self
    }

    pub fn states(mut self, states: &[CtState]) -> Self {
        let mut states = states.to_vec();
        states.sort();
        states.dedup();
        self.state_match = states;
        self
    }

    /// Human readable one-line summary used in logs and drift diffs
    pub fn summary(&self) -> String {
        let mut parts = vec![self.chain.as_str().to_string(), self.family.as_str().to_string()];
        if let Some(iface) = &self.in_iface {
            parts.push(format!("iif {iface}"));
        }
        if let Some(iface) = &self.out_iface {
            parts.push(format!("oif {iface}"));
        }
        if let Some(src) = &self.source {
            parts.push(format!("saddr {src}"));
        }
        if let Some(dst) = &self.destination {
            parts.push(format!("daddr {dst}"));
        }
        if self.proto != Protocol::Any {
            parts.push(self.proto.as_str().to_string());
        }
        if let Some(port) = self.dport {
            parts.push(format!("dport {port}"));
        }
        if !self.state_match.is_empty() {
            parts.push(format!("ct state {}", format_states(&self.state_match)));
        }
        parts.push(self.rule_type.as_str().to_string());
        parts.join(" ")
    }
}

/// Routing rule descriptor, before the store assigns an id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RoutingRuleSpec {
    pub rule_type: RouteType,
    #[serde(default)]
    pub from_network: Option<IpNetwork>,
    #[serde(default)]
    pub to_network: Option<IpNetwork>,
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub table_id: u32,
    #[serde(default)]
    pub priority: u32,
    /// `None` is the default route
    #[serde(default)]
    pub destination: Option<IpNetwork>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub fwmark: u32,
}

impl RoutingRuleSpec {
    /// Policy rule selecting `table_id` at `priority`
    pub fn policy(table_id: u32, priority: u32) -> Self {
        Self {
            rule_type: RouteType::Policy,
            from_network: None,
            to_network: None,
            table_name: String::new(),
            table_id,
            priority,
            destination: None,
            device: None,
            fwmark: 0,
        }
    }

    /// Route via `device` in `table_id`; default route unless a destination is set
    pub fn route(device: impl Into<String>, table_id: u32) -> Self {
        Self {
            rule_type: RouteType::Route,
            from_network: None,
            to_network: None,
            table_name: String::new(),
            table_id,
            priority: 0,
            destination: None,
            device: Some(device.into()),
            fwmark: 0,
        }
    }

    pub fn from(mut self, network: IpNetwork) -> Self {
        self.from_network = Some(network);
        self
    }

    pub fn to(mut self, network: IpNetwork) -> Self {
        self.to_network = Some(network);
        self
    }

    pub fn fwmark(mut self, mark: u32) -> Self {
        self.fwmark = mark;
        self
    }

    pub fn destination(mut self, network: IpNetwork) -> Self {
        self.destination = Some(network);
        self
    }

    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    /// Address family, taken from the first address present (IPv4 otherwise)
    pub fn family(&self) -> Family {
        self.from_network
            .as_ref()
            .or(self.to_network.as_ref())
            .or(self.destination.as_ref())
            .map_or(Family::Ipv4, Family::of)
    }

    /// Resolves `table_name` into `table_id` when only the name was given.
    ///
    /// Accepts the reserved iproute2 names, numeric strings, and entries of
    /// `rt_tables` (the file content is passed in so this stays pure).
    pub fn resolve_table(&mut self, rt_tables: Option<&str>) -> std::result::Result<(), String> {
        if self.table_id != 0 || self.table_name.is_empty() {
            return Ok(());
        }
        let name = self.table_name.trim();
        if let Some((_, id)) = RESERVED_TABLES.iter().find(|(n, _)| *n == name) {
            self.table_id = *id;
            return Ok(());
        }
        if let Ok(id) = name.parse::<u32>() {
            self.table_id = id;
            return Ok(());
        }
        let found = rt_tables.and_then(|content| {
            content.lines().find_map(|line| {
                let line = line.trim();
                if line.starts_with('#') {
                    return None;
                }
                let mut fields = line.split_whitespace();
                let id = fields.next()?.parse::<u32>().ok()?;
                (fields.next()? == name).then_some(id)
            })
        });
        match found {
            Some(id) => {
                self.table_id = id;
                Ok(())
            }
            None => Err(format!("unknown routing table '{name}'")),
        }
    }

    pub fn summary(&self) -> String {
        match self.rule_type {
            RouteType::Policy => {
                let mut parts = vec!["rule".to_string()];
                if let Some(from) = &self.from_network {
                    parts.push(format!("from {from}"));
                }
                if let Some(to) = &self.to_network {
                    parts.push(format!("to {to}"));
                }
                if self.fwmark > 0 {
                    parts.push(format!("fwmark {:#x}", self.fwmark));
                }
                parts.push(format!("table {} priority {}", self.table_id, self.priority));
                parts.join(" ")
            }
            RouteType::Route => format!(
                "route {} dev {} table {}",
                self.destination
                    .map_or_else(|| "default".to_string(), |d| d.to_string()),
                self.device.as_deref().unwrap_or("-"),
                self.table_id
            ),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Stored rows
// ═══════════════════════════════════════════════════════════════════════════

/// Named, prioritized collection of rules toggled as one unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleGroup {
    pub name: String,
    pub group_type: String,
    pub priority: i32,
    pub enabled: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FirewallRule {
    pub id: i64,
    pub group_name: String,
    #[serde(flatten)]
    pub spec: FirewallRuleSpec,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingRule {
    pub id: i64,
    pub group_name: String,
    #[serde(flatten)]
    pub spec: RoutingRuleSpec,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_nft_names() {
        assert_eq!(Chain::Nat.nft_chain(), "postrouting");
        assert_eq!(Chain::from_nft_chain("postrouting"), Some(Chain::Nat));
        assert_eq!(Chain::from_nft_chain("prerouting"), None);
        assert_eq!("forward".parse::<Chain>().unwrap(), Chain::Forward);
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("".parse::<Protocol>().unwrap(), Protocol::Any);
        assert_eq!("ipv6-icmp".parse::<Protocol>().unwrap(), Protocol::Icmpv6);
        assert!("sctp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_states_are_normalized() {
        let states = parse_states("related, established,related").unwrap();
        assert_eq!(states, vec![CtState::Established, CtState::Related]);
        assert_eq!(format_states(&states), "established,related");
        assert!(parse_states("bogus").is_err());
    }

    #[test]
    fn test_source_sets_family() {
        let spec = FirewallRuleSpec::accept(Chain::Input).source("fd00::/64".parse().unwrap());
        assert_eq!(spec.family, Family::Ipv6);
    }

    #[test]
    fn test_resolve_reserved_and_numeric_tables() {
        let mut spec = RoutingRuleSpec::policy(0, 100).table_name("main");
        spec.resolve_table(None).unwrap();
        assert_eq!(spec.table_id, 254);

        let mut spec = RoutingRuleSpec::policy(0, 100).table_name("201");
        spec.resolve_table(None).unwrap();
        assert_eq!(spec.table_id, 201);
    }

    #[test]
    fn test_resolve_table_from_rt_tables() {
        let rt_tables = "# comment\n255\tlocal\n200 phantom_mh\n";
        let mut spec = RoutingRuleSpec::route("wg1", 0).table_name("phantom_mh");
        spec.resolve_table(Some(rt_tables)).unwrap();
        assert_eq!(spec.table_id, 200);

        let mut spec = RoutingRuleSpec::route("wg1", 0).table_name("nope");
        assert!(spec.resolve_table(Some(rt_tables)).is_err());
    }

    #[test]
    fn test_route_family_defaults_to_ipv4() {
        assert_eq!(RoutingRuleSpec::route("wg0", 200).family(), Family::Ipv4);
        let spec = RoutingRuleSpec::route("wg0", 200).destination("::/0".parse().unwrap());
        assert_eq!(spec.family(), Family::Ipv6);
    }

    #[test]
    fn test_summaries() {
        let spec = FirewallRuleSpec::masquerade()
            .source("10.0.0.0/24".parse().unwrap())
            .out_iface("eth0");
        assert_eq!(spec.summary(), "nat ipv4 oif eth0 saddr 10.0.0.0/24 masquerade");

        let route = RoutingRuleSpec::route("wg1", 200);
        assert_eq!(route.summary(), "route default dev wg1 table 200");
    }
}
