//! Preset library
//!
//! Each preset is a pure expansion of a high-level intent into a
//! [`PresetPlan`]: one group with its firewall rules and routes. The group
//! manager installs a plan as a single unit, so a preset is either fully
//! present (store and kernel) or not at all.
//!
//! | Preset | Group | Priority |
//! |---|---|---|
//! | VPN | caller supplied | 100 |
//! | Multihop | caller supplied | 80 |
//! | Kill-switch | `kill-switch` | 10 |
//! | DNS protection | `dns-protection` | 20 |
//! | IPv6 block | `ipv6-block` | 5 |

use super::error::{Error, Result};
use super::firewall::{
    Chain, CtState, Family, FirewallRuleSpec, Protocol, RoutingRuleSpec,
};
use crate::validators;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::IpAddr;

pub const VPN_PRIORITY: i32 = 100;
pub const MULTIHOP_PRIORITY: i32 = 80;
pub const KILL_SWITCH_PRIORITY: i32 = 10;
pub const DNS_PRIORITY: i32 = 20;
pub const IPV6_BLOCK_PRIORITY: i32 = 5;

pub const KILL_SWITCH_GROUP: &str = "kill-switch";
pub const DNS_GROUP: &str = "dns-protection";
pub const IPV6_BLOCK_GROUP: &str = "ipv6-block";

/// Policy rule priorities used by multihop
const MULTIHOP_SUBNET_RULE_PRIORITY: u32 = 100;
const MULTIHOP_FWMARK_RULE_PRIORITY: u32 = 200;

const DNS_PORT: u16 = 53;
const DHCP_PORTS: [u16; 2] = [67, 68];

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PresetKind {
    Vpn,
    Multihop,
    KillSwitch,
    DnsProtection,
    Ipv6Block,
}

impl PresetKind {
    /// `group_type` of the generated group
    pub const fn group_type(self) -> &'static str {
        match self {
            PresetKind::Vpn => "vpn",
            PresetKind::Multihop => "multihop",
            PresetKind::KillSwitch => "kill_switch",
            PresetKind::DnsProtection => "dns_protection",
            PresetKind::Ipv6Block => "ipv6_block",
        }
    }
}

/// A fully expanded preset, ready for [`GroupManager::install`](super::groups::GroupManager::install)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresetPlan {
    pub preset_name: String,
    pub kind: PresetKind,
    pub group_name: String,
    pub priority: i32,
    /// Preset parameters, stored as group metadata and binding params
    pub metadata: Value,
    pub rules: Vec<FirewallRuleSpec>,
    pub routes: Vec<RoutingRuleSpec>,
}

impl PresetPlan {
    fn new(name: &str, kind: PresetKind, priority: i32, params: Value) -> Self {
        let mut metadata = json!({ "preset": kind.as_ref() });
        if let (Some(meta), Value::Object(params)) = (metadata.as_object_mut(), params) {
            meta.extend(params);
        }
        Self {
            preset_name: name.to_string(),
            kind,
            group_name: name.to_string(),
            priority,
            metadata,
            rules: Vec::new(),
            routes: Vec::new(),
        }
    }

    fn rule(mut self, spec: FirewallRuleSpec) -> Self {
        self.rules.push(spec);
        self
    }

    fn route(mut self, spec: RoutingRuleSpec) -> Self {
        self.routes.push(spec);
        self
    }
}

fn iface<'a>(field: &str, name: &'a str) -> Result<&'a str> {
    validators::validate_interface(name).map_err(|e| Error::validation(field, e))
}

fn port(field: &str, port: u16) -> Result<u16> {
    validators::validate_port(port).map_err(|e| Error::validation(field, e))
}

fn established() -> [CtState; 2] {
    [CtState::Established, CtState::Related]
}

/// Road-warrior VPN server: accept the tunnel port, forward between the
/// tunnel and the uplink, masquerade tunnel clients.
///
/// # Errors
///
/// [`Error::Validation`] for bad names, interfaces or port.
pub fn vpn(
    name: &str,
    wg_iface: &str,
    wg_port: u16,
    wg_subnet: IpNetwork,
    out_iface: &str,
) -> Result<PresetPlan> {
    validators::validate_group_name(name).map_err(|e| Error::validation("name", e))?;
    let wg = iface("wg_iface", wg_iface)?;
    let out = iface("out_iface", out_iface)?;
    let wg_port = port("wg_port", wg_port)?;

    let params = json!({
        "wg_iface": wg, "wg_port": wg_port, "wg_subnet": wg_subnet.to_string(), "out_iface": out,
    });
    Ok(PresetPlan::new(name, PresetKind::Vpn, VPN_PRIORITY, params)
        .rule(FirewallRuleSpec::accept(Chain::Input).port(Protocol::Udp, wg_port))
        .rule(FirewallRuleSpec::accept(Chain::Forward).in_iface(wg).out_iface(out))
        .rule(
            FirewallRuleSpec::accept(Chain::Forward)
                .in_iface(out)
                .out_iface(wg)
                .states(&established()),
        )
        .rule(
            FirewallRuleSpec::masquerade()
                .source(wg_subnet)
                .out_iface(out),
        ))
}

/// Chains two tunnels: traffic from `subnet` (or carrying `fwmark`) is routed
/// through a dedicated table whose default route leaves via `out_iface`.
///
/// # Errors
///
/// [`Error::Validation`] for bad names, interfaces or table id.
pub fn multihop(
    name: &str,
    in_iface: &str,
    out_iface: &str,
    fwmark: u32,
    table_id: u32,
    subnet: IpNetwork,
) -> Result<PresetPlan> {
    validators::validate_group_name(name).map_err(|e| Error::validation("name", e))?;
    let inbound = iface("in_iface", in_iface)?;
    let out = iface("out_iface", out_iface)?;
    validators::validate_table_id(table_id).map_err(|e| Error::validation("table_id", e))?;

    let params = json!({
        "in_iface": inbound, "out_iface": out, "fwmark": fwmark,
        "table_id": table_id, "subnet": subnet.to_string(),
    });

    let mut default_route = RoutingRuleSpec::route(out, table_id);
    if Family::of(&subnet) == Family::Ipv6 {
        // `::/0` carries the family; it compiles to the default route
        let any = ipnetwork::Ipv6Network::new(std::net::Ipv6Addr::UNSPECIFIED, 0)
            .map_err(|e| Error::Internal(e.to_string()))?;
        default_route = default_route.destination(IpNetwork::V6(any));
    }

    let mut plan = PresetPlan::new(name, PresetKind::Multihop, MULTIHOP_PRIORITY, params)
        .route(default_route)
        .route(
            RoutingRuleSpec::policy(table_id, MULTIHOP_SUBNET_RULE_PRIORITY).from(subnet),
        );
    if fwmark > 0 {
        plan = plan.route(
            RoutingRuleSpec::policy(table_id, MULTIHOP_FWMARK_RULE_PRIORITY).fwmark(fwmark),
        );
    }
    Ok(plan
        .rule(FirewallRuleSpec::accept(Chain::Forward).in_iface(inbound).out_iface(out))
        .rule(
            FirewallRuleSpec::accept(Chain::Forward)
                .in_iface(out)
                .out_iface(inbound)
                .states(&established()),
        ))
}

/// Fail-closed egress: only loopback, established flows, the tunnel's own
/// transport ports, DHCP and the tunnel interface may leave the host.
///
/// `wstunnel_port` of 0 means no TCP transport.
///
/// # Errors
///
/// [`Error::Validation`] for a bad interface or port.
pub fn kill_switch(wg_port: u16, wstunnel_port: u16, wg_iface: &str) -> Result<PresetPlan> {
    let wg = iface("wg_iface", wg_iface)?;
    let wg_port = port("wg_port", wg_port)?;

    let params = json!({ "wg_port": wg_port, "wstunnel_port": wstunnel_port, "wg_iface": wg });
    let mut plan = PresetPlan::new(
        KILL_SWITCH_GROUP,
        PresetKind::KillSwitch,
        KILL_SWITCH_PRIORITY,
        params,
    )
    .rule(FirewallRuleSpec::accept(Chain::Output).out_iface("lo"))
    .rule(FirewallRuleSpec::accept(Chain::Output).states(&established()))
    .rule(FirewallRuleSpec::accept(Chain::Output).port(Protocol::Udp, wg_port));
    if wstunnel_port > 0 {
        plan = plan.rule(FirewallRuleSpec::accept(Chain::Output).port(Protocol::Tcp, wstunnel_port));
    }
    plan = plan.rule(FirewallRuleSpec::accept(Chain::Output).out_iface(wg));
    for dhcp in DHCP_PORTS {
        plan = plan.rule(FirewallRuleSpec::accept(Chain::Output).port(Protocol::Udp, dhcp));
    }
    Ok(plan
        .rule(FirewallRuleSpec::drop(Chain::Output))
        .rule(FirewallRuleSpec::accept(Chain::Forward).in_iface(wg))
        .rule(FirewallRuleSpec::accept(Chain::Forward).out_iface(wg))
        .rule(FirewallRuleSpec::drop(Chain::Forward)))
}

/// DNS only through the tunnel or a local resolver; port 53 elsewhere is
/// dropped. `dns_servers` is recorded in the metadata for the caller.
///
/// # Errors
///
/// [`Error::Validation`] for a bad interface.
pub fn dns_protection(dns_servers: &[IpAddr], wg_iface: &str) -> Result<PresetPlan> {
    let wg = iface("wg_iface", wg_iface)?;
    let servers: Vec<String> = dns_servers.iter().map(ToString::to_string).collect();
    let params = json!({ "dns_servers": servers, "wg_iface": wg });

    Ok(
        PresetPlan::new(DNS_GROUP, PresetKind::DnsProtection, DNS_PRIORITY, params)
            .rule(
                FirewallRuleSpec::accept(Chain::Output)
                    .port(Protocol::Udp, DNS_PORT)
                    .out_iface(wg),
            )
            .rule(
                FirewallRuleSpec::accept(Chain::Output)
                    .port(Protocol::Tcp, DNS_PORT)
                    .out_iface(wg),
            )
            .rule(
                FirewallRuleSpec::accept(Chain::Output)
                    .port(Protocol::Udp, DNS_PORT)
                    .out_iface("lo"),
            )
            .rule(FirewallRuleSpec::drop(Chain::Output).port(Protocol::Udp, DNS_PORT))
            .rule(FirewallRuleSpec::drop(Chain::Output).port(Protocol::Tcp, DNS_PORT)),
    )
}

/// Drops every IPv6 packet on input, output and forward.
pub fn ipv6_block() -> PresetPlan {
    [Chain::Input, Chain::Output, Chain::Forward].into_iter().fold(
        PresetPlan::new(
            IPV6_BLOCK_GROUP,
            PresetKind::Ipv6Block,
            IPV6_BLOCK_PRIORITY,
            json!({}),
        ),
        |plan, chain| plan.rule(FirewallRuleSpec::drop(chain).family(Family::Ipv6)),
    )
}
