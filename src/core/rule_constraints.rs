//! Rule constraint functions for firewall and routing rules
//!
//! This module centralizes the business logic about valid field combinations.
//! Every descriptor is checked here before it touches the store or the kernel,
//! so an impossible combination surfaces as `InvalidParam` and never as a
//! half-applied kernel error.
//!
//! # Examples
//!
//! ```
//! use phantom_fw::core::firewall::{Chain, FirewallRuleSpec, Protocol, RuleType};
//! use phantom_fw::core::rule_constraints::*;
//!
//! assert!(verdict_valid_for_chain(RuleType::Masquerade, Chain::Nat));
//! assert!(!verdict_valid_for_chain(RuleType::Masquerade, Chain::Input));
//!
//! let spec = FirewallRuleSpec::accept(Chain::Input).port(Protocol::Icmp, 22);
//! assert!(validate_rule(&spec).is_err());
//! ```

use super::error::{Error, Result};
use super::firewall::{
    Chain, Family, FirewallRuleSpec, Protocol, RouteType, RoutingRuleSpec, RuleType,
    parse_states,
};
use crate::validators;
use ipnetwork::IpNetwork;

// ═══════════════════════════════════════════════════════════════════════════
// Firewall Rule Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the verdict may be used in the chain.
///
/// Masquerade is only meaningful in the NAT hook, and the NAT hook only
/// carries masquerade rules.
#[inline]
pub fn verdict_valid_for_chain(rule_type: RuleType, chain: Chain) -> bool {
    match chain {
        Chain::Nat => rule_type == RuleType::Masquerade,
        Chain::Input | Chain::Output | Chain::Forward => rule_type != RuleType::Masquerade,
    }
}

/// Returns `true` if an interface of that direction exists in the chain's hook.
///
/// There is no input interface on output or postrouting, and no output
/// interface on input.
#[inline]
pub fn interface_valid_for_chain(chain: Chain, inbound: bool) -> bool {
    match chain {
        Chain::Input => inbound,
        Chain::Output | Chain::Nat => !inbound,
        Chain::Forward => true,
    }
}

/// Returns `true` if the network belongs to the family.
#[inline]
pub fn network_matches_family(network: &IpNetwork, family: Family) -> bool {
    Family::of(network) == family
}

/// Returns `true` if the protocol can be matched within the family.
///
/// ICMP is IPv4-only and ICMPv6 is IPv6-only.
#[inline]
pub fn protocol_valid_for_family(proto: Protocol, family: Family) -> bool {
    !matches!(
        (proto, family),
        (Protocol::Icmp, Family::Ipv6) | (Protocol::Icmpv6, Family::Ipv4)
    )
}

/// Validates a firewall rule descriptor.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the offending field.
pub fn validate_rule(spec: &FirewallRuleSpec) -> Result<()> {
    if !verdict_valid_for_chain(spec.rule_type, spec.chain) {
        return Err(Error::validation(
            "rule_type",
            format!(
                "'{}' is not valid in chain '{}'",
                spec.rule_type, spec.chain
            ),
        ));
    }

    if let Some(port) = spec.dport {
        validators::validate_port(port).map_err(|e| Error::validation("dport", e))?;
        if !spec.proto.has_ports() {
            return Err(Error::validation(
                "dport",
                format!("protocol '{}' has no ports, use tcp or udp", spec.proto),
            ));
        }
    }

    if !protocol_valid_for_family(spec.proto, spec.family) {
        return Err(Error::validation(
            "proto",
            format!("'{}' cannot be matched in {}", spec.proto, spec.family),
        ));
    }

    for (field, network) in [("source", &spec.source), ("destination", &spec.destination)] {
        if let Some(net) = network
            && !network_matches_family(net, spec.family)
        {
            return Err(Error::validation(
                field,
                format!("{net} does not belong to family {}", spec.family),
            ));
        }
    }

    for (field, inbound, iface) in [
        ("in_iface", true, &spec.in_iface),
        ("out_iface", false, &spec.out_iface),
    ] {
        if let Some(name) = iface {
            validators::validate_interface(name).map_err(|e| Error::validation(field, e))?;
            if !interface_valid_for_chain(spec.chain, inbound) {
                return Err(Error::validation(
                    field,
                    format!("chain '{}' has no {field}", spec.chain),
                ));
            }
        }
    }

    if spec.chain == Chain::Nat && spec.out_iface.is_none() && spec.source.is_none() {
        return Err(Error::validation(
            "out_iface",
            "masquerade needs an egress interface or a source network",
        ));
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Routing Rule Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if every address in the descriptor shares one family.
pub fn route_family_consistent(spec: &RoutingRuleSpec) -> bool {
    let family = spec.family();
    [&spec.from_network, &spec.to_network, &spec.destination]
        .into_iter()
        .flatten()
        .all(|net| network_matches_family(net, family))
}

/// Validates a routing rule descriptor.
///
/// The table id must already be resolved.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the offending field.
pub fn validate_route(spec: &RoutingRuleSpec) -> Result<()> {
    validators::validate_table_id(spec.table_id).map_err(|e| Error::validation("table_id", e))?;

    if !route_family_consistent(spec) {
        return Err(Error::validation(
            "family",
            "addresses of a routing rule must share one address family",
        ));
    }

    match spec.rule_type {
        RouteType::Policy => {
            validators::validate_rule_priority(spec.priority)
                .map_err(|e| Error::validation("priority", e))?;
            if spec.from_network.is_none() && spec.to_network.is_none() && spec.fwmark == 0 {
                return Err(Error::validation(
                    "from_network",
                    "policy rule needs a source, destination or fwmark selector",
                ));
            }
            if spec.device.is_some() || spec.destination.is_some() {
                return Err(Error::validation(
                    "device",
                    "device and destination only apply to route entries",
                ));
            }
        }
        RouteType::Route => {
            let device = spec
                .device
                .as_deref()
                .ok_or_else(|| Error::validation("device", "route needs a device"))?;
            validators::validate_interface(device).map_err(|e| Error::validation("device", e))?;
            if spec.fwmark != 0 || spec.from_network.is_some() || spec.to_network.is_some() {
                return Err(Error::validation(
                    "fwmark",
                    "selectors only apply to policy rules",
                ));
            }
        }
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Text Descriptors
// ═══════════════════════════════════════════════════════════════════════════

/// A firewall rule as flat strings, the shape the C ABI and the CLI receive.
///
/// Empty strings mean "not set"; `dport` 0 means any port.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleText<'a> {
    pub chain: &'a str,
    pub rule_type: &'a str,
    pub family: Family,
    pub proto: &'a str,
    pub dport: u16,
    pub source: &'a str,
    pub destination: &'a str,
    pub in_iface: &'a str,
    pub out_iface: &'a str,
    pub state_match: &'a str,
}

impl RuleText<'_> {
    /// Parses and validates the descriptor.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] naming the first bad field.
    pub fn parse(&self) -> Result<FirewallRuleSpec> {
        let chain: Chain = self
            .chain
            .trim()
            .parse()
            .map_err(|_| Error::validation("chain", format!("unknown chain '{}'", self.chain)))?;
        let rule_type: RuleType = self.rule_type.trim().parse().map_err(|_| {
            Error::validation("rule_type", format!("unknown rule type '{}'", self.rule_type))
        })?;
        let proto: Protocol = self.proto.trim().parse().map_err(|_| {
            Error::validation("proto", format!("unknown protocol '{}'", self.proto))
        })?;

        let spec = FirewallRuleSpec {
            chain,
            rule_type,
            family: self.family,
            proto,
            dport: (self.dport > 0).then_some(self.dport),
            source: validators::parse_optional_network(self.source)
                .map_err(|e| Error::validation("source", e))?,
            destination: validators::parse_optional_network(self.destination)
                .map_err(|e| Error::validation("destination", e))?,
            in_iface: validators::parse_optional_interface(self.in_iface)
                .map_err(|e| Error::validation("in_iface", e))?,
            out_iface: validators::parse_optional_interface(self.out_iface)
                .map_err(|e| Error::validation("out_iface", e))?,
            state_match: parse_states(self.state_match)
                .map_err(|e| Error::validation("state_match", e))?,
        };
        validate_rule(&spec)?;
        Ok(spec)
    }
}

/// A routing rule as flat strings; empty strings and zeros mean "not set".
///
/// The table may be given by id or by name; name resolution happens when the
/// rule is added.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteText<'a> {
    pub rule_type: &'a str,
    pub from_network: &'a str,
    pub to_network: &'a str,
    pub table_name: &'a str,
    pub table_id: u32,
    pub priority: u32,
    pub destination: &'a str,
    pub device: &'a str,
    pub fwmark: u32,
}

impl RouteText<'_> {
    /// # Errors
    ///
    /// [`Error::Validation`] for an unknown rule type, a malformed network or
    /// a bad device name.
    pub fn parse(&self) -> Result<RoutingRuleSpec> {
        let rule_type: RouteType = self.rule_type.trim().parse().map_err(|_| {
            Error::validation("rule_type", format!("unknown routing rule type '{}'", self.rule_type))
        })?;
        Ok(RoutingRuleSpec {
            rule_type,
            from_network: validators::parse_optional_network(self.from_network)
                .map_err(|e| Error::validation("from_network", e))?,
            to_network: validators::parse_optional_network(self.to_network)
                .map_err(|e| Error::validation("to_network", e))?,
            table_name: self.table_name.trim().to_string(),
            table_id: self.table_id,
            priority: self.priority,
            destination: validators::parse_optional_network(self.destination)
                .map_err(|e| Error::validation("destination", e))?,
            device: validators::parse_optional_interface(self.device)
                .map_err(|e| Error::validation("device", e))?,
            fwmark: self.fwmark,
        })
    }
}
