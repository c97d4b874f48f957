//! nftables JSON rendering and parsing
//!
//! Rendering produces the `{"nftables": [...]}` batches fed to `nft --json -f -`.
//! Parsing turns `nft --json list table inet <table>` output back into
//! [`FilterEntry`] values so live state can be compared structurally with
//! compiler output.

use super::{FilterEntry, ForeignRule, RuleKey};
use crate::core::firewall::{Chain, CtState, Family, FirewallRuleSpec, Protocol, RuleType};
use ipnetwork::IpNetwork;
use serde_json::{Value, json};
use std::net::IpAddr;

/// Base chains of the managed table: (name, type, hook, priority)
const BASE_CHAINS: [(&str, &str, &str, i32); 4] = [
    ("input", "filter", "input", 0),
    ("output", "filter", "output", 0),
    ("forward", "filter", "forward", 0),
    ("postrouting", "nat", "postrouting", 100),
];

pub fn batch(commands: Vec<Value>) -> Value {
    json!({ "nftables": commands })
}

/// Creates the managed table and its base chains.
///
/// `add` is idempotent for tables and chains, so this is safe to repeat.
pub fn table_setup(table: &str) -> Value {
    let mut commands = vec![json!({ "add": { "table": { "family": "inet", "name": table } } })];
    for (name, kind, hook, prio) in BASE_CHAINS {
        commands.push(json!({
            "add": {
                "chain": {
                    "family": "inet",
                    "table": table,
                    "name": name,
                    "type": kind,
                    "hook": hook,
                    "prio": prio,
                    "policy": "accept"
                }
            }
        }));
    }
    batch(commands)
}

pub fn flush_table(table: &str) -> Value {
    batch(vec![
        json!({ "flush": { "table": { "family": "inet", "name": table } } }),
    ])
}

// ═══════════════════════════════════════════════════════════════════════════
// Expression builders
// ═══════════════════════════════════════════════════════════════════════════

fn meta_match(key: &str, value: impl serde::Serialize) -> Value {
    json!({
        "match": {
            "left": { "meta": { "key": key } },
            "op": "==",
            "right": value
        }
    })
}

fn payload_match(protocol: &str, field: &str, value: impl serde::Serialize) -> Value {
    json!({
        "match": {
            "left": { "payload": { "protocol": protocol, "field": field } },
            "op": "==",
            "right": value
        }
    })
}

fn network_value(network: &IpNetwork) -> Value {
    let full = match network {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    };
    if network.prefix() == full {
        json!(network.ip().to_string())
    } else {
        json!({ "prefix": { "addr": network.network().to_string(), "len": network.prefix() } })
    }
}

/// Match and verdict expressions for one rule, in a fixed order
pub fn rule_expr(rule: &FirewallRuleSpec) -> Vec<Value> {
    let mut expr = Vec::new();

    if rule.family == Family::Ipv6 && rule.source.is_none() && rule.destination.is_none() {
        expr.push(meta_match("nfproto", "ipv6"));
    }
    if let Some(iface) = &rule.in_iface {
        expr.push(meta_match("iifname", iface));
    }
    if let Some(iface) = &rule.out_iface {
        expr.push(meta_match("oifname", iface));
    }
    let l3 = rule.family.payload_protocol();
    if let Some(net) = &rule.source {
        expr.push(payload_match(l3, "saddr", network_value(net)));
    }
    if let Some(net) = &rule.destination {
        expr.push(payload_match(l3, "daddr", network_value(net)));
    }
    match (rule.proto.nft_name(), rule.dport) {
        (Some(proto), Some(port)) => expr.push(payload_match(proto, "dport", port)),
        (Some(proto), None) => expr.push(meta_match("l4proto", proto)),
        (None, _) => {}
    }
    match rule.state_match.as_slice() {
        [] => {}
        [single] => expr.push(json!({
            "match": { "left": { "ct": { "key": "state" } }, "op": "in", "right": single.as_str() }
        })),
        many => {
            let names: Vec<&str> = many.iter().map(|s| s.as_str()).collect();
            expr.push(json!({
                "match": { "left": { "ct": { "key": "state" } }, "op": "in", "right": names }
            }));
        }
    }
    let verdict = rule.rule_type.as_str();
    expr.push(json!({ verdict: null }));
    expr
}

/// Adds `entry` to its chain; with `before` set, inserts ahead of that handle.
pub fn add_rule(table: &str, entry: &FilterEntry, before: Option<u64>) -> Value {
    let mut rule = json!({
        "family": "inet",
        "table": table,
        "chain": entry.rule.chain.nft_chain(),
        "expr": rule_expr(&entry.rule),
    });
    if let Some(key) = &entry.key {
        rule["comment"] = json!(key.to_comment());
    }
    let command = match before {
        Some(handle) => {
            rule["handle"] = json!(handle);
            json!({ "insert": { "rule": rule } })
        }
        None => json!({ "add": { "rule": rule } }),
    };
    batch(vec![command])
}

pub fn delete_rule(table: &str, chain: &str, handle: u64) -> Value {
    batch(vec![json!({
        "delete": { "rule": { "family": "inet", "table": table, "chain": chain, "handle": handle } }
    })])
}

// ═══════════════════════════════════════════════════════════════════════════
// Parsing
// ═══════════════════════════════════════════════════════════════════════════

/// One rule from a table listing, in listing order
#[derive(Debug, Clone)]
pub struct ListedRule {
    pub chain: String,
    pub handle: Option<u64>,
    pub entry: std::result::Result<FilterEntry, ForeignRule>,
}

impl ListedRule {
    pub fn key(&self) -> Option<&RuleKey> {
        self.entry.as_ref().ok().and_then(|e| e.key.as_ref())
    }
}

/// Extracts every rule from `nft --json list table|chain` output.
pub fn parse_listing(listing: &Value) -> Vec<ListedRule> {
    listing
        .get("nftables")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("rule"))
                .map(parse_rule)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_rule(rule: &Value) -> ListedRule {
    let chain = rule
        .get("chain")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let handle = rule.get("handle").and_then(Value::as_u64);
    let comment = rule.get("comment").and_then(Value::as_str);
    let expr = rule.get("expr").cloned().unwrap_or(Value::Null);

    let entry = Chain::from_nft_chain(&chain)
        .and_then(|c| parse_expr(c, &expr))
        .map(|spec| FilterEntry {
            key: comment.and_then(RuleKey::from_comment),
            rule: spec,
        })
        .ok_or_else(|| ForeignRule {
            chain: chain.clone(),
            handle,
            comment: comment.map(String::from),
            expr: expr.to_string(),
        });

    ListedRule {
        chain,
        handle,
        entry,
    }
}

fn parse_network(value: &Value) -> Option<IpNetwork> {
    if let Some(text) = value.as_str() {
        if let Ok(net) = text.parse::<IpNetwork>() {
            return Some(net);
        }
        return text.parse::<IpAddr>().ok().map(IpNetwork::from);
    }
    let prefix = value.get("prefix")?;
    let addr = prefix.get("addr")?.as_str()?.parse::<IpAddr>().ok()?;
    let len = u8::try_from(prefix.get("len")?.as_u64()?).ok()?;
    IpNetwork::new(addr, len).ok()
}

fn parse_states(value: &Value) -> Option<Vec<CtState>> {
    let names: Vec<&str> = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => return None,
    };
    let mut states = names
        .into_iter()
        .map(|n| n.parse::<CtState>().ok())
        .collect::<Option<Vec<_>>>()?;
    states.sort();
    states.dedup();
    Some(states)
}

/// Normalizes an expression list; `None` if any part is outside the
/// vocabulary the compiler emits.
fn parse_expr(chain: Chain, expr: &Value) -> Option<FirewallRuleSpec> {
    let mut verdict = None;
    let mut spec = FirewallRuleSpec::new(chain, RuleType::Accept);
    let mut family = None;

    for item in expr.as_array()? {
        let obj = item.as_object()?;
        let (kind, body) = obj.iter().next()?;
        match kind.as_str() {
            "accept" | "drop" | "masquerade" => {
                verdict = Some(kind.parse::<RuleType>().ok()?);
            }
            "match" => {
                let left = body.get("left")?;
                let right = body.get("right")?;
                if let Some(meta) = left.get("meta") {
                    match meta.get("key")?.as_str()? {
                        "nfproto" => {
                            family = Some(right.as_str()?.parse::<Family>().ok()?);
                        }
                        "iifname" => spec.in_iface = Some(right.as_str()?.to_string()),
                        "oifname" => spec.out_iface = Some(right.as_str()?.to_string()),
                        "l4proto" => spec.proto = right.as_str()?.parse::<Protocol>().ok()?,
                        _ => return None,
                    }
                } else if let Some(payload) = left.get("payload") {
                    let protocol = payload.get("protocol")?.as_str()?;
                    let field = payload.get("field")?.as_str()?;
                    match (protocol, field) {
                        ("ip" | "ip6", "saddr" | "daddr") => {
                            family = Some(if protocol == "ip" {
                                Family::Ipv4
                            } else {
                                Family::Ipv6
                            });
                            let net = parse_network(right)?;
                            if field == "saddr" {
                                spec.source = Some(net);
                            } else {
                                spec.destination = Some(net);
                            }
                        }
                        ("tcp" | "udp", "dport") => {
                            spec.proto = protocol.parse::<Protocol>().ok()?;
                            spec.dport = Some(u16::try_from(right.as_u64()?).ok()?);
                        }
                        _ => return None,
                    }
                } else if left.get("ct").and_then(|ct| ct.get("key"))?.as_str()? == "state" {
                    spec.state_match = parse_states(right)?;
                } else {
                    return None;
                }
            }
            "counter" => {}
            _ => return None,
        }
    }

    spec.rule_type = verdict?;
    spec.family = family.unwrap_or_else(|| {
        if spec.proto == Protocol::Icmpv6 {
            Family::Ipv6
        } else {
            Family::Ipv4
        }
    });
    Some(spec)
}
