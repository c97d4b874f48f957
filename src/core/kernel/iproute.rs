//! `ip rule` / `ip route` argument rendering and `ip -json` parsing
//!
//! Managed entries carry a dedicated route protocol number (`protocol` on
//! rules, `proto` on routes). That number is how listings are filtered down to
//! the entries this engine owns.

use super::{PolicyEntry, RouteEntry};
use crate::core::firewall::Family;
use ipnetwork::IpNetwork;
use serde_json::Value;
use std::net::IpAddr;

/// Default route protocol id for managed entries
pub const DEFAULT_ROUTE_PROTOCOL: u32 = 112;

fn push<S: Into<String>>(args: &mut Vec<String>, parts: impl IntoIterator<Item = S>) {
    args.extend(parts.into_iter().map(Into::into));
}

/// `ip <family> rule <verb> ...`
pub fn policy_args(verb: &str, entry: &PolicyEntry, protocol: u32) -> Vec<String> {
    let mut args = Vec::new();
    push(&mut args, [entry.family.ip_flag(), "rule", verb]);
    if let Some(from) = &entry.from {
        push(&mut args, ["from".to_string(), from.to_string()]);
    }
    if let Some(to) = &entry.to {
        push(&mut args, ["to".to_string(), to.to_string()]);
    }
    if let Some(mark) = entry.fwmark {
        push(&mut args, ["fwmark".to_string(), format!("{mark:#x}")]);
    }
    push(
        &mut args,
        [
            "lookup".to_string(),
            entry.table.to_string(),
            "priority".to_string(),
            entry.priority.to_string(),
            "protocol".to_string(),
            protocol.to_string(),
        ],
    );
    args
}

/// `ip <family> route <verb> ...`
pub fn route_args(verb: &str, entry: &RouteEntry, protocol: u32) -> Vec<String> {
    let mut args = Vec::new();
    push(&mut args, [entry.family.ip_flag(), "route", verb]);
    args.push(
        entry
            .destination
            .map_or_else(|| "default".to_string(), |d| d.to_string()),
    );
    push(
        &mut args,
        [
            "dev".to_string(),
            entry.device.clone(),
            "table".to_string(),
            entry.table.to_string(),
            "proto".to_string(),
            protocol.to_string(),
        ],
    );
    args
}

pub fn list_policy_args(family: Family) -> Vec<String> {
    vec![
        "-json".into(),
        family.ip_flag().into(),
        "rule".into(),
        "show".into(),
    ]
}

pub fn list_route_args(family: Family, protocol: u32) -> Vec<String> {
    vec![
        "-json".into(),
        family.ip_flag().into(),
        "route".into(),
        "show".into(),
        "table".into(),
        "all".into(),
        "proto".into(),
        protocol.to_string(),
    ]
}

/// Accepts numbers, numeric strings and hex strings (`0x64`).
fn as_number(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let text = value.as_str()?;
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn table_id(value: Option<&Value>) -> Option<u32> {
    let Some(value) = value else {
        return Some(254);
    };
    match value.as_str() {
        Some("main") => Some(254),
        Some("default") => Some(253),
        Some("local") => Some(255),
        _ => as_number(value).and_then(|n| u32::try_from(n).ok()),
    }
}

fn address(entry: &Value, key: &str, len_key: &str) -> Option<Option<IpNetwork>> {
    let Some(text) = entry.get(key).and_then(Value::as_str) else {
        return Some(None);
    };
    if text == "all" || text == "default" {
        return Some(None);
    }
    if let Ok(net) = text.parse::<IpNetwork>()
        && text.contains('/')
    {
        return Some(Some(net));
    }
    let addr = text.parse::<IpAddr>().ok()?;
    let len = match entry.get(len_key).and_then(as_number) {
        Some(len) => u8::try_from(len).ok()?,
        None => match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        },
    };
    IpNetwork::new(addr, len).ok().map(Some)
}

fn owned_by(entry: &Value, protocol: u32) -> bool {
    entry
        .get("protocol")
        .and_then(as_number)
        .is_some_and(|p| p == u64::from(protocol))
}

/// Parses `ip -json rule show`, keeping entries tagged with `protocol`.
pub fn parse_policies(family: Family, listing: &Value, protocol: u32) -> Vec<PolicyEntry> {
    let Some(items) = listing.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|item| owned_by(item, protocol))
        .filter_map(|item| {
            Some(PolicyEntry {
                family,
                from: address(item, "src", "srclen")?,
                to: address(item, "dst", "dstlen")?,
                fwmark: item
                    .get("fwmark")
                    .and_then(as_number)
                    .and_then(|m| u32::try_from(m).ok()),
                table: table_id(item.get("table"))?,
                priority: u32::try_from(item.get("priority").and_then(as_number)?).ok()?,
            })
        })
        .collect()
}

/// Parses `ip -json route show table all proto <protocol>`.
///
/// The `proto` filter already restricted the listing, so entries without a
/// `protocol` field are kept.
pub fn parse_routes(family: Family, listing: &Value) -> Vec<RouteEntry> {
    let Some(items) = listing.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            Some(RouteEntry {
                family,
                destination: address(item, "dst", "dstlen")?,
                device: item.get("dev")?.as_str()?.to_string(),
                table: table_id(item.get("table"))?,
            })
        })
        .collect()
}
