//! Kernel primitives and backends
//!
//! A compiled policy is a list of [`KernelOp`]s. Each op adds or deletes one
//! primitive: a filter rule in the managed nftables table, a policy routing
//! rule, or a route. Ops are structurally invertible, which is what the
//! applier's rollback stack relies on.
//!
//! - [`system`]: drives `nft` and `ip` on the host
//! - [`memory`]: in-process model used by tests and dry runs
//! - [`nft`]: nftables JSON rendering and parsing
//! - [`iproute`]: `ip` argument rendering and `ip -json` parsing

pub mod iproute;
pub mod memory;
pub mod nft;
pub mod system;

use super::error::Result;
use super::firewall::{Family, FirewallRuleSpec};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use memory::MemoryKernel;
pub use system::SystemKernel;

/// Prefix of every comment written by the compiler
pub const COMMENT_PREFIX: &str = "phantom";

/// Ordering key of a managed filter rule, carried in the nft rule comment.
///
/// Field order gives the chain order: group priority, then group name, then
/// rule id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleKey {
    pub priority: i32,
    pub group: String,
    pub id: i64,
}

impl RuleKey {
    pub fn new(priority: i32, group: impl Into<String>, id: i64) -> Self {
        Self {
            priority,
            group: group.into(),
            id,
        }
    }

    /// Renders the key as `phantom/<priority>/<group>/<id>`
    pub fn to_comment(&self) -> String {
        format!(
            "{COMMENT_PREFIX}/{}/{}/{}",
            self.priority, self.group, self.id
        )
    }

    pub fn from_comment(comment: &str) -> Option<Self> {
        let mut parts = comment.splitn(4, '/');
        if parts.next()? != COMMENT_PREFIX {
            return None;
        }
        let priority = parts.next()?.parse().ok()?;
        let group = parts.next()?;
        let id = parts.next()?.parse().ok()?;
        if group.is_empty() {
            return None;
        }
        Some(Self::new(priority, group, id))
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_comment())
    }
}

/// One filter rule as it lives in the managed table.
///
/// `key` is `None` for rules that carry no managed comment (added by hand).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterEntry {
    pub key: Option<RuleKey>,
    #[serde(flatten)]
    pub rule: FirewallRuleSpec,
}

impl FilterEntry {
    pub fn new(key: RuleKey, rule: FirewallRuleSpec) -> Self {
        Self {
            key: Some(key),
            rule,
        }
    }

    pub fn unmanaged(rule: FirewallRuleSpec) -> Self {
        Self { key: None, rule }
    }

    pub fn describe(&self) -> String {
        match &self.key {
            Some(key) => format!("{} [{key}]", self.rule.summary()),
            None => self.rule.summary(),
        }
    }
}

/// Policy routing rule (`ip rule`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub family: Family,
    pub from: Option<IpNetwork>,
    pub to: Option<IpNetwork>,
    pub fwmark: Option<u32>,
    pub table: u32,
    pub priority: u32,
}

impl PolicyEntry {
    pub fn describe(&self) -> String {
        let mut parts = vec![format!("rule {}", self.family)];
        if let Some(from) = &self.from {
            parts.push(format!("from {from}"));
        }
        if let Some(to) = &self.to {
            parts.push(format!("to {to}"));
        }
        if let Some(mark) = self.fwmark {
            parts.push(format!("fwmark {mark:#x}"));
        }
        parts.push(format!("lookup {} priority {}", self.table, self.priority));
        parts.join(" ")
    }
}

/// Route inside a routing table (`ip route`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteEntry {
    pub family: Family,
    /// `None` is the default route
    pub destination: Option<IpNetwork>,
    pub device: String,
    pub table: u32,
}

impl RouteEntry {
    pub fn describe(&self) -> String {
        format!(
            "route {} {} dev {} table {}",
            self.family,
            self.destination
                .map_or_else(|| "default".to_string(), |d| d.to_string()),
            self.device,
            self.table
        )
    }
}

/// A single primitive kernel mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "entry", rename_all = "snake_case")]
pub enum KernelOp {
    AddFilter(FilterEntry),
    DeleteFilter(FilterEntry),
    AddPolicy(PolicyEntry),
    DeletePolicy(PolicyEntry),
    AddRoute(RouteEntry),
    DeleteRoute(RouteEntry),
}

impl KernelOp {
    /// The op that undoes this one
    pub fn inverse(&self) -> KernelOp {
        match self {
            KernelOp::AddFilter(e) => KernelOp::DeleteFilter(e.clone()),
            KernelOp::DeleteFilter(e) => KernelOp::AddFilter(e.clone()),
            KernelOp::AddPolicy(e) => KernelOp::DeletePolicy(e.clone()),
            KernelOp::DeletePolicy(e) => KernelOp::AddPolicy(e.clone()),
            KernelOp::AddRoute(e) => KernelOp::DeleteRoute(e.clone()),
            KernelOp::DeleteRoute(e) => KernelOp::AddRoute(e.clone()),
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(
            self,
            KernelOp::AddFilter(_) | KernelOp::AddPolicy(_) | KernelOp::AddRoute(_)
        )
    }

    /// Filter ops go to nftables, the rest to the routing subsystem
    pub fn is_filter(&self) -> bool {
        matches!(self, KernelOp::AddFilter(_) | KernelOp::DeleteFilter(_))
    }

    pub fn describe(&self) -> String {
        match self {
            KernelOp::AddFilter(e) => format!("add filter {}", e.describe()),
            KernelOp::DeleteFilter(e) => format!("delete filter {}", e.describe()),
            KernelOp::AddPolicy(e) => format!("add {}", e.describe()),
            KernelOp::DeletePolicy(e) => format!("delete {}", e.describe()),
            KernelOp::AddRoute(e) => format!("add {}", e.describe()),
            KernelOp::DeleteRoute(e) => format!("delete {}", e.describe()),
        }
    }
}

/// A rule in the managed table that could not be normalized
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignRule {
    pub chain: String,
    pub handle: Option<u64>,
    pub comment: Option<String>,
    pub expr: String,
}

/// Normalized live kernel state (or the expected state computed from the store)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSnapshot {
    pub filters: Vec<FilterEntry>,
    pub policies: Vec<PolicyEntry>,
    pub routes: Vec<RouteEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign: Vec<ForeignRule>,
}

impl KernelSnapshot {
    /// The state that results from applying `ops` to an empty kernel
    pub fn from_ops(ops: &[KernelOp]) -> Self {
        let mut snapshot = Self::default();
        for op in ops {
            match op {
                KernelOp::AddFilter(e) => snapshot.filters.push(e.clone()),
                KernelOp::AddPolicy(e) => snapshot.policies.push(e.clone()),
                KernelOp::AddRoute(e) => snapshot.routes.push(e.clone()),
                KernelOp::DeleteFilter(e) => remove_first(&mut snapshot.filters, e),
                KernelOp::DeletePolicy(e) => remove_first(&mut snapshot.policies, e),
                KernelOp::DeleteRoute(e) => remove_first(&mut snapshot.routes, e),
            }
        }
        snapshot
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
            && self.policies.is_empty()
            && self.routes.is_empty()
            && self.foreign.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len() + self.policies.len() + self.routes.len() + self.foreign.len()
    }

    /// Whether a managed filter entry with this key is present
    pub fn contains_key(&self, key: &RuleKey) -> bool {
        self.filters.iter().any(|f| f.key.as_ref() == Some(key))
    }
}

fn remove_first<T: PartialEq>(items: &mut Vec<T>, item: &T) {
    if let Some(pos) = items.iter().position(|x| x == item) {
        items.remove(pos);
    }
}

/// Position at which a new entry with `key` is inserted among `existing` keys.
///
/// Returns the index of the first managed entry whose key is greater, or
/// `None` to append. Unmanaged entries never influence placement.
pub fn insertion_index<'a>(
    existing: impl IntoIterator<Item = Option<&'a RuleKey>>,
    key: &RuleKey,
) -> Option<usize> {
    existing
        .into_iter()
        .position(|k| k.is_some_and(|k| k > key))
}

/// Host-side filter and routing primitives.
///
/// Adds are not idempotent (a second add of the same filter rule installs a
/// duplicate, a second add of the same route fails). Deletes of absent
/// primitives succeed.
pub trait KernelBackend: Send + Sync {
    /// Ensures the managed table and its base chains exist
    fn prepare(&self) -> Result<()>;

    /// Executes one primitive
    fn execute(&self, op: &KernelOp) -> Result<()>;

    /// Reads back and normalizes the managed filter table, policies and routes
    fn snapshot(&self) -> Result<KernelSnapshot>;

    /// Removes every rule from the managed table, keeping its chains
    fn flush_filter_table(&self) -> Result<()>;

    /// Removes every policy rule and route tagged with the managed protocol
    fn flush_managed_routes(&self) -> Result<()>;

    fn flush_route_cache(&self) -> Result<()>;

    /// Sets the global IPv4 forwarding switch (idempotent)
    fn set_ip_forward(&self, enabled: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::Chain;

    #[test]
    fn test_comment_roundtrip_with_dashes() {
        let key = RuleKey::new(-5, "kill-switch", 42);
        assert_eq!(key.to_comment(), "phantom/-5/kill-switch/42");
        assert_eq!(RuleKey::from_comment(&key.to_comment()), Some(key));
    }

    #[test]
    fn test_foreign_comments_rejected() {
        assert_eq!(RuleKey::from_comment("allow ssh"), None);
        assert_eq!(RuleKey::from_comment("phantom/x/g/1"), None);
        assert_eq!(RuleKey::from_comment("phantom/1//1"), None);
        assert_eq!(RuleKey::from_comment("phantom-rule-7"), None);
    }

    #[test]
    fn test_key_order_is_priority_then_name_then_id() {
        let mut keys = vec![
            RuleKey::new(100, "vpn", 1),
            RuleKey::new(10, "kill-switch", 9),
            RuleKey::new(10, "dns", 20),
            RuleKey::new(10, "dns", 3),
        ];
        keys.sort();
        let comments: Vec<_> = keys.iter().map(RuleKey::to_comment).collect();
        assert_eq!(
            comments,
            [
                "phantom/10/dns/3",
                "phantom/10/dns/20",
                "phantom/10/kill-switch/9",
                "phantom/100/vpn/1"
            ]
        );
    }

    #[test]
    fn test_insertion_index_skips_unmanaged() {
        let a = RuleKey::new(10, "a", 1);
        let c = RuleKey::new(30, "c", 1);
        let existing = [Some(&a), None, Some(&c)];
        assert_eq!(insertion_index(existing, &RuleKey::new(20, "b", 1)), Some(2));
        assert_eq!(insertion_index(existing, &RuleKey::new(40, "d", 1)), None);
        assert_eq!(insertion_index(existing, &RuleKey::new(1, "z", 1)), Some(0));
    }

    #[test]
    fn test_inverse_is_involution() {
        let op = KernelOp::AddFilter(FilterEntry::new(
            RuleKey::new(1, "g", 1),
            FirewallRuleSpec::accept(Chain::Input),
        ));
        assert_eq!(op.inverse().inverse(), op);
        assert!(!op.inverse().is_add());
        assert!(op.is_filter());
    }

    #[test]
    fn test_snapshot_from_ops_applies_deletes() {
        let route = RouteEntry {
            family: Family::Ipv4,
            destination: None,
            device: "wg1".into(),
            table: 200,
        };
        let ops = vec![
            KernelOp::AddRoute(route.clone()),
            KernelOp::AddRoute(route.clone()),
            KernelOp::DeleteRoute(route.clone()),
        ];
        let snapshot = KernelSnapshot::from_ops(&ops);
        assert_eq!(snapshot.routes, vec![route]);
        assert_eq!(snapshot.len(), 1);
    }
}
