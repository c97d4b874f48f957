//! Rule compiler
//!
//! Pure translation from stored rows to [`KernelOp`]s. Nothing here touches
//! the kernel or the store, and the same input always compiles to the same
//! output.
//!
//! Ordering contract:
//! - within a group: filter rules by ascending id, then routing rules by
//!   ascending id
//! - across groups: ascending priority, ties broken by group name
//!
//! Each filter entry is tagged with a [`RuleKey`] so backends can place it at
//! the right position in its chain regardless of the order groups are
//! enabled in.

use super::firewall::{FirewallRule, RouteType, RoutingRule, RuleGroup};
use super::kernel::{FilterEntry, KernelOp, KernelSnapshot, PolicyEntry, RouteEntry, RuleKey};

/// A group together with its rows, as read from the store
#[derive(Debug, Clone)]
pub struct GroupRows {
    pub group: RuleGroup,
    pub rules: Vec<FirewallRule>,
    pub routes: Vec<RoutingRule>,
}

pub fn rule_key(group: &RuleGroup, rule_id: i64) -> RuleKey {
    RuleKey::new(group.priority, &group.name, rule_id)
}

pub fn compile_rule(group: &RuleGroup, rule: &FirewallRule) -> KernelOp {
    KernelOp::AddFilter(FilterEntry::new(
        rule_key(group, rule.id),
        rule.spec.clone(),
    ))
}

/// A zero-length destination (`0.0.0.0/0`, `::/0`) compiles to the default route.
pub fn compile_route(route: &RoutingRule) -> KernelOp {
    let spec = &route.spec;
    match spec.rule_type {
        RouteType::Policy => KernelOp::AddPolicy(PolicyEntry {
            family: spec.family(),
            from: spec.from_network,
            to: spec.to_network,
            fwmark: (spec.fwmark > 0).then_some(spec.fwmark),
            table: spec.table_id,
            priority: spec.priority,
        }),
        RouteType::Route => KernelOp::AddRoute(RouteEntry {
            family: spec.family(),
            destination: spec.destination.filter(|d| d.prefix() > 0),
            device: spec.device.clone().unwrap_or_default(),
            table: spec.table_id,
        }),
    }
}

pub fn compile_group(
    group: &RuleGroup,
    rules: &[FirewallRule],
    routes: &[RoutingRule],
) -> Vec<KernelOp> {
    let mut rules: Vec<&FirewallRule> = rules.iter().collect();
    rules.sort_by_key(|r| r.id);
    let mut routes: Vec<&RoutingRule> = routes.iter().collect();
    routes.sort_by_key(|r| r.id);

    rules
        .into_iter()
        .map(|r| compile_rule(group, r))
        .chain(routes.into_iter().map(compile_route))
        .collect()
}

/// Compiles every group in `groups`, whatever its enabled flag.
///
/// Callers pass the enabled projection.
pub fn compile_projection(groups: &[GroupRows]) -> Vec<KernelOp> {
    let mut ordered: Vec<&GroupRows> = groups.iter().collect();
    ordered.sort_by(|a, b| {
        (a.group.priority, &a.group.name).cmp(&(b.group.priority, &b.group.name))
    });
    ordered
        .into_iter()
        .flat_map(|g| compile_group(&g.group, &g.rules, &g.routes))
        .collect()
}

/// The kernel state `ops` would produce, with filters in chain order
pub fn expected_snapshot(ops: &[KernelOp]) -> KernelSnapshot {
    let mut snapshot = KernelSnapshot::from_ops(ops);
    snapshot
        .filters
        .sort_by(|a, b| (a.rule.chain, &a.key).cmp(&(b.rule.chain, &b.key)));
    snapshot
}
