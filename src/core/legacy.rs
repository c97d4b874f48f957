//! Stateless single-rule entry point
//!
//! Applies or removes one filter rule or route directly, without a group and
//! without touching the store. Rules go through the regular compiler, so they
//! look exactly like managed ones in the kernel, but carry the reserved
//! `legacy` key sorting after every group. Since nothing is persisted,
//! verification reports them as unexpected, and `start` or a table flush
//! clears them.

use super::compiler::{compile_route, compile_rule};
use super::error::Result;
use super::firewall::{FirewallRule, FirewallRuleSpec, RoutingRule, RoutingRuleSpec, RuleGroup};
use super::kernel::{KernelOp, RuleKey};
use super::rule_constraints::{validate_route, validate_rule};
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const LEGACY_GROUP: &str = "legacy";
pub const LEGACY_PRIORITY: i32 = i32::MAX;

/// A rule handed to the stateless entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LegacyRule {
    Filter(FirewallRuleSpec),
    Route(RoutingRuleSpec),
}

pub fn legacy_key() -> RuleKey {
    RuleKey::new(LEGACY_PRIORITY, LEGACY_GROUP, 0)
}

fn legacy_group() -> RuleGroup {
    let now = Utc::now();
    RuleGroup {
        name: LEGACY_GROUP.to_string(),
        group_type: LEGACY_GROUP.to_string(),
        priority: LEGACY_PRIORITY,
        enabled: true,
        metadata: serde_json::json!({}),
        created_at: now,
        updated_at: now,
    }
}

/// Validates and compiles `rule` into its add-form op.
///
/// # Errors
///
/// [`Error::Validation`](super::error::Error::Validation) for an invalid rule.
pub fn compile_legacy(rule: &LegacyRule) -> Result<KernelOp> {
    match rule {
        LegacyRule::Filter(spec) => {
            validate_rule(spec)?;
            let row = FirewallRule {
                id: 0,
                group_name: LEGACY_GROUP.to_string(),
                spec: spec.clone(),
                created_at: Utc::now(),
            };
            Ok(compile_rule(&legacy_group(), &row))
        }
        LegacyRule::Route(spec) => {
            validate_route(spec)?;
            let row = RoutingRule {
                id: 0,
                group_name: LEGACY_GROUP.to_string(),
                spec: spec.clone(),
                created_at: Utc::now(),
            };
            Ok(compile_route(&row))
        }
    }
}
