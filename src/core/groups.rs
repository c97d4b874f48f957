//! Group manager
//!
//! Drives compiler, applier and store as one unit for every group, rule and
//! route mutation. While the engine is live, each kernel-affecting change
//! follows the same protocol:
//!
//! 1. write a pending marker (compiled ops and crash resolution), durably
//! 2. apply or remove the ops in the kernel, with rollback
//! 3. commit the row change and clear the marker in one transaction
//!
//! A kernel failure clears the marker and leaves the store untouched. A
//! commit failure undoes the kernel change before the error is returned.

use super::applier::Applier;
use super::compiler::{compile_group, compile_route, compile_rule};
use super::error::{Error, Result};
use super::firewall::{
    FirewallRule, FirewallRuleSpec, MAX_RULES_PER_GROUP, RoutingRule, RoutingRuleSpec, RuleGroup,
};
use super::kernel::KernelOp;
use super::presets::PresetPlan;
use super::rule_constraints::{validate_route, validate_rule};
use super::store::{PendingTx, PresetBinding, Resolution, Store, StoreTx};
use crate::validators;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Location of named routing tables
pub const RT_TABLES_PATH: &str = "/etc/iproute2/rt_tables";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Apply,
    Remove,
}

pub struct GroupManager<'a> {
    store: &'a Store,
    applier: &'a Applier,
    live: bool,
}

impl<'a> GroupManager<'a> {
    /// `live` selects whether kernel state follows store changes immediately.
    pub fn new(store: &'a Store, applier: &'a Applier, live: bool) -> Self {
        Self {
            store,
            applier,
            live,
        }
    }

    fn kernel_step(&self, direction: Direction, ops: &[KernelOp]) -> Result<()> {
        match direction {
            Direction::Apply => self.applier.apply(ops),
            Direction::Remove => self.applier.remove(ops),
        }
    }

    fn clear_marker(&self) {
        if let Err(e) = self.store.write(|tx| tx.clear_pending()) {
            // Recovery at the next init resolves the marker instead
            error!("Failed to clear pending marker: {e}");
        }
    }

    /// Runs the marker / kernel / commit protocol.
    fn transact<T>(
        &self,
        pending: PendingTx,
        direction: Direction,
        commit: impl FnOnce(&StoreTx<'_>) -> Result<T>,
    ) -> Result<T> {
        debug!(
            "Transaction {} ({} on '{}', {} ops)",
            pending.tx_id,
            pending.operation,
            pending.group_name,
            pending.ops.len()
        );
        self.store.write(|tx| tx.put_pending(&pending))?;

        if let Err(e) = self.kernel_step(direction, &pending.ops) {
            self.clear_marker();
            return Err(e);
        }

        match self.store.write(|tx| {
            let value = commit(tx)?;
            tx.clear_pending()?;
            Ok(value)
        }) {
            Ok(value) => Ok(value),
            Err(e) => {
                error!(
                    "Commit of {} on '{}' failed, undoing kernel change: {e}",
                    pending.operation, pending.group_name
                );
                let undo = match direction {
                    Direction::Apply => Direction::Remove,
                    Direction::Remove => Direction::Apply,
                };
                if let Err(undo_err) = self.kernel_step(undo, &pending.ops) {
                    warn!("Compensation failed: {undo_err}");
                }
                self.clear_marker();
                Err(e)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Groups
    // ═══════════════════════════════════════════════════════════════════════

    /// Persists a new, disabled group.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for a bad name or type, [`Error::AlreadyExists`]
    /// if the name is taken.
    pub fn create(
        &self,
        name: &str,
        group_type: &str,
        priority: i32,
        metadata: Option<Value>,
    ) -> Result<RuleGroup> {
        validators::validate_group_name(name).map_err(|e| Error::validation("name", e))?;
        validators::validate_group_type(group_type)
            .map_err(|e| Error::validation("group_type", e))?;
        let metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
        if !metadata.is_object() {
            return Err(Error::validation("metadata", "must be a JSON object"));
        }

        let now = Utc::now();
        let group = RuleGroup {
            name: name.to_string(),
            group_type: group_type.to_string(),
            priority,
            enabled: false,
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.store.write(|tx| tx.insert_group(&group))?;
        info!("Created group '{name}' (type {group_type}, priority {priority})");
        Ok(group)
    }

    /// Deletes a group with its rows, withdrawing it from the kernel first.
    ///
    /// # Errors
    ///
    /// [`Error::GroupNotFound`]; kernel errors leave the group intact.
    pub fn delete(&self, name: &str) -> Result<()> {
        let (group, ops) = self.store.read(|tx| {
            let group = tx.group(name)?;
            let rows = tx.group_rows(group.clone())?;
            Ok((group, compile_group(&rows.group, &rows.rules, &rows.routes)))
        })?;

        if group.enabled && self.live {
            let pending = PendingTx::new("delete", name, ops, Resolution::DeleteGroup);
            self.transact(pending, Direction::Remove, |tx| tx.delete_group(name))?;
        } else {
            self.store.write(|tx| tx.delete_group(name))?;
        }
        info!("Deleted group '{name}'");
        Ok(())
    }

    /// Enables a group; a no-op if it already is.
    ///
    /// # Errors
    ///
    /// [`Error::GroupNotFound`]; kernel errors leave the group disabled with
    /// nothing of it applied.
    pub fn enable(&self, name: &str) -> Result<RuleGroup> {
        let rows = self.store.read(|tx| {
            let group = tx.group(name)?;
            tx.group_rows(group)
        })?;
        if rows.group.enabled {
            debug!("Group '{name}' already enabled");
            return Ok(rows.group);
        }

        if self.live {
            let ops = compile_group(&rows.group, &rows.rules, &rows.routes);
            let count = ops.len();
            let pending = PendingTx::new("enable", name, ops, Resolution::RollBack);
            self.transact(pending, Direction::Apply, |tx| {
                tx.set_group_enabled(name, true)
            })?;
            info!("Enabled group '{name}' ({count} kernel entries)");
        } else {
            self.store.write(|tx| tx.set_group_enabled(name, true))?;
            info!("Enabled group '{name}' (applied at start)");
        }
        self.store.read(|tx| tx.group(name))
    }

    /// Disables a group, keeping its rows; a no-op if already disabled.
    ///
    /// # Errors
    ///
    /// [`Error::GroupNotFound`]; kernel errors leave the group enabled and
    /// fully applied.
    pub fn disable(&self, name: &str) -> Result<RuleGroup> {
        let rows = self.store.read(|tx| {
            let group = tx.group(name)?;
            tx.group_rows(group)
        })?;
        if !rows.group.enabled {
            debug!("Group '{name}' already disabled");
            return Ok(rows.group);
        }

        if self.live {
            let ops = compile_group(&rows.group, &rows.rules, &rows.routes);
            let pending = PendingTx::new("disable", name, ops, Resolution::SetDisabled);
            self.transact(pending, Direction::Remove, |tx| {
                tx.set_group_enabled(name, false)
            })?;
        } else {
            self.store.write(|tx| tx.set_group_enabled(name, false))?;
        }
        info!("Disabled group '{name}'");
        self.store.read(|tx| tx.group(name))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Rules and routes
    // ═══════════════════════════════════════════════════════════════════════

    fn check_capacity(tx: &StoreTx<'_>, group: &str, adding: usize) -> Result<()> {
        if tx.count_rules(group)? + adding > MAX_RULES_PER_GROUP {
            return Err(Error::validation(
                "group",
                format!("group '{group}' would exceed {MAX_RULES_PER_GROUP} rules"),
            ));
        }
        Ok(())
    }

    /// Adds a firewall rule; applied at once if its group is enabled and live.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`], [`Error::GroupNotFound`], or a kernel error (no
    /// row is stored then).
    pub fn add_rule(&self, group_name: &str, spec: FirewallRuleSpec) -> Result<FirewallRule> {
        validate_rule(&spec)?;
        let (group, id) = self.store.read(|tx| {
            let group = tx.group(group_name)?;
            Self::check_capacity(tx, group_name, 1)?;
            Ok((group, tx.next_rule_id()?))
        })?;
        let rule = FirewallRule {
            id,
            group_name: group_name.to_string(),
            spec,
            created_at: Utc::now(),
        };

        let insert = |tx: &StoreTx<'_>| {
            if tx.next_rule_id()? != id {
                return Err(Error::Internal(format!("rule id {id} was taken")));
            }
            tx.insert_rule(&rule)
        };
        if group.enabled && self.live {
            let pending = PendingTx::new(
                "add_rule",
                group_name,
                vec![compile_rule(&group, &rule)],
                Resolution::RollBack,
            );
            self.transact(pending, Direction::Apply, insert)?;
        } else {
            self.store.write(insert)?;
        }
        info!("Added rule {id} to '{group_name}': {}", rule.spec.summary());
        Ok(rule)
    }

    /// # Errors
    ///
    /// [`Error::RuleNotFound`], or a kernel error (the row is kept then).
    pub fn remove_rule(&self, id: i64) -> Result<()> {
        let (group, rule) = self.store.read(|tx| {
            let rule = tx.rule(id)?;
            Ok((tx.group(&rule.group_name)?, rule))
        })?;

        if group.enabled && self.live {
            let pending = PendingTx::new(
                "remove_rule",
                &group.name,
                vec![compile_rule(&group, &rule)],
                Resolution::DeleteRule(id),
            );
            self.transact(pending, Direction::Remove, |tx| tx.delete_rule(id))?;
        } else {
            self.store.write(|tx| tx.delete_rule(id))?;
        }
        info!("Removed rule {id} from '{}'", group.name);
        Ok(())
    }

    /// Adds a routing rule; applied at once if its group is enabled and live.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] (including unknown table names),
    /// [`Error::GroupNotFound`], or a kernel error.
    pub fn add_route(&self, group_name: &str, mut spec: RoutingRuleSpec) -> Result<RoutingRule> {
        if spec.table_id == 0 && !spec.table_name.is_empty() {
            let rt_tables = std::fs::read_to_string(RT_TABLES_PATH).ok();
            spec.resolve_table(rt_tables.as_deref())
                .map_err(|e| Error::validation("table_name", e))?;
        }
        validate_route(&spec)?;

        let (group, id) = self.store.read(|tx| {
            let group = tx.group(group_name)?;
            Self::check_capacity(tx, group_name, 1)?;
            Ok((group, tx.next_route_id()?))
        })?;
        let route = RoutingRule {
            id,
            group_name: group_name.to_string(),
            spec,
            created_at: Utc::now(),
        };

        let insert = |tx: &StoreTx<'_>| {
            if tx.next_route_id()? != id {
                return Err(Error::Internal(format!("route id {id} was taken")));
            }
            tx.insert_route(&route)
        };
        if group.enabled && self.live {
            let pending = PendingTx::new(
                "add_route",
                group_name,
                vec![compile_route(&route)],
                Resolution::RollBack,
            );
            self.transact(pending, Direction::Apply, insert)?;
        } else {
            self.store.write(insert)?;
        }
        info!("Added route {id} to '{group_name}': {}", route.spec.summary());
        Ok(route)
    }

    /// # Errors
    ///
    /// [`Error::RouteNotFound`], or a kernel error (the row is kept then).
    pub fn remove_route(&self, id: i64) -> Result<()> {
        let (group, route) = self.store.read(|tx| {
            let route = tx.route(id)?;
            Ok((tx.group(&route.group_name)?, route))
        })?;

        if group.enabled && self.live {
            let pending = PendingTx::new(
                "remove_route",
                &group.name,
                vec![compile_route(&route)],
                Resolution::DeleteRoute(id),
            );
            self.transact(pending, Direction::Remove, |tx| tx.delete_route(id))?;
        } else {
            self.store.write(|tx| tx.delete_route(id))?;
        }
        info!("Removed route {id} from '{}'", group.name);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Whole-group install
    // ═══════════════════════════════════════════════════════════════════════

    /// Creates, populates and enables a group in one step, binding it to a
    /// preset.
    ///
    /// Nothing is written before the kernel apply succeeds, so any failure
    /// leaves neither rows nor kernel entries behind.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] if the group or preset exists, validation and
    /// kernel errors otherwise.
    pub fn install(&self, plan: &PresetPlan) -> Result<RuleGroup> {
        validators::validate_group_name(&plan.group_name)
            .map_err(|e| Error::validation("name", e))?;
        for spec in &plan.rules {
            validate_rule(spec)?;
        }
        for spec in &plan.routes {
            validate_route(spec)?;
        }
        if plan.rules.len() + plan.routes.len() > MAX_RULES_PER_GROUP {
            return Err(Error::validation("rules", "preset expands to too many rules"));
        }

        let (first_rule, first_route) = self.store.read(|tx| {
            if tx.find_group(&plan.group_name)?.is_some() {
                return Err(Error::AlreadyExists(format!("group '{}'", plan.group_name)));
            }
            if tx.binding(&plan.preset_name)?.is_some() {
                return Err(Error::AlreadyExists(format!("preset '{}'", plan.preset_name)));
            }
            Ok((tx.next_rule_id()?, tx.next_route_id()?))
        })?;

        let now = Utc::now();
        let group = RuleGroup {
            name: plan.group_name.clone(),
            group_type: plan.kind.group_type().to_string(),
            priority: plan.priority,
            enabled: true,
            metadata: plan.metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        let rules: Vec<FirewallRule> = plan
            .rules
            .iter()
            .zip(first_rule..)
            .map(|(spec, id)| FirewallRule {
                id,
                group_name: group.name.clone(),
                spec: spec.clone(),
                created_at: now,
            })
            .collect();
        let routes: Vec<RoutingRule> = plan
            .routes
            .iter()
            .zip(first_route..)
            .map(|(spec, id)| RoutingRule {
                id,
                group_name: group.name.clone(),
                spec: spec.clone(),
                created_at: now,
            })
            .collect();
        let binding = PresetBinding {
            preset_name: plan.preset_name.clone(),
            kind: plan.kind.as_ref().to_string(),
            group_name: group.name.clone(),
            params: plan.metadata.clone(),
            created_at: now,
        };

        let commit = |tx: &StoreTx<'_>| {
            tx.insert_group(&group)?;
            for rule in &rules {
                tx.insert_rule(rule)?;
            }
            for route in &routes {
                tx.insert_route(route)?;
            }
            tx.insert_binding(&binding)
        };

        if self.live {
            let ops = compile_group(&group, &rules, &routes);
            let pending = PendingTx::new("install", &group.name, ops, Resolution::RollBack);
            self.transact(pending, Direction::Apply, commit)?;
        } else {
            self.store.write(commit)?;
        }
        info!(
            "Installed preset '{}' as group '{}' ({} rules, {} routes)",
            plan.preset_name,
            group.name,
            rules.len(),
            routes.len()
        );
        Ok(group)
    }
}
