//! Lifecycle controller
//!
//! [`Engine`] owns the kernel applier and, between `init` and `close`, a
//! session holding the open store. It is the single entry point used by the
//! CLI and the C ABI.
//!
//! # Lifecycle
//!
//! ```text
//! uninitialized --init--> initialized --start--> started
//!       ^                     |   ^                 |
//!       |                     |   +-----start-------+ (from stopped)
//!     close <-----------------+-- stopped <--stop---+
//! ```
//!
//! The engine is *live* while `initialized` or `started`: the kernel mirrors
//! the enabled groups, and group, rule, route and preset changes reach it at
//! once. Becoming live (`init` on a store that was not stopped, or `start`)
//! rebuilds the kernel state from a clean slate; `stop` withdraws it. A `stop`
//! is persisted, so a later `init` on the same store comes up `stopped`.
//!
//! # Concurrency
//!
//! Kernel-mutating calls serialize on one mutation lock. Reads take only the
//! session lock and run in one store transaction each.

use super::applier::Applier;
use super::compiler::{compile_projection, expected_snapshot};
use super::error::{Error, Result};
use super::firewall::{FirewallRule, FirewallRuleSpec, RoutingRule, RoutingRuleSpec, RuleGroup};
use super::groups::GroupManager;
use super::kernel::{KernelBackend, KernelOp, KernelSnapshot, SystemKernel};
use super::legacy::{LegacyRule, compile_legacy};
use super::presets::{self, PresetPlan};
use super::store::{PendingTx, Resolution, Store};
use super::verify::{self, DriftReport};
use crate::audit::{AuditLog, EventType};
use crate::config::EngineConfig;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

const STATE_INITIALIZED: &str = "initialized";
const STATE_STARTED: &str = "started";
const STATE_STOPPED: &str = "stopped";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EngineStatus {
    Uninitialized,
    Initialized,
    Started,
    Stopped,
    Closed,
}

impl EngineStatus {
    /// Whether kernel state follows store changes immediately
    pub const fn is_live(self) -> bool {
        matches!(self, EngineStatus::Initialized | EngineStatus::Started)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCounts {
    pub total: usize,
    /// Rows that should currently be present in the kernel
    pub applied: usize,
}

/// Snapshot returned by `get_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: EngineStatus,
    pub enabled_groups: usize,
    pub firewall_rules: RuleCounts,
    pub routing_rules: RuleCounts,
    pub last_error: String,
}

struct Session {
    store: Store,
    status: Mutex<EngineStatus>,
}

impl Session {
    fn status(&self) -> EngineStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: EngineStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

pub struct Engine {
    config: EngineConfig,
    applier: Applier,
    audit: Option<AuditLog>,
    mutation: Mutex<()>,
    session: RwLock<Option<Arc<Session>>>,
    closed: AtomicBool,
    last_error: Mutex<String>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine over an explicit kernel backend.
    ///
    /// The audit trail goes to the state directory when enabled in `config`.
    pub fn new(config: EngineConfig, kernel: Arc<dyn KernelBackend>) -> Self {
        let audit = if config.audit_log {
            AuditLog::new()
                .inspect_err(|e| warn!("Audit log disabled: {e}"))
                .ok()
        } else {
            None
        };
        Self {
            config,
            applier: Applier::new(kernel),
            audit,
            mutation: Mutex::new(()),
            session: RwLock::new(None),
            closed: AtomicBool::new(false),
            last_error: Mutex::new(String::new()),
        }
    }

    /// Engine driving the host's `nft` and `ip`.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for an invalid configuration.
    pub fn system(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let kernel = SystemKernel::new(
            config.table_name.clone(),
            config.route_protocol,
            config.proc_root.clone(),
        );
        Ok(Self::new(config, Arc::new(kernel)))
    }

    /// Replaces the audit destination (`None` disables auditing)
    pub fn with_audit(mut self, audit: Option<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Arc<dyn KernelBackend> {
        self.applier.kernel()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Plumbing
    // ═══════════════════════════════════════════════════════════════════════

    fn lock_mutation(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotInitialized)
    }

    fn groups<'a>(&'a self, session: &'a Session) -> GroupManager<'a> {
        GroupManager::new(&session.store, &self.applier, session.status().is_live())
    }

    /// Remembers the message of a failed call for the status report
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.remember(e);
        }
        result
    }

    fn remember(&self, e: &Error) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = e.to_string();
    }

    fn audit<T>(&self, event: EventType, result: &Result<T>, details: serde_json::Value) {
        if let Some(audit) = &self.audit {
            audit.record(
                event,
                result.is_ok(),
                details,
                result.as_ref().err().map(ToString::to_string),
            );
        }
    }

    fn projection_ops(session: &Session) -> Result<Vec<KernelOp>> {
        session
            .store
            .read(|tx| Ok(compile_projection(&tx.enabled_projection()?)))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    pub fn status(&self) -> EngineStatus {
        match self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(session) => session.status(),
            None if self.closed.load(Ordering::SeqCst) => EngineStatus::Closed,
            None => EngineStatus::Uninitialized,
        }
    }

    /// Opens the store at `db_path` and resolves any transaction a previous
    /// process left unfinished.
    ///
    /// Unless the store was stopped, the kernel is then brought in line with
    /// the enabled groups: if it has drifted, the managed state is rebuilt as
    /// `start` does. A failed rebuild leaves the engine `stopped` (the error
    /// is in the status report) rather than failing `init`.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyInitialized`], store errors, or kernel errors from
    /// preparing the managed table, reading its state, or from recovery.
    pub fn init(&self, db_path: &str) -> Result<()> {
        let _guard = self.lock_mutation();
        self.track(self.init_locked(db_path))
    }

    fn init_locked(&self, db_path: &str) -> Result<()> {
        if self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Err(Error::AlreadyInitialized);
        }

        let store = Store::open(db_path)?;
        self.recover(&store)?;

        let persisted = store.read(|tx| tx.lifecycle_state())?;
        if persisted.is_none() {
            store.write(|tx| tx.set_lifecycle_state(STATE_INITIALIZED))?;
        }
        let status = if persisted.as_deref() == Some(STATE_STOPPED) {
            EngineStatus::Stopped
        } else {
            self.applier.prepare()?;
            let ops = store.read(|tx| Ok(compile_projection(&tx.enabled_projection()?)))?;
            // A new store has nothing to mirror and no claim on what is there
            if persisted.is_none()
                || verify::diff(&expected_snapshot(&ops), &self.applier.snapshot()?).in_sync
            {
                EngineStatus::Initialized
            } else {
                // The kernel lost or changed state since the last process
                match self.rebuild(&store, "init") {
                    Ok(count) => {
                        store.write(|tx| tx.clear_pending())?;
                        info!("Reconciled {count} kernel entries at init");
                        EngineStatus::Initialized
                    }
                    Err(e) => {
                        error!("Reconcile at init failed, engine stopped: {e}");
                        self.remember(&e);
                        EngineStatus::Stopped
                    }
                }
            }
        };

        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(Session {
            store,
            status: Mutex::new(status),
        }));
        self.closed.store(false, Ordering::SeqCst);
        info!("Initialized with state store {db_path} ({status})");
        Ok(())
    }

    /// Idempotently removes the in-flight ops of an interrupted transaction
    /// and applies its recorded resolution.
    fn recover(&self, store: &Store) -> Result<()> {
        let Some(pending) = store.read(|tx| tx.pending())? else {
            return Ok(());
        };
        warn!(
            "Recovering interrupted {} on '{}' (tx {}, {} ops, resolution {:?})",
            pending.operation,
            pending.group_name,
            pending.tx_id,
            pending.ops.len(),
            pending.resolution
        );

        let result = self.applier.prepare().and_then(|()| {
            let ops = Self::unshared_ops(store, &pending)?;
            self.applier.remove(&ops)?;
            store.write(|tx| {
                match pending.resolution {
                    Resolution::RollBack => {}
                    Resolution::SetDisabled => {
                        if tx.find_group(&pending.group_name)?.is_some() {
                            tx.set_group_enabled(&pending.group_name, false)?;
                        }
                    }
                    Resolution::DeleteGroup => {
                        if tx.find_group(&pending.group_name)?.is_some() {
                            tx.delete_group(&pending.group_name)?;
                        }
                    }
                    Resolution::DeleteRule(id) => match tx.delete_rule(id) {
                        Ok(()) | Err(Error::RuleNotFound(_)) => {}
                        Err(e) => return Err(e),
                    },
                    Resolution::DeleteRoute(id) => match tx.delete_route(id) {
                        Ok(()) | Err(Error::RouteNotFound(_)) => {}
                        Err(e) => return Err(e),
                    },
                    Resolution::MarkStopped => tx.set_lifecycle_state(STATE_STOPPED)?,
                }
                tx.clear_pending()
            })
        });

        self.audit(
            EventType::Recover,
            &result,
            json!({
                "tx_id": pending.tx_id.to_string(),
                "operation": pending.operation,
                "group": pending.group_name,
                "ops": pending.ops.len(),
            }),
        );
        match &result {
            Ok(()) => info!("Recovered interrupted {}", pending.operation),
            Err(e) => error!("Recovery of {} failed: {e}", pending.operation),
        }
        result
    }

    /// Ops of `pending` that no other enabled group still needs.
    ///
    /// Policies and routes are identified by value, so one installed by
    /// another group must survive the cleanup. A lifecycle transaction
    /// withdraws everything.
    fn unshared_ops(store: &Store, pending: &PendingTx) -> Result<Vec<KernelOp>> {
        if matches!(pending.resolution, Resolution::MarkStopped) {
            return Ok(pending.ops.clone());
        }
        let others = store.read(|tx| {
            let mut groups = tx.enabled_projection()?;
            groups.retain(|g| g.group.name != pending.group_name);
            Ok(compile_projection(&groups))
        })?;
        let ops: Vec<KernelOp> = pending
            .ops
            .iter()
            .filter(|op| op.is_filter() || !others.contains(op))
            .cloned()
            .collect();
        if ops.len() < pending.ops.len() {
            info!(
                "Keeping {} entries still used by other groups",
                pending.ops.len() - ops.len()
            );
        }
        Ok(ops)
    }

    /// Replaces the managed kernel state with the enabled projection under a
    /// `MarkStopped` marker, which the caller clears on success.
    ///
    /// On failure nothing managed is left, the store says `stopped` and the
    /// marker is gone.
    fn rebuild(&self, store: &Store, operation: &str) -> Result<usize> {
        let ops = store.read(|tx| Ok(compile_projection(&tx.enabled_projection()?)))?;
        let pending = PendingTx::new(operation, "*", ops, Resolution::MarkStopped);
        store.write(|tx| tx.put_pending(&pending))?;

        let applied = self
            .applier
            .reset()
            .and_then(|()| self.applier.apply(&pending.ops));
        if let Err(e) = applied {
            if let Err(db_err) = store.write(|tx| {
                tx.set_lifecycle_state(STATE_STOPPED)?;
                tx.clear_pending()
            }) {
                error!("Failed to record stopped state: {db_err}");
            }
            return Err(e);
        }
        Ok(pending.ops.len())
    }

    /// Rebuilds the kernel state from the store: flushes everything managed,
    /// then applies every enabled group in priority order.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`], [`Error::AlreadyStarted`], or the kernel
    /// error that stopped the apply (the engine is `stopped` then, with
    /// nothing managed left in the kernel).
    pub fn start(&self) -> Result<()> {
        let _guard = self.lock_mutation();
        let result = self.start_locked();
        self.audit(EventType::Start, &result, json!({}));
        self.track(result)
    }

    fn start_locked(&self) -> Result<()> {
        let session = self.session()?;
        match session.status() {
            EngineStatus::Started => return Err(Error::AlreadyStarted),
            EngineStatus::Initialized | EngineStatus::Stopped => {}
            other => return Err(Error::InvalidState(format!("cannot start from {other}"))),
        }

        self.applier.prepare()?;
        let count = match self.rebuild(&session.store, "start") {
            Ok(count) => count,
            Err(e) => {
                error!("Start failed, engine stopped: {e}");
                session.set_status(EngineStatus::Stopped);
                return Err(e);
            }
        };

        if let Err(e) = session.store.write(|tx| {
            tx.set_lifecycle_state(STATE_STARTED)?;
            tx.clear_pending()
        }) {
            error!("Failed to record started state, withdrawing: {e}");
            if let Err(undo) = self.applier.reset() {
                warn!("Withdraw failed: {undo}");
            }
            session.set_status(EngineStatus::Stopped);
            return Err(e);
        }

        session.set_status(EngineStatus::Started);
        info!("Started: {count} kernel entries applied");
        Ok(())
    }

    /// Withdraws every managed filter rule, policy and route from the kernel.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`], [`Error::NotStarted`] when not live, or the
    /// kernel error (the engine is `stopped` then, possibly with part of the
    /// managed state still in the kernel).
    pub fn stop(&self) -> Result<()> {
        let _guard = self.lock_mutation();
        let result = self.stop_locked();
        self.audit(EventType::Stop, &result, json!({}));
        self.track(result)
    }

    fn stop_locked(&self) -> Result<()> {
        let session = self.session()?;
        if !session.status().is_live() {
            return Err(Error::NotStarted);
        }

        let ops = Self::projection_ops(&session)?;
        let pending = PendingTx::new("stop", "*", ops, Resolution::MarkStopped);
        session.store.write(|tx| tx.put_pending(&pending))?;

        if let Err(e) = self.applier.reset() {
            // Part of the state may already be gone; the engine no longer
            // mirrors the store either way
            error!("Stop failed, engine stopped: {e}");
            if let Err(db_err) = session.store.write(|tx| {
                tx.set_lifecycle_state(STATE_STOPPED)?;
                tx.clear_pending()
            }) {
                error!("Failed to record stopped state: {db_err}");
            }
            session.set_status(EngineStatus::Stopped);
            return Err(e);
        }

        session.store.write(|tx| {
            tx.set_lifecycle_state(STATE_STOPPED)?;
            tx.clear_pending()
        })?;
        session.set_status(EngineStatus::Stopped);
        info!("Stopped: managed kernel state withdrawn");
        Ok(())
    }

    /// Closes the store. A `started` engine is stopped first; otherwise the
    /// kernel is left as it is. A failed stop is logged and does not keep the
    /// store open.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] if there is no open session.
    pub fn close(&self) -> Result<()> {
        let _guard = self.lock_mutation();
        if self.status() == EngineStatus::Started {
            let stopped = self.stop_locked();
            self.audit(EventType::Stop, &stopped, json!({ "on": "close" }));
            if let Err(e) = self.track(stopped) {
                warn!("Stop on close failed: {e}");
            }
        }
        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match session {
            Some(session) => {
                self.closed.store(true, Ordering::SeqCst);
                info!("Closed state store {}", session.store.path());
                Ok(())
            }
            None => self.track(Err(Error::NotInitialized)),
        }
    }

    /// Status with row counts; works in every lifecycle state.
    ///
    /// # Errors
    ///
    /// Store read errors.
    pub fn status_report(&self) -> Result<StatusReport> {
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Ok(session) = self.session() else {
            return Ok(StatusReport {
                status: self.status(),
                enabled_groups: 0,
                firewall_rules: RuleCounts::default(),
                routing_rules: RuleCounts::default(),
                last_error,
            });
        };

        let status = session.status();
        let (enabled, fw_total, rt_total, fw_enabled, rt_enabled) = session.store.read(|tx| {
            let projection = tx.enabled_projection()?;
            Ok((
                projection.len(),
                tx.list_rules(None)?.len(),
                tx.list_routes(None)?.len(),
                projection.iter().map(|g| g.rules.len()).sum::<usize>(),
                projection.iter().map(|g| g.routes.len()).sum::<usize>(),
            ))
        })?;
        let live = status.is_live();
        Ok(StatusReport {
            status,
            enabled_groups: enabled,
            firewall_rules: RuleCounts {
                total: fw_total,
                applied: if live { fw_enabled } else { 0 },
            },
            routing_rules: RuleCounts {
                total: rt_total,
                applied: if live { rt_enabled } else { 0 },
            },
            last_error,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Groups
    // ═══════════════════════════════════════════════════════════════════════

    /// Creates a disabled group.
    ///
    /// # Errors
    ///
    /// See [`GroupManager::create`].
    pub fn create_group(&self, name: &str, group_type: &str, priority: i32) -> Result<RuleGroup> {
        self.create_group_with_metadata(name, group_type, priority, None)
    }

    /// # Errors
    ///
    /// See [`GroupManager::create`].
    pub fn create_group_with_metadata(
        &self,
        name: &str,
        group_type: &str,
        priority: i32,
        metadata: Option<serde_json::Value>,
    ) -> Result<RuleGroup> {
        let _guard = self.lock_mutation();
        self.track(
            self.session()
                .and_then(|s| self.groups(&s).create(name, group_type, priority, metadata)),
        )
    }

    /// # Errors
    ///
    /// See [`GroupManager::delete`].
    pub fn delete_group(&self, name: &str) -> Result<()> {
        let _guard = self.lock_mutation();
        let result = self.session().and_then(|s| self.groups(&s).delete(name));
        self.audit(EventType::DeleteGroup, &result, json!({ "group": name }));
        self.track(result)
    }

    /// # Errors
    ///
    /// See [`GroupManager::enable`].
    pub fn enable_group(&self, name: &str) -> Result<RuleGroup> {
        let _guard = self.lock_mutation();
        let result = self.session().and_then(|s| self.groups(&s).enable(name));
        self.audit(EventType::EnableGroup, &result, json!({ "group": name }));
        self.track(result)
    }

    /// # Errors
    ///
    /// See [`GroupManager::disable`].
    pub fn disable_group(&self, name: &str) -> Result<RuleGroup> {
        let _guard = self.lock_mutation();
        let result = self.session().and_then(|s| self.groups(&s).disable(name));
        self.audit(EventType::DisableGroup, &result, json!({ "group": name }));
        self.track(result)
    }

    /// Groups ordered by priority, then name
    pub fn list_groups(&self) -> Result<Vec<RuleGroup>> {
        self.session()?.store.read(|tx| tx.list_groups())
    }

    pub fn get_group(&self, name: &str) -> Result<RuleGroup> {
        self.session()?.store.read(|tx| tx.group(name))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Rules and routes
    // ═══════════════════════════════════════════════════════════════════════

    /// # Errors
    ///
    /// See [`GroupManager::add_rule`].
    pub fn add_rule(&self, group: &str, spec: FirewallRuleSpec) -> Result<FirewallRule> {
        let _guard = self.lock_mutation();
        self.track(self.session().and_then(|s| self.groups(&s).add_rule(group, spec)))
    }

    /// # Errors
    ///
    /// See [`GroupManager::remove_rule`].
    pub fn remove_rule(&self, id: i64) -> Result<()> {
        let _guard = self.lock_mutation();
        self.track(self.session().and_then(|s| self.groups(&s).remove_rule(id)))
    }

    /// Rules by ascending id, optionally of one group.
    ///
    /// # Errors
    ///
    /// [`Error::GroupNotFound`] if `group` names no group.
    pub fn list_rules(&self, group: Option<&str>) -> Result<Vec<FirewallRule>> {
        self.session()?.store.read(|tx| {
            if let Some(name) = group {
                tx.group(name)?;
            }
            tx.list_rules(group)
        })
    }

    /// # Errors
    ///
    /// See [`GroupManager::add_route`].
    pub fn add_route(&self, group: &str, spec: RoutingRuleSpec) -> Result<RoutingRule> {
        let _guard = self.lock_mutation();
        self.track(self.session().and_then(|s| self.groups(&s).add_route(group, spec)))
    }

    /// # Errors
    ///
    /// See [`GroupManager::remove_route`].
    pub fn remove_route(&self, id: i64) -> Result<()> {
        let _guard = self.lock_mutation();
        self.track(self.session().and_then(|s| self.groups(&s).remove_route(id)))
    }

    /// # Errors
    ///
    /// [`Error::GroupNotFound`] if `group` names no group.
    pub fn list_routes(&self, group: Option<&str>) -> Result<Vec<RoutingRule>> {
        self.session()?.store.read(|tx| {
            if let Some(name) = group {
                tx.group(name)?;
            }
            tx.list_routes(group)
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Presets
    // ═══════════════════════════════════════════════════════════════════════

    /// Installs an expanded preset; every failure comes back as [`Error::Preset`].
    fn apply_preset(&self, preset: &str, plan: Result<PresetPlan>) -> Result<RuleGroup> {
        let _guard = self.lock_mutation();
        let result = plan
            .and_then(|plan| {
                let session = self.session()?;
                self.groups(&session).install(&plan)
            })
            .map_err(|source| Error::Preset {
                preset: preset.to_string(),
                source: Box::new(source),
            });
        self.audit(EventType::ApplyPreset, &result, json!({ "preset": preset }));
        self.track(result)
    }

    /// # Errors
    ///
    /// [`Error::Preset`] wrapping the cause.
    pub fn apply_preset_vpn(
        &self,
        name: &str,
        wg_iface: &str,
        wg_port: u16,
        wg_subnet: IpNetwork,
        out_iface: &str,
    ) -> Result<RuleGroup> {
        self.apply_preset(
            name,
            presets::vpn(name, wg_iface, wg_port, wg_subnet, out_iface),
        )
    }

    /// # Errors
    ///
    /// [`Error::Preset`] wrapping the cause.
    pub fn apply_preset_multihop(
        &self,
        name: &str,
        in_iface: &str,
        out_iface: &str,
        fwmark: u32,
        table_id: u32,
        subnet: IpNetwork,
    ) -> Result<RuleGroup> {
        self.apply_preset(
            name,
            presets::multihop(name, in_iface, out_iface, fwmark, table_id, subnet),
        )
    }

    /// # Errors
    ///
    /// [`Error::Preset`] wrapping the cause.
    pub fn apply_preset_kill_switch(
        &self,
        wg_port: u16,
        wstunnel_port: u16,
        wg_iface: &str,
    ) -> Result<RuleGroup> {
        self.apply_preset(
            presets::KILL_SWITCH_GROUP,
            presets::kill_switch(wg_port, wstunnel_port, wg_iface),
        )
    }

    /// # Errors
    ///
    /// [`Error::Preset`] wrapping the cause.
    pub fn apply_preset_dns_protection(
        &self,
        dns_servers: &[IpAddr],
        wg_iface: &str,
    ) -> Result<RuleGroup> {
        self.apply_preset(
            presets::DNS_GROUP,
            presets::dns_protection(dns_servers, wg_iface),
        )
    }

    /// # Errors
    ///
    /// [`Error::Preset`] wrapping the cause.
    pub fn apply_preset_ipv6_block(&self) -> Result<RuleGroup> {
        self.apply_preset(presets::IPV6_BLOCK_GROUP, Ok(presets::ipv6_block()))
    }

    /// Removes a preset's backing group (and with it the binding).
    ///
    /// # Errors
    ///
    /// [`Error::PresetNotFound`], or the errors of [`GroupManager::delete`].
    pub fn remove_preset(&self, name: &str) -> Result<()> {
        let _guard = self.lock_mutation();
        let result = self.session().and_then(|session| {
            let binding = session
                .store
                .read(|tx| tx.binding(name))?
                .ok_or_else(|| Error::PresetNotFound(name.to_string()))?;
            self.groups(&session).delete(&binding.group_name)
        });
        self.audit(EventType::RemovePreset, &result, json!({ "preset": name }));
        self.track(result)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Verification
    // ═══════════════════════════════════════════════════════════════════════

    /// Live managed kernel state, normalized.
    ///
    /// # Errors
    ///
    /// Kernel read errors.
    pub fn get_kernel_state(&self) -> Result<KernelSnapshot> {
        self.track(self.applier.snapshot())
    }

    /// What the kernel should hold right now: the enabled projection while
    /// live, nothing otherwise.
    pub fn expected_state(&self) -> Result<KernelSnapshot> {
        let session = self.session()?;
        if !session.status().is_live() {
            return Ok(KernelSnapshot::default());
        }
        Ok(expected_snapshot(&Self::projection_ops(&session)?))
    }

    /// Diffs the expected state against the live kernel. Never modifies
    /// anything.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`], store errors, or [`Error::Verify`] when the
    /// kernel cannot be read.
    pub fn verify_rules(&self) -> Result<DriftReport> {
        self.verify_with_diff().map(|(report, _)| report)
    }

    /// As [`Engine::verify_rules`], plus a rendered line diff.
    ///
    /// # Errors
    ///
    /// As [`Engine::verify_rules`].
    pub fn verify_with_diff(&self) -> Result<(DriftReport, String)> {
        let result = self.expected_state().and_then(|expected| {
            let live = self
                .applier
                .snapshot()
                .map_err(|e| Error::Verify(format!("cannot read kernel state: {e}")))?;
            Ok((
                verify::diff(&expected, &live),
                verify::render_diff(&expected, &live),
            ))
        });
        let details = match &result {
            Ok((report, _)) => json!({
                "in_sync": report.in_sync,
                "missing": report.missing.len(),
                "unexpected": report.unexpected.len(),
            }),
            Err(_) => json!({}),
        };
        self.audit(EventType::VerifyRules, &result, details);
        if let Ok((report, _)) = &result {
            if report.in_sync {
                debug!("Kernel state in sync ({})", report.live_fingerprint);
            } else {
                warn!(
                    "Kernel drift: {} missing, {} unexpected",
                    report.missing.len(),
                    report.unexpected.len()
                );
            }
        }
        self.track(result)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Utilities
    // ═══════════════════════════════════════════════════════════════════════

    /// # Errors
    ///
    /// I/O or permission errors writing the sysctl.
    pub fn flush_route_cache(&self) -> Result<()> {
        let _guard = self.lock_mutation();
        let result = self.applier.kernel().flush_route_cache();
        self.audit(EventType::FlushRouteCache, &result, json!({}));
        self.track(result)
    }

    /// Turns on IPv4 forwarding (idempotent).
    ///
    /// # Errors
    ///
    /// I/O or permission errors writing the sysctl.
    pub fn enable_ip_forward(&self) -> Result<()> {
        let _guard = self.lock_mutation();
        let result = self.applier.kernel().set_ip_forward(true);
        self.audit(EventType::IpForward, &result, json!({ "enabled": true }));
        self.track(result)
    }

    /// Empties the managed filter table. The store is not touched, so enabled
    /// groups show up as missing in verification until the next `start` (or the
    /// next `init` in a new process).
    ///
    /// # Errors
    ///
    /// nftables errors.
    pub fn flush_firewall_table(&self) -> Result<()> {
        let _guard = self.lock_mutation();
        let result = self.applier.kernel().flush_filter_table();
        self.audit(EventType::FlushTable, &result, json!({}));
        if result.is_ok() {
            warn!("Managed filter table flushed outside the store");
        }
        self.track(result)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Stateless entry point
    // ═══════════════════════════════════════════════════════════════════════

    /// Applies one rule or route directly, without persisting it.
    ///
    /// # Errors
    ///
    /// Validation or kernel errors.
    pub fn legacy_apply_rule(&self, rule: &LegacyRule) -> Result<()> {
        let _guard = self.lock_mutation();
        let result = compile_legacy(rule).and_then(|op| {
            self.applier.prepare()?;
            self.applier.apply(std::slice::from_ref(&op))
        });
        self.audit(EventType::LegacyApply, &result, serde_json::to_value(rule)?);
        self.track(result)
    }

    /// Removes one rule or route applied through [`Engine::legacy_apply_rule`].
    /// Removing an absent rule succeeds.
    ///
    /// # Errors
    ///
    /// Validation or kernel errors.
    pub fn legacy_remove_rule(&self, rule: &LegacyRule) -> Result<()> {
        let _guard = self.lock_mutation();
        let result = compile_legacy(rule).and_then(|op| {
            self.applier.prepare()?;
            self.applier.remove(std::slice::from_ref(&op))
        });
        self.audit(EventType::LegacyRemove, &result, serde_json::to_value(rule)?);
        self.track(result)
    }
}
