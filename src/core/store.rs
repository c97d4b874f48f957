//! Durable state store
//!
//! One `SQLite` database per engine instance, opened in WAL mode with foreign
//! keys enforced. Every public access runs inside one transaction:
//! [`Store::read`] for snapshot-consistent reads, [`Store::write`] for
//! all-or-nothing writes. Compound commits (row change plus clearing the
//! pending marker) share a single [`Store::write`] call.
//!
//! # Schema
//!
//! - `engine_state`: single row with the persisted lifecycle state
//! - `rule_groups`: keyed by name
//! - `firewall_rules`, `routing_rules`: `AUTOINCREMENT` ids, cascade on group delete
//! - `preset_bindings`: preset name to backing group, cascade on group delete
//! - `pending_tx`: at most one in-flight kernel transaction

use super::compiler::GroupRows;
use super::error::{Error, Result, StoreResultExt};
use super::firewall::{
    FirewallRule, FirewallRuleSpec, RoutingRule, RoutingRuleSpec, RuleGroup, format_states,
    parse_states,
};
use super::kernel::KernelOp;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

/// Current `PRAGMA user_version`
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS engine_state (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    state       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rule_groups (
    name        TEXT PRIMARY KEY,
    group_type  TEXT NOT NULL,
    priority    INTEGER NOT NULL,
    enabled     INTEGER NOT NULL DEFAULT 0,
    metadata    TEXT NOT NULL DEFAULT '{}',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS firewall_rules (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    group_name  TEXT NOT NULL REFERENCES rule_groups(name) ON DELETE CASCADE,
    chain       TEXT NOT NULL,
    rule_type   TEXT NOT NULL,
    family      TEXT NOT NULL,
    proto       TEXT NOT NULL,
    dport       INTEGER,
    source      TEXT,
    destination TEXT,
    in_iface    TEXT,
    out_iface   TEXT,
    state_match TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_firewall_rules_group ON firewall_rules(group_name);

CREATE TABLE IF NOT EXISTS routing_rules (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    group_name   TEXT NOT NULL REFERENCES rule_groups(name) ON DELETE CASCADE,
    rule_type    TEXT NOT NULL,
    from_network TEXT,
    to_network   TEXT,
    table_name   TEXT NOT NULL DEFAULT '',
    table_id     INTEGER NOT NULL,
    priority     INTEGER NOT NULL DEFAULT 0,
    destination  TEXT,
    device       TEXT,
    fwmark       INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_routing_rules_group ON routing_rules(group_name);

CREATE TABLE IF NOT EXISTS preset_bindings (
    preset_name TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    group_name  TEXT NOT NULL UNIQUE REFERENCES rule_groups(name) ON DELETE CASCADE,
    params      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_tx (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    tx_id       TEXT NOT NULL,
    operation   TEXT NOT NULL,
    group_name  TEXT NOT NULL,
    ops         TEXT NOT NULL,
    resolution  TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
";

/// What crash recovery does to the store after removing the in-flight ops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "id")]
pub enum Resolution {
    /// Store untouched: the operation never happened
    RollBack,
    SetDisabled,
    DeleteGroup,
    DeleteRule(i64),
    DeleteRoute(i64),
    MarkStopped,
}

/// Durable marker of a kernel transaction in flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTx {
    pub tx_id: Uuid,
    pub operation: String,
    pub group_name: String,
    /// Add-form ops whose effects must not survive a crash
    pub ops: Vec<KernelOp>,
    pub resolution: Resolution,
    pub created_at: DateTime<Utc>,
}

impl PendingTx {
    pub fn new(
        operation: impl Into<String>,
        group_name: impl Into<String>,
        ops: Vec<KernelOp>,
        resolution: Resolution,
    ) -> Self {
        Self {
            tx_id: Uuid::new_v4(),
            operation: operation.into(),
            group_name: group_name.into(),
            ops,
            resolution,
            created_at: Utc::now(),
        }
    }
}

/// Applied preset and the group backing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetBinding {
    pub preset_name: String,
    pub kind: String,
    pub group_name: String,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub struct Store {
    conn: Mutex<Connection>,
    path: String,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Opens (creating if needed) and migrates the database at `path`.
    ///
    /// `:memory:` gives a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DbOpen`] if the file cannot be opened or migrated.
    pub fn open(path: &str) -> Result<Self> {
        let open_err = |source| Error::DbOpen {
            path: path.to_string(),
            source,
        };
        let conn = Connection::open(path).map_err(open_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = FULL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(open_err)?;

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(open_err)?;
        if version > SCHEMA_VERSION {
            return Err(Error::Corrupt(format!(
                "schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        if version < SCHEMA_VERSION {
            info!("Migrating state store {path} from schema v{version} to v{SCHEMA_VERSION}");
            conn.execute_batch(&format!(
                "BEGIN;{SCHEMA_V1}PRAGMA user_version = {SCHEMA_VERSION};COMMIT;"
            ))
            .map_err(open_err)?;
        }

        debug!("State store open at {path}");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Runs `f` inside one read transaction.
    ///
    /// # Errors
    ///
    /// Propagates errors of `f`; fails with [`Error::DbQuery`] if the
    /// transaction cannot begin.
    pub fn read<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .query_ctx("begin read")?;
        let stx = StoreTx { tx };
        f(&stx)
    }

    /// Runs `f` inside one write transaction, committing only if it succeeds.
    ///
    /// # Errors
    ///
    /// Propagates errors of `f` (nothing is written then); fails with
    /// [`Error::DbWrite`] if the commit itself fails.
    pub fn write<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .write_ctx("begin write")?;
        let stx = StoreTx { tx };
        let value = f(&stx)?;
        stx.tx.commit().write_ctx("commit")?;
        Ok(value)
    }
}

/// An open transaction with typed accessors
pub struct StoreTx<'c> {
    tx: Transaction<'c>,
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Corrupt(format!("bad timestamp '{text}': {e}")))
}

fn parse_field<T: FromStr>(column: &str, text: &str) -> Result<T> {
    text.parse()
        .map_err(|_| Error::Corrupt(format!("bad {column} value '{text}'")))
}

fn parse_network(column: &str, text: Option<String>) -> Result<Option<IpNetwork>> {
    text.map(|t| parse_field::<IpNetwork>(column, &t)).transpose()
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

struct GroupRow {
    name: String,
    group_type: String,
    priority: i32,
    enabled: bool,
    metadata: String,
    created_at: String,
    updated_at: String,
}

const GROUP_COLUMNS: &str =
    "name, group_type, priority, enabled, metadata, created_at, updated_at";

impl GroupRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            group_type: row.get(1)?,
            priority: row.get(2)?,
            enabled: row.get(3)?,
            metadata: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<RuleGroup> {
        Ok(RuleGroup {
            metadata: serde_json::from_str(&self.metadata)
                .map_err(|e| Error::Corrupt(format!("group '{}' metadata: {e}", self.name)))?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            name: self.name,
            group_type: self.group_type,
            priority: self.priority,
            enabled: self.enabled,
        })
    }
}

struct RuleRow {
    id: i64,
    group_name: String,
    chain: String,
    rule_type: String,
    family: String,
    proto: String,
    dport: Option<u16>,
    source: Option<String>,
    destination: Option<String>,
    in_iface: Option<String>,
    out_iface: Option<String>,
    state_match: String,
    created_at: String,
}

const RULE_COLUMNS: &str = "id, group_name, chain, rule_type, family, proto, dport, source, \
     destination, in_iface, out_iface, state_match, created_at";

impl RuleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            group_name: row.get(1)?,
            chain: row.get(2)?,
            rule_type: row.get(3)?,
            family: row.get(4)?,
            proto: row.get(5)?,
            dport: row.get(6)?,
            source: row.get(7)?,
            destination: row.get(8)?,
            in_iface: row.get(9)?,
            out_iface: row.get(10)?,
            state_match: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn decode(self) -> Result<FirewallRule> {
        Ok(FirewallRule {
            id: self.id,
            group_name: self.group_name,
            spec: FirewallRuleSpec {
                chain: parse_field("chain", &self.chain)?,
                rule_type: parse_field("rule_type", &self.rule_type)?,
                family: parse_field("family", &self.family)?,
                proto: parse_field("proto", &self.proto)?,
                dport: self.dport,
                source: parse_network("source", self.source)?,
                destination: parse_network("destination", self.destination)?,
                in_iface: self.in_iface,
                out_iface: self.out_iface,
                state_match: parse_states(&self.state_match).map_err(Error::Corrupt)?,
            },
            created_at: parse_time(&self.created_at)?,
        })
    }
}

struct RouteRow {
    id: i64,
    group_name: String,
    rule_type: String,
    from_network: Option<String>,
    to_network: Option<String>,
    table_name: String,
    table_id: u32,
    priority: u32,
    destination: Option<String>,
    device: Option<String>,
    fwmark: u32,
    created_at: String,
}

const ROUTE_COLUMNS: &str = "id, group_name, rule_type, from_network, to_network, table_name, \
     table_id, priority, destination, device, fwmark, created_at";

impl RouteRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            group_name: row.get(1)?,
            rule_type: row.get(2)?,
            from_network: row.get(3)?,
            to_network: row.get(4)?,
            table_name: row.get(5)?,
            table_id: row.get(6)?,
            priority: row.get(7)?,
            destination: row.get(8)?,
            device: row.get(9)?,
            fwmark: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn decode(self) -> Result<RoutingRule> {
        Ok(RoutingRule {
            id: self.id,
            group_name: self.group_name,
            spec: RoutingRuleSpec {
                rule_type: parse_field("rule_type", &self.rule_type)?,
                from_network: parse_network("from_network", self.from_network)?,
                to_network: parse_network("to_network", self.to_network)?,
                table_name: self.table_name,
                table_id: self.table_id,
                priority: self.priority,
                destination: parse_network("destination", self.destination)?,
                device: self.device,
                fwmark: self.fwmark,
            },
            created_at: parse_time(&self.created_at)?,
        })
    }
}

impl StoreTx<'_> {
    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Persisted lifecycle state, `None` for a fresh store
    pub fn lifecycle_state(&self) -> Result<Option<String>> {
        self.tx
            .query_row("SELECT state FROM engine_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .query_ctx("read lifecycle state")
    }

    pub fn set_lifecycle_state(&self, state: &str) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO engine_state (id, state, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
                params![state, now()],
            )
            .write_ctx("write lifecycle state")?;
        Ok(())
    }

    // ── Groups ──────────────────────────────────────────────────────────────

    fn query_groups(&self, sql: &str) -> Result<Vec<RuleGroup>> {
        let mut stmt = self.tx.prepare(sql).query_ctx("prepare group query")?;
        let rows = stmt
            .query_map([], GroupRow::from_row)
            .query_ctx("list groups")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .query_ctx("list groups")?;
        rows.into_iter().map(GroupRow::decode).collect()
    }

    /// All groups ordered by priority, then name
    pub fn list_groups(&self) -> Result<Vec<RuleGroup>> {
        self.query_groups(&format!(
            "SELECT {GROUP_COLUMNS} FROM rule_groups ORDER BY priority, name"
        ))
    }

    /// Enabled groups ordered by priority, then name
    pub fn enabled_groups(&self) -> Result<Vec<RuleGroup>> {
        self.query_groups(&format!(
            "SELECT {GROUP_COLUMNS} FROM rule_groups WHERE enabled = 1 ORDER BY priority, name"
        ))
    }

    pub fn find_group(&self, name: &str) -> Result<Option<RuleGroup>> {
        self.tx
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM rule_groups WHERE name = ?1"),
                params![name],
                GroupRow::from_row,
            )
            .optional()
            .query_ctx("get group")?
            .map(GroupRow::decode)
            .transpose()
    }

    /// # Errors
    ///
    /// [`Error::GroupNotFound`] if there is no such group.
    pub fn group(&self, name: &str) -> Result<RuleGroup> {
        self.find_group(name)?
            .ok_or_else(|| Error::GroupNotFound(name.to_string()))
    }

    /// # Errors
    ///
    /// [`Error::AlreadyExists`] if the name is taken.
    pub fn insert_group(&self, group: &RuleGroup) -> Result<()> {
        if self.find_group(&group.name)?.is_some() {
            return Err(Error::AlreadyExists(format!("group '{}'", group.name)));
        }
        self.tx
            .execute(
                &format!("INSERT INTO rule_groups ({GROUP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    group.name,
                    group.group_type,
                    group.priority,
                    group.enabled,
                    group.metadata.to_string(),
                    group.created_at.to_rfc3339(),
                    group.updated_at.to_rfc3339(),
                ],
            )
            .write_ctx("insert group")?;
        Ok(())
    }

    pub fn set_group_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let changed = self
            .tx
            .execute(
                "UPDATE rule_groups SET enabled = ?2, updated_at = ?3 WHERE name = ?1",
                params![name, enabled, now()],
            )
            .write_ctx("update group")?;
        if changed == 0 {
            return Err(Error::GroupNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Deletes the group; rules, routes and preset binding cascade.
    pub fn delete_group(&self, name: &str) -> Result<()> {
        let changed = self
            .tx
            .execute("DELETE FROM rule_groups WHERE name = ?1", params![name])
            .write_ctx("delete group")?;
        if changed == 0 {
            return Err(Error::GroupNotFound(name.to_string()));
        }
        Ok(())
    }

    // ── Firewall rules ──────────────────────────────────────────────────────

    /// Rules by ascending id, optionally of one group
    pub fn list_rules(&self, group: Option<&str>) -> Result<Vec<FirewallRule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM firewall_rules WHERE ?1 IS NULL OR group_name = ?1 ORDER BY id"
        );
        let mut stmt = self.tx.prepare(&sql).query_ctx("prepare rule query")?;
        let rows = stmt
            .query_map(params![group], RuleRow::from_row)
            .query_ctx("list rules")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .query_ctx("list rules")?;
        rows.into_iter().map(RuleRow::decode).collect()
    }

    /// # Errors
    ///
    /// [`Error::RuleNotFound`] if there is no such rule.
    pub fn rule(&self, id: i64) -> Result<FirewallRule> {
        self.tx
            .query_row(
                &format!("SELECT {RULE_COLUMNS} FROM firewall_rules WHERE id = ?1"),
                params![id],
                RuleRow::from_row,
            )
            .optional()
            .query_ctx("get rule")?
            .ok_or(Error::RuleNotFound(id))?
            .decode()
    }

    pub fn count_rules(&self, group: &str) -> Result<usize> {
        let count: i64 = self
            .tx
            .query_row(
                "SELECT (SELECT COUNT(*) FROM firewall_rules WHERE group_name = ?1)
                      + (SELECT COUNT(*) FROM routing_rules WHERE group_name = ?1)",
                params![group],
                |row| row.get(0),
            )
            .query_ctx("count rules")?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Inserts `rule` with its id exactly as given.
    pub fn insert_rule(&self, rule: &FirewallRule) -> Result<()> {
        let spec = &rule.spec;
        self.tx
            .execute(
                &format!(
                    "INSERT INTO firewall_rules ({RULE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    rule.id,
                    rule.group_name,
                    spec.chain.as_str(),
                    spec.rule_type.as_str(),
                    spec.family.as_str(),
                    spec.proto.as_str(),
                    spec.dport,
                    spec.source.map(|n| n.to_string()),
                    spec.destination.map(|n| n.to_string()),
                    spec.in_iface,
                    spec.out_iface,
                    format_states(&spec.state_match),
                    rule.created_at.to_rfc3339(),
                ],
            )
            .write_ctx("insert rule")?;
        Ok(())
    }

    pub fn delete_rule(&self, id: i64) -> Result<()> {
        let changed = self
            .tx
            .execute("DELETE FROM firewall_rules WHERE id = ?1", params![id])
            .write_ctx("delete rule")?;
        if changed == 0 {
            return Err(Error::RuleNotFound(id));
        }
        Ok(())
    }

    // ── Routing rules ───────────────────────────────────────────────────────

    pub fn list_routes(&self, group: Option<&str>) -> Result<Vec<RoutingRule>> {
        let sql = format!(
            "SELECT {ROUTE_COLUMNS} FROM routing_rules WHERE ?1 IS NULL OR group_name = ?1 ORDER BY id"
        );
        let mut stmt = self.tx.prepare(&sql).query_ctx("prepare route query")?;
        let rows = stmt
            .query_map(params![group], RouteRow::from_row)
            .query_ctx("list routes")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .query_ctx("list routes")?;
        rows.into_iter().map(RouteRow::decode).collect()
    }

    /// # Errors
    ///
    /// [`Error::RouteNotFound`] if there is no such route.
    pub fn route(&self, id: i64) -> Result<RoutingRule> {
        self.tx
            .query_row(
                &format!("SELECT {ROUTE_COLUMNS} FROM routing_rules WHERE id = ?1"),
                params![id],
                RouteRow::from_row,
            )
            .optional()
            .query_ctx("get route")?
            .ok_or(Error::RouteNotFound(id))?
            .decode()
    }

    pub fn insert_route(&self, route: &RoutingRule) -> Result<()> {
        let spec = &route.spec;
        self.tx
            .execute(
                &format!(
                    "INSERT INTO routing_rules ({ROUTE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    route.id,
                    route.group_name,
                    spec.rule_type.as_str(),
                    spec.from_network.map(|n| n.to_string()),
                    spec.to_network.map(|n| n.to_string()),
                    spec.table_name,
                    spec.table_id,
                    spec.priority,
                    spec.destination.map(|n| n.to_string()),
                    spec.device,
                    spec.fwmark,
                    route.created_at.to_rfc3339(),
                ],
            )
            .write_ctx("insert route")?;
        Ok(())
    }

    pub fn delete_route(&self, id: i64) -> Result<()> {
        let changed = self
            .tx
            .execute("DELETE FROM routing_rules WHERE id = ?1", params![id])
            .write_ctx("delete route")?;
        if changed == 0 {
            return Err(Error::RouteNotFound(id));
        }
        Ok(())
    }

    // ── Id prediction ───────────────────────────────────────────────────────

    fn next_id(&self, table: &'static str) -> Result<i64> {
        self.tx
            .query_row(
                &format!(
                    "SELECT MAX(
                        COALESCE((SELECT seq FROM sqlite_sequence WHERE name = '{table}'), 0),
                        COALESCE((SELECT MAX(id) FROM {table}), 0)
                     ) + 1"
                ),
                [],
                |row| row.get(0),
            )
            .query_ctx("predict id")
    }

    /// Id the next inserted firewall rule will receive
    pub fn next_rule_id(&self) -> Result<i64> {
        self.next_id("firewall_rules")
    }

    /// Id the next inserted routing rule will receive
    pub fn next_route_id(&self) -> Result<i64> {
        self.next_id("routing_rules")
    }

    // ── Projection ──────────────────────────────────────────────────────────

    pub fn group_rows(&self, group: RuleGroup) -> Result<GroupRows> {
        Ok(GroupRows {
            rules: self.list_rules(Some(&group.name))?,
            routes: self.list_routes(Some(&group.name))?,
            group,
        })
    }

    /// Every enabled group with its rows, ordered by priority then name
    pub fn enabled_projection(&self) -> Result<Vec<GroupRows>> {
        self.enabled_groups()?
            .into_iter()
            .map(|g| self.group_rows(g))
            .collect()
    }

    // ── Presets ─────────────────────────────────────────────────────────────

    pub fn insert_binding(&self, binding: &PresetBinding) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO preset_bindings (preset_name, kind, group_name, params, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    binding.preset_name,
                    binding.kind,
                    binding.group_name,
                    binding.params.to_string(),
                    binding.created_at.to_rfc3339(),
                ],
            )
            .write_ctx("insert preset binding")?;
        Ok(())
    }

    pub fn binding(&self, preset_name: &str) -> Result<Option<PresetBinding>> {
        let row = self
            .tx
            .query_row(
                "SELECT preset_name, kind, group_name, params, created_at
                 FROM preset_bindings WHERE preset_name = ?1",
                params![preset_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .query_ctx("get preset binding")?;
        row.map(|(preset_name, kind, group_name, params, created_at)| {
            Ok(PresetBinding {
                params: serde_json::from_str(&params)
                    .map_err(|e| Error::Corrupt(format!("preset '{preset_name}' params: {e}")))?,
                created_at: parse_time(&created_at)?,
                preset_name,
                kind,
                group_name,
            })
        })
        .transpose()
    }

    // ── Pending transaction marker ──────────────────────────────────────────

    /// # Errors
    ///
    /// [`Error::InvalidState`] if a marker is already present.
    pub fn put_pending(&self, pending: &PendingTx) -> Result<()> {
        if self.pending()?.is_some() {
            return Err(Error::InvalidState(
                "another kernel transaction is pending".into(),
            ));
        }
        self.tx
            .execute(
                "INSERT INTO pending_tx (id, tx_id, operation, group_name, ops, resolution, created_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    pending.tx_id.to_string(),
                    pending.operation,
                    pending.group_name,
                    serde_json::to_string(&pending.ops)?,
                    serde_json::to_string(&pending.resolution)?,
                    pending.created_at.to_rfc3339(),
                ],
            )
            .write_ctx("write pending marker")?;
        Ok(())
    }

    pub fn pending(&self) -> Result<Option<PendingTx>> {
        let row = self
            .tx
            .query_row(
                "SELECT tx_id, operation, group_name, ops, resolution, created_at
                 FROM pending_tx WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .query_ctx("read pending marker")?;
        row.map(|(tx_id, operation, group_name, ops, resolution, created_at)| {
            let corrupt = |e: serde_json::Error| Error::Corrupt(format!("pending marker: {e}"));
            Ok(PendingTx {
                tx_id: parse_field("tx_id", &tx_id)?,
                operation,
                group_name,
                ops: serde_json::from_str(&ops).map_err(corrupt)?,
                resolution: serde_json::from_str(&resolution).map_err(corrupt)?,
                created_at: parse_time(&created_at)?,
            })
        })
        .transpose()
    }

    pub fn clear_pending(&self) -> Result<()> {
        self.tx
            .execute("DELETE FROM pending_tx WHERE id = 1", [])
            .write_ctx("clear pending marker")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::{Chain, CtState, Protocol};
    use crate::core::kernel::{FilterEntry, RuleKey};
    use serde_json::json;

    fn group(name: &str, priority: i32) -> RuleGroup {
        RuleGroup {
            name: name.into(),
            group_type: "custom".into(),
            priority,
            enabled: false,
            metadata: json!({ "note": name }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn rule(id: i64, group: &str) -> FirewallRule {
        FirewallRule {
            id,
            group_name: group.into(),
            spec: FirewallRuleSpec::accept(Chain::Forward)
                .in_iface("wg0")
                .out_iface("eth0")
                .states(&[CtState::Established, CtState::Related]),
            created_at: Utc::now(),
        }
    }

    fn memory() -> Store {
        Store::open(":memory:").unwrap()
    }

    #[test]
    fn test_group_roundtrip_and_duplicate() {
        let store = memory();
        store.write(|tx| tx.insert_group(&group("vpn", 100))).unwrap();
        let err = store
            .write(|tx| tx.insert_group(&group("vpn", 1)))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let loaded = store.read(|tx| tx.group("vpn")).unwrap();
        assert_eq!(loaded.priority, 100);
        assert_eq!(loaded.metadata["note"], "vpn");
        assert!(!loaded.enabled);
    }

    #[test]
    fn test_enabled_groups_are_ordered() {
        let store = memory();
        store
            .write(|tx| {
                for (name, prio) in [("b", 10), ("a", 10), ("c", 5), ("off", 1)] {
                    tx.insert_group(&group(name, prio))?;
                    if name != "off" {
                        tx.set_group_enabled(name, true)?;
                    }
                }
                Ok(())
            })
            .unwrap();
        let names: Vec<String> = store
            .read(|tx| tx.enabled_groups())
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, ["c", "a", "b"]);
    }

    #[test]
    fn test_rule_roundtrip() {
        let store = memory();
        let mut ipv6 = rule(0, "g");
        ipv6.spec = FirewallRuleSpec::accept(Chain::Input)
            .source("fd00::/64".parse().unwrap())
            .port(Protocol::Udp, 51820);
        store
            .write(|tx| {
                tx.insert_group(&group("g", 1))?;
                let id = tx.next_rule_id()?;
                tx.insert_rule(&FirewallRule { id, ..rule(0, "g") })?;
                let id = tx.next_rule_id()?;
                tx.insert_rule(&FirewallRule { id, ..ipv6.clone() })
            })
            .unwrap();
        let rules = store.read(|tx| tx.list_rules(Some("g"))).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, 1);
        assert_eq!(rules[0].spec, rule(0, "g").spec);
        assert_eq!(rules[1].spec, ipv6.spec);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let store = memory();
        store.write(|tx| tx.insert_group(&group("g", 1))).unwrap();
        for _ in 0..3 {
            store
                .write(|tx| {
                    let id = tx.next_rule_id()?;
                    tx.insert_rule(&rule(id, "g"))
                })
                .unwrap();
        }
        store.write(|tx| tx.delete_rule(3)).unwrap();
        assert_eq!(store.read(|tx| tx.next_rule_id()).unwrap(), 4);
    }

    #[test]
    fn test_delete_group_cascades() {
        let store = memory();
        store
            .write(|tx| {
                tx.insert_group(&group("g", 1))?;
                tx.insert_rule(&rule(1, "g"))?;
                tx.insert_route(&RoutingRule {
                    id: 1,
                    group_name: "g".into(),
                    spec: RoutingRuleSpec::route("wg1", 200),
                    created_at: Utc::now(),
                })?;
                tx.insert_binding(&PresetBinding {
                    preset_name: "g".into(),
                    kind: "vpn".into(),
                    group_name: "g".into(),
                    params: json!({}),
                    created_at: Utc::now(),
                })?;
                tx.delete_group("g")
            })
            .unwrap();
        store
            .read(|tx| {
                assert!(tx.list_rules(None)?.is_empty());
                assert!(tx.list_routes(None)?.is_empty());
                assert!(tx.binding("g")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_failed_write_leaves_nothing() {
        let store = memory();
        let result: Result<()> = store.write(|tx| {
            tx.insert_group(&group("g", 1))?;
            Err(Error::Internal("boom".into()))
        });
        assert!(result.is_err());
        assert!(store.read(|tx| tx.find_group("g")).unwrap().is_none());
    }

    #[test]
    fn test_pending_marker_single_slot() {
        let store = memory();
        let op = KernelOp::AddFilter(FilterEntry::new(
            RuleKey::new(1, "g", 1),
            FirewallRuleSpec::drop(Chain::Output),
        ));
        let marker = PendingTx::new("enable", "g", vec![op], Resolution::RollBack);
        store.write(|tx| tx.put_pending(&marker)).unwrap();
        assert!(store.write(|tx| tx.put_pending(&marker)).is_err());

        let loaded = store.read(|tx| tx.pending()).unwrap().unwrap();
        assert_eq!(loaded.tx_id, marker.tx_id);
        assert_eq!(loaded.ops, marker.ops);
        assert_eq!(loaded.resolution, Resolution::RollBack);

        store.write(|tx| tx.clear_pending()).unwrap();
        assert!(store.read(|tx| tx.pending()).unwrap().is_none());
    }

    #[test]
    fn test_resolution_encoding() {
        let text = serde_json::to_string(&Resolution::DeleteRule(7)).unwrap();
        assert_eq!(text, r#"{"action":"delete_rule","id":7}"#);
        let back: Resolution = serde_json::from_str(&text).unwrap();
        assert_eq!(back, Resolution::DeleteRule(7));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let path = path.to_str().unwrap();
        {
            let store = Store::open(path).unwrap();
            store
                .write(|tx| {
                    tx.insert_group(&group("g", 1))?;
                    tx.set_lifecycle_state("started")
                })
                .unwrap();
        }
        let store = Store::open(path).unwrap();
        assert_eq!(
            store.read(|tx| tx.lifecycle_state()).unwrap().as_deref(),
            Some("started")
        );
        assert!(store.read(|tx| tx.find_group("g")).unwrap().is_some());
    }
}
