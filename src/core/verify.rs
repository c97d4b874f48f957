//! Drift verification
//!
//! Compares the live kernel snapshot against the state the store says should
//! be applied. Both sides are normalized into the same entry types, so the
//! comparison is a plain multiset difference. Verification only reports; it
//! never touches the kernel.

use super::kernel::{FilterEntry, ForeignRule, KernelSnapshot, PolicyEntry, RouteEntry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::hash::Hash;

/// One entry present on only one side of the comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entry", rename_all = "snake_case")]
pub enum DriftItem {
    Filter(FilterEntry),
    Policy(PolicyEntry),
    Route(RouteEntry),
    /// A rule in the managed table that could not be normalized
    Foreign(ForeignRule),
}

impl DriftItem {
    pub fn describe(&self) -> String {
        match self {
            DriftItem::Filter(e) => format!("filter {}", e.describe()),
            DriftItem::Policy(e) => e.describe(),
            DriftItem::Route(e) => e.describe(),
            DriftItem::Foreign(f) => describe_foreign(f),
        }
    }
}

fn describe_foreign(rule: &ForeignRule) -> String {
    let handle = rule
        .handle
        .map_or_else(String::new, |h| format!(" handle {h}"));
    format!("foreign {}{handle}: {}", rule.chain, rule.expr)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub in_sync: bool,
    /// Expected but absent from the kernel
    pub missing: Vec<DriftItem>,
    /// Present in the kernel but not expected
    pub unexpected: Vec<DriftItem>,
    pub expected_fingerprint: String,
    pub live_fingerprint: String,
}

impl DriftReport {
    pub fn drift_count(&self) -> usize {
        self.missing.len() + self.unexpected.len()
    }
}

/// Entries of `left` not matched one-for-one by entries of `right`
fn multiset_minus<'a, T: Eq + Hash>(left: &'a [T], right: &[T]) -> Vec<&'a T> {
    let mut available: HashMap<&T, usize> = HashMap::new();
    for item in right {
        *available.entry(item).or_default() += 1;
    }
    left.iter()
        .filter(|item| match available.get_mut(item) {
            Some(n) if *n > 0 => {
                *n -= 1;
                false
            }
            _ => true,
        })
        .collect()
}

fn one_side(from: &KernelSnapshot, against: &KernelSnapshot) -> Vec<DriftItem> {
    let mut items: Vec<DriftItem> = multiset_minus(&from.filters, &against.filters)
        .into_iter()
        .cloned()
        .map(DriftItem::Filter)
        .collect();
    items.extend(
        multiset_minus(&from.policies, &against.policies)
            .into_iter()
            .cloned()
            .map(DriftItem::Policy),
    );
    items.extend(
        multiset_minus(&from.routes, &against.routes)
            .into_iter()
            .cloned()
            .map(DriftItem::Route),
    );
    items
}

/// Diffs `expected` against `live`.
///
/// Foreign rules are always unexpected; ordering within chains is not
/// compared.
pub fn diff(expected: &KernelSnapshot, live: &KernelSnapshot) -> DriftReport {
    let missing = one_side(expected, live);
    let mut unexpected = one_side(live, expected);
    unexpected.extend(live.foreign.iter().cloned().map(DriftItem::Foreign));

    DriftReport {
        in_sync: missing.is_empty() && unexpected.is_empty(),
        missing,
        unexpected,
        expected_fingerprint: fingerprint(expected),
        live_fingerprint: fingerprint(live),
    }
}

/// Snapshot in canonical form: filters in chain order, everything
/// else is sorted.
fn canonical(snapshot: &KernelSnapshot) -> KernelSnapshot {
    let mut canonical = snapshot.clone();
    canonical
        .filters
        .sort_by(|a, b| (a.rule.chain, &a.key).cmp(&(b.rule.chain, &b.key)));
    canonical
        .policies
        .sort_by_key(|p| (p.priority, p.table, p.describe()));
    canonical.routes.sort_by_key(|r| (r.table, r.describe()));
    canonical
        .foreign
        .sort_by(|a, b| (&a.chain, a.handle).cmp(&(&b.chain, b.handle)));
    canonical
}

/// SHA-256 of the canonical JSON of `snapshot`, hex encoded
pub fn fingerprint(snapshot: &KernelSnapshot) -> String {
    let json_str = serde_json::to_string(&canonical(snapshot)).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json_str.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn snapshot_lines(snapshot: &KernelSnapshot) -> String {
    let canonical = canonical(snapshot);
    let mut lines: Vec<String> = canonical
        .filters
        .iter()
        .map(|f| format!("filter {}", f.describe()))
        .collect();
    lines.extend(canonical.policies.iter().map(PolicyEntry::describe));
    lines.extend(canonical.routes.iter().map(RouteEntry::describe));
    lines.extend(canonical.foreign.iter().map(describe_foreign));
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

/// Unified-style line diff from `expected` to `live`
pub fn render_diff(expected: &KernelSnapshot, live: &KernelSnapshot) -> String {
    use std::fmt::Write;
    let old_text = snapshot_lines(expected);
    let new_text = snapshot_lines(live);

    let diff = similar::TextDiff::from_lines(&old_text, &new_text);
    let mut result = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "- ",
            similar::ChangeTag::Insert => "+ ",
            similar::ChangeTag::Equal => "  ",
        };
        let _ = write!(result, "{sign}{change}");
    }
    result
}
