//! In-process kernel model
//!
//! Behaves like the host for everything the engine relies on: filter rules
//! are placed by key inside their chain, duplicate policy rules and routes are
//! refused, deletes of absent primitives succeed. Clones share state, so a
//! test can keep a handle while the engine owns another.

use super::{
    FilterEntry, ForeignRule, KernelBackend, KernelOp, KernelSnapshot, PolicyEntry, RouteEntry,
    insertion_index,
};
use crate::core::error::{Error, Result};
use crate::core::firewall::Chain;
use std::sync::{Arc, Mutex, MutexGuard};
use strum::IntoEnumIterator;

type Slot = std::result::Result<FilterEntry, ForeignRule>;

#[derive(Debug, Default)]
struct Inner {
    prepared: bool,
    chains: Vec<(Chain, Vec<Slot>)>,
    policies: Vec<PolicyEntry>,
    routes: Vec<RouteEntry>,
    ip_forward: bool,
    route_cache_flushes: usize,
    executed: usize,
    /// Remaining ops before injected failure
    fail_after: Option<usize>,
    fail_route_flush: bool,
}

impl Inner {
    fn chain_mut(&mut self, chain: Chain) -> &mut Vec<Slot> {
        let pos = self
            .chains
            .iter()
            .position(|(c, _)| *c == chain)
            .unwrap_or_else(|| {
                self.chains.push((chain, Vec::new()));
                self.chains.len() - 1
            });
        &mut self.chains[pos].1
    }

    fn take_failure(&mut self) -> bool {
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                true
            }
            Some(n) => {
                self.fail_after = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryKernel {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge the other handles
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Makes the op after the next `n` successful ones fail once (`0` fails the next).
    pub fn fail_after(&self, n: usize) {
        self.lock().fail_after = Some(n);
    }

    /// Makes the next `flush_managed_routes` fail once, after filters are gone.
    pub fn fail_next_route_flush(&self) {
        self.lock().fail_route_flush = true;
    }

    pub fn clear_failure(&self) {
        let mut inner = self.lock();
        inner.fail_after = None;
        inner.fail_route_flush = false;
    }

    /// Number of primitive ops executed successfully
    pub fn executed(&self) -> usize {
        self.lock().executed
    }

    pub fn ip_forward(&self) -> bool {
        self.lock().ip_forward
    }

    pub fn route_cache_flushes(&self) -> usize {
        self.lock().route_cache_flushes
    }

    pub fn is_prepared(&self) -> bool {
        self.lock().prepared
    }

    /// Appends a filter entry behind the engine's back
    pub fn insert_external_filter(&self, entry: FilterEntry) {
        self.lock().chain_mut(entry.rule.chain).push(Ok(entry));
    }

    /// Appends a rule the parser would not understand
    pub fn insert_foreign(&self, chain: Chain, rule: ForeignRule) {
        self.lock().chain_mut(chain).push(Err(rule));
    }

    pub fn insert_external_route(&self, route: RouteEntry) {
        self.lock().routes.push(route);
    }

    pub fn insert_external_policy(&self, policy: PolicyEntry) {
        self.lock().policies.push(policy);
    }

    /// Removes the first matching filter entry behind the engine's back
    pub fn remove_external_filter(&self, entry: &FilterEntry) -> bool {
        let mut inner = self.lock();
        let chain = inner.chain_mut(entry.rule.chain);
        match chain.iter().position(|e| e.as_ref().ok() == Some(entry)) {
            Some(pos) => {
                let _removed = chain.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn remove_external_route(&self, route: &RouteEntry) -> bool {
        let mut inner = self.lock();
        match inner.routes.iter().position(|r| r == route) {
            Some(pos) => {
                inner.routes.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Filter entries of one chain in chain order
    pub fn chain_entries(&self, chain: Chain) -> Vec<FilterEntry> {
        self.lock()
            .chain_mut(chain)
            .iter()
            .filter_map(|e| e.as_ref().ok().cloned())
            .collect()
    }
}

impl KernelBackend for MemoryKernel {
    fn prepare(&self) -> Result<()> {
        let mut inner = self.lock();
        for chain in Chain::iter() {
            inner.chain_mut(chain);
        }
        inner.prepared = true;
        Ok(())
    }

    fn execute(&self, op: &KernelOp) -> Result<()> {
        let mut inner = self.lock();
        if inner.take_failure() {
            return Err(if op.is_filter() {
                Error::Nftables {
                    message: format!("injected failure on {}", op.describe()),
                    stderr: Some("Error: Could not process rule: Operation not supported".into()),
                    exit_code: Some(1),
                }
            } else {
                Error::Netlink {
                    message: format!("injected failure on {}", op.describe()),
                    stderr: Some("RTNETLINK answers: Operation not supported".into()),
                    exit_code: Some(2),
                }
            });
        }
        if op.is_filter() && !inner.prepared {
            return Err(Error::Nftables {
                message: "managed table does not exist".into(),
                stderr: Some("Error: No such file or directory".into()),
                exit_code: Some(1),
            });
        }

        match op {
            KernelOp::AddFilter(entry) => {
                let chain = inner.chain_mut(entry.rule.chain);
                let pos = entry.key.as_ref().and_then(|key| {
                    let keys = chain.iter().map(|e| e.as_ref().ok().and_then(|f| f.key.as_ref()));
                    insertion_index(keys, key)
                });
                match pos {
                    Some(pos) => chain.insert(pos, Ok(entry.clone())),
                    None => chain.push(Ok(entry.clone())),
                }
            }
            KernelOp::DeleteFilter(entry) => {
                let chain = inner.chain_mut(entry.rule.chain);
                if let Some(pos) = chain.iter().position(|e| e.as_ref().ok() == Some(entry)) {
                    let _removed = chain.remove(pos);
                }
            }
            KernelOp::AddPolicy(entry) => {
                if inner.policies.contains(entry) {
                    return Err(Error::Netlink {
                        message: format!("cannot {}", op.describe()),
                        stderr: Some("RTNETLINK answers: File exists".into()),
                        exit_code: Some(2),
                    });
                }
                inner.policies.push(entry.clone());
            }
            KernelOp::DeletePolicy(entry) => {
                if let Some(pos) = inner.policies.iter().position(|p| p == entry) {
                    inner.policies.remove(pos);
                }
            }
            KernelOp::AddRoute(entry) => {
                if inner.routes.contains(entry) {
                    return Err(Error::Netlink {
                        message: format!("cannot {}", op.describe()),
                        stderr: Some("RTNETLINK answers: File exists".into()),
                        exit_code: Some(2),
                    });
                }
                inner.routes.push(entry.clone());
            }
            KernelOp::DeleteRoute(entry) => {
                if let Some(pos) = inner.routes.iter().position(|r| r == entry) {
                    inner.routes.remove(pos);
                }
            }
        }
        inner.executed += 1;
        Ok(())
    }

    fn snapshot(&self) -> Result<KernelSnapshot> {
        let inner = self.lock();
        let mut snapshot = KernelSnapshot {
            policies: inner.policies.clone(),
            routes: inner.routes.clone(),
            ..KernelSnapshot::default()
        };
        for chain in Chain::iter() {
            let Some((_, entries)) = inner.chains.iter().find(|(c, _)| *c == chain) else {
                continue;
            };
            for entry in entries {
                match entry {
                    Ok(filter) => snapshot.filters.push(filter.clone()),
                    Err(foreign) => snapshot.foreign.push(foreign.clone()),
                }
            }
        }
        Ok(snapshot)
    }

    fn flush_filter_table(&self) -> Result<()> {
        let mut inner = self.lock();
        for (_, entries) in &mut inner.chains {
            entries.clear();
        }
        Ok(())
    }

    fn flush_managed_routes(&self) -> Result<()> {
        let mut inner = self.lock();
        if std::mem::take(&mut inner.fail_route_flush) {
            return Err(Error::Netlink {
                message: "injected failure on route flush".into(),
                stderr: Some("RTNETLINK answers: Operation not supported".into()),
                exit_code: Some(2),
            });
        }
        inner.policies.clear();
        inner.routes.clear();
        Ok(())
    }

    fn flush_route_cache(&self) -> Result<()> {
        self.lock().route_cache_flushes += 1;
        Ok(())
    }

    fn set_ip_forward(&self, enabled: bool) -> Result<()> {
        self.lock().ip_forward = enabled;
        Ok(())
    }
}
