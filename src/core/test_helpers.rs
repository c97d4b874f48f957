//! Shared test utilities for core module tests
//!
//! Provides an engine fixture over [`MemoryKernel`] and an in-memory store,
//! plus builders for the rules and routes tests use most. This module is only
//! compiled in test mode.

use crate::config::EngineConfig;
use crate::core::engine::Engine;
use crate::core::firewall::{Chain, FirewallRuleSpec, Protocol, RoutingRuleSpec};
use crate::core::kernel::MemoryKernel;
use std::sync::{Arc, Mutex};

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("PHANTOM_FW_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("PHANTOM_FW_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Engine over a fresh [`MemoryKernel`], not yet initialized, auditing off.
pub fn engine_uninit() -> (Engine, MemoryKernel) {
    let kernel = MemoryKernel::new();
    (engine_with_kernel(&kernel), kernel)
}

/// Engine initialized on a private `:memory:` store.
///
/// This is the canonical fixture; the engine is live (`initialized`).
pub fn memory_engine() -> (Engine, MemoryKernel) {
    let (engine, kernel) = engine_uninit();
    engine.init(":memory:").unwrap();
    (engine, kernel)
}

/// On-disk database path inside a fresh temporary directory
pub fn temp_db() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db").to_string_lossy().into_owned();
    (dir, path)
}

pub fn tcp_accept(port: u16) -> FirewallRuleSpec {
    FirewallRuleSpec::accept(Chain::Input).port(Protocol::Tcp, port)
}

pub fn masquerade(source: &str, out_iface: &str) -> FirewallRuleSpec {
    FirewallRuleSpec::masquerade()
        .source(source.parse().unwrap())
        .out_iface(out_iface)
}

pub fn default_route(device: &str, table: u32) -> RoutingRuleSpec {
    RoutingRuleSpec::route(device, table)
}

pub fn from_policy(from: &str, table: u32, priority: u32) -> RoutingRuleSpec {
    RoutingRuleSpec::policy(table, priority).from(from.parse().unwrap())
}

/// Engine sharing `kernel`, not yet initialized, auditing off
pub fn engine_with_kernel(kernel: &MemoryKernel) -> Engine {
    Engine::new(EngineConfig::default(), Arc::new(kernel.clone())).with_audit(None)
}
