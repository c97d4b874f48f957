//! Integration tests for phantom-fw
//!
//! These tests drive the public API end to end: lifecycle, group
//! transactions, presets, crash recovery and drift detection.
//!
//! # Running with the in-memory kernel
//!
//! By default every test runs against `MemoryKernel` and needs no privileges:
//! ```bash
//! cargo test --test integration_tests
//! ```
//!
//! # Running with the real kernel
//!
//! The host round-trip test touches nftables and policy routing. Run it in a
//! throwaway network namespace only:
//! ```bash
//! sudo -E unshare -n env PHANTOM_FW_USE_REAL_KERNEL=1 cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use phantom_fw::config::EngineConfig;
use phantom_fw::core::firewall::{
    Chain, Family, FirewallRuleSpec, Protocol, RoutingRuleSpec, RuleType,
};
use phantom_fw::audit::{AuditLog, EventType};
use phantom_fw::core::applier::Applier;
use phantom_fw::core::compiler::compile_group;
use phantom_fw::core::kernel::{KernelBackend, MemoryKernel, RouteEntry};
use phantom_fw::core::store::{PendingTx, Resolution, Store};
use phantom_fw::core::verify::DriftItem;
use phantom_fw::{Engine, EngineStatus, ErrorCode};
use std::env;
use std::sync::Arc;

fn engine(kernel: &MemoryKernel) -> Engine {
    Engine::new(EngineConfig::default(), Arc::new(kernel.clone())).with_audit(None)
}

fn memory_engine() -> (Engine, MemoryKernel) {
    let kernel = MemoryKernel::new();
    let engine = engine(&kernel);
    engine.init(":memory:").unwrap();
    (engine, kernel)
}

fn masquerade() -> FirewallRuleSpec {
    FirewallRuleSpec::masquerade()
        .source("10.0.0.0/24".parse().unwrap())
        .out_iface("eth0")
}

fn accept(port: u16) -> FirewallRuleSpec {
    FirewallRuleSpec::accept(Chain::Input).port(Protocol::Tcp, port)
}

#[test]
fn test_end_to_end_vpn_group() {
    let (engine, _kernel) = memory_engine();

    engine.create_group("vpn1", "preset", 10).unwrap();
    let rule = engine.add_rule("vpn1", masquerade()).unwrap();
    assert_eq!(rule.id, 1);

    engine.enable_group("vpn1").unwrap();
    let state = engine.get_kernel_state().unwrap();
    assert!(
        state
            .filters
            .iter()
            .any(|f| f.rule.chain == Chain::Nat && f.rule.rule_type == RuleType::Masquerade),
        "masquerade missing from {:?}",
        state.filters
    );

    let report = engine.verify_rules().unwrap();
    assert!(report.in_sync, "{report:?}");
    assert_eq!(report.expected_fingerprint, report.live_fingerprint);

    engine.delete_group("vpn1").unwrap();
    assert!(engine.get_kernel_state().unwrap().filters.is_empty());
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_enable_and_disable_are_idempotent() {
    let (engine, kernel) = memory_engine();
    engine.create_group("web", "custom", 20).unwrap();
    engine.add_rule("web", accept(80)).unwrap();

    let first = engine.enable_group("web").unwrap();
    let executed = kernel.executed();
    let second = engine.enable_group("web").unwrap();
    assert_eq!(first.enabled, second.enabled);
    assert_eq!(kernel.executed(), executed);

    engine.disable_group("web").unwrap();
    let executed = kernel.executed();
    engine.disable_group("web").unwrap();
    assert_eq!(kernel.executed(), executed);
}

#[test]
fn test_enable_is_all_or_nothing() {
    for failing_op in 0..4 {
        let (engine, kernel) = memory_engine();
        engine.create_group("g", "custom", 1).unwrap();
        for port in [22, 80, 443] {
            engine.add_rule("g", accept(port)).unwrap();
        }
        engine
            .add_route("g", RoutingRuleSpec::route("wg1", 200))
            .unwrap();

        kernel.fail_after(failing_op);
        assert!(engine.enable_group("g").is_err(), "op {failing_op}");
        assert!(!engine.get_group("g").unwrap().enabled);
        assert!(kernel.snapshot().unwrap().is_empty(), "op {failing_op}");
    }
}

#[test]
fn test_round_trip_matches_compiled_store() {
    let (engine, _kernel) = memory_engine();
    engine.create_group("mix", "custom", 5).unwrap();
    engine.add_rule("mix", accept(22)).unwrap();
    engine.add_rule("mix", masquerade()).unwrap();
    engine
        .add_route(
            "mix",
            RoutingRuleSpec::policy(200, 1000).from("10.0.0.0/24".parse().unwrap()),
        )
        .unwrap();
    engine
        .add_route("mix", RoutingRuleSpec::route("wg0", 200))
        .unwrap();

    engine.enable_group("mix").unwrap();
    let live = engine.get_kernel_state().unwrap();
    let expected = engine.expected_state().unwrap();
    assert_eq!(live.filters.len(), expected.filters.len());
    assert_eq!(live.policies, expected.policies);
    assert_eq!(live.routes, expected.routes);
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_kill_switch_failure_leaves_no_rows() {
    let (engine, kernel) = memory_engine();
    kernel.fail_after(1);

    let err = engine.apply_preset_kill_switch(51820, 443, "wg0").unwrap_err();
    assert_eq!(err.code(), ErrorCode::PresetFailed);
    assert!(engine.list_groups().unwrap().is_empty());
    assert!(engine.list_rules(None).unwrap().is_empty());
    assert!(kernel.snapshot().unwrap().is_empty());

    // Nothing half-applied blocks a retry
    engine.apply_preset_kill_switch(51820, 443, "wg0").unwrap();
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_presets_coexist_in_priority_order() {
    let (engine, kernel) = memory_engine();
    engine
        .apply_preset_vpn("vpn", "wg0", 51820, "10.8.0.0/24".parse().unwrap(), "eth0")
        .unwrap();
    engine.apply_preset_kill_switch(51820, 0, "wg0").unwrap();
    engine
        .apply_preset_dns_protection(&["10.8.0.1".parse().unwrap()], "wg0")
        .unwrap();
    engine.apply_preset_ipv6_block().unwrap();

    assert_eq!(engine.list_groups().unwrap().len(), 4);
    assert!(engine.verify_rules().unwrap().in_sync);

    let output: Vec<i32> = kernel
        .chain_entries(Chain::Output)
        .iter()
        .map(|e| e.key.as_ref().unwrap().priority)
        .collect();
    let mut sorted = output.clone();
    sorted.sort_unstable();
    assert_eq!(output, sorted);

    engine.remove_preset("kill-switch").unwrap();
    engine.remove_preset("vpn").unwrap();
    assert_eq!(engine.list_groups().unwrap().len(), 2);
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_presets_come_back_after_kernel_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db").to_string_lossy().into_owned();

    let before = MemoryKernel::new();
    let first = engine(&before);
    first.init(&path).unwrap();
    first.apply_preset_kill_switch(51820, 0, "wg0").unwrap();
    first.apply_preset_ipv6_block().unwrap();
    first.close().unwrap();

    // Host rebooted: the store survived, the kernel did not
    let after = MemoryKernel::new();
    let second = engine(&after);
    second.init(&path).unwrap();
    assert_eq!(second.status(), EngineStatus::Initialized);
    assert_eq!(
        after.snapshot().unwrap().len(),
        before.snapshot().unwrap().len()
    );
    assert!(second.verify_rules().unwrap().in_sync);

    second.remove_preset("kill-switch").unwrap();
    assert!(second.verify_rules().unwrap().in_sync);
}

#[test]
fn test_crash_at_any_point_of_enable_recovers() {
    for crashed_after in 0..=3 {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db").to_string_lossy().into_owned();
        let kernel = MemoryKernel::new();

        let first = engine(&kernel);
        first.init(&path).unwrap();
        first.create_group("vpn", "custom", 10).unwrap();
        for port in [22, 80, 443] {
            first.add_rule("vpn", accept(port)).unwrap();
        }
        first.close().unwrap();

        // Marker written, then the process dies after `crashed_after` ops
        let store = Store::open(&path).unwrap();
        let ops = store
            .read(|tx| {
                let rows = tx.group_rows(tx.group("vpn")?)?;
                Ok(compile_group(&rows.group, &rows.rules, &rows.routes))
            })
            .unwrap();
        let pending = PendingTx::new("enable", "vpn", ops.clone(), Resolution::RollBack);
        store.write(|tx| tx.put_pending(&pending)).unwrap();
        Applier::new(Arc::new(kernel.clone()))
            .apply(&ops[..crashed_after])
            .unwrap();
        drop(store);

        let second = engine(&kernel);
        second.init(&path).unwrap();
        assert!(!second.get_group("vpn").unwrap().enabled);
        assert!(kernel.snapshot().unwrap().is_empty(), "crash after {crashed_after}");
        assert!(second.verify_rules().unwrap().in_sync);

        second.enable_group("vpn").unwrap();
        assert_eq!(kernel.chain_entries(Chain::Input).len(), 3);
    }
}

#[test]
fn test_drift_detection() {
    let (engine, kernel) = memory_engine();
    engine.create_group("web", "custom", 10).unwrap();
    engine.add_rule("web", accept(443)).unwrap();
    engine
        .add_route("web", RoutingRuleSpec::route("wg0", 200))
        .unwrap();
    engine.enable_group("web").unwrap();

    let stray = RouteEntry {
        family: Family::Ipv4,
        destination: Some("192.168.50.0/24".parse().unwrap()),
        device: "wg0".into(),
        table: 200,
    };
    kernel.insert_external_route(stray.clone());
    let report = engine.verify_rules().unwrap();
    assert_eq!(report.unexpected, vec![DriftItem::Route(stray.clone())]);
    assert!(report.missing.is_empty());

    kernel.remove_external_route(&stray);
    let managed = kernel.snapshot().unwrap().routes.remove(0);
    kernel.remove_external_route(&managed);
    let report = engine.verify_rules().unwrap();
    assert_eq!(report.missing, vec![DriftItem::Route(managed)]);
    assert!(report.unexpected.is_empty());
    assert_ne!(report.expected_fingerprint, report.live_fingerprint);
}

#[test]
fn test_lifecycle_round_trip() {
    let (engine, kernel) = memory_engine();
    assert_eq!(engine.status(), EngineStatus::Initialized);
    engine.create_group("web", "custom", 10).unwrap();
    engine.add_rule("web", accept(80)).unwrap();
    engine.enable_group("web").unwrap();

    engine.start().unwrap();
    assert_eq!(engine.status(), EngineStatus::Started);
    assert_eq!(
        engine.start().unwrap_err().code(),
        ErrorCode::AlreadyStarted
    );

    engine.stop().unwrap();
    assert!(kernel.snapshot().unwrap().is_empty());
    assert_eq!(engine.stop().unwrap_err().code(), ErrorCode::NotStarted);

    let report = engine.status_report().unwrap();
    assert_eq!(report.status, EngineStatus::Stopped);
    assert_eq!(report.firewall_rules.total, 1);
    assert_eq!(report.firewall_rules.applied, 0);
    assert_eq!(report.last_error, "Engine is not started");

    engine.close().unwrap();
    assert_eq!(engine.status(), EngineStatus::Closed);
    assert_eq!(
        engine.list_groups().unwrap_err().code(),
        ErrorCode::NotInitialized
    );
}

#[test]
fn test_concurrent_mutations_serialize() {
    let (engine, _kernel) = memory_engine();
    let engine = Arc::new(engine);
    for i in 0..4 {
        engine.create_group(&format!("g{i}"), "custom", i).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let group = format!("g{i}");
                for port in 1..=10 {
                    engine.add_rule(&group, accept(port)).unwrap();
                }
                engine.enable_group(&group).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut ids: Vec<i64> = engine
        .list_rules(None)
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=40).collect::<Vec<_>>());
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_audit_trail_records_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.log");
    let kernel = MemoryKernel::new();
    let engine = Engine::new(EngineConfig::default(), Arc::new(kernel.clone()))
        .with_audit(Some(AuditLog::at(&audit_path)));
    engine.init(":memory:").unwrap();
    engine.create_group("web", "custom", 10).unwrap();
    engine.add_rule("web", accept(80)).unwrap();

    kernel.fail_after(0);
    engine.enable_group("web").unwrap_err();
    engine.enable_group("web").unwrap();

    let events = AuditLog::at(&audit_path).read_recent(10).unwrap();
    let toggles: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::EnableGroup)
        .collect();
    assert_eq!(toggles.len(), 2);
    // Newest first
    assert!(toggles[0].success);
    assert!(!toggles[1].success);
    assert!(toggles[1].error.is_some());
    assert_eq!(toggles[0].details["group"], "web");
}

#[test]
fn test_host_kernel_round_trip() {
    if env::var("PHANTOM_FW_USE_REAL_KERNEL").is_err() {
        eprintln!("Skipping host test: PHANTOM_FW_USE_REAL_KERNEL is not set");
        return;
    }

    let config = EngineConfig {
        table_name: "phantom_it".to_string(),
        audit_log: false,
        ..EngineConfig::default()
    };
    let engine = Engine::system(config).unwrap();
    engine.init(":memory:").unwrap();
    engine.create_group("it", "custom", 10).unwrap();
    engine.add_rule("it", accept(2222)).unwrap();
    engine.enable_group("it").unwrap();
    let report = engine.verify_rules().unwrap();
    engine.stop().unwrap();
    assert!(report.in_sync, "{report:?}");
}
