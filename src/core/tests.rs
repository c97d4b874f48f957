//! Cross-module tests: engine, group manager, store and kernel together

use crate::core::applier::Applier;
use crate::core::compiler::compile_group;
use crate::core::engine::EngineStatus;
use crate::core::error::{Error, ErrorCode};
use crate::core::firewall::{Chain, Protocol};
use crate::core::kernel::{FilterEntry, KernelBackend, KernelOp, MemoryKernel};
use crate::core::legacy::{LegacyRule, legacy_key};
use crate::core::store::{PendingTx, Resolution, Store};
use crate::core::test_helpers::{
    default_route, engine_with_kernel, from_policy, masquerade, memory_engine, tcp_accept,
    temp_db,
};
use crate::core::verify::DriftItem;
use std::sync::Arc;

fn populated(engine: &crate::core::engine::Engine, name: &str, priority: i32, ports: &[u16]) {
    engine.create_group(name, "custom", priority).unwrap();
    for port in ports {
        engine.add_rule(name, tcp_accept(*port)).unwrap();
    }
}

fn group_ops(path: &str, name: &str) -> Vec<KernelOp> {
    let store = Store::open(path).unwrap();
    store
        .read(|tx| {
            let rows = tx.group_rows(tx.group(name)?)?;
            Ok(compile_group(&rows.group, &rows.rules, &rows.routes))
        })
        .unwrap()
}

/// Leaves a pending marker and a partial kernel change behind, as a process
/// killed in the middle of a transaction would.
fn simulate_crash(path: &str, kernel: &MemoryKernel, pending: &PendingTx, done: usize, adding: bool) {
    let store = Store::open(path).unwrap();
    store.write(|tx| tx.put_pending(pending)).unwrap();
    let applier = Applier::new(Arc::new(kernel.clone()));
    if adding {
        applier.apply(&pending.ops[..done]).unwrap();
    } else {
        applier.remove(&pending.ops[..done]).unwrap();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Enable / disable
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_enable_is_idempotent() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "web", 50, &[80, 443]);

    engine.enable_group("web").unwrap();
    let executed = kernel.executed();
    let group = engine.enable_group("web").unwrap();

    assert!(group.enabled);
    assert_eq!(kernel.executed(), executed);
    assert_eq!(kernel.chain_entries(Chain::Input).len(), 2);
}

#[test]
fn test_disable_is_idempotent_and_keeps_rows() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "web", 50, &[80]);
    engine.enable_group("web").unwrap();

    engine.disable_group("web").unwrap();
    let executed = kernel.executed();
    let group = engine.disable_group("web").unwrap();

    assert!(!group.enabled);
    assert_eq!(kernel.executed(), executed);
    assert!(kernel.snapshot().unwrap().is_empty());
    assert_eq!(engine.list_rules(Some("web")).unwrap().len(), 1);
}

#[test]
fn test_enable_failure_leaves_nothing() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "vpn", 100, &[22, 80, 443]);
    engine.add_route("vpn", default_route("wg1", 200)).unwrap();

    kernel.fail_after(2);
    let err = engine.enable_group("vpn").unwrap_err();

    assert_eq!(err.code(), ErrorCode::NftFailed);
    assert!(!engine.get_group("vpn").unwrap().enabled);
    assert!(kernel.snapshot().unwrap().is_empty());

    // No marker left behind: the next transaction goes through
    engine.enable_group("vpn").unwrap();
    assert_eq!(kernel.snapshot().unwrap().len(), 4);
}

#[test]
fn test_route_failure_reports_netlink() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "vpn", 100, &[22]);
    engine.add_route("vpn", default_route("wg1", 200)).unwrap();

    kernel.fail_after(1);
    let err = engine.enable_group("vpn").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NetlinkFailed);
    assert!(kernel.snapshot().unwrap().is_empty());
}

#[test]
fn test_enable_applies_exactly_the_compiled_rows() {
    let (engine, _) = memory_engine();
    engine.create_group("mix", "custom", 30).unwrap();
    engine.add_rule("mix", tcp_accept(22)).unwrap();
    engine
        .add_rule("mix", masquerade("10.0.0.0/24", "eth0"))
        .unwrap();
    engine
        .add_route("mix", from_policy("10.0.0.0/24", 200, 100))
        .unwrap();
    engine.add_route("mix", default_route("wg0", 200)).unwrap();

    engine.enable_group("mix").unwrap();

    let live = engine.get_kernel_state().unwrap();
    let expected = engine.expected_state().unwrap();
    assert_eq!(live.filters.len(), 2);
    assert_eq!(live.policies, expected.policies);
    assert_eq!(live.routes, expected.routes);
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_groups_keep_priority_order_regardless_of_enable_order() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "late", 50, &[80]);
    populated(&engine, "early", 10, &[22]);
    populated(&engine, "middle", 30, &[53]);

    engine.enable_group("late").unwrap();
    engine.enable_group("early").unwrap();
    engine.enable_group("middle").unwrap();

    let groups: Vec<String> = kernel
        .chain_entries(Chain::Input)
        .into_iter()
        .map(|e| e.key.unwrap().group)
        .collect();
    assert_eq!(groups, ["early", "middle", "late"]);
}

// ═══════════════════════════════════════════════════════════════════════════
// Rules, routes and groups while live
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_rule_changes_follow_enabled_group() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "web", 50, &[80]);
    engine.enable_group("web").unwrap();

    let rule = engine.add_rule("web", tcp_accept(443)).unwrap();
    assert_eq!(kernel.chain_entries(Chain::Input).len(), 2);

    engine.remove_rule(rule.id).unwrap();
    assert_eq!(kernel.chain_entries(Chain::Input).len(), 1);
    assert!(matches!(
        engine.remove_rule(rule.id),
        Err(Error::RuleNotFound(id)) if id == rule.id
    ));
}

#[test]
fn test_rule_changes_in_disabled_group_skip_kernel() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "web", 50, &[80]);
    let route = engine.add_route("web", default_route("wg0", 200)).unwrap();
    assert_eq!(kernel.executed(), 0);
    engine.remove_route(route.id).unwrap();
    assert!(engine.list_routes(Some("web")).unwrap().is_empty());
}

#[test]
fn test_add_rule_kernel_failure_stores_nothing() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "web", 50, &[80]);
    engine.enable_group("web").unwrap();

    kernel.fail_after(0);
    assert!(engine.add_rule("web", tcp_accept(443)).is_err());
    assert_eq!(engine.list_rules(Some("web")).unwrap().len(), 1);
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_ids_are_never_reused() {
    let (engine, _) = memory_engine();
    engine.create_group("g", "custom", 1).unwrap();
    let first = engine.add_rule("g", tcp_accept(1)).unwrap();
    let second = engine.add_rule("g", tcp_accept(2)).unwrap();
    engine.remove_rule(second.id).unwrap();
    let third = engine.add_rule("g", tcp_accept(3)).unwrap();

    assert_eq!(first.id, 1);
    assert_eq!(second.id, 2);
    assert_eq!(third.id, 3);
}

#[test]
fn test_delete_enabled_group_withdraws_it() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "web", 50, &[80, 443]);
    engine.enable_group("web").unwrap();

    engine.delete_group("web").unwrap();
    assert!(kernel.snapshot().unwrap().is_empty());
    assert!(matches!(engine.get_group("web"), Err(Error::GroupNotFound(_))));
    assert!(engine.list_rules(None).unwrap().is_empty());
}

#[test]
fn test_delete_kernel_failure_keeps_group_applied() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "web", 50, &[80, 443]);
    engine.enable_group("web").unwrap();

    kernel.fail_after(1);
    assert!(engine.delete_group("web").is_err());
    assert!(engine.get_group("web").unwrap().enabled);
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_duplicate_group_and_unknown_group() {
    let (engine, _) = memory_engine();
    engine.create_group("g", "custom", 1).unwrap();
    assert!(matches!(
        engine.create_group("g", "custom", 2),
        Err(Error::AlreadyExists(_))
    ));
    assert_eq!(
        engine.add_rule("missing", tcp_accept(1)).unwrap_err().code(),
        ErrorCode::GroupNotFound
    );
    assert_eq!(
        engine.list_rules(Some("missing")).unwrap_err().code(),
        ErrorCode::GroupNotFound
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_stopped_engine_defers_kernel_changes() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "web", 50, &[80]);
    engine.stop().unwrap();

    engine.enable_group("web").unwrap();
    assert!(kernel.snapshot().unwrap().is_empty());
    assert!(engine.verify_rules().unwrap().in_sync);

    engine.start().unwrap();
    assert_eq!(kernel.chain_entries(Chain::Input).len(), 1);
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_start_rebuilds_from_clean_slate() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "web", 50, &[80]);
    engine.enable_group("web").unwrap();
    kernel.insert_external_filter(FilterEntry::unmanaged(tcp_accept(8080)));

    engine.start().unwrap();
    let report = engine.verify_rules().unwrap();
    assert!(report.in_sync, "{report:?}");
}

#[test]
fn test_start_failure_leaves_engine_stopped() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "web", 50, &[80, 443]);
    engine.enable_group("web").unwrap();

    kernel.fail_after(1);
    assert!(engine.start().is_err());
    assert_eq!(engine.status(), EngineStatus::Stopped);
    assert!(kernel.snapshot().unwrap().is_empty());

    engine.start().unwrap();
    assert_eq!(engine.status(), EngineStatus::Started);
}

#[test]
fn test_stop_is_persisted_and_close_keeps_kernel() {
    let (_dir, path) = temp_db();
    let kernel = MemoryKernel::new();

    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    populated(&engine, "web", 50, &[80]);
    engine.enable_group("web").unwrap();
    engine.close().unwrap();
    assert_eq!(kernel.chain_entries(Chain::Input).len(), 1);

    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    assert_eq!(engine.status(), EngineStatus::Initialized);
    assert!(engine.get_group("web").unwrap().enabled);
    engine.stop().unwrap();
    engine.close().unwrap();

    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    assert_eq!(engine.status(), EngineStatus::Stopped);
    assert!(kernel.snapshot().unwrap().is_empty());
}

#[test]
fn test_init_reconciles_a_fresh_kernel() {
    let (_dir, path) = temp_db();
    let kernel = MemoryKernel::new();
    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    populated(&engine, "web", 50, &[80, 443]);
    engine.enable_group("web").unwrap();
    engine.close().unwrap();

    // Same store, kernel state lost (reboot)
    let rebooted = MemoryKernel::new();
    let engine = engine_with_kernel(&rebooted);
    engine.init(&path).unwrap();
    assert_eq!(engine.status(), EngineStatus::Initialized);
    assert_eq!(rebooted.chain_entries(Chain::Input).len(), 2);

    engine.add_rule("web", tcp_accept(8080)).unwrap();
    assert_eq!(rebooted.chain_entries(Chain::Input).len(), 3);
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_init_leaves_matching_kernel_alone() {
    let (_dir, path) = temp_db();
    let kernel = MemoryKernel::new();
    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    populated(&engine, "web", 50, &[80]);
    engine.enable_group("web").unwrap();
    engine.close().unwrap();

    let executed = kernel.executed();
    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    assert_eq!(kernel.executed(), executed);
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_init_reconcile_failure_comes_up_stopped() {
    let (_dir, path) = temp_db();
    let kernel = MemoryKernel::new();
    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    populated(&engine, "web", 50, &[80, 443]);
    engine.enable_group("web").unwrap();
    engine.close().unwrap();

    let rebooted = MemoryKernel::new();
    rebooted.fail_after(1);
    let engine = engine_with_kernel(&rebooted);
    engine.init(&path).unwrap();
    assert_eq!(engine.status(), EngineStatus::Stopped);
    assert!(rebooted.snapshot().unwrap().is_empty());
    assert!(!engine.status_report().unwrap().last_error.is_empty());
    engine.close().unwrap();

    let engine = engine_with_kernel(&rebooted);
    engine.init(&path).unwrap();
    assert_eq!(engine.status(), EngineStatus::Stopped);
    engine.start().unwrap();
    assert_eq!(rebooted.chain_entries(Chain::Input).len(), 2);
}

#[test]
fn test_close_stops_started_engine() {
    let (_dir, path) = temp_db();
    let kernel = MemoryKernel::new();
    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    populated(&engine, "web", 50, &[80]);
    engine.enable_group("web").unwrap();
    engine.start().unwrap();
    engine.close().unwrap();
    assert!(kernel.snapshot().unwrap().is_empty());

    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    assert_eq!(engine.status(), EngineStatus::Stopped);
}

#[test]
fn test_stop_failure_marks_engine_stopped() {
    let (_dir, path) = temp_db();
    let kernel = MemoryKernel::new();
    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    populated(&engine, "web", 50, &[80]);
    engine.add_route("web", default_route("wg0", 200)).unwrap();
    engine.enable_group("web").unwrap();
    engine.start().unwrap();

    kernel.fail_next_route_flush();
    assert_eq!(engine.stop().unwrap_err().code(), ErrorCode::NetlinkFailed);
    assert_eq!(engine.status(), EngineStatus::Stopped);
    assert!(kernel.chain_entries(Chain::Input).is_empty());

    // Stopped means nothing is expected; the leftover route is reported
    let report = engine.verify_rules().unwrap();
    assert_eq!(report.unexpected.len(), 1);

    engine.close().unwrap();
    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    assert_eq!(engine.status(), EngineStatus::Stopped);
    engine.start().unwrap();
    assert!(engine.verify_rules().unwrap().in_sync);
}

// ═══════════════════════════════════════════════════════════════════════════
// Crash recovery
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_recovery_rolls_back_interrupted_enable() {
    let (_dir, path) = temp_db();
    let kernel = MemoryKernel::new();
    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    populated(&engine, "vpn", 100, &[22, 80, 443]);
    engine.close().unwrap();

    let ops = group_ops(&path, "vpn");
    let pending = PendingTx::new("enable", "vpn", ops, Resolution::RollBack);
    simulate_crash(&path, &kernel, &pending, 2, true);
    assert_eq!(kernel.chain_entries(Chain::Input).len(), 2);

    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    assert!(!engine.get_group("vpn").unwrap().enabled);
    assert!(kernel.snapshot().unwrap().is_empty());
    assert!(engine.verify_rules().unwrap().in_sync);

    // The marker is gone
    engine.enable_group("vpn").unwrap();
    assert_eq!(kernel.chain_entries(Chain::Input).len(), 3);
}

#[test]
fn test_recovery_completes_interrupted_disable() {
    let (_dir, path) = temp_db();
    let kernel = MemoryKernel::new();
    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    populated(&engine, "vpn", 100, &[22, 80, 443]);
    engine.enable_group("vpn").unwrap();
    engine.close().unwrap();

    let ops = group_ops(&path, "vpn");
    let pending = PendingTx::new("disable", "vpn", ops, Resolution::SetDisabled);
    simulate_crash(&path, &kernel, &pending, 1, false);

    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    assert!(!engine.get_group("vpn").unwrap().enabled);
    assert!(kernel.snapshot().unwrap().is_empty());
}

#[test]
fn test_recovery_completes_interrupted_rule_removal() {
    let (_dir, path) = temp_db();
    let kernel = MemoryKernel::new();
    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    populated(&engine, "web", 50, &[80, 443]);
    engine.enable_group("web").unwrap();
    engine.close().unwrap();

    let ops = group_ops(&path, "web");
    let target = ops[1].clone();
    let pending = PendingTx::new("remove_rule", "web", vec![target], Resolution::DeleteRule(2));
    simulate_crash(&path, &kernel, &pending, 0, false);

    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    let rules = engine.list_rules(Some("web")).unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].id, 1);
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_recovery_of_interrupted_start_stops_engine() {
    let (_dir, path) = temp_db();
    let kernel = MemoryKernel::new();
    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    populated(&engine, "web", 50, &[80, 443]);
    engine.enable_group("web").unwrap();
    engine.close().unwrap();
    kernel.flush_filter_table().unwrap();

    let ops = group_ops(&path, "web");
    let pending = PendingTx::new("start", "*", ops, Resolution::MarkStopped);
    simulate_crash(&path, &kernel, &pending, 1, true);

    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    assert_eq!(engine.status(), EngineStatus::Stopped);
    assert!(kernel.snapshot().unwrap().is_empty());

    engine.start().unwrap();
    assert_eq!(kernel.chain_entries(Chain::Input).len(), 2);
}

#[test]
fn test_recovery_keeps_route_shared_with_enabled_group() {
    let (_dir, path) = temp_db();
    let kernel = MemoryKernel::new();
    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    populated(&engine, "a", 10, &[22]);
    engine.add_route("a", default_route("wg0", 200)).unwrap();
    engine.enable_group("a").unwrap();
    populated(&engine, "b", 20, &[80]);
    engine.add_route("b", default_route("wg0", 200)).unwrap();
    engine.close().unwrap();

    // b's filter went in, the crash hit before its route
    let ops = group_ops(&path, "b");
    let pending = PendingTx::new("enable", "b", ops, Resolution::RollBack);
    simulate_crash(&path, &kernel, &pending, 1, true);
    assert_eq!(kernel.snapshot().unwrap().routes.len(), 1);

    let engine = engine_with_kernel(&kernel);
    engine.init(&path).unwrap();
    assert!(engine.get_group("a").unwrap().enabled);
    assert!(!engine.get_group("b").unwrap().enabled);
    assert_eq!(kernel.snapshot().unwrap().routes.len(), 1);
    assert_eq!(kernel.chain_entries(Chain::Input).len(), 1);
    assert!(engine.verify_rules().unwrap().in_sync);
}

// ═══════════════════════════════════════════════════════════════════════════
// Presets
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_kill_switch_failure_on_second_rule_leaves_nothing() {
    let (engine, kernel) = memory_engine();
    kernel.fail_after(1);

    let err = engine.apply_preset_kill_switch(51820, 443, "wg0").unwrap_err();
    assert_eq!(err.code(), ErrorCode::PresetFailed);
    assert!(matches!(err, Error::Preset { ref preset, .. } if preset == "kill-switch"));

    assert!(engine.list_groups().unwrap().is_empty());
    assert!(engine.list_rules(None).unwrap().is_empty());
    assert!(kernel.snapshot().unwrap().is_empty());
    assert!(matches!(
        engine.remove_preset("kill-switch"),
        Err(Error::PresetNotFound(_))
    ));
}

#[test]
fn test_preset_apply_and_remove() {
    let (engine, kernel) = memory_engine();
    let group = engine.apply_preset_kill_switch(51820, 0, "wg0").unwrap();
    assert!(group.enabled);
    assert_eq!(group.group_type, "kill_switch");
    assert_eq!(group.metadata["preset"], "kill_switch");
    assert_eq!(engine.list_rules(Some("kill-switch")).unwrap().len(), 10);
    assert_eq!(kernel.snapshot().unwrap().filters.len(), 10);
    assert!(engine.verify_rules().unwrap().in_sync);

    assert!(matches!(
        engine.apply_preset_kill_switch(51820, 0, "wg0"),
        Err(Error::Preset { .. })
    ));

    engine.remove_preset("kill-switch").unwrap();
    assert!(kernel.snapshot().unwrap().is_empty());
    assert!(engine.list_groups().unwrap().is_empty());
}

#[test]
fn test_dns_preset_group_type() {
    let (engine, _) = memory_engine();
    let group = engine
        .apply_preset_dns_protection(&["10.8.0.1".parse().unwrap()], "wg0")
        .unwrap();
    assert_eq!(group.group_type, "dns_protection");
    assert_eq!(engine.get_group("dns-protection").unwrap().group_type, "dns_protection");
}

#[test]
fn test_multihop_preset_routes() {
    let (engine, kernel) = memory_engine();
    engine
        .apply_preset_multihop("hop", "wg0", "wg1", 0x64, 200, "10.8.0.0/24".parse().unwrap())
        .unwrap();
    let snapshot = kernel.snapshot().unwrap();
    assert_eq!(snapshot.routes.len(), 1);
    assert_eq!(snapshot.policies.len(), 2);
    assert_eq!(snapshot.filters.len(), 2);
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_invalid_preset_parameters_are_preset_errors() {
    let (engine, _) = memory_engine();
    let err = engine
        .apply_preset_vpn("vpn", "bad iface!", 51820, "10.0.0.0/24".parse().unwrap(), "eth0")
        .unwrap_err();
    match err {
        Error::Preset { source, .. } => assert_eq!(source.code(), ErrorCode::InvalidParam),
        other => panic!("unexpected error: {other}"),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Verification
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_drift_detection() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "web", 50, &[80, 443]);
    engine.enable_group("web").unwrap();

    let stray = FilterEntry::unmanaged(tcp_accept(8080));
    kernel.insert_external_filter(stray.clone());
    let report = engine.verify_rules().unwrap();
    assert!(!report.in_sync);
    assert_eq!(report.unexpected, vec![DriftItem::Filter(stray.clone())]);
    assert!(report.missing.is_empty());

    kernel.remove_external_filter(&stray);
    let managed = kernel.chain_entries(Chain::Input)[0].clone();
    kernel.remove_external_filter(&managed);
    let report = engine.verify_rules().unwrap();
    assert_eq!(report.missing, vec![DriftItem::Filter(managed)]);
    assert!(report.unexpected.is_empty());
}

#[test]
fn test_verify_never_modifies_kernel() {
    let (engine, kernel) = memory_engine();
    populated(&engine, "web", 50, &[80]);
    engine.enable_group("web").unwrap();
    kernel.insert_external_filter(FilterEntry::unmanaged(tcp_accept(8080)));
    let before = kernel.snapshot().unwrap();
    let executed = kernel.executed();

    let (_, diff) = engine.verify_with_diff().unwrap();
    assert!(diff.contains("+ filter"));
    assert_eq!(kernel.snapshot().unwrap(), before);
    assert_eq!(kernel.executed(), executed);
}

#[test]
fn test_flush_table_shows_as_missing() {
    let (engine, _) = memory_engine();
    populated(&engine, "web", 50, &[80]);
    engine.enable_group("web").unwrap();

    engine.flush_firewall_table().unwrap();
    let report = engine.verify_rules().unwrap();
    assert_eq!(report.missing.len(), 1);
    assert!(engine.get_group("web").unwrap().enabled);
}

// ═══════════════════════════════════════════════════════════════════════════
// Utilities and the stateless entry point
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_sysctl_utilities() {
    let (engine, kernel) = memory_engine();
    engine.flush_route_cache().unwrap();
    engine.enable_ip_forward().unwrap();
    engine.enable_ip_forward().unwrap();
    assert_eq!(kernel.route_cache_flushes(), 1);
    assert!(kernel.ip_forward());
}

#[test]
fn test_legacy_rules_are_not_persisted() {
    let (engine, kernel) = memory_engine();
    let rule = LegacyRule::Filter(tcp_accept(2222));
    engine.legacy_apply_rule(&rule).unwrap();

    assert!(kernel.snapshot().unwrap().contains_key(&legacy_key()));
    assert!(engine.list_groups().unwrap().is_empty());
    let report = engine.verify_rules().unwrap();
    assert_eq!(report.unexpected.len(), 1);

    engine.legacy_remove_rule(&rule).unwrap();
    engine.legacy_remove_rule(&rule).unwrap();
    assert!(engine.verify_rules().unwrap().in_sync);
}

#[test]
fn test_legacy_rule_sorts_after_groups() {
    let (engine, kernel) = memory_engine();
    engine
        .legacy_apply_rule(&LegacyRule::Filter(tcp_accept(2222)))
        .unwrap();
    populated(&engine, "web", 50, &[80]);
    engine.enable_group("web").unwrap();

    let entries = kernel.chain_entries(Chain::Input);
    assert_eq!(entries.last().unwrap().key, Some(legacy_key()));
    assert_eq!(entries[0].rule.proto, Protocol::Tcp);
}
