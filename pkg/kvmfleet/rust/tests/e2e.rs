// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! End-to-end cycles over scripted collaborators: fleet poll, inventory
//! reconciliation, metric shipping and the gated cleanup pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use kvm_fleet_monitor::backend::TemplateId;
use kvm_fleet_monitor::batch::MetricKey;
use kvm_fleet_monitor::cleanup::{CleanupGate, CleanupOutcome, CleanupWindow, RetentionPolicy};
use kvm_fleet_monitor::error::CycleError;
use kvm_fleet_monitor::hypervisor::HostAddress;
use kvm_fleet_monitor::reconciler::EnrollmentContext;
use kvm_fleet_monitor::scheduler::FleetScheduler;
use kvm_fleet_monitor::testutil::{MockHypervisor, MockInventory, MockSink, ScriptedDomain};

fn enrollment(api: &MockInventory) -> EnrollmentContext {
    EnrollmentContext {
        base_group: api.seed_group("openstack-instances"),
        template: TemplateId("10264".into()),
        psk_identity: "fleet-psk".into(),
        psk_key: "deadbeefcafe".into(),
    }
}

fn scheduler(
    hv: MockHypervisor,
    api: Arc<MockInventory>,
    sink: Arc<MockSink>,
    limit: usize,
) -> FleetScheduler<MockHypervisor, MockInventory, MockSink> {
    let ctx = enrollment(&api);
    FleetScheduler::new(Arc::new(hv), api, sink, ctx, limit)
        .with_cpu_sample_delay(Duration::ZERO)
}

fn domain(uuid: &str, project: &str) -> ScriptedDomain {
    ScriptedDomain {
        uuid: uuid.into(),
        name: format!("vm-{uuid}"),
        user_uuid: format!("user-of-{project}"),
        project_uuid: project.into(),
        vnics: vec!["vnet0".into()],
        vdisks: vec!["vda".into()],
        ..Default::default()
    }
}

fn addresses(names: &[&str]) -> Vec<HostAddress> {
    names.iter().map(|n| HostAddress(n.to_string())).collect()
}

#[tokio::test]
async fn e2e_cycle_enrolls_every_observed_instance() {
    let hv = MockHypervisor::new();
    hv.host("kvm-01").add_domain(domain("uuid-a", "p-1"));
    hv.host("kvm-01").add_domain(domain("uuid-b", "p-2"));
    hv.host("kvm-02").add_domain(domain("uuid-c", "p-1"));
    let api = Arc::new(MockInventory::new());
    let sink = Arc::new(MockSink::new());

    let observation = scheduler(hv, api.clone(), sink.clone(), 4)
        .run_cycle(&addresses(&["kvm-01", "kvm-02"]))
        .await
        .unwrap();

    // Every instance observed active ends the cycle with an enabled entity.
    assert_eq!(observation.observed.len(), 3);
    for uuid in ["uuid-a", "uuid-b", "uuid-c"] {
        let entity = api.find_host_sync(uuid).expect("entity must exist");
        assert!(entity.enabled, "{uuid} must be enabled");
    }
    // Created entities carry the transport identity.
    assert_eq!(api.psk_identity_of("uuid-a").as_deref(), Some("fleet-psk"));

    // Two sends per instance: discovery happens-before metrics. Batches
    // from different hosts may interleave, so order is asserted per
    // instance rather than globally.
    let batches = sink.batches();
    assert_eq!(batches.len(), 6);
    for uuid in ["uuid-a", "uuid-b", "uuid-c"] {
        let indexed: Vec<(usize, &Vec<_>)> = batches
            .iter()
            .enumerate()
            .filter(|(_, b)| b.first().is_some_and(|r| r.host == uuid))
            .collect();
        assert_eq!(indexed.len(), 2, "{uuid} must ship exactly two batches");
        let (discovery_idx, discovery) = indexed[0];
        let (metrics_idx, metrics) = indexed[1];
        assert!(discovery_idx < metrics_idx);
        assert!(matches!(discovery[0].key, MetricKey::Discovery { .. }));
        assert!(matches!(metrics[0].key, MetricKey::Stat { .. }));
        // One shared clock per instance observation.
        let clock = discovery[0].clock;
        assert!(discovery.iter().chain(metrics).all(|r| r.clock == clock));
    }
}

#[tokio::test]
async fn e2e_second_cycle_is_idempotent() {
    let hv = MockHypervisor::new();
    hv.host("kvm-01").add_domain(domain("uuid-a", "p-1"));
    let api = Arc::new(MockInventory::new());
    let sink = Arc::new(MockSink::new());
    let scheduler = scheduler(hv, api.clone(), sink, 2);

    scheduler
        .run_cycle(&addresses(&["kvm-01"]))
        .await
        .unwrap();
    let after_first = api.mutation_count();
    assert_eq!(api.host_count(), 1);

    scheduler
        .run_cycle(&addresses(&["kvm-01"]))
        .await
        .unwrap();
    // No backend state changed between cycles: no new mutations, no
    // duplicate entity.
    assert_eq!(api.mutation_count(), after_first);
    assert_eq!(api.host_count(), 1);
}

#[tokio::test]
async fn e2e_cycle_then_cleanup_reconciles_stale_entities() {
    let dir = tempfile::tempdir().unwrap();
    let hv = MockHypervisor::new();
    hv.host("kvm-01").add_domain(domain("uuid-live", "p-1"));
    let api = Arc::new(MockInventory::new());
    let sink = Arc::new(MockSink::new());
    let scheduler = scheduler(hv, api.clone(), sink, 2);

    // Backend knows two entities the fleet no longer reports.
    let base = api.seed_group("openstack-instances");
    let now = Utc::now();
    api.seed_host(
        "uuid-stale",
        true,
        &[base.clone()],
        Some(now - ChronoDuration::hours(3)),
    );
    api.seed_host(
        "uuid-ancient",
        true,
        &[base.clone()],
        Some(now - ChronoDuration::days(120)),
    );

    let observation = scheduler
        .run_cycle(&addresses(&["kvm-01"]))
        .await
        .unwrap();
    let observed: HashSet<String> = observation.observed.into_iter().collect();

    let gate = CleanupGate::new(
        dir.path().join("cleanup.lock"),
        CleanupWindow {
            start_minute: 0,
            end_minute: 59,
        },
        RetentionPolicy::default(),
    );
    let outcome = gate
        .run(api.as_ref(), &base, &observed, now)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        CleanupOutcome::Completed {
            disabled: 1,
            deleted: 1
        }
    );
    assert!(api.find_host_sync("uuid-live").unwrap().enabled);
    assert!(!api.find_host_sync("uuid-stale").unwrap().enabled);
    assert!(api.find_host_sync("uuid-ancient").is_none());
    assert!(!dir.path().join("cleanup.lock").exists());
}

#[tokio::test]
async fn e2e_sink_failure_aborts_cycle_but_keeps_applied_decisions() {
    let hv = MockHypervisor::new();
    hv.host("kvm-01").add_domain(domain("uuid-a", "p-1"));
    let api = Arc::new(MockInventory::new());
    let sink = Arc::new(MockSink::new());
    sink.fail(true);

    let err = scheduler(hv, api.clone(), sink, 2)
        .run_cycle(&addresses(&["kvm-01"]))
        .await
        .unwrap_err();

    assert!(matches!(err, CycleError::Backend(_)));
    // The create that preceded the failed send stays applied; cycles are
    // never rolled back.
    assert!(api.find_host_sync("uuid-a").is_some());
}
