// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! One full run: poll the fleet, then attempt the cleanup pass.
//!
//! The binary is cron-driven; a run executes a single cycle to completion
//! and exits. Decisions already applied are never rolled back, even when a
//! later host aborts the cycle.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::backend::InventoryApi;
use crate::backend::api::ZabbixApi;
use crate::backend::sender::TrapperSink;
use crate::cleanup::{CleanupGate, CleanupOutcome, SkipReason};
use crate::config::{FleetConfig, load_hosts};
use crate::reconciler::EnrollmentContext;
use crate::scheduler::FleetScheduler;
use crate::virsh::{VirshHypervisor, VirshSettings};

/// End-of-run summary, logged for operators.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub observed_instances: usize,
    pub hosts_polled: usize,
    pub hosts_unreachable: usize,
    pub cleanup_disabled: usize,
    pub cleanup_deleted: usize,
    pub cleanup_skipped: bool,
}

/// Execute one polling cycle and one cleanup attempt.
pub async fn run(config: &FleetConfig) -> Result<RunSummary> {
    let hosts = load_hosts(&config.hosts_file)?;
    if hosts.is_empty() {
        warn!(file = %config.hosts_file.display(), "Hosts file is empty, nothing to poll");
    }

    let api = Arc::new(
        ZabbixApi::login(
            &config.backend.server,
            &config.backend.api_user,
            &config.backend.api_password,
            config.backend_timeout(),
        )
        .await
        .context("logging in to the monitoring backend")?,
    );

    let base_group = api
        .get_or_create_group(&config.fleet_group)
        .await
        .context("resolving the fleet group")?;
    let Some(template) = api.template_id(&config.template).await? else {
        bail!("template {:?} does not exist in the backend", config.template);
    };

    let ctx = EnrollmentContext {
        base_group: base_group.clone(),
        template,
        psk_identity: config.backend.psk_identity.clone(),
        psk_key: config.backend.psk_key.clone(),
    };

    let hypervisor = Arc::new(VirshHypervisor::new(VirshSettings::new(
        config.ssh_user.clone(),
        config.ssh_key_file.clone(),
    )));
    let sink = Arc::new(TrapperSink::new(
        &config.backend.server,
        config.backend.trapper_port,
        config.backend_timeout(),
    ));

    let scheduler = FleetScheduler::new(
        hypervisor,
        api.clone(),
        sink,
        ctx,
        config.concurrency,
    );
    let observation = scheduler
        .run_cycle(&hosts)
        .await
        .context("fleet cycle aborted")?;

    let observed: HashSet<String> = observation.observed.iter().cloned().collect();
    let gate = CleanupGate::new(
        config.cleanup.lock_file.clone(),
        config.window(),
        config.retention_policy(),
    );
    let outcome = gate
        .run(api.as_ref(), &base_group, &observed, Utc::now())
        .await
        .context("cleanup pass failed")?;

    if let Err(e) = api.logout().await {
        warn!(error = %e, "Backend logout failed");
    }

    let mut summary = RunSummary {
        observed_instances: observation.observed.len(),
        hosts_polled: observation.hosts_polled,
        hosts_unreachable: observation.hosts_unreachable,
        ..Default::default()
    };
    match outcome {
        CleanupOutcome::Completed { disabled, deleted } => {
            summary.cleanup_disabled = disabled;
            summary.cleanup_deleted = deleted;
        }
        CleanupOutcome::Skipped(reason) => {
            summary.cleanup_skipped = true;
            if reason == SkipReason::LockHeld {
                info!("Cleanup skipped: another invocation holds the lock");
            }
        }
    }

    info!(
        observed = summary.observed_instances,
        polled = summary.hosts_polled,
        unreachable = summary.hosts_unreachable,
        disabled = summary.cleanup_disabled,
        deleted = summary.cleanup_deleted,
        cleanup_skipped = summary.cleanup_skipped,
        "Run complete"
    );
    Ok(summary)
}
