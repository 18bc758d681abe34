// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Per-host processing.
//!
//! One invocation handles one host for one cycle: open the connection,
//! enumerate active instances, and for each instance reconcile its inventory
//! entity and ship its metric batch. Fault isolation is layered: a vanished
//! or unsampleable instance is skipped, a backend failure aborts the host's
//! remaining work, and a connection failure abandons the host entirely.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::backend::{GroupId, InventoryApi, MetricSink};
use crate::batch::{build_batch, build_discovery};
use crate::error::{HostError, HypervisorError};
use crate::hypervisor::{HostAddress, Hypervisor};
use crate::reconciler::{self, EnrollmentContext};
use crate::sampler::InstanceSampler;

/// Process one host, returning the UUIDs of the instances that were fully
/// reconciled and shipped.
pub async fn process_host<H, A, S>(
    hypervisor: &H,
    api: &A,
    sink: &S,
    host: &HostAddress,
    ctx: &EnrollmentContext,
    cpu_sample_delay: Duration,
) -> Result<Vec<String>, HostError>
where
    H: Hypervisor,
    A: InventoryApi + ?Sized,
    S: MetricSink + ?Sized,
{
    let conn = hypervisor
        .open(host)
        .await
        .map_err(HostError::Connection)?;
    let sampler = InstanceSampler::new(&conn).with_cpu_sample_delay(cpu_sample_delay);

    let uuids = sampler
        .enumerate_active()
        .await
        .map_err(HostError::Connection)?;
    info!(host = %host, instances = uuids.len(), "Enumerated active instances");

    // Project groups are resolved at most once per host per cycle.
    let mut project_groups: HashMap<String, GroupId> = HashMap::new();
    let mut processed = Vec::new();

    for uuid in uuids {
        let snapshot = match sampler.snapshot(&uuid).await {
            Ok(snapshot) => snapshot,
            Err(HypervisorError::InstanceNotFound { .. }) => {
                warn!(host = %host, uuid = %uuid, "Instance vanished since enumeration, skipping");
                continue;
            }
            Err(e) => {
                error!(host = %host, uuid = %uuid, error = %e, "Sampling failed, skipping instance");
                continue;
            }
        };

        let project_group = match project_groups.get(&snapshot.project_uuid) {
            Some(group) => group.clone(),
            None => {
                let group = api.get_or_create_group(&snapshot.project_uuid).await?;
                project_groups.insert(snapshot.project_uuid.clone(), group.clone());
                group
            }
        };

        let decision = reconciler::reconcile(api, &uuid, &project_group, ctx).await?;
        debug!(host = %host, uuid = %uuid, decision = ?decision, "Reconciled instance");

        // Discovery ships first so the backend has provisioned the per-item
        // targets before their metrics arrive.
        let clock = Utc::now().timestamp();
        sink.send(&build_discovery(&snapshot, clock)).await?;
        let receipt = sink.send(&build_batch(&snapshot, clock)).await?;
        if receipt.failed > 0 {
            warn!(
                host = %host,
                uuid = %uuid,
                failed = receipt.failed,
                total = receipt.total,
                "Backend rejected some records"
            );
        }

        processed.push(uuid);
    }

    Ok(processed)
}
