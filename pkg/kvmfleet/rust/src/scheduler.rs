// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Fleet-wide cycle scheduling.
//!
//! Runs one host worker task per configured host under a bounded concurrency
//! ceiling and aggregates the observed instance set. Workers share no
//! mutable state; results travel back through task join handles. Only the
//! explicitly anticipated failure kinds are absorbed: an unreachable host
//! is skipped, anything else aborts the cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::backend::{InventoryApi, MetricSink};
use crate::error::{CycleError, HostError};
use crate::hypervisor::{HostAddress, Hypervisor};
use crate::reconciler::EnrollmentContext;
use crate::sampler::CPU_SAMPLE_DELAY;
use crate::worker::process_host;

/// Aggregated result of one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleObservation {
    /// Instance UUIDs successfully processed, concatenated across hosts.
    /// Identifiers are unique per host, so no deduplication is applied.
    pub observed: Vec<String>,
    pub hosts_polled: usize,
    pub hosts_unreachable: usize,
}

pub struct FleetScheduler<H, A: ?Sized, S: ?Sized> {
    hypervisor: Arc<H>,
    api: Arc<A>,
    sink: Arc<S>,
    ctx: EnrollmentContext,
    concurrency_limit: usize,
    cpu_sample_delay: Duration,
}

impl<H, A, S> FleetScheduler<H, A, S>
where
    H: Hypervisor + 'static,
    A: InventoryApi + ?Sized + 'static,
    S: MetricSink + ?Sized + 'static,
{
    pub fn new(
        hypervisor: Arc<H>,
        api: Arc<A>,
        sink: Arc<S>,
        ctx: EnrollmentContext,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            hypervisor,
            api,
            sink,
            ctx,
            concurrency_limit,
            cpu_sample_delay: CPU_SAMPLE_DELAY,
        }
    }

    /// Override the per-instance CPU sampling delay (tests use zero).
    pub fn with_cpu_sample_delay(mut self, delay: Duration) -> Self {
        self.cpu_sample_delay = delay;
        self
    }

    /// Poll every host once and aggregate the observed instance set.
    pub async fn run_cycle(&self, hosts: &[HostAddress]) -> Result<CycleObservation, CycleError> {
        if hosts.is_empty() {
            return Ok(CycleObservation::default());
        }

        let pool_size = self.concurrency_limit.clamp(1, hosts.len());
        let permits = Arc::new(Semaphore::new(pool_size));
        info!(
            hosts = hosts.len(),
            workers = pool_size,
            "Starting fleet cycle"
        );

        let mut tasks = JoinSet::new();
        for host in hosts.iter().cloned() {
            let permits = permits.clone();
            let hypervisor = self.hypervisor.clone();
            let api = self.api.clone();
            let sink = self.sink.clone();
            let ctx = self.ctx.clone();
            let cpu_sample_delay = self.cpu_sample_delay;

            tasks.spawn(async move {
                // The semaphore is never closed while tasks run.
                let _permit = permits.acquire_owned().await.ok();
                let result = process_host(
                    hypervisor.as_ref(),
                    api.as_ref(),
                    sink.as_ref(),
                    &host,
                    &ctx,
                    cpu_sample_delay,
                )
                .await;
                (host, result)
            });
        }

        let mut observation = CycleObservation::default();
        while let Some(joined) = tasks.join_next().await {
            let (host, result) = joined.map_err(|e| CycleError::Worker(e.to_string()))?;
            match result {
                Ok(uuids) => {
                    observation.hosts_polled += 1;
                    observation.observed.extend(uuids);
                }
                Err(HostError::Connection(e)) => {
                    warn!(host = %host, error = %e, "Host unreachable, skipped for this cycle");
                    observation.hosts_unreachable += 1;
                }
                Err(HostError::Backend(e)) => {
                    error!(host = %host, error = %e, "Backend failure, aborting cycle");
                    return Err(CycleError::Backend(e));
                }
            }
        }

        info!(
            observed = observation.observed.len(),
            polled = observation.hosts_polled,
            unreachable = observation.hosts_unreachable,
            "Fleet cycle complete"
        );
        Ok(observation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TemplateId;
    use crate::testutil::{MockHypervisor, MockInventory, MockSink, ScriptedDomain};

    fn scheduler(
        hv: MockHypervisor,
        api: Arc<MockInventory>,
        sink: Arc<MockSink>,
        limit: usize,
    ) -> FleetScheduler<MockHypervisor, MockInventory, MockSink> {
        let ctx = EnrollmentContext {
            base_group: api.seed_group("openstack-instances"),
            template: TemplateId("10264".into()),
            psk_identity: "fleet-psk".into(),
            psk_key: "deadbeef".into(),
        };
        FleetScheduler::new(Arc::new(hv), api, sink, ctx, limit)
            .with_cpu_sample_delay(Duration::ZERO)
    }

    fn domain(uuid: &str) -> ScriptedDomain {
        ScriptedDomain {
            uuid: uuid.into(),
            name: format!("vm-{uuid}"),
            ..Default::default()
        }
    }

    fn addresses(names: &[&str]) -> Vec<HostAddress> {
        names.iter().map(|n| HostAddress(n.to_string())).collect()
    }

    #[tokio::test]
    async fn test_cycle_skips_unreachable_host() {
        let hv = MockHypervisor::new();
        for (i, name) in ["h1", "h2", "h3", "h4", "h5"].iter().enumerate() {
            hv.host(name).add_domain(domain(&format!("uuid-{i}")));
        }
        hv.set_unreachable("h3");
        let api = Arc::new(MockInventory::new());
        let sink = Arc::new(MockSink::new());

        let observation = scheduler(hv, api.clone(), sink, 2)
            .run_cycle(&addresses(&["h1", "h2", "h3", "h4", "h5"]))
            .await
            .unwrap();

        let mut observed = observation.observed.clone();
        observed.sort();
        assert_eq!(observed, vec!["uuid-0", "uuid-1", "uuid-3", "uuid-4"]);
        assert_eq!(observation.hosts_polled, 4);
        assert_eq!(observation.hosts_unreachable, 1);
    }

    #[tokio::test]
    async fn test_cycle_aborts_on_backend_failure() {
        let hv = MockHypervisor::new();
        hv.host("h1").add_domain(domain("uuid-1"));
        let api = Arc::new(MockInventory::new());
        api.fail_mutations(true);
        let sink = Arc::new(MockSink::new());

        let err = scheduler(hv, api, sink, 4)
            .run_cycle(&addresses(&["h1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::Backend(_)));
    }

    #[tokio::test]
    async fn test_cycle_empty_fleet() {
        let hv = MockHypervisor::new();
        let api = Arc::new(MockInventory::new());
        let sink = Arc::new(MockSink::new());

        let observation = scheduler(hv, api, sink, 8).run_cycle(&[]).await.unwrap();
        assert_eq!(observation, CycleObservation::default());
    }
}
