// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Per-instance metric sampling.
//!
//! Produces one point-in-time [`MetricSnapshot`] per instance per cycle. CPU
//! utilization needs two counter samples separated by a fixed delay, so a
//! snapshot has a latency floor of [`CPU_SAMPLE_DELAY`]; the two samples are
//! strictly ordered and nothing else is interleaved between them.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::HypervisorError;
use crate::hypervisor::{
    CpuCounters, HypervisorConnection, IoCounters, MemoryStatsKib, zeroed_disk_counters,
    zeroed_nic_counters,
};

/// Delay between the two CPU counter samples.
pub const CPU_SAMPLE_DELAY: Duration = Duration::from_secs(1);

/// Counter nanoseconds per "percent-second": 1e9 ns/s divided by 100.
const NS_PER_PERCENT_SEC: f64 = 1e7;

/// CPU utilization percentages derived from two counter samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuPercentages {
    pub cpu_time: f64,
    pub system_time: f64,
    pub user_time: f64,
}

/// Memory figures in bytes, converted from the hypervisor's KiB reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBytes {
    pub free: u64,
    pub available: u64,
    pub current_allocation: u64,
}

/// Point-in-time measurement bundle for one instance. Ephemeral: produced
/// once per cycle and consumed by the batch builder, never persisted here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSnapshot {
    pub uuid: String,
    pub name: String,
    pub virt_host: String,
    pub user_uuid: String,
    pub project_uuid: String,
    pub cpu: CpuPercentages,
    pub memory: MemoryBytes,
    pub vnics: Vec<String>,
    pub vdisks: Vec<String>,
    pub disk_io: BTreeMap<String, IoCounters>,
    pub nic_io: BTreeMap<String, IoCounters>,
}

/// Normalized utilization over one sampling interval.
///
/// `delta / (ncpu * delay * 1e7)` with nanosecond counters: averaged across
/// the instance's cores so the nominal range stays within 100 per core.
/// Callers must reproduce this exact divisor to match reference values.
pub fn cpu_percent(t1_ns: u64, t2_ns: u64, ncpu: u32, delay: Duration) -> f64 {
    let divisor = f64::from(ncpu.max(1)) * delay.as_secs_f64() * NS_PER_PERCENT_SEC;
    if divisor == 0.0 {
        return 0.0;
    }
    t2_ns.saturating_sub(t1_ns) as f64 / divisor
}

fn cpu_percentages(t1: CpuCounters, t2: CpuCounters, ncpu: u32, delay: Duration) -> CpuPercentages {
    CpuPercentages {
        cpu_time: cpu_percent(t1.cpu_time_ns, t2.cpu_time_ns, ncpu, delay),
        system_time: cpu_percent(t1.system_time_ns, t2.system_time_ns, ncpu, delay),
        user_time: cpu_percent(t1.user_time_ns, t2.user_time_ns, ncpu, delay),
    }
}

fn memory_bytes(stats: MemoryStatsKib) -> MemoryBytes {
    MemoryBytes {
        free: stats.unused * 1024,
        available: stats.usable * 1024,
        current_allocation: stats.actual * 1024,
    }
}

/// Samples instances over one open hypervisor connection.
pub struct InstanceSampler<'a, C> {
    conn: &'a C,
    cpu_sample_delay: Duration,
}

impl<'a, C: HypervisorConnection> InstanceSampler<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self {
            conn,
            cpu_sample_delay: CPU_SAMPLE_DELAY,
        }
    }

    /// Override the CPU sampling delay. Tests use a zero delay; production
    /// keeps the default.
    pub fn with_cpu_sample_delay(mut self, delay: Duration) -> Self {
        self.cpu_sample_delay = delay;
        self
    }

    /// UUIDs of the instances currently active on the connected host.
    pub async fn enumerate_active(&self) -> Result<Vec<String>, HypervisorError> {
        self.conn.list_active_instances().await
    }

    /// Full metrics snapshot for one instance.
    ///
    /// An instance that stopped since enumeration yields zeroed CPU, memory
    /// and I/O figures rather than an error; one that vanished entirely
    /// yields [`HypervisorError::InstanceNotFound`].
    pub async fn snapshot(&self, uuid: &str) -> Result<MetricSnapshot, HypervisorError> {
        let descriptor = self.conn.descriptor(uuid).await?;
        let virt_host = self.conn.hostname().await?;

        let cpu = self.sample_cpu(uuid).await?;
        let memory = self.sample_memory(uuid).await?;

        let mut disk_io = BTreeMap::new();
        for disk in &descriptor.vdisks {
            let counters = match self.conn.block_stats(uuid, disk).await {
                Ok(counters) => counters,
                Err(e) if e.is_inactive() => zeroed_disk_counters(),
                Err(e) => return Err(e),
            };
            disk_io.insert(disk.clone(), counters);
        }

        let mut nic_io = BTreeMap::new();
        for nic in &descriptor.vnics {
            let counters = match self.conn.interface_stats(uuid, nic).await {
                Ok(counters) => counters,
                Err(e) if e.is_inactive() => zeroed_nic_counters(),
                Err(e) => return Err(e),
            };
            nic_io.insert(nic.clone(), counters);
        }

        Ok(MetricSnapshot {
            uuid: uuid.to_string(),
            name: descriptor.name.clone(),
            virt_host,
            user_uuid: descriptor.user_id().to_string(),
            project_uuid: descriptor.project_id().to_string(),
            cpu,
            memory,
            vnics: descriptor.vnics,
            vdisks: descriptor.vdisks,
            disk_io,
            nic_io,
        })
    }

    async fn sample_cpu(&self, uuid: &str) -> Result<CpuPercentages, HypervisorError> {
        let t1 = match self.conn.cpu_counters(uuid).await {
            Ok(counters) => counters,
            Err(e) if e.is_inactive() => return Ok(CpuPercentages::default()),
            Err(e) => return Err(e),
        };

        sleep(self.cpu_sample_delay).await;

        let t2 = match self.conn.cpu_counters(uuid).await {
            Ok(counters) => counters,
            Err(e) if e.is_inactive() => return Ok(CpuPercentages::default()),
            Err(e) => return Err(e),
        };

        let ncpu = self.conn.vcpu_count(uuid).await?;
        Ok(cpu_percentages(t1, t2, ncpu, self.cpu_sample_delay))
    }

    async fn sample_memory(&self, uuid: &str) -> Result<MemoryBytes, HypervisorError> {
        match self.conn.memory_stats(uuid).await {
            Ok(stats) => Ok(memory_bytes(stats)),
            Err(e) if e.is_inactive() => Ok(MemoryBytes::default()),
            Err(e) => Err(e),
        }
    }
}
