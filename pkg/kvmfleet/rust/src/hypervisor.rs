// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Hypervisor introspection boundary.
//!
//! The engine talks to virtualization hosts exclusively through these traits.
//! The production adapter lives in [`crate::virsh`]; tests script the traits
//! directly.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

use crate::error::HypervisorError;

/// Address of one virtualization node, as configured. Immutable for a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddress(pub String);

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cumulative CPU time counters for one instance, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub cpu_time_ns: u64,
    pub system_time_ns: u64,
    pub user_time_ns: u64,
}

/// Memory statistics as reported by the hypervisor, in KiB.
///
/// Field names follow the hypervisor's vocabulary; the sampler converts to
/// the reported byte figures (`unused -> free`, `usable -> available`,
/// `actual -> current_allocation`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStatsKib {
    pub unused: u64,
    pub usable: u64,
    pub actual: u64,
}

/// Named cumulative I/O counters for one disk or network interface.
pub type IoCounters = BTreeMap<String, u64>;

/// Ownership metadata embedded in an instance's descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainOwner {
    pub user_uuid: String,
    pub project_uuid: String,
}

/// Sentinel project/user identifier for instances carrying no ownership
/// metadata in their descriptor.
pub const UNOWNED_SENTINEL: &str = "non-openstack-instance";

/// Structured form of an instance's XML descriptor: display name, device
/// identifiers and ownership metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainDescriptor {
    pub name: String,
    pub vnics: Vec<String>,
    pub vdisks: Vec<String>,
    pub owner: Option<DomainOwner>,
}

impl DomainDescriptor {
    pub fn user_id(&self) -> &str {
        self.owner
            .as_ref()
            .map_or(UNOWNED_SENTINEL, |o| o.user_uuid.as_str())
    }

    pub fn project_id(&self) -> &str {
        self.owner
            .as_ref()
            .map_or(UNOWNED_SENTINEL, |o| o.project_uuid.as_str())
    }
}

/// Factory for per-host connections.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    type Conn: HypervisorConnection + Send + Sync + 'static;

    /// Open a read-only connection to one host. Failure is host-fatal and
    /// cycle-recoverable.
    async fn open(&self, host: &HostAddress) -> Result<Self::Conn, HypervisorError>;
}

/// One open read-only connection to a virtualization host.
///
/// Per-instance calls fail with [`HypervisorError::InstanceNotFound`] when
/// the identifier no longer resolves and with [`HypervisorError::Inactive`]
/// when a statistics call is invalid because the instance is not running.
#[async_trait]
pub trait HypervisorConnection: Send + Sync {
    /// UUIDs of the instances currently active on this host.
    async fn list_active_instances(&self) -> Result<Vec<String>, HypervisorError>;

    async fn cpu_counters(&self, uuid: &str) -> Result<CpuCounters, HypervisorError>;

    async fn vcpu_count(&self, uuid: &str) -> Result<u32, HypervisorError>;

    async fn memory_stats(&self, uuid: &str) -> Result<MemoryStatsKib, HypervisorError>;

    async fn block_stats(&self, uuid: &str, disk: &str) -> Result<IoCounters, HypervisorError>;

    async fn interface_stats(&self, uuid: &str, nic: &str) -> Result<IoCounters, HypervisorError>;

    async fn descriptor(&self, uuid: &str) -> Result<DomainDescriptor, HypervisorError>;

    /// Hostname of the virtualization host itself.
    async fn hostname(&self) -> Result<String, HypervisorError>;
}

/// Canonical disk counter names. A stopped instance reports all of these as
/// zero rather than erroring.
pub const DISK_STAT_NAMES: [&str; 8] = [
    "rd_bytes",
    "rd_operations",
    "rd_total_times",
    "wr_bytes",
    "wr_operations",
    "wr_total_times",
    "flush_operations",
    "flush_total_times",
];

/// Canonical network interface counter names.
pub const NIC_STAT_NAMES: [&str; 2] = ["read", "write"];

pub fn zeroed_disk_counters() -> IoCounters {
    DISK_STAT_NAMES
        .iter()
        .map(|name| (name.to_string(), 0))
        .collect()
}

pub fn zeroed_nic_counters() -> IoCounters {
    NIC_STAT_NAMES
        .iter()
        .map(|name| (name.to_string(), 0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_owner_fallback() {
        let desc = DomainDescriptor {
            name: "vm-1".into(),
            ..Default::default()
        };
        assert_eq!(desc.project_id(), UNOWNED_SENTINEL);
        assert_eq!(desc.user_id(), UNOWNED_SENTINEL);

        let owned = DomainDescriptor {
            owner: Some(DomainOwner {
                user_uuid: "u-1".into(),
                project_uuid: "p-1".into(),
            }),
            ..desc
        };
        assert_eq!(owned.project_id(), "p-1");
        assert_eq!(owned.user_id(), "u-1");
    }

    #[test]
    fn test_zeroed_counters_cover_canonical_names() {
        let disks = zeroed_disk_counters();
        assert_eq!(disks.len(), 8);
        assert_eq!(disks.get("rd_bytes"), Some(&0));
        assert_eq!(disks.get("flush_total_times"), Some(&0));

        let nics = zeroed_nic_counters();
        assert_eq!(nics.get("read"), Some(&0));
        assert_eq!(nics.get("write"), Some(&0));
    }
}
