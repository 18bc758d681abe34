// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Metric batch construction.
//!
//! Pure transformation from a [`MetricSnapshot`] into timestamped records.
//! All records built in one call share one clock value so the backend can
//! correlate them as a single observation instant. Discovery records (the
//! NIC/disk identifier lists) are built separately and shipped before the
//! per-item metrics they provision.

use std::fmt;

use serde_json::json;

use crate::sampler::MetricSnapshot;

/// The always-updated item the cleanup gate queries for last activity.
pub const ACTIVITY_PROBE_KEY: &str = "libvirt.instance[name]";

/// Closed set of metric categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricCategory {
    Cpu,
    Memory,
    Disk,
    Nic,
    Instance,
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricCategory::Cpu => "cpu",
            MetricCategory::Memory => "memory",
            MetricCategory::Disk => "disk",
            MetricCategory::Nic => "nic",
            MetricCategory::Instance => "instance",
        };
        f.write_str(name)
    }
}

/// Discovery payload kinds, consumed by the backend for auto-provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    Nic,
    Disk,
}

/// Wire key of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricKey {
    /// `libvirt.<category>[<qualifier>,<stat>]` or `libvirt.<category>[<stat>]`.
    Stat {
        category: MetricCategory,
        qualifier: Option<String>,
        stat: String,
    },
    /// `libvirt.nic.discover` / `libvirt.disk.discover`.
    Discovery { kind: DiscoveryKind },
}

impl MetricKey {
    pub fn render(&self) -> String {
        match self {
            MetricKey::Stat {
                category,
                qualifier: Some(q),
                stat,
            } => format!("libvirt.{category}[{q},{stat}]"),
            MetricKey::Stat {
                category,
                qualifier: None,
                stat,
            } => format!("libvirt.{category}[{stat}]"),
            MetricKey::Discovery {
                kind: DiscoveryKind::Nic,
            } => "libvirt.nic.discover".to_string(),
            MetricKey::Discovery {
                kind: DiscoveryKind::Disk,
            } => "libvirt.disk.discover".to_string(),
        }
    }
}

/// One timestamped key/value observation for one inventory entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRecord {
    /// Entity the record belongs to (the instance UUID).
    pub host: String,
    pub key: MetricKey,
    pub value: String,
    pub clock: i64,
}

impl MetricRecord {
    fn stat(
        host: &str,
        category: MetricCategory,
        qualifier: Option<&str>,
        stat: &str,
        value: impl fmt::Display,
        clock: i64,
    ) -> Self {
        Self {
            host: host.to_string(),
            key: MetricKey::Stat {
                category,
                qualifier: qualifier.map(str::to_string),
                stat: stat.to_string(),
            },
            value: value.to_string(),
            clock,
        }
    }
}

/// Serialize an identifier list as a discovery payload, e.g.
/// `{"data":[{"{#VNIC}":"vnet0"}]}`.
fn discovery_payload(macro_name: &str, names: &[String]) -> String {
    let items: Vec<serde_json::Value> =
        names.iter().map(|n| json!({ macro_name: n })).collect();
    json!({ "data": items }).to_string()
}

/// Build the discovery records for one instance: one NIC list and one disk
/// list, emitted every cycle regardless of whether the instance already
/// exists in inventory.
pub fn build_discovery(snapshot: &MetricSnapshot, clock: i64) -> Vec<MetricRecord> {
    vec![
        MetricRecord {
            host: snapshot.uuid.clone(),
            key: MetricKey::Discovery {
                kind: DiscoveryKind::Nic,
            },
            value: discovery_payload("{#VNIC}", &snapshot.vnics),
            clock,
        },
        MetricRecord {
            host: snapshot.uuid.clone(),
            key: MetricKey::Discovery {
                kind: DiscoveryKind::Disk,
            },
            value: discovery_payload("{#VDISK}", &snapshot.vdisks),
            clock,
        },
    ]
}

/// Build the full metric batch for one instance.
pub fn build_batch(snapshot: &MetricSnapshot, clock: i64) -> Vec<MetricRecord> {
    let host = snapshot.uuid.as_str();
    let mut records = Vec::new();

    for (disk, counters) in &snapshot.disk_io {
        for (stat, value) in counters {
            records.push(MetricRecord::stat(
                host,
                MetricCategory::Disk,
                Some(disk.as_str()),
                stat,
                value,
                clock,
            ));
        }
    }

    for (nic, counters) in &snapshot.nic_io {
        for (stat, value) in counters {
            records.push(MetricRecord::stat(
                host,
                MetricCategory::Nic,
                Some(nic.as_str()),
                stat,
                value,
                clock,
            ));
        }
    }

    let memory = &snapshot.memory;
    records.push(MetricRecord::stat(
        host,
        MetricCategory::Memory,
        None,
        "free",
        memory.free,
        clock,
    ));
    records.push(MetricRecord::stat(
        host,
        MetricCategory::Memory,
        None,
        "available",
        memory.available,
        clock,
    ));
    records.push(MetricRecord::stat(
        host,
        MetricCategory::Memory,
        None,
        "current_allocation",
        memory.current_allocation,
        clock,
    ));

    let cpu = &snapshot.cpu;
    records.push(MetricRecord::stat(
        host,
        MetricCategory::Cpu,
        None,
        "cpu_time",
        cpu.cpu_time,
        clock,
    ));
    records.push(MetricRecord::stat(
        host,
        MetricCategory::Cpu,
        None,
        "system_time",
        cpu.system_time,
        clock,
    ));
    records.push(MetricRecord::stat(
        host,
        MetricCategory::Cpu,
        None,
        "user_time",
        cpu.user_time,
        clock,
    ));

    records.push(MetricRecord::stat(
        host,
        MetricCategory::Instance,
        None,
        "name",
        &snapshot.name,
        clock,
    ));
    records.push(MetricRecord::stat(
        host,
        MetricCategory::Instance,
        None,
        "virt_host",
        &snapshot.virt_host,
        clock,
    ));
    records.push(MetricRecord::stat(
        host,
        MetricCategory::Instance,
        None,
        "user_uuid",
        &snapshot.user_uuid,
        clock,
    ));
    records.push(MetricRecord::stat(
        host,
        MetricCategory::Instance,
        None,
        "project_uuid",
        &snapshot.project_uuid,
        clock,
    ));

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{CpuPercentages, MemoryBytes};
    use std::collections::BTreeMap;

    fn snapshot() -> MetricSnapshot {
        let mut disk_io = BTreeMap::new();
        disk_io.insert(
            "vda".to_string(),
            BTreeMap::from([("rd_bytes".to_string(), 42u64), ("wr_bytes".to_string(), 7)]),
        );
        let mut nic_io = BTreeMap::new();
        nic_io.insert(
            "vnet0".to_string(),
            BTreeMap::from([("read".to_string(), 1u64), ("write".to_string(), 2)]),
        );
        MetricSnapshot {
            uuid: "uuid-1".into(),
            name: "web-1".into(),
            virt_host: "node-1".into(),
            user_uuid: "u-1".into(),
            project_uuid: "p-1".into(),
            cpu: CpuPercentages {
                cpu_time: 4e-5,
                system_time: 0.0,
                user_time: 0.0,
            },
            memory: MemoryBytes {
                free: 102_400,
                available: 204_800,
                current_allocation: 307_200,
            },
            vnics: vec!["vnet0".into()],
            vdisks: vec!["vda".into()],
            disk_io,
            nic_io,
        }
    }

    #[test]
    fn test_key_rendering() {
        let qualified = MetricKey::Stat {
            category: MetricCategory::Disk,
            qualifier: Some("vda".into()),
            stat: "rd_bytes".into(),
        };
        assert_eq!(qualified.render(), "libvirt.disk[vda,rd_bytes]");

        let plain = MetricKey::Stat {
            category: MetricCategory::Memory,
            qualifier: None,
            stat: "free".into(),
        };
        assert_eq!(plain.render(), "libvirt.memory[free]");

        let discover = MetricKey::Discovery {
            kind: DiscoveryKind::Nic,
        };
        assert_eq!(discover.render(), "libvirt.nic.discover");
    }

    #[test]
    fn test_activity_probe_key_matches_instance_name_record() {
        let key = MetricKey::Stat {
            category: MetricCategory::Instance,
            qualifier: None,
            stat: "name".into(),
        };
        assert_eq!(key.render(), ACTIVITY_PROBE_KEY);
    }

    #[test]
    fn test_batch_shares_one_clock() {
        let records = build_batch(&snapshot(), 1_700_000_000);
        assert!(!records.is_empty());
        assert!(records.iter().all(|r| r.clock == 1_700_000_000));
        assert!(records.iter().all(|r| r.host == "uuid-1"));
    }

    #[test]
    fn test_batch_contents() {
        let records = build_batch(&snapshot(), 1);
        let find = |key: &str| {
            records
                .iter()
                .find(|r| r.key.render() == key)
                .unwrap_or_else(|| panic!("missing record {key}"))
        };

        assert_eq!(find("libvirt.disk[vda,rd_bytes]").value, "42");
        assert_eq!(find("libvirt.nic[vnet0,write]").value, "2");
        assert_eq!(find("libvirt.memory[free]").value, "102400");
        assert_eq!(find("libvirt.cpu[cpu_time]").value, "0.00004");
        assert_eq!(find("libvirt.instance[name]").value, "web-1");
        assert_eq!(find("libvirt.instance[project_uuid]").value, "p-1");
    }

    #[test]
    fn test_discovery_payloads() {
        let records = build_discovery(&snapshot(), 5);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key.render(), "libvirt.nic.discover");
        assert_eq!(records[0].value, r#"{"data":[{"{#VNIC}":"vnet0"}]}"#);
        assert_eq!(records[1].key.render(), "libvirt.disk.discover");
        assert_eq!(records[1].value, r#"{"data":[{"{#VDISK}":"vda"}]}"#);
        assert!(records.iter().all(|r| r.clock == 5));
    }

    #[test]
    fn test_discovery_empty_lists() {
        let snap = MetricSnapshot {
            uuid: "uuid-2".into(),
            ..Default::default()
        };
        let records = build_discovery(&snap, 0);
        assert_eq!(records[0].value, r#"{"data":[]}"#);
        assert_eq!(records[1].value, r#"{"data":[]}"#);
    }
}
