// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Hypervisor adapter over the libvirt CLI.
//!
//! Every introspection call shells out to `virsh` read-only against a
//! `qemu+ssh` URI and parses the tabular output. Keeping libvirt behind its
//! own CLI avoids linking the hypervisor stack into this process; the CLI's
//! stderr is captured per call and surfaced only through the error taxonomy,
//! never printed.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::descriptor::parse_domain_xml;
use crate::error::HypervisorError;
use crate::hypervisor::{
    CpuCounters, DomainDescriptor, HostAddress, Hypervisor, HypervisorConnection, IoCounters,
    MemoryStatsKib,
};

/// Disk counter names as the CLI prints them, mapped to the canonical names.
const BLOCK_STAT_RENAMES: [(&str, &str); 9] = [
    ("rd_req", "rd_operations"),
    ("rd_bytes", "rd_bytes"),
    ("rd_total_times", "rd_total_times"),
    ("wr_req", "wr_operations"),
    ("wr_bytes", "wr_bytes"),
    ("wr_total_times", "wr_total_times"),
    ("flush_reqs", "flush_operations"),
    ("flush_operations", "flush_operations"),
    ("flush_total_times", "flush_total_times"),
];

const INTERFACE_STAT_RENAMES: [(&str, &str); 2] = [("rx_bytes", "read"), ("tx_bytes", "write")];

#[derive(Debug, Clone)]
pub struct VirshSettings {
    pub ssh_user: String,
    pub ssh_key_file: Option<PathBuf>,
    /// The CLI binary; an absolute path in production deployments.
    pub binary: PathBuf,
}

impl VirshSettings {
    pub fn new(ssh_user: String, ssh_key_file: Option<PathBuf>) -> Self {
        Self {
            ssh_user,
            ssh_key_file,
            binary: PathBuf::from("virsh"),
        }
    }
}

pub struct VirshHypervisor {
    settings: VirshSettings,
}

impl VirshHypervisor {
    pub fn new(settings: VirshSettings) -> Self {
        Self { settings }
    }

    fn connection_uri(&self, host: &HostAddress) -> String {
        let base = format!("qemu+ssh://{}@{}/system", self.settings.ssh_user, host);
        match &self.settings.ssh_key_file {
            Some(key) => format!("{base}?keyfile={}", key.display()),
            None => base,
        }
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    type Conn = VirshConnection;

    async fn open(&self, host: &HostAddress) -> Result<Self::Conn, HypervisorError> {
        let uri = self.connection_uri(host);
        let conn = VirshConnection {
            binary: self.settings.binary.clone(),
            uri: uri.clone(),
            hostname: String::new(),
        };

        // Probe the transport once so an unreachable host fails here, at the
        // host-fatal boundary, instead of midway through sampling.
        let hostname = conn
            .exec(None, &["hostname"])
            .await
            .map_err(|e| HypervisorError::Connection {
                uri,
                reason: e.to_string(),
            })?;

        Ok(VirshConnection {
            hostname: hostname.trim().to_string(),
            ..conn
        })
    }
}

pub struct VirshConnection {
    binary: PathBuf,
    uri: String,
    hostname: String,
}

impl VirshConnection {
    async fn exec(&self, uuid: Option<&str>, args: &[&str]) -> Result<String, HypervisorError> {
        let output = Command::new(&self.binary)
            .arg("--quiet")
            .arg("--readonly")
            .arg("--connect")
            .arg(&self.uri)
            .args(args)
            .output()
            .await
            .map_err(|e| HypervisorError::Call {
                call: args.join(" "),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(classify_failure(
            &self.uri,
            uuid,
            &args.join(" "),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn domain_active(&self, uuid: &str) -> bool {
        match self.exec(Some(uuid), &["domstate", uuid]).await {
            Ok(state) => matches!(state.trim(), "running" | "paused"),
            Err(_) => false,
        }
    }

    /// Statistics call with the stopped-domain distinction: a failure on a
    /// domain that turns out to be inactive is [`HypervisorError::Inactive`],
    /// which the sampler maps to zeroed figures.
    async fn stats_call(&self, uuid: &str, args: &[&str]) -> Result<String, HypervisorError> {
        match self.exec(Some(uuid), args).await {
            Ok(out) => Ok(out),
            Err(e) if e.is_instance_not_found() || e.is_inactive() => Err(e),
            Err(e) => {
                if self.domain_active(uuid).await {
                    Err(e)
                } else {
                    Err(HypervisorError::Inactive { uuid: uuid.into() })
                }
            }
        }
    }
}

#[async_trait]
impl HypervisorConnection for VirshConnection {
    async fn list_active_instances(&self) -> Result<Vec<String>, HypervisorError> {
        let out = self.exec(None, &["list", "--uuid"]).await?;
        Ok(parse_uuid_list(&out))
    }

    async fn cpu_counters(&self, uuid: &str) -> Result<CpuCounters, HypervisorError> {
        let out = self
            .stats_call(uuid, &["cpu-stats", "--total", uuid])
            .await?;
        parse_cpu_stats(&out)
    }

    async fn vcpu_count(&self, uuid: &str) -> Result<u32, HypervisorError> {
        let out = self.stats_call(uuid, &["dominfo", uuid]).await?;
        parse_vcpu_count(&out)
    }

    async fn memory_stats(&self, uuid: &str) -> Result<MemoryStatsKib, HypervisorError> {
        let out = self.stats_call(uuid, &["dommemstat", uuid]).await?;
        Ok(parse_dommemstat(&out))
    }

    async fn block_stats(&self, uuid: &str, disk: &str) -> Result<IoCounters, HypervisorError> {
        let out = self.stats_call(uuid, &["domblkstat", uuid, disk]).await?;
        Ok(parse_device_stats(&out, &BLOCK_STAT_RENAMES))
    }

    async fn interface_stats(&self, uuid: &str, nic: &str) -> Result<IoCounters, HypervisorError> {
        let out = self.stats_call(uuid, &["domifstat", uuid, nic]).await?;
        Ok(parse_device_stats(&out, &INTERFACE_STAT_RENAMES))
    }

    async fn descriptor(&self, uuid: &str) -> Result<DomainDescriptor, HypervisorError> {
        let xml = self.exec(Some(uuid), &["dumpxml", uuid]).await?;
        parse_domain_xml(&xml)
    }

    async fn hostname(&self) -> Result<String, HypervisorError> {
        Ok(self.hostname.clone())
    }
}

fn classify_failure(uri: &str, uuid: Option<&str>, call: &str, stderr: &str) -> HypervisorError {
    let reason = stderr.trim().to_string();
    let lower = reason.to_lowercase();

    if lower.contains("domain not found") || lower.contains("failed to get domain") {
        return HypervisorError::InstanceNotFound {
            uuid: uuid.unwrap_or("<unknown>").to_string(),
        };
    }
    if lower.contains("domain is not running") {
        return HypervisorError::Inactive {
            uuid: uuid.unwrap_or("<unknown>").to_string(),
        };
    }
    if lower.contains("failed to connect")
        || lower.contains("cannot recv data")
        || lower.contains("end of file while reading data")
        || lower.contains("no connection driver available")
    {
        return HypervisorError::Connection {
            uri: uri.to_string(),
            reason,
        };
    }
    HypervisorError::Call {
        call: call.to_string(),
        reason,
    }
}

fn parse_uuid_list(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `cpu-stats --total` output. The CLI prints seconds; counters are
/// kept in nanoseconds.
fn parse_cpu_stats(out: &str) -> Result<CpuCounters, HypervisorError> {
    let mut counters = CpuCounters::default();
    let mut seen = 0u32;

    for line in out.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(seconds) = value.parse::<f64>() else {
            continue;
        };
        let ns = (seconds * 1e9).round() as u64;
        match name {
            "cpu_time" => {
                counters.cpu_time_ns = ns;
                seen += 1;
            }
            "system_time" => {
                counters.system_time_ns = ns;
                seen += 1;
            }
            "user_time" => {
                counters.user_time_ns = ns;
                seen += 1;
            }
            _ => {}
        }
    }

    if seen == 0 {
        return Err(HypervisorError::Call {
            call: "cpu-stats".into(),
            reason: "no cpu counters in output".into(),
        });
    }
    Ok(counters)
}

/// Parse `dommemstat` output (KiB values). Absent fields stay zero.
fn parse_dommemstat(out: &str) -> MemoryStatsKib {
    let mut stats = MemoryStatsKib::default();
    for line in out.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kib) = value.parse::<u64>() else {
            continue;
        };
        match name {
            "unused" => stats.unused = kib,
            "usable" => stats.usable = kib,
            "actual" => stats.actual = kib,
            _ => {}
        }
    }
    stats
}

/// Parse `domblkstat`/`domifstat` lines of the shape
/// `<device> <counter> <value>`, keeping and renaming the recognized
/// counters only.
fn parse_device_stats(out: &str, renames: &[(&str, &str)]) -> IoCounters {
    let mut counters: IoCounters = BTreeMap::new();
    for line in out.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (name, value) = match fields.as_slice() {
            [_, name, value] => (*name, *value),
            [name, value] => (*name, *value),
            _ => continue,
        };
        let Ok(parsed) = value.parse::<u64>() else {
            continue;
        };
        if let Some((_, canonical)) = renames.iter().find(|(raw, _)| *raw == name) {
            counters.insert((*canonical).to_string(), parsed);
        }
    }
    counters
}

fn parse_vcpu_count(out: &str) -> Result<u32, HypervisorError> {
    for line in out.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "CPU(s)" {
            return value.trim().parse().map_err(|_| HypervisorError::Call {
                call: "dominfo".into(),
                reason: format!("bad CPU(s) value {:?}", value.trim()),
            });
        }
    }
    Err(HypervisorError::Call {
        call: "dominfo".into(),
        reason: "no CPU(s) field in output".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_uri() {
        let plain = VirshHypervisor::new(VirshSettings::new("root".into(), None));
        assert_eq!(
            plain.connection_uri(&HostAddress("kvm-01".into())),
            "qemu+ssh://root@kvm-01/system"
        );

        let keyed = VirshHypervisor::new(VirshSettings::new(
            "nova".into(),
            Some(PathBuf::from("/etc/fleet/id_ed25519")),
        ));
        assert_eq!(
            keyed.connection_uri(&HostAddress("10.0.0.4".into())),
            "qemu+ssh://nova@10.0.0.4/system?keyfile=/etc/fleet/id_ed25519"
        );
    }

    #[test]
    fn test_parse_uuid_list() {
        let out = "\n 8e1cbdd4-9f39-4a3c-b9b2-510c7e7a3bfb\n 11f1bdd4-0000-4a3c-b9b2-510c7e7a3bfb\n\n";
        assert_eq!(
            parse_uuid_list(out),
            vec![
                "8e1cbdd4-9f39-4a3c-b9b2-510c7e7a3bfb",
                "11f1bdd4-0000-4a3c-b9b2-510c7e7a3bfb"
            ]
        );
    }

    #[test]
    fn test_parse_cpu_stats() {
        let out = "Total:\n\tcpu_time       245.950000000 seconds\n\tuser_time       11.290000000 seconds\n\tsystem_time     21.130000000 seconds\n";
        let counters = parse_cpu_stats(out).unwrap();
        assert_eq!(counters.cpu_time_ns, 245_950_000_000);
        assert_eq!(counters.user_time_ns, 11_290_000_000);
        assert_eq!(counters.system_time_ns, 21_130_000_000);
    }

    #[test]
    fn test_parse_cpu_stats_empty_is_error() {
        assert!(parse_cpu_stats("Total:\n").is_err());
    }

    #[test]
    fn test_parse_dommemstat() {
        let out = "actual 1048576\nswap_in 0\nswap_out 0\nunused 100\nusable 150\nlast_update 1700000000\n";
        let stats = parse_dommemstat(out);
        assert_eq!(stats.actual, 1_048_576);
        assert_eq!(stats.unused, 100);
        assert_eq!(stats.usable, 150);
    }

    #[test]
    fn test_parse_block_stats_renames() {
        let out = "vda rd_req 10290\nvda rd_bytes 326736896\nvda wr_req 1138\nvda wr_bytes 12977152\nvda errs 0\nvda flush_operations 52\n";
        let counters = parse_device_stats(out, &BLOCK_STAT_RENAMES);
        assert_eq!(counters["rd_operations"], 10_290);
        assert_eq!(counters["rd_bytes"], 326_736_896);
        assert_eq!(counters["wr_operations"], 1_138);
        assert_eq!(counters["flush_operations"], 52);
        assert!(!counters.contains_key("errs"));
    }

    #[test]
    fn test_parse_interface_stats_renames() {
        let out = "vnet0 rx_bytes 8192\nvnet0 rx_packets 64\nvnet0 tx_bytes 4096\nvnet0 tx_errs 0\n";
        let counters = parse_device_stats(out, &INTERFACE_STAT_RENAMES);
        assert_eq!(counters["read"], 8_192);
        assert_eq!(counters["write"], 4_096);
        assert_eq!(counters.len(), 2);
    }

    #[test]
    fn test_parse_vcpu_count() {
        let out = "Id:             7\nName:           instance-0000002a\nCPU(s):         2\nState:          running\n";
        assert_eq!(parse_vcpu_count(out).unwrap(), 2);
        assert!(parse_vcpu_count("Name: x\n").is_err());
    }

    #[test]
    fn test_classify_failure() {
        let uri = "qemu+ssh://root@kvm-01/system";
        let not_found = classify_failure(
            uri,
            Some("u-1"),
            "dumpxml u-1",
            "error: failed to get domain 'u-1'",
        );
        assert!(not_found.is_instance_not_found());

        let inactive = classify_failure(
            uri,
            Some("u-1"),
            "dommemstat u-1",
            "error: Requested operation is not valid: domain is not running",
        );
        assert!(inactive.is_inactive());

        let connection = classify_failure(
            uri,
            None,
            "hostname",
            "error: failed to connect to the hypervisor",
        );
        assert!(matches!(connection, HypervisorError::Connection { .. }));

        let other = classify_failure(uri, Some("u-1"), "dominfo u-1", "error: something odd");
        assert!(matches!(other, HypervisorError::Call { .. }));
    }
}
