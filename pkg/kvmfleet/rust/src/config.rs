// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Runtime configuration.
//!
//! One explicit struct, loaded once at startup and passed by reference into
//! each component; there is no ambient global. The host list lives in its
//! own plain-text file so operators can edit it without touching the YAML.

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cleanup::{CleanupWindow, RetentionPolicy};
use crate::hypervisor::HostAddress;

const DEFAULT_CONFIG_FILE: &str = "/etc/kvm-fleet-monitor/config.yaml";

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_fleet_group() -> String {
    "openstack-instances".to_string()
}

fn default_template() -> String {
    "libvirt-instance".to_string()
}

fn default_concurrency() -> usize {
    16
}

fn default_trapper_port() -> u16 {
    10051
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// Plain-text list of host addresses, one per line.
    pub hosts_file: PathBuf,
    /// SSH private key used for the hypervisor transport.
    pub ssh_key_file: Option<PathBuf>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    pub backend: BackendConfig,
    /// Group every fleet-managed entity is enrolled in; also the cleanup
    /// gate's scan scope.
    #[serde(default = "default_fleet_group")]
    pub fleet_group: String,
    /// Provisioning template linked to created entities.
    #[serde(default = "default_template")]
    pub template: String,
    /// Ceiling on concurrently polled hosts.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Log destination; stderr when unset.
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Backend server, host or host:port (API endpoint and trapper share it).
    pub server: String,
    pub api_user: String,
    pub api_password: String,
    #[serde(default = "default_trapper_port")]
    pub trapper_port: u16,
    /// Transport identity for the pre-shared-key ingestion channel; also
    /// stamped onto entities at creation.
    pub psk_identity: String,
    /// Hex-encoded pre-shared key.
    pub psk_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/lock/kvm-fleet-monitor.lock")
}

fn default_window_start() -> u32 {
    0
}

fn default_window_end() -> u32 {
    14
}

fn default_short_absence_secs() -> u64 {
    3600
}

fn default_long_retention_days() -> u64 {
    90
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    /// Minute-of-hour range (inclusive) in which the cleanup pass may run.
    #[serde(default = "default_window_start")]
    pub window_start_minute: u32,
    #[serde(default = "default_window_end")]
    pub window_end_minute: u32,
    #[serde(default = "default_short_absence_secs")]
    pub short_absence_secs: u64,
    #[serde(default = "default_long_retention_days")]
    pub long_retention_days: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            lock_file: default_lock_file(),
            window_start_minute: default_window_start(),
            window_end_minute: default_window_end(),
            short_absence_secs: default_short_absence_secs(),
            long_retention_days: default_long_retention_days(),
        }
    }
}

impl FleetConfig {
    pub fn window(&self) -> CleanupWindow {
        CleanupWindow {
            start_minute: self.cleanup.window_start_minute,
            end_minute: self.cleanup.window_end_minute,
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            short_absence: ChronoDuration::seconds(self.cleanup.short_absence_secs as i64),
            long_retention: ChronoDuration::days(self.cleanup.long_retention_days as i64),
        }
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.timeout_secs)
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

pub fn load_config(path: &Path) -> Result<FleetConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: FleetConfig =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

/// Read the fleet host list: whitespace-separated addresses, tokens
/// containing `#` are comments.
pub fn load_hosts(path: &Path) -> Result<Vec<HostAddress>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading hosts file {}", path.display()))?;
    Ok(contents
        .split_whitespace()
        .filter(|token| !token.contains('#'))
        .map(|token| HostAddress(token.to_string()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
hosts_file: /etc/kvm-fleet-monitor/hosts.txt
ssh_key_file: /etc/kvm-fleet-monitor/id_ed25519
ssh_user: nova
backend:
  server: zabbix.example.com
  api_user: fleet
  api_password: hunter2
  trapper_port: 10051
  psk_identity: fleet-psk
  psk_key: deadbeefcafe
  timeout_secs: 10
fleet_group: openstack-instances
template: libvirt-instance
concurrency: 32
cleanup:
  lock_file: /tmp/fleet.lock
  window_start_minute: 45
  window_end_minute: 59
  short_absence_secs: 7200
  long_retention_days: 30
log_file: /var/log/kvm-fleet-monitor.log
"#;
        let path = dir.path().join("config.yaml");
        fs::write(&path, yaml).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.ssh_user, "nova");
        assert_eq!(config.backend.server, "zabbix.example.com");
        assert_eq!(config.concurrency, 32);
        assert_eq!(config.cleanup.window_start_minute, 45);
        assert_eq!(config.retention_policy().long_retention, ChronoDuration::days(30));
        assert_eq!(config.window().end_minute, 59);
        assert_eq!(config.backend_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_minimal_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
hosts_file: /etc/hosts.txt
backend:
  server: zbx.local
  api_user: u
  api_password: p
  psk_identity: id
  psk_key: ff
"#;
        let path = dir.path().join("config.yaml");
        fs::write(&path, yaml).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.ssh_user, "root");
        assert_eq!(config.fleet_group, "openstack-instances");
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.backend.trapper_port, 10051);
        assert_eq!(config.cleanup.window_end_minute, 14);
        assert_eq!(
            config.retention_policy(),
            RetentionPolicy::default()
        );
        assert!(config.log_file.is_none());
        assert!(config.ssh_key_file.is_none());
    }

    #[test]
    fn test_parse_rejects_incomplete_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "hosts_file: /x\nbackend:\n  server: s\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_load_hosts_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.txt");
        fs::write(
            &path,
            "kvm-01.example.com\n#kvm-02.example.com\nkvm-03.example.com 10.0.0.4\n",
        )
        .unwrap();

        let hosts = load_hosts(&path).unwrap();
        assert_eq!(
            hosts,
            vec![
                HostAddress("kvm-01.example.com".into()),
                HostAddress("kvm-03.example.com".into()),
                HostAddress("10.0.0.4".into()),
            ]
        );
    }

    #[test]
    fn test_load_hosts_missing_file() {
        assert!(load_hosts(Path::new("/nonexistent/hosts.txt")).is_err());
    }
}
