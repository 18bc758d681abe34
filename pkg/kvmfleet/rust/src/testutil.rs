// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Scripted in-memory collaborators for tests.
//!
//! Available to unit tests and, behind the `test-helpers` feature, to the
//! end-to-end suite. Nothing here ships in production builds.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::backend::{
    EntityId, GroupId, InventoryApi, InventoryEntity, MetricSink, SinkReceipt, TemplateId,
};
use crate::batch::MetricRecord;
use crate::error::{BackendError, HypervisorError};
use crate::hypervisor::{
    CpuCounters, DomainDescriptor, DomainOwner, HostAddress, Hypervisor, HypervisorConnection,
    IoCounters, MemoryStatsKib,
};

/// One scripted domain on a mock host.
#[derive(Debug, Clone)]
pub struct ScriptedDomain {
    pub uuid: String,
    pub name: String,
    pub user_uuid: String,
    pub project_uuid: String,
    /// Inactive domains are not enumerated and report zeroed statistics.
    pub active: bool,
    /// Enumerated but gone by sampling time: every per-domain call fails
    /// with `InstanceNotFound`.
    pub vanished: bool,
    pub vcpus: u32,
    /// CPU counter samples consumed in order; the last one repeats.
    pub cpu_samples: Vec<CpuCounters>,
    pub memory: MemoryStatsKib,
    pub vnics: Vec<String>,
    pub vdisks: Vec<String>,
    pub disk_counters: IoCounters,
    pub nic_counters: IoCounters,
}

impl Default for ScriptedDomain {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            name: String::new(),
            user_uuid: String::new(),
            project_uuid: String::new(),
            active: true,
            vanished: false,
            vcpus: 1,
            cpu_samples: Vec::new(),
            memory: MemoryStatsKib {
                unused: 100,
                usable: 150,
                actual: 256,
            },
            vnics: Vec::new(),
            vdisks: Vec::new(),
            disk_counters: BTreeMap::from([
                ("rd_bytes".to_string(), 1024u64),
                ("rd_operations".to_string(), 10),
                ("wr_bytes".to_string(), 512),
                ("wr_operations".to_string(), 5),
            ]),
            nic_counters: BTreeMap::from([
                ("read".to_string(), 2048u64),
                ("write".to_string(), 4096),
            ]),
        }
    }
}

impl ScriptedDomain {
    fn descriptor(&self) -> DomainDescriptor {
        let owner = if self.user_uuid.is_empty() && self.project_uuid.is_empty() {
            None
        } else {
            Some(DomainOwner {
                user_uuid: self.user_uuid.clone(),
                project_uuid: self.project_uuid.clone(),
            })
        };
        DomainDescriptor {
            name: self.name.clone(),
            vnics: self.vnics.clone(),
            vdisks: self.vdisks.clone(),
            owner,
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    domains: BTreeMap<String, ScriptedDomain>,
    cpu_cursor: HashMap<String, usize>,
}

/// Scripted [`HypervisorConnection`].
#[derive(Clone)]
pub struct MockConnection {
    hostname: String,
    state: Arc<Mutex<ConnectionState>>,
}

impl MockConnection {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            state: Arc::new(Mutex::new(ConnectionState::default())),
        }
    }

    pub fn add_domain(&self, domain: ScriptedDomain) {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.domains.insert(domain.uuid.clone(), domain);
    }

    fn domain(&self, uuid: &str) -> Result<ScriptedDomain, HypervisorError> {
        let state = self.state.lock().expect("mock state poisoned");
        match state.domains.get(uuid) {
            Some(domain) if !domain.vanished => Ok(domain.clone()),
            _ => Err(HypervisorError::InstanceNotFound { uuid: uuid.into() }),
        }
    }

    fn active_domain(&self, uuid: &str) -> Result<ScriptedDomain, HypervisorError> {
        let domain = self.domain(uuid)?;
        if !domain.active {
            return Err(HypervisorError::Inactive { uuid: uuid.into() });
        }
        Ok(domain)
    }
}

#[async_trait]
impl HypervisorConnection for MockConnection {
    async fn list_active_instances(&self) -> Result<Vec<String>, HypervisorError> {
        let state = self.state.lock().expect("mock state poisoned");
        Ok(state
            .domains
            .values()
            .filter(|d| d.active)
            .map(|d| d.uuid.clone())
            .collect())
    }

    async fn cpu_counters(&self, uuid: &str) -> Result<CpuCounters, HypervisorError> {
        self.active_domain(uuid)?;
        let mut state = self.state.lock().expect("mock state poisoned");
        let cursor = state.cpu_cursor.entry(uuid.to_string()).or_insert(0);
        let index = *cursor;
        *cursor += 1;
        let samples = &state.domains[uuid].cpu_samples;
        Ok(samples
            .get(index)
            .or_else(|| samples.last())
            .copied()
            .unwrap_or_default())
    }

    async fn vcpu_count(&self, uuid: &str) -> Result<u32, HypervisorError> {
        Ok(self.domain(uuid)?.vcpus.max(1))
    }

    async fn memory_stats(&self, uuid: &str) -> Result<MemoryStatsKib, HypervisorError> {
        Ok(self.active_domain(uuid)?.memory)
    }

    async fn block_stats(&self, uuid: &str, _disk: &str) -> Result<IoCounters, HypervisorError> {
        Ok(self.active_domain(uuid)?.disk_counters)
    }

    async fn interface_stats(&self, uuid: &str, _nic: &str) -> Result<IoCounters, HypervisorError> {
        Ok(self.active_domain(uuid)?.nic_counters)
    }

    async fn descriptor(&self, uuid: &str) -> Result<DomainDescriptor, HypervisorError> {
        Ok(self.domain(uuid)?.descriptor())
    }

    async fn hostname(&self) -> Result<String, HypervisorError> {
        Ok(self.hostname.clone())
    }
}

/// Scripted [`Hypervisor`] over a set of named mock hosts.
#[derive(Default)]
pub struct MockHypervisor {
    hosts: Mutex<HashMap<String, MockConnection>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection for `name`, created on first use. The returned handle
    /// shares state with what `open` hands to workers.
    pub fn host(&self, name: &str) -> MockConnection {
        let mut hosts = self.hosts.lock().expect("mock state poisoned");
        hosts
            .entry(name.to_string())
            .or_insert_with(|| MockConnection::new(name))
            .clone()
    }

    pub fn set_unreachable(&self, name: &str) {
        self.unreachable
            .lock()
            .expect("mock state poisoned")
            .insert(name.to_string());
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    type Conn = MockConnection;

    async fn open(&self, host: &HostAddress) -> Result<Self::Conn, HypervisorError> {
        let unreachable = self.unreachable.lock().expect("mock state poisoned");
        if unreachable.contains(&host.0) {
            return Err(HypervisorError::Connection {
                uri: host.0.clone(),
                reason: "scripted connection failure".into(),
            });
        }
        drop(unreachable);
        Ok(self.host(&host.0))
    }
}

#[derive(Debug, Clone)]
struct HostRecord {
    id: String,
    name: String,
    enabled: bool,
    groups: Vec<String>,
    psk_identity: String,
}

#[derive(Default)]
struct InventoryState {
    hosts: BTreeMap<String, HostRecord>,
    groups: BTreeMap<String, String>,
    templates: BTreeMap<String, String>,
    latest: BTreeMap<String, i64>,
    next_id: u64,
    mutations: u64,
    fail_mutations: bool,
    fail_queries: bool,
}

impl InventoryState {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("{}", 10_000 + self.next_id)
    }
}

fn scripted_failure(method: &str) -> BackendError {
    BackendError::Rpc {
        method: method.to_string(),
        message: "scripted failure".into(),
    }
}

/// Scripted [`InventoryApi`] with mutation counters.
#[derive(Default)]
pub struct MockInventory {
    state: Mutex<InventoryState>,
}

impl MockInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a group directly, bypassing failure flags and counters.
    pub fn seed_group(&self, name: &str) -> GroupId {
        let mut state = self.state.lock().expect("mock state poisoned");
        if let Some(id) = state.groups.get(name) {
            return GroupId(id.clone());
        }
        let id = state.next_id();
        state.groups.insert(name.to_string(), id.clone());
        GroupId(id)
    }

    pub fn seed_template(&self, name: &str) -> TemplateId {
        let mut state = self.state.lock().expect("mock state poisoned");
        let id = state.next_id();
        state.templates.insert(name.to_string(), id.clone());
        TemplateId(id)
    }

    /// Seed an entity directly, bypassing failure flags and counters.
    pub fn seed_host(
        &self,
        name: &str,
        enabled: bool,
        groups: &[GroupId],
        last_activity: Option<DateTime<Utc>>,
    ) -> EntityId {
        let mut state = self.state.lock().expect("mock state poisoned");
        let id = state.next_id();
        state.hosts.insert(
            name.to_string(),
            HostRecord {
                id: id.clone(),
                name: name.to_string(),
                enabled,
                groups: groups.iter().map(|g| g.0.clone()).collect(),
                psk_identity: String::new(),
            },
        );
        if let Some(at) = last_activity {
            state.latest.insert(id.clone(), at.timestamp());
        }
        EntityId(id)
    }

    pub fn fail_mutations(&self, fail: bool) {
        self.state.lock().expect("mock state poisoned").fail_mutations = fail;
    }

    pub fn fail_queries(&self, fail: bool) {
        self.state.lock().expect("mock state poisoned").fail_queries = fail;
    }

    pub fn find_host_sync(&self, name: &str) -> Option<InventoryEntity> {
        let state = self.state.lock().expect("mock state poisoned");
        state.hosts.get(name).map(|record| InventoryEntity {
            id: EntityId(record.id.clone()),
            name: record.name.clone(),
            enabled: record.enabled,
        })
    }

    pub fn host_count(&self) -> usize {
        self.state.lock().expect("mock state poisoned").hosts.len()
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().expect("mock state poisoned").groups.len()
    }

    /// Total applied mutations (creates, status flips, deletes).
    pub fn mutation_count(&self) -> u64 {
        self.state.lock().expect("mock state poisoned").mutations
    }

    pub fn psk_identity_of(&self, name: &str) -> Option<String> {
        let state = self.state.lock().expect("mock state poisoned");
        state.hosts.get(name).map(|r| r.psk_identity.clone())
    }
}

#[async_trait]
impl InventoryApi for MockInventory {
    async fn find_host(&self, name: &str) -> Result<Option<InventoryEntity>, BackendError> {
        if self.state.lock().expect("mock state poisoned").fail_queries {
            return Err(scripted_failure("host.get"));
        }
        Ok(self.find_host_sync(name))
    }

    async fn create_host(
        &self,
        name: &str,
        groups: &[GroupId],
        _template: &TemplateId,
        psk_identity: &str,
        _psk_key: &str,
    ) -> Result<EntityId, BackendError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        if state.fail_mutations {
            return Err(scripted_failure("host.create"));
        }
        if state.hosts.contains_key(name) {
            return Err(BackendError::Rpc {
                method: "host.create".into(),
                message: format!("host {name:?} already exists"),
            });
        }
        let id = state.next_id();
        state.hosts.insert(
            name.to_string(),
            HostRecord {
                id: id.clone(),
                name: name.to_string(),
                enabled: true,
                groups: groups.iter().map(|g| g.0.clone()).collect(),
                psk_identity: psk_identity.to_string(),
            },
        );
        state.mutations += 1;
        Ok(EntityId(id))
    }

    async fn get_or_create_group(&self, name: &str) -> Result<GroupId, BackendError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        if let Some(id) = state.groups.get(name) {
            return Ok(GroupId(id.clone()));
        }
        if state.fail_mutations {
            return Err(scripted_failure("hostgroup.create"));
        }
        let id = state.next_id();
        state.groups.insert(name.to_string(), id.clone());
        state.mutations += 1;
        Ok(GroupId(id))
    }

    async fn template_id(&self, name: &str) -> Result<Option<TemplateId>, BackendError> {
        let state = self.state.lock().expect("mock state poisoned");
        if state.fail_queries {
            return Err(scripted_failure("template.get"));
        }
        Ok(state.templates.get(name).map(|id| TemplateId(id.clone())))
    }

    async fn hosts_in_group(&self, group: &GroupId) -> Result<Vec<InventoryEntity>, BackendError> {
        let state = self.state.lock().expect("mock state poisoned");
        if state.fail_queries {
            return Err(scripted_failure("host.get"));
        }
        Ok(state
            .hosts
            .values()
            .filter(|record| record.groups.contains(&group.0))
            .map(|record| InventoryEntity {
                id: EntityId(record.id.clone()),
                name: record.name.clone(),
                enabled: record.enabled,
            })
            .collect())
    }

    async fn latest_activity(
        &self,
        host: &EntityId,
        _item_key: &str,
    ) -> Result<Option<DateTime<Utc>>, BackendError> {
        let state = self.state.lock().expect("mock state poisoned");
        if state.fail_queries {
            return Err(scripted_failure("item.get"));
        }
        Ok(state
            .latest
            .get(&host.0)
            .and_then(|clock| DateTime::<Utc>::from_timestamp(*clock, 0)))
    }

    async fn set_hosts_enabled(
        &self,
        hosts: &[EntityId],
        enabled: bool,
    ) -> Result<(), BackendError> {
        if hosts.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().expect("mock state poisoned");
        if state.fail_mutations {
            return Err(scripted_failure("host.massupdate"));
        }
        let ids: HashSet<&str> = hosts.iter().map(|h| h.0.as_str()).collect();
        for record in state.hosts.values_mut() {
            if ids.contains(record.id.as_str()) {
                record.enabled = enabled;
            }
        }
        state.mutations += hosts.len() as u64;
        Ok(())
    }

    async fn delete_hosts(&self, hosts: &[EntityId]) -> Result<(), BackendError> {
        if hosts.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().expect("mock state poisoned");
        if state.fail_mutations {
            return Err(scripted_failure("host.delete"));
        }
        let ids: HashSet<&str> = hosts.iter().map(|h| h.0.as_str()).collect();
        state.hosts.retain(|_, record| !ids.contains(record.id.as_str()));
        state.mutations += hosts.len() as u64;
        Ok(())
    }

    async fn logout(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Recording [`MetricSink`].
#[derive(Default)]
pub struct MockSink {
    batches: Mutex<Vec<Vec<MetricRecord>>>,
    fail: Mutex<bool>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        *self.fail.lock().expect("mock state poisoned") = fail;
    }

    /// Every batch received, in send order.
    pub fn batches(&self) -> Vec<Vec<MetricRecord>> {
        self.batches.lock().expect("mock state poisoned").clone()
    }
}

#[async_trait]
impl MetricSink for MockSink {
    async fn send(&self, records: &[MetricRecord]) -> Result<SinkReceipt, BackendError> {
        if *self.fail.lock().expect("mock state poisoned") {
            return Err(BackendError::Sink("scripted sink failure".into()));
        }
        let mut batches = self.batches.lock().expect("mock state poisoned");
        batches.push(records.to_vec());
        let total = records.len() as u64;
        Ok(SinkReceipt {
            processed: total,
            failed: 0,
            total,
        })
    }
}
