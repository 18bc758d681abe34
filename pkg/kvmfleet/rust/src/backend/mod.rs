// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Monitoring backend boundary: inventory RPC and metric ingestion.
//!
//! The engine only ever sees these traits. Production adapters are
//! [`api::ZabbixApi`] (JSON-RPC over HTTPS) and [`sender::TrapperSink`]
//! (the backend's push-ingestion wire protocol). Both are safe for
//! concurrent use by multiple host workers.

pub mod api;
pub mod sender;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::batch::MetricRecord;
use crate::error::BackendError;

/// Backend-assigned identifier of one inventory entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId(pub String);

/// Backend-assigned identifier of one entity group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupId(pub String);

/// Backend-assigned identifier of one provisioning template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateId(pub String);

/// The backend's record mirroring one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntity {
    pub id: EntityId,
    /// Entity name; equals the instance UUID for entities this engine owns.
    pub name: String,
    pub enabled: bool,
}

/// Acknowledgment counts from one metric sink send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReceipt {
    pub processed: u64,
    pub failed: u64,
    pub total: u64,
}

/// Inventory CRUD surface of the monitoring backend.
#[async_trait]
pub trait InventoryApi: Send + Sync {
    /// Look an entity up by name. `None` when the backend has no record.
    async fn find_host(&self, name: &str) -> Result<Option<InventoryEntity>, BackendError>;

    /// Create an entity enrolled in `groups`, linked to `template` and
    /// stamped with the fleet-wide PSK transport identity.
    async fn create_host(
        &self,
        name: &str,
        groups: &[GroupId],
        template: &TemplateId,
        psk_identity: &str,
        psk_key: &str,
    ) -> Result<EntityId, BackendError>;

    /// Resolve a group by name, creating it on first sight.
    async fn get_or_create_group(&self, name: &str) -> Result<GroupId, BackendError>;

    async fn template_id(&self, name: &str) -> Result<Option<TemplateId>, BackendError>;

    /// All entities enrolled in `group`, enabled or not.
    async fn hosts_in_group(&self, group: &GroupId) -> Result<Vec<InventoryEntity>, BackendError>;

    /// Timestamp of the most recent ingested value for `item_key` on the
    /// entity, `None` when the item never reported.
    async fn latest_activity(
        &self,
        host: &EntityId,
        item_key: &str,
    ) -> Result<Option<DateTime<Utc>>, BackendError>;

    /// Batch-set the monitoring-enabled flag. A no-op on an empty slice.
    async fn set_hosts_enabled(
        &self,
        hosts: &[EntityId],
        enabled: bool,
    ) -> Result<(), BackendError>;

    /// Batch-delete entities. A no-op on an empty slice.
    async fn delete_hosts(&self, hosts: &[EntityId]) -> Result<(), BackendError>;

    /// Terminate the authenticated session.
    async fn logout(&self) -> Result<(), BackendError>;
}

/// Metric ingestion surface of the monitoring backend.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn send(&self, records: &[MetricRecord]) -> Result<SinkReceipt, BackendError>;
}
