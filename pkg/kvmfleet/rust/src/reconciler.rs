// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Inventory lifecycle decisions.
//!
//! Compares one observed instance against the backend's knowledge and
//! decides what, if anything, must change. Present instances only ever
//! yield `CreateAndEnroll`, `Enable` or `NoOp` here; `Disable` and `Delete`
//! are the cleanup gate's side of the same decision space. Decisions are
//! evaluated per instance with no cross-instance ordering requirement.

use crate::backend::{GroupId, InventoryApi, InventoryEntity, TemplateId};
use crate::error::BackendError;

/// Lifecycle decision for one entity. Transient: computed and applied
/// within one cycle, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    CreateAndEnroll,
    Enable,
    NoOp,
    Disable,
    Delete,
}

/// Fleet-wide enrollment parameters resolved once per cycle.
#[derive(Debug, Clone)]
pub struct EnrollmentContext {
    pub base_group: GroupId,
    pub template: TemplateId,
    pub psk_identity: String,
    pub psk_key: String,
}

/// Decide the lifecycle action for an observed-active instance.
pub fn decide(existing: Option<&InventoryEntity>) -> Decision {
    match existing {
        None => Decision::CreateAndEnroll,
        Some(entity) if !entity.enabled => Decision::Enable,
        Some(_) => Decision::NoOp,
    }
}

/// Look up, decide and apply for one instance. Returns the decision that
/// was applied; backend failures propagate untouched.
pub async fn reconcile<A: InventoryApi + ?Sized>(
    api: &A,
    uuid: &str,
    project_group: &GroupId,
    ctx: &EnrollmentContext,
) -> Result<Decision, BackendError> {
    match api.find_host(uuid).await? {
        None => {
            api.create_host(
                uuid,
                &[ctx.base_group.clone(), project_group.clone()],
                &ctx.template,
                &ctx.psk_identity,
                &ctx.psk_key,
            )
            .await?;
            Ok(Decision::CreateAndEnroll)
        }
        Some(entity) if !entity.enabled => {
            api.set_hosts_enabled(std::slice::from_ref(&entity.id), true)
                .await?;
            Ok(Decision::Enable)
        }
        Some(_) => Ok(Decision::NoOp),
    }
}
