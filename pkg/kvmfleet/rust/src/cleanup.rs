// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Destructive cleanup pass over stale inventory entities.
//!
//! Runs at most once per scheduling window: a filesystem mutual-exclusion
//! marker serializes overlapping invocations (acquire-or-abort, released on
//! every exit path), and a minute-of-hour window keeps the pass to one slot
//! per hour. Entities the fleet no longer reports are disabled, and deleted
//! only once their last reported activity is older than the long retention
//! window.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Timelike, Utc};
use tracing::{debug, info, warn};

use crate::backend::{GroupId, InventoryApi, InventoryEntity};
use crate::batch::ACTIVITY_PROBE_KEY;
use crate::error::CleanupError;
use crate::reconciler::Decision;

/// Staleness thresholds for absent entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Absence long enough to be a real disappearance rather than jitter.
    pub short_absence: Duration,
    /// Absence after which the entity is deleted outright.
    pub long_retention: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            short_absence: Duration::hours(1),
            long_retention: Duration::days(90),
        }
    }
}

/// Why a stale entity was classified the way it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The activity probe item never reported a value.
    NeverReported,
    /// Last activity predates the long retention window.
    BeyondRetention,
    /// Absent longer than the short window but inside retention.
    Absent,
    /// Inside the short window; not yet a confirmed disappearance.
    RecentlyAbsent,
}

/// Classify one stale entity by its last reported activity.
///
/// Delete requires the long window to have elapsed, independent of the
/// short-window check; everything else is disabled. An entity with no
/// activity record at all cannot be aged, so it is disabled, never deleted.
pub fn classify(
    last_activity: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: &RetentionPolicy,
) -> (Decision, StaleReason) {
    let Some(last) = last_activity else {
        return (Decision::Disable, StaleReason::NeverReported);
    };
    let absent = now.signed_duration_since(last);
    if absent > policy.long_retention {
        (Decision::Delete, StaleReason::BeyondRetention)
    } else if absent > policy.short_absence {
        (Decision::Disable, StaleReason::Absent)
    } else {
        // Conservative default: even a just-missed entity is disabled until
        // it reports again.
        (Decision::Disable, StaleReason::RecentlyAbsent)
    }
}

/// Minute-of-hour range (inclusive bounds) in which the pass may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupWindow {
    pub start_minute: u32,
    pub end_minute: u32,
}

impl CleanupWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let minute = now.minute();
        self.start_minute <= minute && minute <= self.end_minute
    }
}

/// Filesystem mutual-exclusion marker. Removal happens in `Drop`, so every
/// exit path from the pass releases it.
struct CleanupLock {
    path: PathBuf,
}

enum LockAttempt {
    Acquired(CleanupLock),
    Contended,
}

impl CleanupLock {
    fn acquire(path: &Path) -> Result<LockAttempt, std::io::Error> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut marker) => {
                // Best effort: the pid helps an operator chase a stale marker.
                let _ = writeln!(marker, "{}", std::process::id());
                Ok(LockAttempt::Acquired(CleanupLock {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(LockAttempt::Contended),
            Err(e) => Err(e),
        }
    }
}

impl Drop for CleanupLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release cleanup lock");
        }
    }
}

/// Why a pass ended without evaluating anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    LockHeld,
    OutsideWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Skipped(SkipReason),
    Completed { disabled: usize, deleted: usize },
}

pub struct CleanupGate {
    lock_path: PathBuf,
    window: CleanupWindow,
    policy: RetentionPolicy,
}

impl CleanupGate {
    pub fn new(lock_path: PathBuf, window: CleanupWindow, policy: RetentionPolicy) -> Self {
        Self {
            lock_path,
            window,
            policy,
        }
    }

    /// Run one cleanup pass against the fleet group.
    ///
    /// `observed` is the cycle's aggregated set of instance UUIDs. Lock
    /// contention and an out-of-window invocation are benign skips, not
    /// errors; the pass makes zero backend mutations in either case.
    pub async fn run<A: InventoryApi + ?Sized>(
        &self,
        api: &A,
        fleet_group: &GroupId,
        observed: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<CleanupOutcome, CleanupError> {
        let _lock = match CleanupLock::acquire(&self.lock_path).map_err(|source| {
            CleanupError::Lock {
                path: self.lock_path.display().to_string(),
                source,
            }
        })? {
            LockAttempt::Acquired(lock) => lock,
            LockAttempt::Contended => {
                info!(
                    path = %self.lock_path.display(),
                    "Cleanup lock already held, skipping pass"
                );
                return Ok(CleanupOutcome::Skipped(SkipReason::LockHeld));
            }
        };

        if !self.window.contains(now) {
            debug!(
                minute = now.minute(),
                start = self.window.start_minute,
                end = self.window.end_minute,
                "Outside cleanup window, skipping pass"
            );
            return Ok(CleanupOutcome::Skipped(SkipReason::OutsideWindow));
        }

        let known = api.hosts_in_group(fleet_group).await?;
        let stale: Vec<&InventoryEntity> =
            known.iter().filter(|e| !observed.contains(&e.name)).collect();
        info!(
            known = known.len(),
            observed = observed.len(),
            stale = stale.len(),
            "Evaluating stale entities"
        );

        let mut to_disable = Vec::new();
        let mut to_delete = Vec::new();
        for entity in stale {
            let last = api.latest_activity(&entity.id, ACTIVITY_PROBE_KEY).await?;
            let (decision, reason) = classify(last, now, &self.policy);
            debug!(
                entity = %entity.name,
                decision = ?decision,
                reason = ?reason,
                "Classified stale entity"
            );
            match decision {
                Decision::Delete => to_delete.push(entity.id.clone()),
                // Re-disabling an already-disabled entity is pointless churn.
                _ if entity.enabled => to_disable.push(entity.id.clone()),
                _ => {}
            }
        }

        let disabled = to_disable.len();
        let deleted = to_delete.len();
        api.set_hosts_enabled(&to_disable, false).await?;
        api.delete_hosts(&to_delete).await?;

        info!(disabled, deleted, "Cleanup pass complete");
        Ok(CleanupOutcome::Completed { disabled, deleted })
    }
}
