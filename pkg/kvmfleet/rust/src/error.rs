// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Error taxonomy for the fleet reconciliation engine.
//!
//! The propagation policy is layered: per-instance errors never escape the
//! host worker, per-host connection errors never escape the fleet scheduler,
//! and only backend mutation failures and unexpected task failures abort a
//! cycle.

use thiserror::Error;

/// Errors surfaced by the hypervisor introspection boundary.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// The host is unreachable or misconfigured. Host-fatal,
    /// cycle-recoverable: the host is skipped for this cycle.
    #[error("failed to open hypervisor connection to {uri}: {reason}")]
    Connection { uri: String, reason: String },

    /// The instance vanished between enumeration and sampling.
    /// Instance-fatal, host-recoverable: the instance is skipped.
    #[error("instance not found: {uuid}")]
    InstanceNotFound { uuid: String },

    /// The instance exists but is not running. Not an error for sampling
    /// purposes; the sampler maps this to zeroed figures.
    #[error("instance {uuid} is not running")]
    Inactive { uuid: String },

    /// Any other introspection failure.
    #[error("hypervisor call {call} failed: {reason}")]
    Call { call: String, reason: String },
}

impl HypervisorError {
    pub fn is_instance_not_found(&self) -> bool {
        matches!(self, HypervisorError::InstanceNotFound { .. })
    }

    pub fn is_inactive(&self) -> bool {
        matches!(self, HypervisorError::Inactive { .. })
    }
}

/// Errors surfaced by the monitoring backend boundary (inventory RPC and
/// metric sink). Host-fatal: inventory state is indeterminate after one of
/// these, so the host's remaining work is aborted and the error propagates.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend rpc {method} failed: {message}")]
    Rpc { method: String, message: String },

    #[error("backend transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend authentication failed: {0}")]
    Auth(String),

    #[error("malformed backend response: {0}")]
    Protocol(String),

    #[error("metric sink: {0}")]
    Sink(String),
}

/// Per-host processing outcome kinds.
#[derive(Error, Debug)]
pub enum HostError {
    /// Absorbed by the scheduler: the host contributes zero observed
    /// instances and the cycle continues.
    #[error(transparent)]
    Connection(HypervisorError),

    /// Propagated by the scheduler: aborts the cycle.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Errors that abort a whole polling cycle.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A host worker task failed outside the anticipated taxonomy
    /// (e.g. a panic). Only the explicitly anticipated kinds are absorbed.
    #[error("host worker task failed: {0}")]
    Worker(String),
}

/// Errors from the cleanup pass. Lock contention is deliberately not here:
/// it is a benign skip outcome, not an error.
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("cleanup lock at {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}
