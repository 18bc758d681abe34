// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Instance XML descriptor parsing.
//!
//! Extracts the display name, NIC/disk device identifiers and the embedded
//! ownership metadata from a domain's XML dump. Only the elements the engine
//! needs are modeled; everything else in the descriptor is ignored.

use serde::Deserialize;

use crate::error::HypervisorError;
use crate::hypervisor::{DomainDescriptor, DomainOwner};

#[derive(Debug, Deserialize)]
struct DomainXml {
    name: String,
    metadata: Option<MetadataXml>,
    devices: Option<DevicesXml>,
}

#[derive(Debug, Deserialize)]
struct MetadataXml {
    // The compute layer embeds ownership under its own namespace prefix.
    #[serde(rename = "nova:instance")]
    instance: Option<NovaInstanceXml>,
}

#[derive(Debug, Deserialize)]
struct NovaInstanceXml {
    #[serde(rename = "nova:owner")]
    owner: Option<NovaOwnerXml>,
}

#[derive(Debug, Deserialize)]
struct NovaOwnerXml {
    #[serde(rename = "nova:user")]
    user: Option<NovaRefXml>,
    #[serde(rename = "nova:project")]
    project: Option<NovaRefXml>,
}

#[derive(Debug, Deserialize)]
struct NovaRefXml {
    #[serde(rename = "@uuid")]
    uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DevicesXml {
    #[serde(rename = "interface", default)]
    interfaces: Vec<DeviceXml>,
    #[serde(rename = "disk", default)]
    disks: Vec<DeviceXml>,
}

#[derive(Debug, Deserialize)]
struct DeviceXml {
    target: Option<TargetXml>,
}

#[derive(Debug, Deserialize)]
struct TargetXml {
    #[serde(rename = "@dev")]
    dev: Option<String>,
}

fn device_names(devices: &[DeviceXml]) -> Vec<String> {
    devices
        .iter()
        .filter_map(|d| d.target.as_ref().and_then(|t| t.dev.clone()))
        .collect()
}

/// Parse a domain XML dump into the structured descriptor.
pub fn parse_domain_xml(xml: &str) -> Result<DomainDescriptor, HypervisorError> {
    let parsed: DomainXml =
        quick_xml::de::from_str(xml).map_err(|e| HypervisorError::Call {
            call: "parse-descriptor".into(),
            reason: e.to_string(),
        })?;

    let (vnics, vdisks) = match &parsed.devices {
        Some(devices) => (
            device_names(&devices.interfaces),
            device_names(&devices.disks),
        ),
        None => (Vec::new(), Vec::new()),
    };

    // Ownership counts only when both uuids are present; a partial owner
    // element degrades to the unowned sentinel.
    let owner = parsed
        .metadata
        .and_then(|m| m.instance)
        .and_then(|i| i.owner)
        .and_then(|o| {
            let user_uuid = o.user.and_then(|u| u.uuid)?;
            let project_uuid = o.project.and_then(|p| p.uuid)?;
            Some(DomainOwner {
                user_uuid,
                project_uuid,
            })
        });

    Ok(DomainDescriptor {
        name: parsed.name,
        vnics,
        vdisks,
        owner,
    })
}
