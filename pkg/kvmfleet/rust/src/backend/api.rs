// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! JSON-RPC inventory client.
//!
//! Thin adapter over the backend's `api_jsonrpc.php` endpoint: typed
//! request/response envelopes, an authenticated session token obtained via
//! `user.login`, and the handful of entity/group/template/item calls the
//! engine needs. `reqwest::Client` is internally reference-counted, so one
//! `ZabbixApi` is shared across all host workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::backend::{EntityId, GroupId, InventoryApi, InventoryEntity, TemplateId};
use crate::error::BackendError;

/// Entity interface stanza sent on creation. The values are arbitrary:
/// ingestion happens over the trapper channel, never by polling this
/// address, but the backend requires an interface to exist.
fn trapper_interface() -> Value {
    json!({
        "type": 1,
        "main": 1,
        "useip": 1,
        "ip": "127.0.0.1",
        "dns": "",
        "port": "10069",
    })
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

pub struct ZabbixApi {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    request_id: AtomicU64,
}

impl ZabbixApi {
    /// Authenticate against `server` and return a ready session.
    pub async fn login(
        server: &str,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = format!("https://{server}/api_jsonrpc.php");

        let mut api = Self {
            http,
            endpoint,
            token: String::new(),
            request_id: AtomicU64::new(1),
        };

        let result = api
            .call(
                "user.login",
                json!({ "username": user, "password": password }),
            )
            .await?;
        let token = result
            .as_str()
            .ok_or_else(|| BackendError::Auth("login returned no session token".into()))?;
        api.token = token.to_string();
        Ok(api)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, BackendError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let mut request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        // user.login is the one unauthenticated call.
        if !self.token.is_empty() {
            request["auth"] = Value::String(self.token.clone());
        }

        let envelope: RpcEnvelope = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = envelope.error {
            return Err(BackendError::Rpc {
                method: method.to_string(),
                message: format!(
                    "{} ({}){}",
                    error.message,
                    error.code,
                    error
                        .data
                        .map(|d| format!(": {d}"))
                        .unwrap_or_default()
                ),
            });
        }
        envelope.result.ok_or_else(|| {
            BackendError::Protocol(format!("{method}: response carried neither result nor error"))
        })
    }
}

/// Extract `field` from every object of a result array.
fn string_field(value: &Value, field: &str) -> Result<String, BackendError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendError::Protocol(format!("object missing string field {field:?}")))
}

fn entity_from_object(value: &Value) -> Result<InventoryEntity, BackendError> {
    // Backend convention: status "0" means monitoring is enabled.
    let status = string_field(value, "status")?;
    Ok(InventoryEntity {
        id: EntityId(string_field(value, "hostid")?),
        name: string_field(value, "host")?,
        enabled: status == "0",
    })
}

fn result_array(result: Value, method: &str) -> Result<Vec<Value>, BackendError> {
    match result {
        Value::Array(items) => Ok(items),
        _ => Err(BackendError::Protocol(format!(
            "{method}: expected an array result"
        ))),
    }
}

/// First element of an id array like `{"hostids": ["10105"]}`.
fn first_id(result: &Value, key: &str) -> Result<String, BackendError> {
    result
        .get(key)
        .and_then(Value::as_array)
        .and_then(|ids| ids.first())
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendError::Protocol(format!("response missing {key:?}")))
}

#[async_trait]
impl InventoryApi for ZabbixApi {
    async fn find_host(&self, name: &str) -> Result<Option<InventoryEntity>, BackendError> {
        let result = self
            .call(
                "host.get",
                json!({
                    "filter": { "host": [name] },
                    "output": ["hostid", "host", "status"],
                }),
            )
            .await?;
        let items = result_array(result, "host.get")?;
        items.first().map(entity_from_object).transpose()
    }

    async fn create_host(
        &self,
        name: &str,
        groups: &[GroupId],
        template: &TemplateId,
        psk_identity: &str,
        psk_key: &str,
    ) -> Result<EntityId, BackendError> {
        let groups: Vec<Value> = groups
            .iter()
            .map(|g| json!({ "groupid": g.0 }))
            .collect();
        let result = self
            .call(
                "host.create",
                json!({
                    "host": name,
                    "interfaces": [trapper_interface()],
                    "groups": groups,
                    "templates": [{ "templateid": template.0 }],
                    "tls_connect": 2,
                    "tls_psk_identity": psk_identity,
                    "tls_psk": psk_key,
                }),
            )
            .await?;
        Ok(EntityId(first_id(&result, "hostids")?))
    }

    async fn get_or_create_group(&self, name: &str) -> Result<GroupId, BackendError> {
        let result = self
            .call("hostgroup.get", json!({ "filter": { "name": [name] } }))
            .await?;
        let items = result_array(result, "hostgroup.get")?;
        if let Some(group) = items.first() {
            return Ok(GroupId(string_field(group, "groupid")?));
        }

        let created = self
            .call("hostgroup.create", json!({ "name": name }))
            .await?;
        Ok(GroupId(first_id(&created, "groupids")?))
    }

    async fn template_id(&self, name: &str) -> Result<Option<TemplateId>, BackendError> {
        let result = self
            .call("template.get", json!({ "filter": { "host": [name] } }))
            .await?;
        let items = result_array(result, "template.get")?;
        items
            .first()
            .map(|t| Ok(TemplateId(string_field(t, "templateid")?)))
            .transpose()
    }

    async fn hosts_in_group(&self, group: &GroupId) -> Result<Vec<InventoryEntity>, BackendError> {
        let result = self
            .call(
                "host.get",
                json!({
                    "groupids": [group.0],
                    "output": ["hostid", "host", "status"],
                }),
            )
            .await?;
        result_array(result, "host.get")?
            .iter()
            .map(entity_from_object)
            .collect()
    }

    async fn latest_activity(
        &self,
        host: &EntityId,
        item_key: &str,
    ) -> Result<Option<DateTime<Utc>>, BackendError> {
        let result = self
            .call(
                "item.get",
                json!({
                    "hostids": [host.0],
                    "filter": { "key_": [item_key] },
                    "output": ["lastclock"],
                }),
            )
            .await?;
        let items = result_array(result, "item.get")?;
        let Some(item) = items.first() else {
            return Ok(None);
        };
        let lastclock = string_field(item, "lastclock")?;
        let clock: i64 = lastclock
            .parse()
            .map_err(|_| BackendError::Protocol(format!("bad lastclock {lastclock:?}")))?;
        // A zero clock means the item exists but never received a value.
        if clock == 0 {
            return Ok(None);
        }
        Ok(DateTime::<Utc>::from_timestamp(clock, 0))
    }

    async fn set_hosts_enabled(
        &self,
        hosts: &[EntityId],
        enabled: bool,
    ) -> Result<(), BackendError> {
        if hosts.is_empty() {
            return Ok(());
        }
        let hosts: Vec<Value> = hosts.iter().map(|h| json!({ "hostid": h.0 })).collect();
        let status = if enabled { 0 } else { 1 };
        self.call(
            "host.massupdate",
            json!({ "hosts": hosts, "status": status }),
        )
        .await?;
        Ok(())
    }

    async fn delete_hosts(&self, hosts: &[EntityId]) -> Result<(), BackendError> {
        if hosts.is_empty() {
            return Ok(());
        }
        let ids: Vec<&str> = hosts.iter().map(|h| h.0.as_str()).collect();
        self.call("host.delete", json!(ids)).await?;
        Ok(())
    }

    async fn logout(&self) -> Result<(), BackendError> {
        self.call("user.logout", json!([])).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_from_object() {
        let entity = entity_from_object(&json!({
            "hostid": "10105",
            "host": "8e1cbdd4-9f39-4a3c-b9b2-510c7e7a3bfb",
            "status": "0",
        }))
        .unwrap();
        assert_eq!(entity.id, EntityId("10105".into()));
        assert!(entity.enabled);

        let disabled = entity_from_object(&json!({
            "hostid": "10106",
            "host": "x",
            "status": "1",
        }))
        .unwrap();
        assert!(!disabled.enabled);
    }

    #[test]
    fn test_entity_from_object_missing_field() {
        let err = entity_from_object(&json!({ "hostid": "1" })).unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));
    }

    #[test]
    fn test_first_id() {
        let value = json!({ "hostids": ["10105", "10106"] });
        assert_eq!(first_id(&value, "hostids").unwrap(), "10105");
        assert!(first_id(&value, "groupids").is_err());
    }

    #[test]
    fn test_result_array_rejects_objects() {
        assert!(result_array(json!({}), "host.get").is_err());
        assert_eq!(result_array(json!([1, 2]), "host.get").unwrap().len(), 2);
    }

    #[test]
    fn test_rpc_envelope_error_deserializes() {
        let envelope: RpcEnvelope = serde_json::from_str(
            r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"Invalid params.","data":"No groups."},"id":3}"#,
        )
        .unwrap();
        let error = envelope.error.unwrap();
        assert_eq!(error.code, -32602);
        assert_eq!(error.data.as_deref(), Some("No groups."));
        assert!(envelope.result.is_none());
    }
}
