// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Trapper-protocol metric sink.
//!
//! Frames a batch of records as the backend's push-ingestion wire format:
//! a 5-byte magic (`ZBXD`, protocol version 1), a little-endian u64 body
//! length, and a JSON body. Each send opens its own TCP connection, so
//! concurrent host workers never share connection state. Channel encryption
//! is the transport's TLS-PSK contract, terminated in front of the trapper
//! port; the PSK identity/key pair travels in configuration and is stamped
//! onto entities at creation time.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::backend::{MetricSink, SinkReceipt};
use crate::batch::MetricRecord;
use crate::error::BackendError;

const PROTOCOL_MAGIC: &[u8; 5] = b"ZBXD\x01";

/// Upper bound on acknowledgment bodies; real ones are well under 1 KiB.
const MAX_ACK_BODY: u64 = 16 * 1024;

#[derive(Serialize)]
struct WireRecord<'a> {
    host: &'a str,
    key: String,
    value: &'a str,
    clock: i64,
}

#[derive(Serialize)]
struct WirePayload<'a> {
    request: &'static str,
    data: Vec<WireRecord<'a>>,
    clock: i64,
}

/// Frame a JSON body with the protocol header.
fn frame(body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(PROTOCOL_MAGIC.len() + 8 + body.len());
    framed.extend_from_slice(PROTOCOL_MAGIC);
    framed.extend_from_slice(&(body.len() as u64).to_le_bytes());
    framed.extend_from_slice(body);
    framed
}

/// Parse the acknowledgment info string, e.g.
/// `processed: 3; failed: 0; total: 3; seconds spent: 0.000070`.
fn parse_ack_info(info: &str) -> Option<SinkReceipt> {
    let mut receipt = SinkReceipt::default();
    let mut seen = 0;
    for part in info.split(';') {
        let (name, value) = part.split_once(':')?;
        let value = value.trim();
        match name.trim() {
            "processed" => {
                receipt.processed = value.parse().ok()?;
                seen += 1;
            }
            "failed" => {
                receipt.failed = value.parse().ok()?;
                seen += 1;
            }
            "total" => {
                receipt.total = value.parse().ok()?;
                seen += 1;
            }
            _ => {}
        }
    }
    (seen == 3).then_some(receipt)
}

pub struct TrapperSink {
    addr: String,
    timeout: Duration,
}

impl TrapperSink {
    pub fn new(server: &str, port: u16, timeout: Duration) -> Self {
        Self {
            addr: format!("{server}:{port}"),
            timeout,
        }
    }

    fn encode(records: &[MetricRecord], clock: i64) -> Result<Vec<u8>, BackendError> {
        let payload = WirePayload {
            request: "sender data",
            data: records
                .iter()
                .map(|r| WireRecord {
                    host: &r.host,
                    key: r.key.render(),
                    value: &r.value,
                    clock: r.clock,
                })
                .collect(),
            clock,
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| BackendError::Sink(format!("encoding batch: {e}")))?;
        Ok(frame(&body))
    }

    async fn exchange(&self, framed: &[u8]) -> Result<Vec<u8>, BackendError> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| BackendError::Sink(format!("connect {}: {e}", self.addr)))?;
        stream
            .write_all(framed)
            .await
            .map_err(|e| BackendError::Sink(format!("write: {e}")))?;

        let mut header = [0u8; 13];
        stream
            .read_exact(&mut header)
            .await
            .map_err(|e| BackendError::Sink(format!("reading ack header: {e}")))?;
        if &header[..5] != PROTOCOL_MAGIC {
            return Err(BackendError::Sink("bad ack header magic".into()));
        }
        let body_len = u64::from_le_bytes(
            header[5..13]
                .try_into()
                .map_err(|_| BackendError::Sink("short ack header".into()))?,
        );
        if body_len > MAX_ACK_BODY {
            return Err(BackendError::Sink(format!(
                "ack body of {body_len} bytes exceeds limit"
            )));
        }

        let mut body = vec![0u8; body_len as usize];
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| BackendError::Sink(format!("reading ack body: {e}")))?;
        Ok(body)
    }
}

#[async_trait]
impl MetricSink for TrapperSink {
    async fn send(&self, records: &[MetricRecord]) -> Result<SinkReceipt, BackendError> {
        if records.is_empty() {
            return Ok(SinkReceipt::default());
        }
        let clock = records[0].clock;
        let framed = Self::encode(records, clock)?;

        let body = timeout(self.timeout, self.exchange(&framed))
            .await
            .map_err(|_| BackendError::Sink(format!("send to {} timed out", self.addr)))??;

        let ack: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| BackendError::Sink(format!("malformed ack: {e}")))?;
        let response = ack.get("response").and_then(|v| v.as_str()).unwrap_or("");
        if response != "success" {
            return Err(BackendError::Sink(format!("ack response {response:?}")));
        }
        let info = ack.get("info").and_then(|v| v.as_str()).unwrap_or("");
        parse_ack_info(info)
            .ok_or_else(|| BackendError::Sink(format!("unparseable ack info {info:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{DiscoveryKind, MetricKey};

    #[test]
    fn test_frame_layout() {
        let framed = frame(b"{}");
        assert_eq!(&framed[..5], b"ZBXD\x01");
        assert_eq!(framed[5..13], 2u64.to_le_bytes());
        assert_eq!(&framed[13..], b"{}");
    }

    #[test]
    fn test_parse_ack_info() {
        let receipt =
            parse_ack_info("processed: 3; failed: 1; total: 4; seconds spent: 0.000070").unwrap();
        assert_eq!(receipt.processed, 3);
        assert_eq!(receipt.failed, 1);
        assert_eq!(receipt.total, 4);

        assert!(parse_ack_info("").is_none());
        assert!(parse_ack_info("processed: x; failed: 0; total: 0").is_none());
    }

    #[test]
    fn test_encode_batch_body() {
        let records = vec![MetricRecord {
            host: "uuid-1".into(),
            key: MetricKey::Discovery {
                kind: DiscoveryKind::Nic,
            },
            value: r#"{"data":[]}"#.into(),
            clock: 1_700_000_000,
        }];
        let framed = TrapperSink::encode(&records, 1_700_000_000).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&framed[13..]).unwrap();
        assert_eq!(body["request"], "sender data");
        assert_eq!(body["clock"], 1_700_000_000);
        assert_eq!(body["data"][0]["host"], "uuid-1");
        assert_eq!(body["data"][0]["key"], "libvirt.nic.discover");
    }
}
