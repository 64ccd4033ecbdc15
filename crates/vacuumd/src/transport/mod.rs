//! Transport abstraction over the two ways of reaching a device.
//!
//! A device is reachable either directly on the LAN ([`local::LocalTransport`])
//! or through the vendor cloud relay ([`cloud::CloudTransport`]). Both speak
//! the same request/response contract, modelled by the [`Transport`] trait so
//! the coordinator can swap one for the other at runtime.

mod local;

pub mod cloud;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use cloud::CloudDeviceLink;
pub use cloud::CloudTransport;
pub use local::LocalTransport;

use crate::device::PropertySnapshot;

/// Errors from either transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport was released or never connected.
    #[error("transport is not connected")]
    Disconnected,

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("device request timed out")]
    Timeout,

    /// The device answered, but with a payload we cannot interpret.
    #[error("malformed device payload: {0}")]
    Protocol(String),

    /// The device answered with an explicit error.
    #[error("device reported an error: {0}")]
    Device(String),

    #[error("mqtt failure: {0}")]
    Mqtt(String),
}

/// Uniform interface over a device communication channel.
///
/// Methods take `&self`; implementations use interior mutability so a single
/// instance can be shared behind an `Arc` (the cloud transport multiplexes one
/// authenticated connection across every device of an account).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the device's current operational properties.
    async fn get_properties(&self) -> Result<PropertySnapshot, TransportError>;

    /// Fetch the device's stored map list as (map id, display name) pairs.
    async fn get_map_list(&self) -> Result<Vec<(u32, String)>, TransportError>;

    /// Ask the device to load the given map for retrieval.
    ///
    /// The device holds at most one map at a time; callers must wait the
    /// settle interval before the map bytes endpoint reflects the switch.
    async fn load_map(&self, map_id: u32) -> Result<(), TransportError>;

    /// Fetch the raw bytes of the currently loaded map.
    async fn get_map_bytes(&self) -> Result<Vec<u8>, TransportError>;

    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Tear the connection down. Idempotent, safe if never connected.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// The coordinator's current channel selection.
///
/// Exactly one variant is current per device at any time. The cloud side is a
/// per-device view onto the account-wide shared connection, so cloning the
/// handle never duplicates a session.
#[derive(Clone)]
pub enum TransportHandle {
    Local(Arc<dyn Transport>),
    Cloud(Arc<dyn Transport>),
}

impl TransportHandle {
    pub fn transport(&self) -> Arc<dyn Transport> {
        match self {
            TransportHandle::Local(t) | TransportHandle::Cloud(t) => Arc::clone(t),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, TransportHandle::Local(_))
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportHandle::Local(_) => f.write_str("TransportHandle::Local"),
            TransportHandle::Cloud(_) => f.write_str("TransportHandle::Cloud"),
        }
    }
}

/// One response frame of the device protocol.
///
/// Control responses are JSON; map payloads are raw binary. Both transports
/// prefix the payload with a one-byte kind tag so map bytes never pass
/// through a JSON encoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Json(Value),
    Binary(Vec<u8>),
}

const FRAME_KIND_JSON: u8 = 0;
const FRAME_KIND_BINARY: u8 = 1;

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Json(value) => {
                let mut out = vec![FRAME_KIND_JSON];
                // Serializing a Value cannot fail.
                out.extend(serde_json::to_vec(value).unwrap_or_default());
                out
            }
            Frame::Binary(bytes) => {
                let mut out = Vec::with_capacity(bytes.len() + 1);
                out.push(FRAME_KIND_BINARY);
                out.extend_from_slice(bytes);
                out
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, TransportError> {
        let (kind, body) = payload
            .split_first()
            .ok_or_else(|| TransportError::Protocol("empty frame".to_string()))?;
        match *kind {
            FRAME_KIND_JSON => {
                let value = serde_json::from_slice(body)
                    .map_err(|e| TransportError::Protocol(format!("bad json frame: {e}")))?;
                Ok(Frame::Json(value))
            }
            FRAME_KIND_BINARY => Ok(Frame::Binary(body.to_vec())),
            other => Err(TransportError::Protocol(format!(
                "unknown frame kind {other}"
            ))),
        }
    }
}

/// Interpret a JSON control response: `{"id": n, "result": ...}` on success,
/// `{"id": n, "error": "..."}` on failure.
pub(crate) fn unwrap_result(value: Value) -> Result<Value, TransportError> {
    if let Some(err) = value.get("error").and_then(Value::as_str) {
        return Err(TransportError::Device(err.to_string()));
    }
    value
        .get("result")
        .cloned()
        .ok_or_else(|| TransportError::Protocol("response carries no result".to_string()))
}

pub(crate) fn parse_map_list(result: Value) -> Result<Vec<(u32, String)>, TransportError> {
    let entries = result
        .as_array()
        .ok_or_else(|| TransportError::Protocol("map list is not an array".to_string()))?;
    entries
        .iter()
        .map(|entry| {
            let id = entry
                .get("map_id")
                .and_then(Value::as_u64)
                .ok_or_else(|| TransportError::Protocol("map entry without id".to_string()))?;
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok((id as u32, name))
        })
        .collect()
}
