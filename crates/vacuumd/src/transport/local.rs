//! Direct LAN transport.
//!
//! One length-prefixed request/response exchange at a time over a single TCP
//! connection to the device. The connection is opened lazily on first use and
//! dropped on any i/o error so the next request reconnects.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::parse_map_list;
use super::unwrap_result;
use super::Frame;
use super::Transport;
use super::TransportError;
use crate::device::PropertySnapshot;

/// How long one request/response exchange may take end to end.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on an incoming frame; map payloads stay well under this.
const MAX_FRAME_LEN: u32 = 8 * 1024 * 1024;

/// Device port for the local protocol.
const LOCAL_PORT: u16 = 58_867;

pub struct LocalTransport {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
    next_id: AtomicU64,
}

impl LocalTransport {
    pub fn new(ip: &str) -> Self {
        Self {
            addr: format!("{ip}:{LOCAL_PORT}"),
            stream: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Frame, TransportError> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.request_inner(method, params))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn request_inner(&self, method: &str, params: Value) -> Result<Frame, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Frame::Json(json!({
            "id": id,
            "method": method,
            "params": params,
        }));

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            debug!(addr = %self.addr, "connecting local transport");
            *guard = Some(TcpStream::connect(&self.addr).await?);
        }
        // Connection established just above.
        let stream = guard.as_mut().ok_or(TransportError::Disconnected)?;

        let result = Self::exchange(stream, &request).await;
        if result.is_err() {
            // Force a reconnect on the next request.
            *guard = None;
        }
        let frame = result?;

        if let Frame::Json(value) = &frame {
            let reply_id = value.get("id").and_then(Value::as_u64);
            if reply_id != Some(id) {
                *guard = None;
                return Err(TransportError::Protocol(format!(
                    "response id {reply_id:?} does not match request {id}"
                )));
            }
        }
        Ok(frame)
    }

    async fn exchange(stream: &mut TcpStream, request: &Frame) -> Result<Frame, TransportError> {
        let payload = request.encode();
        stream.write_u32_le(payload.len() as u32).await?;
        stream.write_all(&payload).await?;
        stream.flush().await?;

        let len = stream.read_u32_le().await?;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::Protocol(format!(
                "oversized frame of {len} bytes"
            )));
        }
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).await?;
        Frame::decode(&payload)
    }

    async fn json_request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        match self.request(method, params).await? {
            Frame::Json(value) => unwrap_result(value),
            Frame::Binary(_) => Err(TransportError::Protocol(format!(
                "{method} answered with a binary frame"
            ))),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn get_properties(&self) -> Result<PropertySnapshot, TransportError> {
        let result = self.json_request("get_properties", Value::Null).await?;
        serde_json::from_value(result)
            .map_err(|e| TransportError::Protocol(format!("bad property payload: {e}")))
    }

    async fn get_map_list(&self) -> Result<Vec<(u32, String)>, TransportError> {
        let result = self.json_request("get_map_list", Value::Null).await?;
        parse_map_list(result)
    }

    async fn load_map(&self, map_id: u32) -> Result<(), TransportError> {
        self.json_request("load_map", json!([map_id])).await?;
        Ok(())
    }

    async fn get_map_bytes(&self) -> Result<Vec<u8>, TransportError> {
        match self.request("get_map_bytes", Value::Null).await? {
            Frame::Binary(bytes) => Ok(bytes),
            Frame::Json(value) => {
                // A JSON reply here is the device refusing the fetch.
                unwrap_result(value)?;
                Err(TransportError::Protocol(
                    "map fetch answered without map bytes".to_string(),
                ))
            }
        }
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.json_request("ping", Value::Null).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut guard = self.stream.lock().await;
        if let Some(stream) = guard.take() {
            // Half-closed is fine; the device drops the session on EOF.
            drop(stream);
            debug!(addr = %self.addr, "local transport disconnected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn serve_one(listener: TcpListener, reply: Frame) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let len = stream.read_u32_le().await.unwrap();
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await.unwrap();
        let request = Frame::decode(&buf).unwrap();

        // Echo the request id into the canned reply.
        let reply = match (request, reply) {
            (Frame::Json(req), Frame::Json(mut rep)) => {
                rep["id"] = req["id"].clone();
                Frame::Json(rep)
            }
            (_, other) => other,
        };
        let payload = reply.encode();
        stream.write_u32_le(payload.len() as u32).await.unwrap();
        stream.write_all(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn ping_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_one(listener, Frame::Json(json!({"result": "pong"}))));

        let transport = LocalTransport {
            addr: format!("127.0.0.1:{port}"),
            stream: Mutex::new(None),
            next_id: AtomicU64::new(1),
        };
        transport.ping().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn map_bytes_come_back_raw() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_one(listener, Frame::Binary(vec![1, 2, 3])));

        let transport = LocalTransport {
            addr: format!("127.0.0.1:{port}"),
            stream: Mutex::new(None),
            next_id: AtomicU64::new(1),
        };
        assert_eq!(transport.get_map_bytes().await.unwrap(), vec![1, 2, 3]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let transport = LocalTransport::new("127.0.0.1");
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
    }
}
