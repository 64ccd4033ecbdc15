//! Cloud-relayed transport.
//!
//! One authenticated MQTT session per account, multiplexed across every
//! device. Requests are published to a per-device topic and correlated with
//! their reply by a request id that doubles as the reply topic suffix, so
//! binary map payloads need no JSON wrapping.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use serde_json::json;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use super::parse_map_list;
use super::unwrap_result;
use super::Frame;
use super::Transport;
use super::TransportError;
use crate::account::SessionCredentials;
use crate::device::PropertySnapshot;

/// Cloud round trips ride through the vendor relay; allow more than local.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const MQTT_PORT: u16 = 8883;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Frame>>>>;

/// The account-wide shared cloud connection.
///
/// Held behind an `Arc` and handed to every coordinator as a
/// [`CloudDeviceLink`]; no coordinator may assume exclusivity over it.
pub struct CloudTransport {
    client: AsyncClient,
    pending: PendingMap,
    next_id: AtomicU64,
    connected: AtomicBool,
    event_loop_task: JoinHandle<()>,
}

impl CloudTransport {
    /// Open the MQTT session for an authenticated account.
    pub fn connect(session: &SessionCredentials) -> Result<Arc<Self>, TransportError> {
        let (user, password) = mqtt_credentials(&session.token).ok_or_else(|| {
            TransportError::Protocol("session token carries no mqtt credentials".to_string())
        })?;

        let host = session
            .base_url
            .trim_start_matches("https://")
            .trim_start_matches("mqtts://")
            .trim_end_matches('/');
        let mut options = MqttOptions::new(format!("vacuumd-{user}"), host, MQTT_PORT);
        options.set_keep_alive(Duration::from_secs(30));
        // Map payloads can be large; raise the default packet limit.
        options.set_max_packet_size(8 * 1024 * 1024, 8 * 1024 * 1024);
        options.set_credentials(user, password);

        let (client, mut event_loop) = AsyncClient::new(options, 16);
        let pending: PendingMap = Arc::default();

        let routes = Arc::clone(&pending);
        let event_loop_task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        route_reply(&routes, &publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("cloud event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            client,
            pending,
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            event_loop_task,
        }))
    }

    /// Bind a per-device view onto this shared connection.
    pub async fn device_link(
        self: &Arc<Self>,
        duid: &str,
    ) -> Result<Arc<CloudDeviceLink>, TransportError> {
        self.client
            .subscribe(format!("devices/{duid}/response/+"), QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Mqtt(e.to_string()))?;
        Ok(Arc::new(CloudDeviceLink {
            conn: Arc::clone(self),
            duid: duid.to_string(),
        }))
    }

    /// Tear down the account session. Called once at hub unload.
    pub async fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!("cloud disconnect: {e}");
        }
        self.event_loop_task.abort();
    }

    async fn request(
        &self,
        duid: &str,
        method: &str,
        params: Value,
    ) -> Result<Frame, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let payload = Frame::Json(json!({
            "id": id,
            "duid": duid,
            "method": method,
            "params": params,
        }))
        .encode();

        let publish = self
            .client
            .publish(
                format!("devices/{duid}/request"),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await;
        if let Err(e) = publish {
            self.pending.lock().unwrap().remove(&id);
            return Err(TransportError::Mqtt(e.to_string()));
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }
}

impl Drop for CloudTransport {
    fn drop(&mut self) {
        self.event_loop_task.abort();
    }
}

/// Pull mqtt credentials out of the opaque session token blob.
fn mqtt_credentials(token: &Value) -> Option<(String, String)> {
    let user = token.get("mqtt_user")?.as_str()?.to_string();
    let password = token.get("mqtt_password")?.as_str()?.to_string();
    Some((user, password))
}

/// Route a reply published on `devices/<duid>/response/<id>` to its waiter.
fn route_reply(pending: &PendingMap, topic: &str, payload: &[u8]) {
    let Some(id) = topic
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse::<u64>().ok())
    else {
        debug!(topic, "ignoring publish on unrecognised topic");
        return;
    };
    let Some(tx) = pending.lock().unwrap().remove(&id) else {
        // Reply after timeout, or a duplicate redelivery.
        debug!(id, "reply with no pending request");
        return;
    };
    match Frame::decode(payload) {
        Ok(frame) => {
            let _ = tx.send(frame);
        }
        Err(e) => debug!(id, "dropping undecodable reply: {e}"),
    }
}

/// Per-device view onto the shared cloud connection.
///
/// This is what a coordinator holds when it has fallen back to the cloud;
/// every call carries the device id so the relay can attribute it.
pub struct CloudDeviceLink {
    conn: Arc<CloudTransport>,
    duid: String,
}

impl CloudDeviceLink {
    async fn json_request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        match self.conn.request(&self.duid, method, params).await? {
            Frame::Json(value) => unwrap_result(value),
            Frame::Binary(_) => Err(TransportError::Protocol(format!(
                "{method} answered with a binary frame"
            ))),
        }
    }
}

#[async_trait]
impl Transport for CloudDeviceLink {
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
        match self.conn.request(&self.duid, "get_map_bytes", Value::Null).await? {
            Frame::Binary(bytes) => Ok(bytes),
            Frame::Json(value) => {
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
        // The underlying session is shared by every device of the account;
        // it is torn down once by the hub, not per coordinator.
        debug!(duid = %self.duid, "cloud link released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn mqtt_credentials_from_token_blob() {
        let token = json!({
            "token": "opaque",
            "mqtt_user": "u123",
            "mqtt_password": "p456",
        });
        assert_eq!(
            mqtt_credentials(&token),
            Some(("u123".to_string(), "p456".to_string()))
        );
        assert_eq!(mqtt_credentials(&json!({"token": "opaque"})), None);
    }

    #[test]
    fn replies_route_by_topic_suffix() {
        let pending: PendingMap = Arc::default();
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, tx);

        route_reply(
            &pending,
            "devices/abc/response/7",
            &Frame::Binary(vec![1, 2]).encode(),
        );
        assert_eq!(rx.try_recv().unwrap(), Frame::Binary(vec![1, 2]));
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_topics_are_ignored() {
        let pending: PendingMap = Arc::default();
        route_reply(&pending, "devices/abc/other", b"\x00{}");
        route_reply(&pending, "devices/abc/response/99", b"\x00{}");
        assert!(pending.lock().unwrap().is_empty());
    }
}
