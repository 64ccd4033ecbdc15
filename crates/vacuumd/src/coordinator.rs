//! Per-device polling coordinator.
//!
//! Owns one device's live state: the selected transport, the merged property
//! snapshot, the active map id and the map registry. The hub drives it on a
//! fixed interval; ticks for one device are strictly sequential because a
//! single task awaits each refresh to completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tracing::debug;
use tracing::warn;

use crate::device::DeviceDescriptor;
use crate::device::PropertySnapshot;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::transport::TransportHandle;

/// Fixed refresh cadence per device.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Refresh ticks between opportunistic local liveness probes.
pub const VERIFY_EVERY_TICKS: u64 = 10;

/// Consecutive local refresh failures that force the cloud fallback.
const MAX_LOCAL_FAILURES: u32 = 3;

/// A refresh tick failed. Recoverable; the loop keeps ticking.
#[derive(Debug, Error)]
#[error("device update failed: {0}")]
pub struct UpdateFailed(#[from] pub TransportError);

struct CoordinatorState {
    handle: TransportHandle,
    props: PropertySnapshot,
    current_map: Option<u32>,
    maps: HashMap<u32, String>,
    local_failures: u32,
    released: bool,
}

pub struct Coordinator {
    descriptor: DeviceDescriptor,
    /// Shared account connection, kept for the one-way fallback.
    cloud: Arc<dyn Transport>,
    state: Mutex<CoordinatorState>,
    /// Serializes map-load sequences (snapshot builder, render refetch)
    /// against each other; the device holds one loaded map at a time.
    map_load_lock: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        descriptor: DeviceDescriptor,
        local: Arc<dyn Transport>,
        cloud: Arc<dyn Transport>,
    ) -> Self {
        Self {
            descriptor,
            cloud,
            state: Mutex::new(CoordinatorState {
                handle: TransportHandle::Local(local),
                props: PropertySnapshot::default(),
                current_map: None,
                maps: HashMap::new(),
                local_failures: 0,
                released: false,
            }),
            map_load_lock: Mutex::new(()),
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Fetch properties over the selected transport and merge them in.
    ///
    /// The merge is additive, so a partial payload never drops fields. The
    /// active map id is recomputed only when the merged snapshot carries a
    /// map flag; otherwise the previous value stands.
    pub async fn refresh(&self) -> Result<PropertySnapshot, UpdateFailed> {
        let transport = {
            let state = self.state.lock().await;
            if state.released {
                return Err(UpdateFailed(TransportError::Disconnected));
            }
            state.handle.transport()
        };

        match transport.get_properties().await {
            Ok(incoming) => {
                let mut state = self.state.lock().await;
                state.local_failures = 0;
                state.props.merge(incoming);
                if let Some(map_id) = state.props.status.as_ref().and_then(|s| s.active_map_id()) {
                    state.current_map = Some(map_id);
                }
                Ok(state.props.clone())
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                if state.handle.is_local() {
                    state.local_failures += 1;
                    if state.local_failures >= MAX_LOCAL_FAILURES {
                        self.downgrade_to_cloud(&mut state);
                    }
                }
                Err(UpdateFailed(e))
            }
        }
    }

    /// Probe the preferred local transport; on failure, fall back to cloud.
    ///
    /// The fallback is one-way for the session: a later successful local
    /// ping does not re-promote.
    pub async fn verify_transport(&self) {
        let local = {
            let state = self.state.lock().await;
            if !state.handle.is_local() {
                return;
            }
            state.handle.transport()
        };

        if let Err(e) = local.ping().await {
            debug!(duid = %self.descriptor.duid, "local liveness probe failed: {e}");
            let mut state = self.state.lock().await;
            // Re-check: a concurrent failure path may have switched already.
            if state.handle.is_local() {
                self.downgrade_to_cloud(&mut state);
            }
        }
    }

    fn downgrade_to_cloud(&self, state: &mut CoordinatorState) {
        warn!(
            duid = %self.descriptor.duid,
            "local connection lost, using the cloud connection for the rest of the \
             session; sustained cloud use can lead to rate limiting, make the vacuum \
             reachable from this host and restart to go back to local"
        );
        state.handle = TransportHandle::Cloud(Arc::clone(&self.cloud));
        state.local_failures = 0;
    }

    /// Disconnect the selected transport. Idempotent, callable concurrently
    /// with an in-flight refresh: the refresh observes `Disconnected` from
    /// the transport rather than using freed state.
    pub async fn release(&self) {
        let transport = {
            let mut state = self.state.lock().await;
            if state.released {
                return;
            }
            state.released = true;
            state.handle.transport()
        };
        if let Err(e) = transport.disconnect().await {
            debug!(duid = %self.descriptor.duid, "disconnect: {e}");
        }
    }

    /// Query the device's map list and replace the registry wholesale.
    ///
    /// Only a non-empty, well-formed response overwrites; an empty list or
    /// an error leaves the last known registry intact.
    pub async fn get_maps(&self) -> Result<(), TransportError> {
        let transport = self.state.lock().await.handle.transport();
        let maps = transport.get_map_list().await?;
        if maps.is_empty() {
            debug!(duid = %self.descriptor.duid, "device reported no maps, keeping prior registry");
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state.maps = maps.into_iter().collect();
        Ok(())
    }

    /// Stable options-store key for a (device, map, category) triple.
    pub fn config_key_for_map(&self, map_id: u32, category: &str) -> String {
        format!("device.{}.map.{}.{}", self.descriptor.duid, map_id, category)
    }

    pub async fn current_map(&self) -> Option<u32> {
        self.state.lock().await.current_map
    }

    pub async fn maps(&self) -> HashMap<u32, String> {
        self.state.lock().await.maps.clone()
    }

    pub async fn snapshot(&self) -> PropertySnapshot {
        self.state.lock().await.props.clone()
    }

    /// Snapshot plus active map in one lock acquisition, for cache checks.
    pub async fn view(&self) -> (PropertySnapshot, Option<u32>) {
        let state = self.state.lock().await;
        (state.props.clone(), state.current_map)
    }

    pub async fn using_local(&self) -> bool {
        self.state.lock().await.handle.is_local()
    }

    /// Hold this guard across any load-map/fetch sequence for this device.
    pub async fn lock_map_loads(&self) -> MutexGuard<'_, ()> {
        self.map_load_lock.lock().await
    }

    /// Issue a load-map command over the selected transport.
    pub async fn load_map(&self, map_id: u32) -> Result<(), TransportError> {
        let transport = self.state.lock().await.handle.transport();
        transport.load_map(map_id).await
    }

    /// Fetch the raw bytes of the currently loaded map.
    pub async fn fetch_map_bytes(&self) -> Result<Vec<u8>, TransportError> {
        let transport = self.state.lock().await.handle.transport();
        transport.get_map_bytes().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StatusProps;
    use crate::transport::mock::MockTransport;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            duid: "abc123".to_string(),
            name: "Front hall".to_string(),
            model: "vacuum.v2".to_string(),
            fw_version: "4.1.2".to_string(),
            ip: Some("192.0.2.10".to_string()),
            mac: Some("aa:bb:cc:dd:ee:ff".to_string()),
        }
    }

    fn coordinator() -> (Coordinator, Arc<MockTransport>, Arc<MockTransport>) {
        let local = Arc::new(MockTransport::new());
        let cloud = Arc::new(MockTransport::new());
        let coordinator = Coordinator::new(
            descriptor(),
            Arc::clone(&local) as Arc<dyn Transport>,
            Arc::clone(&cloud) as Arc<dyn Transport>,
        );
        (coordinator, local, cloud)
    }

    fn status_snapshot(status: StatusProps) -> PropertySnapshot {
        PropertySnapshot {
            status: Some(status),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn refresh_sets_active_map_from_flag() {
        let (coordinator, local, _) = coordinator();
        local.push_properties(status_snapshot(StatusProps {
            map_status: Some(7),
            ..Default::default()
        }));

        coordinator.refresh().await.unwrap();
        assert_eq!(coordinator.current_map().await, Some(1));
    }

    #[tokio::test]
    async fn refresh_without_flag_keeps_previous_active_map() {
        let (coordinator, local, _) = coordinator();
        local.push_properties(status_snapshot(StatusProps {
            map_status: Some(11),
            ..Default::default()
        }));
        coordinator.refresh().await.unwrap();
        assert_eq!(coordinator.current_map().await, Some(2));

        // Partial payload carrying only a battery reading.
        local.push_properties(status_snapshot(StatusProps {
            battery: Some(42),
            ..Default::default()
        }));
        coordinator.refresh().await.unwrap();

        assert_eq!(coordinator.current_map().await, Some(2));
        let snapshot = coordinator.snapshot().await;
        let status = snapshot.status.unwrap();
        assert_eq!(status.battery, Some(42));
        assert_eq!(status.map_status, Some(11));
    }

    #[tokio::test]
    async fn failed_refresh_reports_and_preserves_state() {
        let (coordinator, local, _) = coordinator();
        local.push_properties(status_snapshot(StatusProps {
            battery: Some(90),
            ..Default::default()
        }));
        coordinator.refresh().await.unwrap();

        local.push_failure();
        let err = coordinator.refresh().await.unwrap_err();
        assert!(matches!(err.0, TransportError::Timeout));
        assert_eq!(
            coordinator.snapshot().await.status.unwrap().battery,
            Some(90)
        );
        assert!(coordinator.using_local().await);
    }

    #[tokio::test]
    async fn three_consecutive_failures_downgrade_to_cloud() {
        let (coordinator, local, _) = coordinator();
        for _ in 0..3 {
            local.push_failure();
            let _ = coordinator.refresh().await;
        }
        assert!(!coordinator.using_local().await);
    }

    #[tokio::test]
    async fn failure_streak_resets_on_success() {
        let (coordinator, local, _) = coordinator();
        local.push_failure();
        local.push_failure();
        let _ = coordinator.refresh().await;
        let _ = coordinator.refresh().await;
        local.push_properties(PropertySnapshot::default());
        coordinator.refresh().await.unwrap();
        local.push_failure();
        let _ = coordinator.refresh().await;
        assert!(coordinator.using_local().await);
    }

    #[tokio::test]
    async fn failed_probe_downgrades_and_stays_downgraded() {
        let (coordinator, local, _) = coordinator();
        *local.ping_ok.lock().unwrap() = false;
        coordinator.verify_transport().await;
        assert!(!coordinator.using_local().await);

        // Device comes back; the session still stays on cloud.
        *local.ping_ok.lock().unwrap() = true;
        coordinator.verify_transport().await;
        assert!(!coordinator.using_local().await);
    }

    #[tokio::test]
    async fn refreshes_use_cloud_after_downgrade() {
        let (coordinator, local, cloud) = coordinator();
        *local.ping_ok.lock().unwrap() = false;
        coordinator.verify_transport().await;

        cloud.push_properties(status_snapshot(StatusProps {
            battery: Some(55),
            ..Default::default()
        }));
        coordinator.refresh().await.unwrap();
        assert_eq!(
            coordinator.snapshot().await.status.unwrap().battery,
            Some(55)
        );
        assert!(local.properties.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_map_list_keeps_prior_registry() {
        let (coordinator, local, _) = coordinator();
        *local.map_list.lock().unwrap() = vec![(0, "Ground floor".to_string())];
        coordinator.get_maps().await.unwrap();
        assert_eq!(coordinator.maps().await.len(), 1);

        local.map_list.lock().unwrap().clear();
        coordinator.get_maps().await.unwrap();
        assert_eq!(
            coordinator.maps().await.get(&0).map(String::as_str),
            Some("Ground floor")
        );
    }

    #[tokio::test]
    async fn nonempty_map_list_replaces_wholesale() {
        let (coordinator, local, _) = coordinator();
        *local.map_list.lock().unwrap() = vec![(0, "Old".to_string()), (1, "Gone".to_string())];
        coordinator.get_maps().await.unwrap();

        *local.map_list.lock().unwrap() = vec![(2, "New".to_string())];
        coordinator.get_maps().await.unwrap();

        let maps = coordinator.maps().await;
        assert_eq!(maps.len(), 1);
        assert_eq!(maps.get(&2).map(String::as_str), Some("New"));
    }

    #[tokio::test]
    async fn release_is_idempotent_and_blocks_refresh() {
        let (coordinator, local, _) = coordinator();
        coordinator.release().await;
        coordinator.release().await;
        assert!(*local.disconnected.lock().unwrap());

        let err = coordinator.refresh().await.unwrap_err();
        assert!(matches!(err.0, TransportError::Disconnected));
    }

    #[test]
    fn config_keys_are_deterministic_and_namespaced() {
        let (coordinator, _, _) = coordinator();
        let key = coordinator.config_key_for_map(2, "image_config");
        assert_eq!(key, "device.abc123.map.2.image_config");
        assert_eq!(key, coordinator.config_key_for_map(2, "image_config"));
        assert_ne!(key, coordinator.config_key_for_map(3, "image_config"));
        assert_ne!(key, coordinator.config_key_for_map(2, "room_colors"));
    }
}
