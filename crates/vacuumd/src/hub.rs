//! Account session owner.
//!
//! The hub discovers the account's devices, constructs one coordinator per
//! device bound to a local transport and the shared cloud connection, seeds
//! map renderers, and runs the per-device polling loops. Entities are handed
//! direct references to their coordinator; there is no ambient registry.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::account::AccountClient;
use crate::account::SessionCredentials;
use crate::coordinator::Coordinator;
use crate::coordinator::SCAN_INTERVAL;
use crate::coordinator::VERIFY_EVERY_TICKS;
use crate::device::PropertySnapshot;
use crate::map::build_device_maps;
use crate::map::GridMapCodec;
use crate::map::MapCodec;
use crate::map::MapRenderer;
use crate::map::RenderError;
use crate::menu::MenuDevice;
use crate::menu::MenuView;
use crate::options::OptionsStore;
use crate::transport::CloudTransport;
use crate::transport::LocalTransport;
use crate::transport::Transport;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ImageServeError {
    #[error("unknown device")]
    UnknownDevice,

    #[error("unknown map")]
    UnknownMap,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

/// One device under management.
pub struct DeviceEntry {
    pub coordinator: Arc<Coordinator>,
    renderers: HashMap<u32, Mutex<MapRenderer>>,
    poll_task: JoinHandle<()>,
}

impl DeviceEntry {
    /// Serve the rendered PNG for one of this device's maps.
    ///
    /// The cached image is served unconditionally unless the renderer's
    /// three-condition gate says a refresh is due; then fresh bytes are
    /// fetched under the device's map-load lock and re-rendered. A render
    /// failure propagates for this request only.
    pub async fn map_image(&self, map_id: u32) -> Result<Vec<u8>, ImageServeError> {
        let renderer = self
            .renderers
            .get(&map_id)
            .ok_or(ImageServeError::UnknownMap)?;
        let mut renderer = renderer.lock().await;

        let (snapshot, current_map) = self.coordinator.view().await;
        if renderer.should_refresh_cache(&snapshot, current_map) {
            let _guard = self.coordinator.lock_map_loads().await;
            let raw = self.coordinator.fetch_map_bytes().await?;
            renderer.render(&raw)?;
        }
        Ok(renderer.cached_image().to_vec())
    }

    pub fn map_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.renderers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Status view of one device, served by the HTTP API.
#[derive(Debug, Serialize)]
pub struct DeviceStatus {
    pub duid: String,
    pub name: String,
    pub model: String,
    pub transport: &'static str,
    pub active_map: Option<u32>,
    pub maps: HashMap<u32, String>,
    pub properties: PropertySnapshot,
}

pub struct Hub {
    devices: HashMap<String, DeviceEntry>,
    cloud: Arc<CloudTransport>,
    shutdown_tx: watch::Sender<bool>,
}

impl Hub {
    /// Authenticate-adjacent setup: discover devices, stand each one up,
    /// spawn its polling loop.
    ///
    /// A device that fails setup is logged and skipped; it never takes the
    /// other devices down with it.
    pub async fn bootstrap(
        account: &AccountClient,
        session: &SessionCredentials,
        options: &OptionsStore,
    ) -> anyhow::Result<Self> {
        let descriptors = account
            .get_home_data(session)
            .await
            .context("device discovery failed")?;
        info!(devices = descriptors.len(), "discovered devices");

        let cloud = CloudTransport::connect(session).context("cloud connection failed")?;
        let (shutdown_tx, _) = watch::channel(false);
        let codec: Arc<dyn MapCodec> = Arc::new(GridMapCodec);

        let mut devices = HashMap::new();
        for descriptor in descriptors {
            let duid = descriptor.duid.clone();
            let Some(ip) = descriptor.ip.clone() else {
                warn!(duid = %duid, "device reported no LAN address, skipping");
                continue;
            };

            let cloud_link = match cloud.device_link(&duid).await {
                Ok(link) => link,
                Err(e) => {
                    error!(duid = %duid, "cloud link setup failed: {e}");
                    continue;
                }
            };
            let coordinator = Arc::new(Coordinator::new(
                descriptor,
                Arc::new(LocalTransport::new(&ip)) as Arc<dyn Transport>,
                cloud_link as Arc<dyn Transport>,
            ));

            // Select the transport up front, then take the first snapshot.
            coordinator.verify_transport().await;
            let mut renderers = HashMap::new();
            match coordinator.refresh().await {
                Ok(_) => {
                    if let Err(e) = coordinator.get_maps().await {
                        warn!(duid = %duid, "map list fetch failed: {e}");
                    }
                    if !coordinator.maps().await.is_empty() {
                        match build_device_maps(&coordinator, options, Arc::clone(&codec)).await
                        {
                            Ok(seeded) => {
                                renderers =
                                    seeded.into_iter().map(|(k, v)| (k, Mutex::new(v))).collect()
                            }
                            Err(e) => warn!(duid = %duid, "map snapshot pass failed: {e}"),
                        }
                    }
                }
                // Degraded start: keep polling, maps stay unavailable.
                Err(e) => warn!(duid = %duid, "first refresh failed: {e}"),
            }

            let poll_task = spawn_polling(Arc::clone(&coordinator), shutdown_tx.subscribe());
            devices.insert(
                duid,
                DeviceEntry {
                    coordinator,
                    renderers,
                    poll_task,
                },
            );
        }

        Ok(Self {
            devices,
            cloud,
            shutdown_tx,
        })
    }

    pub fn device(&self, duid: &str) -> Option<&DeviceEntry> {
        self.devices.get(duid)
    }

    pub async fn map_image(&self, duid: &str, map_id: u32) -> Result<Vec<u8>, ImageServeError> {
        self.device(duid)
            .ok_or(ImageServeError::UnknownDevice)?
            .map_image(map_id)
            .await
    }

    pub async fn device_statuses(&self) -> Vec<DeviceStatus> {
        let mut statuses = Vec::with_capacity(self.devices.len());
        for entry in self.devices.values() {
            let descriptor = entry.coordinator.descriptor();
            let (properties, active_map) = entry.coordinator.view().await;
            statuses.push(DeviceStatus {
                duid: descriptor.duid.clone(),
                name: descriptor.name.clone(),
                model: descriptor.model.clone(),
                transport: if entry.coordinator.using_local().await {
                    "local"
                } else {
                    "cloud"
                },
                active_map,
                maps: entry.coordinator.maps().await,
                properties,
            });
        }
        statuses.sort_by(|a, b| a.duid.cmp(&b.duid));
        statuses
    }

    /// Menu view over the current devices, for the options navigation.
    pub async fn menu_view(&self) -> MenuView {
        let mut devices = Vec::with_capacity(self.devices.len());
        for entry in self.devices.values() {
            let descriptor = entry.coordinator.descriptor();
            let mut maps: Vec<(u32, String)> =
                entry.coordinator.maps().await.into_iter().collect();
            maps.sort_by_key(|(id, _)| *id);
            devices.push(MenuDevice {
                duid: descriptor.duid.clone(),
                name: descriptor.name.clone(),
                maps,
            });
        }
        devices.sort_by(|a, b| a.duid.cmp(&b.duid));
        MenuView { devices }
    }

    /// Stop polling, release every coordinator, tear down the cloud session.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (duid, entry) in self.devices {
            if let Err(e) = entry.poll_task.await {
                // Cancellation during shutdown is expected.
                if !e.is_cancelled() {
                    warn!(duid = %duid, "poll task ended abnormally: {e}");
                }
            }
            entry.coordinator.release().await;
        }
        self.cloud.shutdown().await;
        info!("hub shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::DeviceDescriptor;
    use crate::device::StatusProps;
    use crate::map::codec::encode_test_map;
    use crate::map::codec::ColorPalette;
    use crate::map::codec::ImageConfig;
    use crate::map::codec::Sizes;
    use crate::map::Drawable;
    use crate::map::CACHE_INTERVAL;
    use crate::transport::mock::MockTransport;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            duid: "dev1".to_string(),
            name: "Vacuum".to_string(),
            model: "vacuum.v2".to_string(),
            fw_version: "1.0".to_string(),
            ip: Some("192.0.2.4".to_string()),
            mac: None,
        }
    }

    /// Entry whose device reports the given cleaning state on map 0.
    async fn entry(in_cleaning: u8) -> (DeviceEntry, Arc<MockTransport>) {
        let local = Arc::new(MockTransport::new());
        *local.map_bytes.lock().unwrap() = encode_test_map(2, 2, &[2u8; 4]);
        local.push_properties(PropertySnapshot {
            status: Some(StatusProps {
                map_status: Some(3),
                in_cleaning: Some(in_cleaning),
                ..Default::default()
            }),
            ..Default::default()
        });
        let cloud = Arc::new(MockTransport::new());
        let coordinator = Arc::new(Coordinator::new(
            descriptor(),
            Arc::clone(&local) as Arc<dyn Transport>,
            cloud as Arc<dyn Transport>,
        ));
        coordinator.refresh().await.unwrap();

        let mut renderer = MapRenderer::new(
            0,
            "Ground floor".to_string(),
            Arc::new(GridMapCodec),
            ColorPalette::default(),
            Sizes::default(),
            vec![Drawable::Path],
            ImageConfig::default(),
        );
        renderer.render(&encode_test_map(2, 2, &[2u8; 4])).unwrap();

        let mut renderers = HashMap::new();
        renderers.insert(0, Mutex::new(renderer));
        let entry = DeviceEntry {
            coordinator,
            renderers,
            poll_task: tokio::spawn(async {}),
        };
        (entry, local)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_device_serves_cache_without_network_calls() {
        let (entry, local) = entry(0).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let first = entry.map_image(0).await.unwrap();
        let second = entry.map_image(0).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(*local.map_bytes_calls.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cache_on_cleaning_active_map_refetches() {
        let (entry, local) = entry(1).await;
        tokio::time::advance(CACHE_INTERVAL + Duration::from_secs(1)).await;

        entry.map_image(0).await.unwrap();
        assert_eq!(*local.map_bytes_calls.lock().unwrap(), 1);

        // Immediately after a refresh the gate is closed again.
        entry.map_image(0).await.unwrap();
        assert_eq!(*local.map_bytes_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_map_is_a_request_error() {
        let (entry, _) = entry(0).await;
        assert!(matches!(
            entry.map_image(9).await,
            Err(ImageServeError::UnknownMap)
        ));
    }
}

/// Run one device's refresh loop until shutdown.
///
/// Ticks are strictly sequential: the body awaits each refresh to completion
/// before the interval yields the next tick. Every
/// [`VERIFY_EVERY_TICKS`]th tick also probes the local transport.
fn spawn_polling(
    coordinator: Arc<Coordinator>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    ticks += 1;
                    if ticks % VERIFY_EVERY_TICKS == 0 {
                        coordinator.verify_transport().await;
                    }
                    if let Err(e) = coordinator.refresh().await {
                        // Soft failure: report and keep ticking.
                        warn!(
                            duid = %coordinator.descriptor().duid,
                            "refresh tick failed: {e}"
                        );
                    }
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }
    })
}
