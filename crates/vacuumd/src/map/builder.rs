//! One-time map snapshot pass at device setup.
//!
//! A device can hold only one map loaded for retrieval at a time, so seeding
//! a renderer per stored map is a strictly sequential switch/settle/fetch
//! walk. The walk visits the currently active map first (no switch needed for
//! the common single-map case) and restores the originally active map at the
//! end so the pass is invisible to the vendor app.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use tracing::info;

use super::codec::ColorPalette;
use super::codec::MapCodec;
use super::render::MapRenderer;
use super::render::RenderError;
use crate::coordinator::Coordinator;
use crate::options::OptionsStore;
use crate::options::CAT_IMAGE_CONFIG;
use crate::options::CAT_ROOM_COLORS;
use crate::transport::TransportError;

/// Mandatory wait after a load-map command before map bytes are valid.
/// Reading earlier yields stale or error bytes.
pub const SETTLE_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum BuilderError {
    /// The coordinator has not yet observed a map flag; run a refresh first.
    #[error("active map is unknown, cannot sequence map loads")]
    ActiveMapUnknown,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("seeding map {map_id} failed: {source}")]
    Render {
        map_id: u32,
        source: RenderError,
    },
}

/// Seed one primed renderer per stored map of a device.
///
/// Holds the coordinator's map-load lock for the whole walk, so no competing
/// load-map command can interleave.
pub async fn build_device_maps(
    coordinator: &Coordinator,
    options: &OptionsStore,
    codec: Arc<dyn MapCodec>,
) -> Result<HashMap<u32, MapRenderer>, BuilderError> {
    let _guard = coordinator.lock_map_loads().await;

    let active_map = coordinator
        .current_map()
        .await
        .ok_or(BuilderError::ActiveMapUnknown)?;

    // Active map first, remaining maps in id order for determinism.
    let mut maps: Vec<(u32, String)> = coordinator.maps().await.into_iter().collect();
    maps.sort_by_key(|(map_id, _)| (*map_id != active_map, *map_id));

    let duid = coordinator.descriptor().duid.clone();
    let sizes = options.sizes();
    let drawables = options.drawables();

    let mut renderers = HashMap::new();
    for (map_id, map_name) in &maps {
        if *map_id != active_map {
            // Switch and wait out the settle interval; only needed when the
            // device holds more than one map.
            debug!(duid = %duid, map_id, "loading map for snapshot");
            coordinator.load_map(*map_id).await?;
            tokio::time::sleep(SETTLE_INTERVAL).await;
        }
        let raw = coordinator.fetch_map_bytes().await?;

        let mut palette = ColorPalette::default();
        palette.room_colors =
            options.room_colors(&coordinator.config_key_for_map(*map_id, CAT_ROOM_COLORS));
        let image_config =
            options.image_config(&coordinator.config_key_for_map(*map_id, CAT_IMAGE_CONFIG));

        let mut renderer = MapRenderer::new(
            *map_id,
            map_name.clone(),
            Arc::clone(&codec),
            palette,
            sizes.clone(),
            drawables.clone(),
            image_config,
        );
        renderer.render(&raw).map_err(|source| BuilderError::Render {
            map_id: *map_id,
            source,
        })?;
        renderers.insert(*map_id, renderer);
    }

    if maps.len() > 1 {
        // Put the device back on the map the user had selected.
        coordinator.load_map(active_map).await?;
    }

    info!(duid = %duid, maps = renderers.len(), "seeded map renderers");
    Ok(renderers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceDescriptor;
    use crate::device::PropertySnapshot;
    use crate::device::StatusProps;
    use crate::map::codec::encode_test_map;
    use crate::map::codec::GridMapCodec;
    use crate::transport::mock::MockTransport;
    use crate::transport::Transport;

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

    /// Coordinator whose device reports map flag for `active` and carries
    /// the given map list.
    async fn seeded_coordinator(
        active: u32,
        maps: Vec<(u32, String)>,
    ) -> (Coordinator, Arc<MockTransport>) {
        let local = Arc::new(MockTransport::new());
        *local.map_list.lock().unwrap() = maps;
        *local.map_bytes.lock().unwrap() = encode_test_map(2, 2, &[2u8; 4]);
        local.push_properties(PropertySnapshot {
            status: Some(StatusProps {
                map_status: Some(active as i64 * 4 + 3),
                ..Default::default()
            }),
            ..Default::default()
        });

        let cloud = Arc::new(MockTransport::new());
        let coordinator = Coordinator::new(
            descriptor(),
            Arc::clone(&local) as Arc<dyn Transport>,
            cloud as Arc<dyn Transport>,
        );
        coordinator.refresh().await.unwrap();
        coordinator.get_maps().await.unwrap();
        (coordinator, local)
    }

    #[tokio::test(start_paused = true)]
    async fn three_maps_two_switches_one_restore() {
        let (coordinator, local) = seeded_coordinator(
            0,
            vec![
                (0, "A".to_string()),
                (1, "B".to_string()),
                (2, "C".to_string()),
            ],
        )
        .await;

        let renderers =
            build_device_maps(&coordinator, &OptionsStore::ephemeral(), Arc::new(GridMapCodec))
                .await
                .unwrap();

        assert_eq!(renderers.len(), 3);
        // Traversal switches to B and C, then one restore back to A.
        assert_eq!(*local.loaded_maps.lock().unwrap(), vec![1, 2, 0]);
        assert_eq!(*local.map_bytes_calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn active_map_is_visited_first_even_when_not_lowest_id() {
        let (coordinator, local) = seeded_coordinator(
            2,
            vec![
                (0, "A".to_string()),
                (1, "B".to_string()),
                (2, "C".to_string()),
            ],
        )
        .await;

        build_device_maps(&coordinator, &OptionsStore::ephemeral(), Arc::new(GridMapCodec))
            .await
            .unwrap();

        // No switch for the active map 2; then 0, 1, and the restore to 2.
        assert_eq!(*local.loaded_maps.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_map_issues_no_commands() {
        let (coordinator, local) =
            seeded_coordinator(0, vec![(0, "Only".to_string())]).await;

        let renderers =
            build_device_maps(&coordinator, &OptionsStore::ephemeral(), Arc::new(GridMapCodec))
                .await
                .unwrap();

        assert_eq!(renderers.len(), 1);
        assert!(local.loaded_maps.lock().unwrap().is_empty());
        assert_eq!(*local.map_bytes_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_active_map_is_an_error() {
        let local = Arc::new(MockTransport::new());
        let cloud = Arc::new(MockTransport::new());
        let coordinator = Coordinator::new(
            descriptor(),
            local as Arc<dyn Transport>,
            cloud as Arc<dyn Transport>,
        );

        let err =
            build_device_maps(&coordinator, &OptionsStore::ephemeral(), Arc::new(GridMapCodec))
                .await
                .unwrap_err();
        assert!(matches!(err, BuilderError::ActiveMapUnknown));
    }
}
