//! Per-map renderer with a bounded-refresh cache.
//!
//! One renderer exists per (device, map) pair. The cached PNG is served
//! unconditionally unless the map is the device's active map, the device is
//! actively cleaning, and the cache has aged past the refresh interval.
//! That triple gate is the only trigger for re-fetching bytes from the
//! device, which bounds network calls.

use std::sync::Arc;
use std::time::Duration;

use image::codecs::png::PngEncoder;
use thiserror::Error;
use tokio::time::Instant;

use super::codec::CodecError;
use super::codec::ColorPalette;
use super::codec::Drawable;
use super::codec::ImageConfig;
use super::codec::MapCodec;
use super::codec::RoomInfo;
use super::codec::Sizes;
use crate::device::PropertySnapshot;

/// Minimum age of a cached render before a refresh is considered.
pub const CACHE_INTERVAL: Duration = Duration::from_secs(90);

#[derive(Debug, Error)]
pub enum RenderError {
    /// The codec decoded the payload but produced no drawable image.
    #[error("map decoding produced no image")]
    NoImage,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("png encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

pub struct MapRenderer {
    map_id: u32,
    map_name: String,
    codec: Arc<dyn MapCodec>,
    palette: ColorPalette,
    sizes: Sizes,
    drawables: Vec<Drawable>,
    image_config: ImageConfig,
    cached: Vec<u8>,
    rooms: Vec<RoomInfo>,
    last_rendered: Instant,
}

impl std::fmt::Debug for MapRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapRenderer")
            .field("map_id", &self.map_id)
            .field("map_name", &self.map_name)
            .finish_non_exhaustive()
    }
}

impl MapRenderer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        map_id: u32,
        map_name: String,
        codec: Arc<dyn MapCodec>,
        palette: ColorPalette,
        sizes: Sizes,
        drawables: Vec<Drawable>,
        image_config: ImageConfig,
    ) -> Self {
        Self {
            map_id,
            map_name,
            codec,
            palette,
            sizes,
            drawables,
            image_config,
            cached: Vec::new(),
            rooms: Vec::new(),
            last_rendered: Instant::now(),
        }
    }

    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    pub fn map_name(&self) -> &str {
        &self.map_name
    }

    pub fn rooms(&self) -> &[RoomInfo] {
        &self.rooms
    }

    /// The last rendered PNG. Empty until the first successful render.
    pub fn cached_image(&self) -> &[u8] {
        &self.cached
    }

    /// Decode raw map bytes and replace the cached PNG.
    ///
    /// A decode with no image is a user-visible error; the previous cache is
    /// left in place but not silently substituted for this request.
    pub fn render(&mut self, raw: &[u8]) -> Result<(), RenderError> {
        let decoded = self.codec.decode(
            raw,
            &self.palette,
            &self.sizes,
            &self.drawables,
            &self.image_config,
        )?;
        let image = decoded.image.ok_or(RenderError::NoImage)?;

        let mut png = Vec::new();
        image.write_with_encoder(PngEncoder::new(&mut png))?;

        self.cached = png;
        self.rooms = decoded.rooms;
        self.last_rendered = Instant::now();
        Ok(())
    }

    /// Whether a fresh fetch from the device is warranted.
    ///
    /// True iff this map is the active map, the device is cleaning, and the
    /// cache is older than [`CACHE_INTERVAL`]. All three must hold.
    pub fn should_refresh_cache(
        &self,
        snapshot: &PropertySnapshot,
        current_map: Option<u32>,
    ) -> bool {
        current_map == Some(self.map_id)
            && snapshot.is_cleaning()
            && self.last_rendered.elapsed() > CACHE_INTERVAL
    }
}
