//! Map decoding and rasterization.
//!
//! The device encodes its map as a compact grid wire format: a header,
//! one semantic byte per cell, then entity records (robot, charger, path).
//! [`GridMapCodec`] decodes that format and paints it into an RGBA raster
//! according to a visual configuration. Vendor-specific codecs plug in
//! behind the [`MapCodec`] trait.

use std::collections::HashMap;

use image::imageops;
use image::Rgba;
use image::RgbaImage;
use serde::Deserialize;
use serde::Serialize;
use strum::AsRefStr;
use strum::EnumIter;
use thiserror::Error;

pub type Color = [u8; 4];

const MAGIC: &[u8; 4] = b"VMG1";

/// Cell semantics in the grid wire format.
const CELL_OUTSIDE: u8 = 0;
const CELL_WALL: u8 = 1;
const CELL_FLOOR: u8 = 2;
/// Cells `16..=31` are rooms; the room id is `cell - ROOM_BASE`.
const ROOM_BASE: u8 = 16;
const ROOM_MAX: u8 = 31;

/// Entity record tags following the cell grid.
const RECORD_ROBOT: u8 = 1;
const RECORD_CHARGER: u8 = 2;
const RECORD_PATH: u8 = 3;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("map payload is truncated")]
    Truncated,

    #[error("map payload has an unknown magic header")]
    BadMagic,

    #[error("map payload is inconsistent: {0}")]
    Inconsistent(String),
}

/// Drawable map layers, in paint order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Drawable {
    Path,
    Charger,
    VacuumPosition,
}

/// Semantic color role -> RGBA mapping.
#[derive(Debug, Clone)]
pub struct ColorPalette {
    pub outside: Color,
    pub wall: Color,
    pub floor: Color,
    pub path: Color,
    pub charger: Color,
    pub robot: Color,
    /// Per-room overrides; rooms without one cycle the default room colors.
    pub room_colors: HashMap<u8, Color>,
}

/// Default cycle for rooms without an explicit color.
const DEFAULT_ROOM_COLORS: [Color; 8] = [
    [240, 178, 122, 255],
    [130, 224, 170, 255],
    [133, 193, 233, 255],
    [195, 155, 211, 255],
    [247, 220, 111, 255],
    [241, 148, 138, 255],
    [118, 215, 196, 255],
    [174, 182, 191, 255],
];

impl Default for ColorPalette {
    fn default() -> Self {
        Self {
            outside: [0, 0, 0, 0],
            wall: [60, 60, 60, 255],
            floor: [86, 175, 252, 255],
            path: [255, 255, 255, 255],
            charger: [102, 204, 102, 255],
            robot: [235, 235, 235, 255],
            room_colors: HashMap::new(),
        }
    }
}

impl ColorPalette {
    fn room_color(&self, room_id: u8) -> Color {
        self.room_colors
            .get(&room_id)
            .copied()
            .unwrap_or(DEFAULT_ROOM_COLORS[room_id as usize % DEFAULT_ROOM_COLORS.len()])
    }
}

/// Per-object pixel sizes, in grid cells at scale 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Sizes {
    pub robot_radius: f32,
    pub charger_radius: f32,
    pub path_width: f32,
}

impl Default for Sizes {
    fn default() -> Self {
        Self {
            robot_radius: 4.0,
            charger_radius: 4.0,
            path_width: 1.0,
        }
    }
}

/// Fraction of the image to cut from each edge, `0.0..=1.0`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    pub left: f32,
    pub right: f32,
    pub top: f32,
    pub bottom: f32,
}

/// Image transform: scale, rotate, trim. Applied in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub scale: f32,
    /// Rotation in degrees, one of 0, 90, 180, 270.
    pub rotate: u16,
    pub trim: TrimConfig,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            scale: 1.0,
            rotate: 0,
            trim: TrimConfig::default(),
        }
    }
}

/// A room discovered while decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: u8,
    pub cell_count: u32,
}

/// Decode result: a raster (absent when the payload holds no drawable area)
/// plus room metadata.
pub struct DecodedMap {
    pub image: Option<RgbaImage>,
    pub rooms: Vec<RoomInfo>,
}

/// Raw map bytes in, decoded map plus rendered raster out.
pub trait MapCodec: Send + Sync {
    fn decode(
        &self,
        raw: &[u8],
        palette: &ColorPalette,
        sizes: &Sizes,
        drawables: &[Drawable],
        config: &ImageConfig,
    ) -> Result<DecodedMap, CodecError>;
}

/// Codec for the daemon's grid wire format.
pub struct GridMapCodec;

struct Grid {
    width: u32,
    height: u32,
    cells: Vec<u8>,
    robot: Option<(u32, u32)>,
    charger: Option<(u32, u32)>,
    path: Vec<(u32, u32)>,
}

impl MapCodec for GridMapCodec {
    fn decode(
        &self,
        raw: &[u8],
        palette: &ColorPalette,
        sizes: &Sizes,
        drawables: &[Drawable],
        config: &ImageConfig,
    ) -> Result<DecodedMap, CodecError> {
        let grid = parse_grid(raw)?;

        let rooms = count_rooms(&grid);
        if grid.width == 0 || grid.height == 0 {
            return Ok(DecodedMap { image: None, rooms });
        }

        let image = paint(&grid, palette, sizes, drawables, config);
        Ok(DecodedMap {
            image: Some(image),
            rooms,
        })
    }
}

fn parse_grid(raw: &[u8]) -> Result<Grid, CodecError> {
    if raw.len() < 8 {
        return Err(CodecError::Truncated);
    }
    if &raw[0..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let width = u16::from_le_bytes([raw[4], raw[5]]) as u32;
    let height = u16::from_le_bytes([raw[6], raw[7]]) as u32;

    let cell_count = (width * height) as usize;
    let cells_end = 8 + cell_count;
    if raw.len() < cells_end {
        return Err(CodecError::Truncated);
    }
    let cells = raw[8..cells_end].to_vec();

    let mut grid = Grid {
        width,
        height,
        cells,
        robot: None,
        charger: None,
        path: Vec::new(),
    };

    let mut rest = &raw[cells_end..];
    while let Some((&tag, body)) = rest.split_first() {
        rest = body;
        match tag {
            RECORD_ROBOT => {
                let (point, remaining) = read_point(rest)?;
                grid.robot = Some(point);
                rest = remaining;
            }
            RECORD_CHARGER => {
                let (point, remaining) = read_point(rest)?;
                grid.charger = Some(point);
                rest = remaining;
            }
            RECORD_PATH => {
                if rest.len() < 2 {
                    return Err(CodecError::Truncated);
                }
                let count = u16::from_le_bytes([rest[0], rest[1]]) as usize;
                rest = &rest[2..];
                let mut points = Vec::with_capacity(count);
                for _ in 0..count {
                    let (point, remaining) = read_point(rest)?;
                    points.push(point);
                    rest = remaining;
                }
                grid.path = points;
            }
            other => {
                return Err(CodecError::Inconsistent(format!(
                    "unknown record tag {other}"
                )))
            }
        }
    }

    Ok(grid)
}

fn read_point(bytes: &[u8]) -> Result<((u32, u32), &[u8]), CodecError> {
    if bytes.len() < 4 {
        return Err(CodecError::Truncated);
    }
    let x = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
    let y = u16::from_le_bytes([bytes[2], bytes[3]]) as u32;
    Ok(((x, y), &bytes[4..]))
}

fn count_rooms(grid: &Grid) -> Vec<RoomInfo> {
    let mut counts: HashMap<u8, u32> = HashMap::new();
    for &cell in &grid.cells {
        if (ROOM_BASE..=ROOM_MAX).contains(&cell) {
            *counts.entry(cell - ROOM_BASE).or_default() += 1;
        }
    }
    let mut rooms: Vec<RoomInfo> = counts
        .into_iter()
        .map(|(id, cell_count)| RoomInfo { id, cell_count })
        .collect();
    rooms.sort_by_key(|r| r.id);
    rooms
}

fn paint(
    grid: &Grid,
    palette: &ColorPalette,
    sizes: &Sizes,
    drawables: &[Drawable],
    config: &ImageConfig,
) -> RgbaImage {
    let px = config.scale.max(1.0).round() as u32;
    let mut image = RgbaImage::new(grid.width * px, grid.height * px);

    // Base layer: cells.
    for y in 0..grid.height {
        for x in 0..grid.width {
            let cell = grid.cells[(y * grid.width + x) as usize];
            let color = match cell {
                CELL_OUTSIDE => palette.outside,
                CELL_WALL => palette.wall,
                CELL_FLOOR => palette.floor,
                c if (ROOM_BASE..=ROOM_MAX).contains(&c) => palette.room_color(c - ROOM_BASE),
                // Unknown semantics paint as floor rather than failing the map.
                _ => palette.floor,
            };
            fill_block(&mut image, x * px, y * px, px, px, color);
        }
    }

    if drawables.contains(&Drawable::Path) {
        let width = (sizes.path_width * px as f32).max(1.0);
        for pair in grid.path.windows(2) {
            draw_segment(&mut image, pair[0], pair[1], px, width, palette.path);
        }
    }
    if drawables.contains(&Drawable::Charger) {
        if let Some(charger) = grid.charger {
            draw_disc(
                &mut image,
                charger,
                px,
                sizes.charger_radius * px as f32,
                palette.charger,
            );
        }
    }
    if drawables.contains(&Drawable::VacuumPosition) {
        if let Some(robot) = grid.robot {
            draw_disc(
                &mut image,
                robot,
                px,
                sizes.robot_radius * px as f32,
                palette.robot,
            );
        }
    }

    let image = match config.rotate % 360 {
        90 => imageops::rotate90(&image),
        180 => imageops::rotate180(&image),
        270 => imageops::rotate270(&image),
        _ => image,
    };

    trim(image, &config.trim)
}

fn trim(image: RgbaImage, trim: &TrimConfig) -> RgbaImage {
    let (w, h) = image.dimensions();
    let left = (w as f32 * trim.left.clamp(0.0, 1.0)) as u32;
    let right = (w as f32 * trim.right.clamp(0.0, 1.0)) as u32;
    let top = (h as f32 * trim.top.clamp(0.0, 1.0)) as u32;
    let bottom = (h as f32 * trim.bottom.clamp(0.0, 1.0)) as u32;

    let new_w = w.saturating_sub(left + right);
    let new_h = h.saturating_sub(top + bottom);
    if new_w == 0 || new_h == 0 || (new_w == w && new_h == h) {
        return image;
    }
    imageops::crop_imm(&image, left, top, new_w, new_h).to_image()
}

fn fill_block(image: &mut RgbaImage, x0: u32, y0: u32, w: u32, h: u32, color: Color) {
    for y in y0..(y0 + h).min(image.height()) {
        for x in x0..(x0 + w).min(image.width()) {
            image.put_pixel(x, y, Rgba(color));
        }
    }
}

fn draw_disc(image: &mut RgbaImage, center: (u32, u32), px: u32, radius: f32, color: Color) {
    let cx = (center.0 * px + px / 2) as f32;
    let cy = (center.1 * px + px / 2) as f32;
    let r = radius.max(1.0);
    let x_range = ((cx - r).floor().max(0.0) as u32)..((cx + r).ceil() as u32).min(image.width());
    for x in x_range {
        let y_range =
            ((cy - r).floor().max(0.0) as u32)..((cy + r).ceil() as u32).min(image.height());
        for y in y_range {
            let dx = x as f32 + 0.5 - cx;
            let dy = y as f32 + 0.5 - cy;
            if dx * dx + dy * dy <= r * r {
                image.put_pixel(x, y, Rgba(color));
            }
        }
    }
}

fn draw_segment(
    image: &mut RgbaImage,
    from: (u32, u32),
    to: (u32, u32),
    px: u32,
    width: f32,
    color: Color,
) {
    let (x0, y0) = (
        (from.0 * px + px / 2) as f32,
        (from.1 * px + px / 2) as f32,
    );
    let (x1, y1) = ((to.0 * px + px / 2) as f32, (to.1 * px + px / 2) as f32);
    let steps = (x1 - x0).abs().max((y1 - y0).abs()).ceil().max(1.0) as u32;
    let half = (width / 2.0).max(0.5);
    for step in 0..=steps {
        let t = step as f32 / steps as f32;
        let x = x0 + (x1 - x0) * t;
        let y = y0 + (y1 - y0) * t;
        draw_disc_at(image, x, y, half, color);
    }
}

fn draw_disc_at(image: &mut RgbaImage, cx: f32, cy: f32, r: f32, color: Color) {
    let x_range = ((cx - r).floor().max(0.0) as u32)..((cx + r).ceil() as u32).min(image.width());
    for x in x_range {
        let y_range =
            ((cy - r).floor().max(0.0) as u32)..((cy + r).ceil() as u32).min(image.height());
        for y in y_range {
            let dx = x as f32 + 0.5 - cx;
            let dy = y as f32 + 0.5 - cy;
            if dx * dx + dy * dy <= r * r {
                image.put_pixel(x, y, Rgba(color));
            }
        }
    }
}

/// Build a well-formed grid payload. Shared by tests across modules.
#[cfg(test)]
pub(crate) fn encode_test_map(width: u16, height: u16, cells: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(cells);
    out
}
