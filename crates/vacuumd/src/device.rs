//! Device identity and live property state.
//!
//! `DeviceDescriptor` is the immutable identity captured at discovery time.
//! `PropertySnapshot` is the coordinator-owned aggregate of last observed
//! operational properties; refreshes merge into it additively so a partial
//! payload never wipes previously known fields.

use serde::Deserialize;
use serde::Serialize;

/// Immutable identity of a discovered vacuum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique device id assigned by the vendor account.
    pub duid: String,

    /// User-assigned display name.
    pub name: String,

    /// Model identifier, e.g. "vacuum.v2".
    pub model: String,

    /// Firmware version string.
    pub fw_version: String,

    /// LAN address for the local transport, if the device reported one.
    pub ip: Option<String>,

    /// Network MAC, if the device reported one.
    pub mac: Option<String>,
}

/// Status block of a property payload.
///
/// Every field is optional: devices omit fields they have no update for and
/// the merge below keeps the previous value in that case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusProps {
    /// Vendor state code (charging, cleaning, paused, ...).
    pub state_code: Option<u8>,

    /// Battery percentage.
    pub battery: Option<u8>,

    /// Firmware-encoded map flag. The active map id is derived from it,
    /// see [`StatusProps::active_map_id`].
    pub map_status: Option<i64>,

    /// Non-zero while the device is actively cleaning.
    pub in_cleaning: Option<u8>,

    /// Vendor error code, 0 when healthy.
    pub error_code: Option<u32>,
}

/// Consumable wear levels, in seconds of use remaining.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumableProps {
    pub main_brush_left: Option<u32>,
    pub side_brush_left: Option<u32>,
    pub filter_left: Option<u32>,
    pub sensor_dirty_left: Option<u32>,
}

/// Lifetime cleaning totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanSummary {
    pub clean_time: Option<u64>,
    pub clean_area: Option<u64>,
    pub clean_count: Option<u64>,
}

/// Mutable aggregate of a device's last observed properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub status: Option<StatusProps>,
    pub consumables: Option<ConsumableProps>,
    pub clean_summary: Option<CleanSummary>,
}

impl StatusProps {
    /// Derive the active map id from the firmware map flag.
    ///
    /// Firmware encodes the flag as `active_map_id * 4 + 3`, so the inverse
    /// is integer division of `(map_status - 3) / 4`.
    pub fn active_map_id(&self) -> Option<u32> {
        self.map_status.map(|flag| ((flag - 3) / 4).max(0) as u32)
    }

    fn merge(&mut self, incoming: StatusProps) {
        merge_field(&mut self.state_code, incoming.state_code);
        merge_field(&mut self.battery, incoming.battery);
        merge_field(&mut self.map_status, incoming.map_status);
        merge_field(&mut self.in_cleaning, incoming.in_cleaning);
        merge_field(&mut self.error_code, incoming.error_code);
    }
}

impl ConsumableProps {
    fn merge(&mut self, incoming: ConsumableProps) {
        merge_field(&mut self.main_brush_left, incoming.main_brush_left);
        merge_field(&mut self.side_brush_left, incoming.side_brush_left);
        merge_field(&mut self.filter_left, incoming.filter_left);
        merge_field(&mut self.sensor_dirty_left, incoming.sensor_dirty_left);
    }
}

impl CleanSummary {
    fn merge(&mut self, incoming: CleanSummary) {
        merge_field(&mut self.clean_time, incoming.clean_time);
        merge_field(&mut self.clean_area, incoming.clean_area);
        merge_field(&mut self.clean_count, incoming.clean_count);
    }
}

impl PropertySnapshot {
    /// Merge a freshly fetched payload into this snapshot.
    ///
    /// Additive by field: values present in `incoming` overwrite, values
    /// absent from `incoming` are retained. Supports devices that answer
    /// with partial payloads between full refreshes.
    pub fn merge(&mut self, incoming: PropertySnapshot) {
        merge_block(&mut self.status, incoming.status, StatusProps::merge);
        merge_block(
            &mut self.consumables,
            incoming.consumables,
            ConsumableProps::merge,
        );
        merge_block(
            &mut self.clean_summary,
            incoming.clean_summary,
            CleanSummary::merge,
        );
    }

    /// Whether the device is actively cleaning right now.
    pub fn is_cleaning(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.in_cleaning)
            .map(|v| v != 0)
            .unwrap_or(false)
    }
}

fn merge_field<T>(current: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *current = incoming;
    }
}

fn merge_block<T>(current: &mut Option<T>, incoming: Option<T>, merge: fn(&mut T, T)) {
    match (current.as_mut(), incoming) {
        (Some(cur), Some(inc)) => merge(cur, inc),
        (None, Some(inc)) => *current = Some(inc),
        (_, None) => {}
    }
}
