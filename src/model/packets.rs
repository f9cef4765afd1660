//! Packet Records
//!
//! Typed records produced by the wire parser and consumed by the processing
//! pipeline. Construction from raw bytes lives in [`crate::model::parser`];
//! these types carry no parsing logic of their own.

use serde::{Deserialize, Serialize};

use crate::core::constants::{
    STATUS_DELOAD_OCCURRED, STATUS_ROM_OUTSIDE_HIGH, STATUS_ROM_OUTSIDE_LOW,
};

/// One snapshot of the MONITOR characteristic.
///
/// Positions are millimeters, loads kilograms. Firmware velocities are kept
/// raw (signed tenths of mm/s); the monitor processor applies the scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorPacket {
    /// Firmware tick counter, two little-endian u16 halves.
    pub ticks: u32,
    pub pos_a: f32,
    pub pos_b: f32,
    pub load_a: f32,
    pub load_b: f32,
    /// Status flag bits, zero when the packet is the short 16-byte shape.
    pub status: u16,
    pub vel_a_raw: i32,
    pub vel_b_raw: i32,
}

impl MonitorPacket {
    pub fn deload_occurred(&self) -> bool {
        self.status & STATUS_DELOAD_OCCURRED != 0
    }

    pub fn rom_outside_high(&self) -> bool {
        self.status & STATUS_ROM_OUTSIDE_HIGH != 0
    }

    pub fn rom_outside_low(&self) -> bool {
        self.status & STATUS_ROM_OUTSIDE_LOW != 0
    }
}

/// One rep notification.
///
/// The wire carries two shapes: the legacy 6-byte counters-only form and the
/// modern 24-byte form with ranges and set bookkeeping. The partition is
/// strictly two-tier on the effective (prefix-stripped) length; legacy
/// packets leave the modern-only fields at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepPacket {
    /// Reps that reached the top of the range.
    pub top_counter: u32,
    /// Fully completed reps.
    pub complete_counter: u32,
    /// Calibrated range top in millimeters. Modern format only.
    pub range_top: f32,
    /// Calibrated range bottom in millimeters. Modern format only.
    pub range_bottom: f32,
    pub reps_rom_count: u16,
    pub reps_rom_total: u16,
    pub reps_set_count: u16,
    pub reps_set_total: u16,
    pub is_legacy_format: bool,
    /// The notification bytes as received, for diagnostics.
    pub raw_data: Vec<u8>,
    pub timestamp_ms: u64,
}

/// One snapshot of the DIAGNOSTIC characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticPacket {
    /// Device uptime in seconds.
    pub seconds: i32,
    pub faults: [i16; 4],
    pub temps: [i8; 8],
    /// True iff any fault word is nonzero.
    pub has_faults: bool,
}

/// Per-phase workout statistics block of the heuristic packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub kg_avg: f32,
    pub kg_max: f32,
    pub vel_avg: f32,
    pub vel_max: f32,
    pub watt_avg: f32,
    pub watt_max: f32,
}

/// One snapshot of the HEURISTIC characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeuristicPacket {
    pub concentric: PhaseStats,
    pub eccentric: PhaseStats,
    pub timestamp_ms: u64,
}

/// One-shot metrics response on the RX characteristic.
///
/// The single big-endian packet in the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxMetricsResponse {
    pub opcode: u8,
    pub values: Vec<u16>,
}

/// Firmware version notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Mode-change echo notification payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChangeEvent {
    pub mode_id: u8,
    pub timestamp_ms: u64,
}

/// A fully validated, filtered and enriched monitor sample.
///
/// Only produced by the monitor processor after the complete validation
/// pipeline; velocities are EMA-smoothed mm/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkoutMetric {
    pub timestamp_ms: u64,
    pub pos_a: f32,
    pub pos_b: f32,
    pub vel_a: f32,
    pub vel_b: f32,
    pub load_a: f32,
    pub load_b: f32,
}

/// Simple per-side handle presence, derived per metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleDetection {
    pub left_detected: bool,
    pub right_detected: bool,
}
