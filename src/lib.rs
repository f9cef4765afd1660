//! Veelink
//!
//! Client-side BLE protocol engine for Vitruvian smart cable trainers. It
//! owns the connected peripheral, runs the monitor/diagnostic/heuristic/
//! heartbeat polling loops, parses the trainer's binary packets, filters
//! spurious samples, derives velocity and handle state, and publishes the
//! results as streams. Everything above it (UI, storage, sync) is an
//! external collaborator that observes the streams and issues high-level
//! commands through the [`controller::connection::TrainerApi`] facade.

/// Core utilities shared across the engine.
pub mod core {
    /// Wall-clock helpers.
    pub mod clock;
    /// Protocol-wide constants: UUIDs, opcodes, thresholds, intervals.
    pub mod constants;
    /// Typed errors of the public operation surface.
    pub mod errors;
    /// Payload types of the published streams.
    pub mod events;
}

/// Data model: wire records, parsing and per-sample processing.
pub mod model {
    /// TX command framing.
    pub mod commands;
    /// Discovered-device descriptors and variant detection.
    pub mod device;
    /// Handle state detection from the metric stream.
    pub mod handle;
    /// Monitor sample validation, filtering and enrichment.
    pub mod monitor;
    /// Typed packet records.
    pub mod packets;
    /// Pure byte-buffer parsing.
    pub mod parser;
}

/// Controllers owning the peripheral and the polling concurrency.
pub mod controller {
    /// Connection facade and published streams.
    pub mod connection;
    /// The four polling tasks and their lifecycle.
    pub mod polling;
    /// GATT operation serialisation.
    pub mod queue;
    #[cfg(test)]
    pub(crate) mod test_support;
}

pub use crate::controller::connection::{AdapterDiscovery, DeviceController, TrainerApi};
pub use crate::core::errors::{CommandError, ConnectError, ScanError};
pub use crate::core::events::{ConnectionState, RomViolation, WorkoutEvent};
pub use crate::model::commands::{TrainingMode, WorkoutCommand, WorkoutConfig};
pub use crate::model::device::{DeviceDescriptor, DeviceModel};
pub use crate::model::handle::HandleState;
pub use crate::model::packets::{
    DiagnosticPacket, HandleDetection, HeuristicPacket, MonitorPacket, RepPacket, WorkoutMetric,
};
