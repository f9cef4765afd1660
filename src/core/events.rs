//! Core Events
//!
//! Payload types of the published streams and of the facade's internal
//! supervision channel. The connection state is the sole user-visible
//! channel for link health: every transition is emitted, none silently.

use btleplug::api::BDAddr;
use serde::{Deserialize, Serialize};

use crate::model::device::DeviceModel;

/// Connection lifecycle of the facade. At most one state at any time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No link, no scan.
    #[default]
    Disconnected,
    /// Discovery is running; results stream on the scan channel.
    Scanning,
    /// A connect attempt is in flight.
    Connecting,
    /// Link established, polling active.
    Connected {
        device_name: String,
        address: BDAddr,
        model: DeviceModel,
    },
    /// The link dropped mid-session and an automatic retry is in flight.
    Reconnecting,
    /// The current attempt failed. Terminal until the caller retries.
    Error {
        message: String,
        cause: Option<String>,
    },
}

/// Which side of the calibrated range of motion was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RomViolation {
    OutsideHigh,
    OutsideLow,
}

/// Hardware-initiated workout events derived from monitor status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkoutEvent {
    /// The machine released force on its own.
    DeloadOccurred,
    /// The user left the calibrated range of motion.
    RomViolation(RomViolation),
}

/// Why the supervisor considers the link lost. Internal to the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLossReason {
    /// The monitor task hit the consecutive-timeout ceiling.
    ConsecutiveTimeouts,
    /// The platform reported a disconnect.
    PeerDisconnected,
}
