//! Device Model
//!
//! Descriptors for discovered trainers. Devices are identified purely by
//! advertised name prefix; no firmware capability gating is attempted, and
//! a characteristic missing on one variant surfaces as an operation failure
//! at use time.

use btleplug::api::BDAddr;
use serde::{Deserialize, Serialize};

use crate::core::constants::{DEVICE_NAME_PREFIX_VEE, DEVICE_NAME_PREFIX_VIT};

/// Hardware variant, detected from the advertised name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceModel {
    /// `Vee_*` devices.
    Vee,
    /// `VIT*` devices.
    Vit,
}

impl DeviceModel {
    /// Detects the variant from an advertised local name. Returns `None`
    /// for devices that are not trainers.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.starts_with(DEVICE_NAME_PREFIX_VEE) {
            Some(DeviceModel::Vee)
        } else if name.starts_with(DEVICE_NAME_PREFIX_VIT) {
            Some(DeviceModel::Vit)
        } else {
            None
        }
    }
}

/// A discovered trainer: advertised name, address and detected variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceDescriptor {
    pub name: String,
    pub address: BDAddr,
    pub model: DeviceModel,
}

impl DeviceDescriptor {
    /// Builds a descriptor from an advertised name, if the name matches a
    /// known trainer prefix.
    pub fn from_advertisement(name: String, address: BDAddr) -> Option<Self> {
        DeviceModel::from_name(&name).map(|model| Self {
            name,
            address,
            model,
        })
    }
}
