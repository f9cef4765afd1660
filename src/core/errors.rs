//! Error Taxonomy
//!
//! Typed errors for the public operation surface. Protocol-level failures
//! (undersized packets, implausible samples) are not errors: the parser and
//! the monitor processor reject those silently and the loops continue.
//! Connection losses travel on the `connection_state` stream, never as a
//! return value of a polling task.

use thiserror::Error;
use uuid::Uuid;

/// Failures while starting or stopping device discovery.
#[derive(Debug, Error)]
pub enum ScanError {
    /// No Bluetooth adapter is available, or the platform rejected access.
    #[error("no usable bluetooth adapter")]
    NoAdapter,
    /// A scan is already running.
    #[error("already scanning")]
    AlreadyScanning,
    /// Stop requested while no scan was active.
    #[error("no scan active")]
    NotScanning,
    /// The underlying stack rejected the scan request.
    #[error("bluetooth scan failed: {0}")]
    Ble(#[from] btleplug::Error),
}

/// Failures while establishing a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The requested peripheral is not in the adapter's cache.
    #[error("device {0} not found")]
    DeviceNotFound(String),
    /// A connection is already established or being established.
    #[error("connection already in progress")]
    Busy,
    /// GATT service discovery failed after connecting.
    #[error("service discovery failed: {0}")]
    ServiceDiscovery(#[source] btleplug::Error),
    /// A characteristic required for the session is absent.
    #[error("characteristic {0} missing")]
    MissingCharacteristic(Uuid),
    /// Subscribing to a notification characteristic failed.
    #[error("subscribe to {uuid} failed: {source}")]
    Subscribe {
        uuid: Uuid,
        #[source]
        source: btleplug::Error,
    },
    /// The peer or the local stack rejected the connection.
    #[error("connect failed: {0}")]
    Ble(#[from] btleplug::Error),
}

/// Failures of TX command writes. These surface to the caller and never
/// mutate the connection state.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No connected peripheral to write to.
    #[error("not connected")]
    NotConnected,
    /// The TX characteristic is absent on this peripheral.
    #[error("TX characteristic missing")]
    MissingTx,
    /// The write itself failed or timed out.
    #[error("command write failed: {0}")]
    Write(#[source] btleplug::Error),
    /// The write did not complete within the per-operation deadline.
    #[error("command write timed out")]
    Timeout,
}
