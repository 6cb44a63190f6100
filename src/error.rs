// src/error.rs - Error taxonomy shared by the codec, devices and the fleet
use std::time::Duration;
use thiserror::Error;

use crate::device::SlotStatus;
use crate::device::parking::ParkingFailure;

/// Framing faults. These never leave the decoder: it resynchronizes and logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("bytes before frame header")]
    Garbage,
    #[error("declared payload length {len} exceeds maximum {max}")]
    Oversize { len: usize, max: usize },
    #[error("checksum mismatch (expected {expected:#06x}, got {actual:#06x})")]
    Checksum { expected: u16, actual: u16 },
    #[error("bad terminator byte {0:#04x}")]
    Terminator(u8),
}

/// Malformed JSON in either direction.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload too large to frame ({0} bytes)")]
    PayloadTooLarge(usize),
}

/// Terminal failure of a single request, delivered through its completion.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("device error {code}: {msg}")]
    Device { code: i64, msg: String },
    #[error("{method} (id {id}) timed out after {timeout:?}")]
    Timeout {
        id: u32,
        method: &'static str,
        timeout: Duration,
    },
    #[error("connection lost")]
    ConnectionLost,
}

/// Failures reported synchronously by a device actor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("device not connected")]
    NotConnected,
    #[error("request queue full")]
    QueueFull,
    #[error("a parking job is already active")]
    ParkingBusy,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("device task stopped")]
    Stopped,
    #[error(transparent)]
    Request(#[from] RequestError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid slot {slot} (fleet has {total} slots)")]
    InvalidSlot { slot: usize, total: usize },
    #[error("invalid device {device} (fleet has {count} devices)")]
    InvalidDevice { device: u8, count: u8 },
    #[error("invalid local slot {0} (devices have 4 slots)")]
    InvalidLocalSlot(u8),
    #[error("device count {0} out of range 1..=4")]
    InvalidDeviceCount(u8),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("TOML encode error: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Caller-facing outcome of every fleet operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FleetError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("device {device} is not connected")]
    NotConnected { device: u8 },
    #[error("slot {slot} is not ready ({status})")]
    SlotNotReady { slot: usize, status: SlotStatus },
    #[error("device {device} request queue is full")]
    QueueFull { device: u8 },
    #[error("device {device}: {source}")]
    RequestFailed {
        device: u8,
        #[source]
        source: RequestError,
    },
    #[error("parking failed for slot {slot}: {cause}")]
    ParkingFailed { slot: usize, cause: ParkingFailure },
    #[error("device {device} is already parking")]
    ParkingBusy { device: u8 },
    #[error("a tool change is already in progress")]
    SelectInProgress,
    #[error("device {device} failed to connect: {reason}")]
    ConnectFailed { device: u8, reason: String },
    #[error("device {device} task has stopped")]
    DeviceStopped { device: u8 },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl FleetError {
    /// Attribute a device-level failure to the device it came from.
    pub fn from_device(device: u8, err: DeviceError) -> Self {
        match err {
            DeviceError::NotConnected => FleetError::NotConnected { device },
            DeviceError::QueueFull => FleetError::QueueFull { device },
            DeviceError::ParkingBusy => FleetError::ParkingBusy { device },
            DeviceError::ConnectFailed(reason) => FleetError::ConnectFailed { device, reason },
            DeviceError::Stopped => FleetError::DeviceStopped { device },
            DeviceError::Request(source) => FleetError::RequestFailed { device, source },
        }
    }
}

impl From<StoreError> for FleetError {
    fn from(err: StoreError) -> Self {
        FleetError::Persistence(err.to_string())
    }
}
