// src/lib.rs - Fleet controller for serial multi-slot filament units
pub mod communication;
pub mod config;
pub mod device;
pub mod error;
pub mod fleet;
pub mod simulator;

pub use config::{Config, ConfigError, load_config};
pub use device::{ConnectionState, DeviceHandle, DeviceSettings, DeviceSnapshot, SlotStatus};
pub use error::FleetError;
pub use fleet::{Collaborators, FleetManager, FleetSettings, FleetStatus};
