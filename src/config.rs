//! # Fleet Configuration
//!
//! One TOML file describes the serial links and the operation defaults.
//!
//! ```toml
//! [fleet]
//! toolchange_retract_length = 100
//! park_hit_count = 5
//! disable_assist_after_toolchange = true
//! state_file = "ace_state.toml"
//!
//! [serial]
//! baud = 115200
//! response_timeout = 2.0
//!
//! [[device]]
//! serial = "/dev/serial/by-id/usb-ANYCUBIC_ACE_1-if00"
//!
//! [[device]]
//! serial = "/dev/serial/by-id/usb-ANYCUBIC_ACE_2-if00"
//! baud = 230400
//! ```
//!
//! Device ids are array positions: the first `[[device]]` is device 0.
//! Every field has a default except the serial path; durations are seconds.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::device::DeviceSettings;
use crate::device::parking::{ParkingMode, ParkingSettings};
use crate::fleet::FleetSettings;
use crate::fleet::address::MAX_DEVICES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

/// Operation defaults shared by every device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FleetConfig {
    #[serde(default = "default_speed")]
    pub feed_speed: u32,
    #[serde(default = "default_speed")]
    pub retract_speed: u32,
    #[serde(default)]
    pub retract_mode: u8,
    #[serde(default = "default_toolchange_retract_length")]
    pub toolchange_retract_length: u32,
    #[serde(default = "default_park_hit_count")]
    pub park_hit_count: u32,
    #[serde(default = "default_park_timeout")]
    pub park_timeout: f64,
    #[serde(default = "default_assist_grace")]
    pub assist_grace: f64,
    #[serde(default = "default_retract_wait")]
    pub retract_wait: f64,
    #[serde(default = "default_true")]
    pub disable_assist_after_toolchange: bool,
    #[serde(default)]
    pub aggressive_parking: bool,
    #[serde(default = "default_max_parking_distance")]
    pub max_parking_distance: u32,
    #[serde(default = "default_parking_speed")]
    pub parking_speed: u32,
    #[serde(default = "default_max_dryer_temperature")]
    pub max_dryer_temperature: u32,
    #[serde(default = "default_min_dryer_temperature")]
    pub min_dryer_temperature: u32,
    #[serde(default = "default_dryer_fan_speed")]
    pub dryer_fan_speed: u32,
    #[serde(default)]
    pub infinity_spool_mode: bool,
    /// Where the selected slot and infinity order are kept between runs.
    #[serde(default)]
    pub state_file: Option<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            feed_speed: default_speed(),
            retract_speed: default_speed(),
            retract_mode: 0,
            toolchange_retract_length: default_toolchange_retract_length(),
            park_hit_count: default_park_hit_count(),
            park_timeout: default_park_timeout(),
            assist_grace: default_assist_grace(),
            retract_wait: default_retract_wait(),
            disable_assist_after_toolchange: true,
            aggressive_parking: false,
            max_parking_distance: default_max_parking_distance(),
            parking_speed: default_parking_speed(),
            max_dryer_temperature: default_max_dryer_temperature(),
            min_dryer_temperature: default_min_dryer_temperature(),
            dryer_fan_speed: default_dryer_fan_speed(),
            infinity_spool_mode: false,
            state_file: None,
        }
    }
}

/// Link and timing defaults for every `[[device]]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_response_timeout")]
    pub response_timeout: f64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: f64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    #[serde(default = "default_max_connection_attempts")]
    pub max_connection_attempts: u32,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: f64,
    #[serde(default = "default_reconnect_max_interval")]
    pub reconnect_max_interval: f64,
    #[serde(default = "default_status_interval")]
    pub status_interval: f64,
    #[serde(default = "default_parking_status_interval")]
    pub parking_status_interval: f64,
    #[serde(default = "default_tick_interval")]
    pub tick_interval: f64,
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout: f64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud: default_baud(),
            response_timeout: default_response_timeout(),
            write_timeout: default_write_timeout(),
            queue_size: default_queue_size(),
            max_payload: default_max_payload(),
            max_connection_attempts: default_max_connection_attempts(),
            reconnect_interval: default_reconnect_interval(),
            reconnect_max_interval: default_reconnect_max_interval(),
            status_interval: default_status_interval(),
            parking_status_interval: default_parking_status_interval(),
            tick_interval: default_tick_interval(),
            liveness_timeout: default_liveness_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub serial: String,
    #[serde(default)]
    pub baud: Option<u32>,
}

fn default_speed() -> u32 {
    50
}
fn default_toolchange_retract_length() -> u32 {
    100
}
fn default_park_hit_count() -> u32 {
    5
}
fn default_park_timeout() -> f64 {
    60.0
}
fn default_assist_grace() -> f64 {
    3.0
}
fn default_retract_wait() -> f64 {
    10.0
}
fn default_true() -> bool {
    true
}
fn default_max_parking_distance() -> u32 {
    100
}
fn default_parking_speed() -> u32 {
    10
}
fn default_max_dryer_temperature() -> u32 {
    55
}
fn default_min_dryer_temperature() -> u32 {
    20
}
fn default_dryer_fan_speed() -> u32 {
    7000
}
fn default_baud() -> u32 {
    115200
}
fn default_response_timeout() -> f64 {
    2.0
}
fn default_write_timeout() -> f64 {
    0.5
}
fn default_queue_size() -> usize {
    20
}
fn default_max_payload() -> usize {
    crate::communication::frame::DEFAULT_MAX_PAYLOAD
}
fn default_max_connection_attempts() -> u32 {
    5
}
fn default_reconnect_interval() -> f64 {
    1.0
}
fn default_reconnect_max_interval() -> f64 {
    10.0
}
fn default_status_interval() -> f64 {
    1.0
}
fn default_parking_status_interval() -> f64 {
    0.2
}
fn default_tick_interval() -> f64 {
    0.05
}
fn default_liveness_timeout() -> f64 {
    5.0
}

fn check_seconds(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{} must be a positive number of seconds, got {}", name, value)))
    }
}

fn check_positive(name: &str, value: u32) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("at least one [[device]] is required".into()));
        }
        if self.devices.len() > MAX_DEVICES as usize {
            return Err(ConfigError::Invalid(format!(
                "at most {} devices are supported, got {}",
                MAX_DEVICES,
                self.devices.len()
            )));
        }
        for (id, device) in self.devices.iter().enumerate() {
            if device.serial.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("device {} has no serial path", id)));
            }
        }

        let fleet = &self.fleet;
        check_positive("feed_speed", fleet.feed_speed)?;
        check_positive("retract_speed", fleet.retract_speed)?;
        check_positive("park_hit_count", fleet.park_hit_count)?;
        check_positive("max_parking_distance", fleet.max_parking_distance)?;
        check_positive("parking_speed", fleet.parking_speed)?;
        check_seconds("park_timeout", fleet.park_timeout)?;
        check_seconds("assist_grace", fleet.assist_grace)?;
        check_seconds("retract_wait", fleet.retract_wait)?;
        if fleet.min_dryer_temperature > fleet.max_dryer_temperature {
            return Err(ConfigError::Invalid(format!(
                "min_dryer_temperature {} is above max_dryer_temperature {}",
                fleet.min_dryer_temperature, fleet.max_dryer_temperature
            )));
        }

        let serial = &self.serial;
        check_positive("baud", serial.baud)?;
        check_positive("max_connection_attempts", serial.max_connection_attempts)?;
        if serial.queue_size == 0 {
            return Err(ConfigError::Invalid("queue_size must be greater than zero".into()));
        }
        check_seconds("response_timeout", serial.response_timeout)?;
        check_seconds("write_timeout", serial.write_timeout)?;
        check_seconds("reconnect_interval", serial.reconnect_interval)?;
        check_seconds("reconnect_max_interval", serial.reconnect_max_interval)?;
        check_seconds("status_interval", serial.status_interval)?;
        check_seconds("parking_status_interval", serial.parking_status_interval)?;
        check_seconds("tick_interval", serial.tick_interval)?;
        check_seconds("liveness_timeout", serial.liveness_timeout)?;
        Ok(())
    }

    pub fn parking_settings(&self) -> ParkingSettings {
        let fleet = &self.fleet;
        ParkingSettings {
            stable_count: fleet.park_hit_count,
            assist_grace: Duration::from_secs_f64(fleet.assist_grace),
            timeout: Duration::from_secs_f64(fleet.park_timeout),
            max_distance: fleet.max_parking_distance,
            speed: fleet.parking_speed,
            sensor_poll: Duration::from_millis(100),
            keep_assist: !fleet.disable_assist_after_toolchange,
        }
    }

    /// Per-device settings, in device id order. Call after `validate`.
    pub fn device_settings(&self) -> Vec<DeviceSettings> {
        let serial = &self.serial;
        let mode = if self.fleet.aggressive_parking {
            ParkingMode::Sensor
        } else {
            ParkingMode::Assist
        };
        self.devices
            .iter()
            .enumerate()
            .map(|(id, device)| DeviceSettings {
                id: id as u8,
                port: device.serial.clone(),
                baud: device.baud.unwrap_or(serial.baud),
                queue_capacity: serial.queue_size,
                max_payload: serial.max_payload,
                response_timeout: Duration::from_secs_f64(serial.response_timeout),
                write_timeout: Duration::from_secs_f64(serial.write_timeout),
                tick_interval: Duration::from_secs_f64(serial.tick_interval),
                status_interval: Duration::from_secs_f64(serial.status_interval),
                parking_status_interval: Duration::from_secs_f64(serial.parking_status_interval),
                liveness_timeout: Duration::from_secs_f64(serial.liveness_timeout),
                reconnect_interval: Duration::from_secs_f64(serial.reconnect_interval),
                reconnect_max_interval: Duration::from_secs_f64(serial.reconnect_max_interval),
                max_connect_attempts: serial.max_connection_attempts,
                parking_mode: mode,
                parking: self.parking_settings(),
            })
            .collect()
    }

    pub fn fleet_settings(&self) -> FleetSettings {
        let fleet = &self.fleet;
        FleetSettings {
            feed_speed: fleet.feed_speed,
            retract_speed: fleet.retract_speed,
            retract_mode: fleet.retract_mode,
            toolchange_retract_length: fleet.toolchange_retract_length,
            park_timeout: Duration::from_secs_f64(fleet.park_timeout),
            retract_wait: Duration::from_secs_f64(fleet.retract_wait),
            response_timeout: Duration::from_secs_f64(self.serial.response_timeout),
            max_dryer_temperature: fleet.max_dryer_temperature,
            min_dryer_temperature: fleet.min_dryer_temperature,
            dryer_fan_speed: fleet.dryer_fan_speed,
            aggressive_parking: fleet.aggressive_parking,
            infinity_spool_mode: fleet.infinity_spool_mode,
        }
    }
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}
