// src/communication/protocol.rs - JSON-RPC style payloads carried inside frames
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ProtocolError;

/// Every method the device firmware understands. Anything else is
/// unrepresentable, so unknown methods are rejected at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    GetInfo,
    GetStatus,
    GetFilamentInfo { index: u8 },
    FeedFilament { index: u8, length: u32, speed: u32 },
    StopFeedFilament { index: u8 },
    UpdateFeedingSpeed { index: u8, speed: u32 },
    UnwindFilament { index: u8, length: u32, speed: u32, mode: u8 },
    StopUnwindFilament { index: u8 },
    UpdateUnwindingSpeed { index: u8, speed: u32 },
    StartFeedAssist { index: u8 },
    StopFeedAssist { index: u8 },
    Drying { temp: u32, fan_speed: u32, duration: u32 },
    DryingStop,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::GetInfo => "get_info",
            Method::GetStatus => "get_status",
            Method::GetFilamentInfo { .. } => "get_filament_info",
            Method::FeedFilament { .. } => "feed_filament",
            Method::StopFeedFilament { .. } => "stop_feed_filament",
            Method::UpdateFeedingSpeed { .. } => "update_feeding_speed",
            Method::UnwindFilament { .. } => "unwind_filament",
            Method::StopUnwindFilament { .. } => "stop_unwind_filament",
            Method::UpdateUnwindingSpeed { .. } => "update_unwinding_speed",
            Method::StartFeedAssist { .. } => "start_feed_assist",
            Method::StopFeedAssist { .. } => "stop_feed_assist",
            Method::Drying { .. } => "drying",
            Method::DryingStop => "drying_stop",
        }
    }

    pub fn params(&self) -> Value {
        match *self {
            Method::GetInfo | Method::GetStatus | Method::DryingStop => json!({}),
            Method::GetFilamentInfo { index }
            | Method::StopFeedFilament { index }
            | Method::StopUnwindFilament { index }
            | Method::StartFeedAssist { index }
            | Method::StopFeedAssist { index } => json!({ "index": index }),
            Method::FeedFilament { index, length, speed } => {
                json!({ "index": index, "length": length, "speed": speed })
            }
            Method::UpdateFeedingSpeed { index, speed }
            | Method::UpdateUnwindingSpeed { index, speed } => {
                json!({ "index": index, "speed": speed })
            }
            Method::UnwindFilament { index, length, speed, mode } => {
                json!({ "index": index, "length": length, "speed": speed, "mode": mode })
            }
            Method::Drying { temp, fan_speed, duration } => {
                json!({ "temp": temp, "fan_speed": fan_speed, "duration": duration })
            }
        }
    }

    /// Local slot this method acts on, if any.
    pub fn slot(&self) -> Option<u8> {
        match *self {
            Method::GetFilamentInfo { index }
            | Method::FeedFilament { index, .. }
            | Method::StopFeedFilament { index }
            | Method::UpdateFeedingSpeed { index, .. }
            | Method::UnwindFilament { index, .. }
            | Method::StopUnwindFilament { index }
            | Method::UpdateUnwindingSpeed { index, .. }
            | Method::StartFeedAssist { index }
            | Method::StopFeedAssist { index } => Some(index),
            _ => None,
        }
    }
}

/// Serialize `{"id", "method", "params"}`.
pub fn encode_request(id: u32, method: &Method) -> Result<Vec<u8>, ProtocolError> {
    let body = json!({
        "id": id,
        "method": method.name(),
        "params": method.params(),
    });
    Ok(serde_json::to_vec(&body)?)
}

/// Inbound payload. Only `id` is needed to route it; `code` 0 is success.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Response {
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

impl Response {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Successful reply handed back to whoever issued the request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub result: Value,
    pub msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DryerReport {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub target_temp: u32,
    #[serde(default)]
    pub duration: u32,
    /// Seconds.
    #[serde(default)]
    pub remain_time: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SlotReport {
    /// Missing on some firmware; the array position stands in.
    #[serde(default)]
    pub index: Option<u8>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub sku: String,
    #[serde(default, rename = "type")]
    pub material: String,
    #[serde(default)]
    pub color: Value,
    #[serde(default)]
    pub rfid: u8,
}

/// Result object of `get_status`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StatusReport {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub temp: f64,
    #[serde(default)]
    pub fan_speed: u32,
    #[serde(default)]
    pub enable_rfid: u8,
    #[serde(default)]
    pub feed_assist_count: u64,
    #[serde(default)]
    pub cont_assist_time: f64,
    #[serde(default, alias = "dryer_status")]
    pub dryer: Option<DryerReport>,
    #[serde(default)]
    pub slots: Vec<SlotReport>,
}

impl StatusReport {
    pub fn from_result(result: &Value) -> Result<Self, ProtocolError> {
        Ok(Self::deserialize(result)?)
    }

    /// Slots paired with their resolved local index.
    pub fn indexed_slots(&self) -> impl Iterator<Item = (u8, &SlotReport)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(pos, s)| s.index.or_else(|| u8::try_from(pos).ok()).map(|i| (i, s)))
    }

    pub fn slot(&self, index: u8) -> Option<&SlotReport> {
        self.indexed_slots().find(|(i, _)| *i == index).map(|(_, s)| s)
    }
}

/// Result object of `get_info`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct InfoReport {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub boot_firmware: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let bytes = encode_request(
            12,
            &Method::UnwindFilament { index: 2, length: 100, speed: 50, mode: 0 },
        )
        .unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["id"], 12);
        assert_eq!(v["method"], "unwind_filament");
        assert_eq!(v["params"]["index"], 2);
        assert_eq!(v["params"]["mode"], 0);
    }

    #[test]
    fn test_parameterless_methods_send_empty_object() {
        let bytes = encode_request(1, &Method::GetStatus).unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["params"], json!({}));
    }

    #[test]
    fn test_response_defaults() {
        let r = Response::parse(br#"{"id":3,"result":{}}"#).unwrap();
        assert_eq!(r.id, Some(3));
        assert!(r.is_success());
        let r = Response::parse(br#"{"id":4,"code":-1,"msg":"busy"}"#).unwrap();
        assert!(!r.is_success());
        assert_eq!(r.msg, "busy");
        assert!(Response::parse(b"{not json").is_err());
    }

    #[test]
    fn test_status_accepts_dryer_status_alias() {
        let result = json!({
            "status": "ready",
            "feed_assist_count": 9,
            "dryer_status": {"status": "drying", "target_temp": 50, "duration": 240, "remain_time": 600},
            "slots": [{"index": 1, "status": "ready", "type": "PLA", "sku": "x", "color": [1, 2, 3]}]
        });
        let report = StatusReport::from_result(&result).unwrap();
        assert_eq!(report.feed_assist_count, 9);
        assert_eq!(report.dryer.as_ref().unwrap().target_temp, 50);
        let slot = report.slot(1).unwrap();
        assert_eq!(slot.material, "PLA");
        assert_eq!(slot.color, json!([1, 2, 3]));
    }

    #[test]
    fn test_slots_without_index_use_position() {
        let result = json!({
            "status": "ready",
            "slots": [
                {"status": "empty"},
                {"status": "ready"},
                {"status": "ready", "type": "PETG"},
                {"status": "empty"}
            ]
        });
        let report = StatusReport::from_result(&result).unwrap();
        assert_eq!(report.slot(0).unwrap().status, "empty");
        assert_eq!(report.slot(1).unwrap().status, "ready");
        assert_eq!(report.slot(2).unwrap().material, "PETG");
        assert_eq!(report.slot(3).unwrap().status, "empty");
        assert!(report.slot(4).is_none());
    }
}
