// src/simulator/mod.rs - Simulated devices speaking the framed JSON protocol
//
// Each `SimulatedAce` answers requests the way the hardware does, with
// controllable slot states, feed-assist behaviour, silence and link drops.
// `SimConnector` hands out links to them by port name.
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::communication::frame::{FrameCodec, FrameDecoder};
use crate::communication::serial::{SerialConnector, SerialLink};
use crate::device::SLOTS_PER_DEVICE;

/// What feed assist does to the hit counter once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistBehaviour {
    /// Counter rises for this many status polls, then holds (filament seated).
    Seats { polls: u32 },
    /// Counter never moves.
    Stuck,
}

/// One request as the simulated device received it.
#[derive(Debug, Clone, PartialEq)]
pub struct SimRequest {
    pub at: Instant,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone)]
struct SimSlot {
    status: String,
    sku: String,
    material: String,
    color: [u8; 3],
}

#[derive(Debug)]
struct SimState {
    slots: [SimSlot; SLOTS_PER_DEVICE],
    status: String,
    feed_assist_count: u64,
    assist_slot: Option<u8>,
    assist_moves_left: u32,
    assist: AssistBehaviour,
    dryer: Option<(u32, u32)>,
    silent: bool,
    fail_open: bool,
    failures: HashMap<String, (i64, String)>,
    requests: Vec<SimRequest>,
    generation: u64,
    opens: u32,
    outbox: VecDeque<u8>,
}

impl SimState {
    fn status_result(&self) -> Value {
        let slots: Vec<Value> = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| {
                json!({
                    "index": i,
                    "status": s.status,
                    "sku": s.sku,
                    "type": s.material,
                    "color": s.color,
                    "rfid": 1,
                })
            })
            .collect();
        let dryer = match self.dryer {
            Some((temp, duration)) => json!({
                "status": "drying",
                "target_temp": temp,
                "duration": duration,
                "remain_time": duration * 60,
            }),
            None => json!({"status": "stop", "target_temp": 0, "duration": 0, "remain_time": 0}),
        };
        json!({
            "status": self.status,
            "temp": 25,
            "enable_rfid": 1,
            "fan_speed": 7000,
            "feed_assist_count": self.feed_assist_count,
            "cont_assist_time": 0.0,
            "dryer_status": dryer,
            "slots": slots,
        })
    }

    fn advance_assist(&mut self) {
        let Some(slot) = self.assist_slot else {
            return;
        };
        if self.slots[slot as usize].status == "ready" && self.assist_moves_left > 0 {
            self.assist_moves_left -= 1;
            self.feed_assist_count += 1;
        }
    }

    /// Reply payload for one request, or `None` when silent.
    fn handle(&mut self, payload: &[u8]) -> Option<Value> {
        let request: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Simulator got malformed request: {}", e);
                return None;
            }
        };
        let id = request["id"].as_u64().unwrap_or(0);
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].clone();
        self.requests.push(SimRequest {
            at: Instant::now(),
            id,
            method: method.clone(),
            params: params.clone(),
        });
        if self.silent {
            return None;
        }
        if let Some((code, msg)) = self.failures.get(&method) {
            return Some(json!({"id": id, "code": code, "msg": msg, "result": {}}));
        }

        let index = params["index"].as_u64().map(|i| i as usize);
        let result = match method.as_str() {
            "get_info" => json!({"model": "Anycubic Color Engine Pro", "firmware": "V1.3.84", "boot_firmware": "V1.0.1"}),
            "get_status" => {
                self.advance_assist();
                self.status_result()
            }
            "get_filament_info" => match index.and_then(|i| self.slots.get(i)) {
                Some(slot) => json!({
                    "index": index,
                    "sku": slot.sku,
                    "type": slot.material,
                    "color": slot.color,
                    "brand": "",
                    "rfid": 1,
                }),
                None => return Some(json!({"id": id, "code": 1, "msg": "invalid index", "result": {}})),
            },
            "start_feed_assist" => {
                self.assist_slot = index.map(|i| i as u8);
                self.assist_moves_left = match self.assist {
                    AssistBehaviour::Seats { polls } => polls,
                    AssistBehaviour::Stuck => 0,
                };
                json!({})
            }
            "stop_feed_assist" => {
                self.assist_slot = None;
                json!({})
            }
            "drying" => {
                let temp = params["temp"].as_u64().unwrap_or(0) as u32;
                let duration = params["duration"].as_u64().unwrap_or(0) as u32;
                self.dryer = Some((temp, duration));
                json!({})
            }
            "drying_stop" => {
                self.dryer = None;
                json!({})
            }
            "feed_filament" | "stop_feed_filament" | "update_feeding_speed" | "unwind_filament"
            | "stop_unwind_filament" | "update_unwinding_speed" => json!({}),
            other => {
                return Some(json!({"id": id, "code": -1, "msg": format!("unknown method {}", other), "result": {}}));
            }
        };
        Some(json!({"id": id, "code": 0, "msg": "success", "result": result}))
    }
}

/// Control handle for one simulated device. Clones share state.
#[derive(Clone)]
pub struct SimulatedAce {
    state: Arc<Mutex<SimState>>,
    notify: Arc<Notify>,
    codec: FrameCodec,
}

impl Default for SimulatedAce {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAce {
    pub fn new() -> Self {
        let colors = [[255, 255, 255], [0, 0, 0], [255, 0, 0], [0, 0, 255]];
        let slots = std::array::from_fn(|i| SimSlot {
            status: "ready".to_string(),
            sku: format!("AHPLBK-{}", 101 + i),
            material: "PLA".to_string(),
            color: colors[i],
        });
        Self {
            state: Arc::new(Mutex::new(SimState {
                slots,
                status: "ready".to_string(),
                feed_assist_count: 0,
                assist_slot: None,
                assist_moves_left: 0,
                assist: AssistBehaviour::Seats { polls: 3 },
                dryer: None,
                silent: false,
                fail_open: false,
                failures: HashMap::new(),
                requests: Vec::new(),
                generation: 0,
                opens: 0,
                outbox: VecDeque::new(),
            })),
            notify: Arc::new(Notify::new()),
            codec: FrameCodec::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_slot_status(&self, local: u8, status: &str) {
        if let Some(slot) = self.lock().slots.get_mut(local as usize) {
            slot.status = status.to_string();
        }
    }

    pub fn set_assist(&self, behaviour: AssistBehaviour) {
        self.lock().assist = behaviour;
    }

    /// Stop answering (requests are still recorded).
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Answer `method` with a device error until cleared.
    pub fn fail_method(&self, method: &str, code: i64, msg: &str) {
        self.lock().failures.insert(method.to_string(), (code, msg.to_string()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Close the current link from the device side.
    pub fn drop_link(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.outbox.clear();
        drop(state);
        self.notify.notify_one();
    }

    pub fn requests(&self) -> Vec<SimRequest> {
        self.lock().requests.clone()
    }

    pub fn requests_for(&self, method: &str) -> Vec<SimRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    pub fn feed_assist_slot(&self) -> Option<u8> {
        self.lock().assist_slot
    }

    pub fn drying(&self) -> Option<(u32, u32)> {
        self.lock().dryer
    }

    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    fn open(&self) -> io::Result<Arc<dyn SerialLink>> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(io::Error::new(io::ErrorKind::NotFound, "simulated port unavailable"));
        }
        state.generation += 1;
        state.opens += 1;
        state.outbox.clear();
        Ok(Arc::new(SimLink {
            device: self.clone(),
            generation: state.generation,
            decoder: Mutex::new(FrameDecoder::new(self.codec)),
        }))
    }
}

struct SimLink {
    device: SimulatedAce,
    generation: u64,
    decoder: Mutex<FrameDecoder>,
}

#[async_trait]
impl SerialLink for SimLink {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let notified = self.device.notify.notified();
            {
                let mut state = self.device.lock();
                if state.generation != self.generation {
                    return Ok(0);
                }
                if !state.outbox.is_empty() {
                    let n = buf.len().min(state.outbox.len());
                    for (dst, src) in buf.iter_mut().zip(state.outbox.drain(..n)) {
                        *dst = src;
                    }
                    return Ok(n);
                }
            }
            notified.await;
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut decoder = self.decoder.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.device.lock();
        if state.generation != self.generation {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated link closed"));
        }
        decoder.extend(buf);
        while let Some(payload) = decoder.next_frame() {
            let Some(reply) = state.handle(&payload) else {
                continue;
            };
            let frame = serde_json::to_vec(&reply)
                .map_err(io::Error::other)
                .and_then(|bytes| self.device.codec.encode(&bytes).map_err(io::Error::other))?;
            state.outbox.extend(frame.iter());
        }
        drop(state);
        drop(decoder);
        self.device.notify.notify_one();
        Ok(buf.len())
    }
}

/// Opens simulated devices by port name.
#[derive(Clone, Default)]
pub struct SimConnector {
    devices: Arc<Mutex<HashMap<String, SimulatedAce>>>,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device on `port` and return its control handle.
    pub fn add(&self, port: &str) -> SimulatedAce {
        let device = SimulatedAce::new();
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(port.to_string(), device.clone());
        device
    }

    pub fn device(&self, port: &str) -> Option<SimulatedAce> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(port)
            .cloned()
    }
}

#[async_trait]
impl SerialConnector for SimConnector {
    async fn open(&self, port: &str, _baud: u32) -> io::Result<Arc<dyn SerialLink>> {
        match self.device(port) {
            Some(device) => device.open(),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no simulated device on {}", port),
            )),
        }
    }

    fn available_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ports.sort();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::protocol::{Method, Response, encode_request};

    async fn roundtrip(link: &Arc<dyn SerialLink>, id: u32, method: Method) -> Response {
        let codec = FrameCodec::default();
        let payload = encode_request(id, &method).unwrap();
        link.write_all(&codec.encode(&payload).unwrap()).await.unwrap();
        let mut decoder = FrameDecoder::new(codec);
        let mut buf = [0u8; 512];
        loop {
            let n = link.read(&mut buf).await.unwrap();
            decoder.extend(&buf[..n]);
            if let Some(frame) = decoder.next_frame() {
                return Response::parse(&frame).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_answers_status_with_slots() {
        let connector = SimConnector::new();
        let sim = connector.add("sim0");
        sim.set_slot_status(2, "empty");
        let link = connector.open("sim0", 115200).await.unwrap();
        let response = roundtrip(&link, 7, Method::GetStatus).await;
        assert_eq!(response.id, Some(7));
        assert!(response.is_success());
        assert_eq!(response.result["slots"][2]["status"], "empty");
        assert_eq!(response.result["dryer_status"]["status"], "stop");
        assert_eq!(sim.requests_for("get_status").len(), 1);
    }

    #[tokio::test]
    async fn test_assist_counter_rises_then_holds() {
        let connector = SimConnector::new();
        let sim = connector.add("sim0");
        sim.set_assist(AssistBehaviour::Seats { polls: 2 });
        let link = connector.open("sim0", 115200).await.unwrap();
        roundtrip(&link, 1, Method::StartFeedAssist { index: 0 }).await;
        let mut counts = Vec::new();
        for id in 2..6 {
            let r = roundtrip(&link, id, Method::GetStatus).await;
            counts.push(r.result["feed_assist_count"].as_u64().unwrap());
        }
        assert_eq!(counts, vec![1, 2, 2, 2]);
    }

    #[tokio::test]
    async fn test_dropped_link_reads_eof() {
        let connector = SimConnector::new();
        let sim = connector.add("sim0");
        let link = connector.open("sim0", 115200).await.unwrap();
        sim.drop_link();
        let mut buf = [0u8; 16];
        assert_eq!(link.read(&mut buf).await.unwrap(), 0);
        assert!(link.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_port_fails_to_open() {
        let connector = SimConnector::new();
        assert!(connector.open("missing", 115200).await.is_err());
        let sim = connector.add("sim0");
        sim.set_fail_open(true);
        assert!(connector.open("sim0", 115200).await.is_err());
    }

    #[test]
    fn test_lists_registered_ports() {
        let connector = SimConnector::new();
        assert!(connector.available_ports().is_empty());
        connector.add("sim1");
        connector.add("sim0");
        assert_eq!(connector.available_ports(), vec!["sim0", "sim1"]);
    }
}
