// Shared harness: a fleet wired to simulated devices
#![allow(dead_code)]

use ace_fleet::device::DeviceSettings;
use ace_fleet::fleet::hooks::{FilamentSensor, MemoryStore, PersistedState, ToolChangeHooks};
use ace_fleet::simulator::{SimConnector, SimulatedAce};
use ace_fleet::{Collaborators, DeviceSnapshot, FleetManager, FleetSettings};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    Before(Option<usize>, Option<usize>),
    After(Option<usize>, Option<usize>),
    Empty(usize),
}

#[derive(Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<HookEvent>>,
}

impl RecordingHooks {
    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: HookEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ToolChangeHooks for RecordingHooks {
    async fn before_tool_change(&self, from: Option<usize>, to: Option<usize>) {
        self.push(HookEvent::Before(from, to));
    }

    async fn after_tool_change(&self, from: Option<usize>, to: Option<usize>) {
        self.push(HookEvent::After(from, to));
    }

    async fn on_empty_spool(&self, slot: usize) {
        self.push(HookEvent::Empty(slot));
    }
}

/// Reports filament after a fixed number of reads.
pub struct CountingSensor {
    reads: AtomicU32,
    present_after: u32,
}

impl CountingSensor {
    pub fn new(present_after: u32) -> Self {
        Self {
            reads: AtomicU32::new(0),
            present_after,
        }
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FilamentSensor for CountingSensor {
    async fn filament_present(&self) -> Result<bool, String> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(n >= self.present_after)
    }
}

pub struct Harness {
    pub fleet: Arc<FleetManager>,
    pub sims: Vec<SimulatedAce>,
    pub store: Arc<MemoryStore>,
    pub hooks: Arc<RecordingHooks>,
}

pub fn device_settings(count: u8) -> Vec<DeviceSettings> {
    (0..count)
        .map(|id| {
            let mut settings = DeviceSettings::new(id, format!("sim{}", id));
            settings.parking.stable_count = 3;
            settings
        })
        .collect()
}

pub struct HarnessBuilder {
    devices: Vec<DeviceSettings>,
    settings: FleetSettings,
    state: PersistedState,
    sensor: Option<Arc<dyn FilamentSensor>>,
}

impl HarnessBuilder {
    pub fn new(count: u8) -> Self {
        Self {
            devices: device_settings(count),
            settings: FleetSettings::default(),
            state: PersistedState::default(),
            sensor: None,
        }
    }

    pub fn selected(mut self, slot: usize) -> Self {
        self.state.current_slot = Some(slot);
        self
    }

    pub fn state(mut self, state: PersistedState) -> Self {
        self.state = state;
        self
    }

    pub fn settings(mut self, f: impl FnOnce(&mut FleetSettings)) -> Self {
        f(&mut self.settings);
        self
    }

    pub fn devices(mut self, f: impl Fn(&mut DeviceSettings)) -> Self {
        self.devices.iter_mut().for_each(f);
        self
    }

    pub fn sensor(mut self, sensor: Arc<dyn FilamentSensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    /// Start the fleet without waiting for devices.
    pub fn spawn(self) -> Harness {
        let connector = SimConnector::new();
        let sims = self.devices.iter().map(|d| connector.add(&d.port)).collect();
        let store = Arc::new(MemoryStore::new(self.state));
        let hooks = Arc::new(RecordingHooks::default());
        let fleet = FleetManager::start(
            self.devices,
            self.settings,
            Arc::new(connector),
            Collaborators {
                hooks: hooks.clone(),
                store: store.clone(),
                sensor: self.sensor,
            },
        )
        .expect("fleet starts");
        Harness {
            fleet: Arc::new(fleet),
            sims,
            store,
            hooks,
        }
    }

    /// Start the fleet and wait until every device reported status.
    pub async fn start(self) -> Harness {
        let harness = self.spawn();
        harness.wait_ready().await;
        harness
    }
}

impl Harness {
    pub fn snapshot(&self, device: u8) -> DeviceSnapshot {
        self.fleet.device(device).unwrap().snapshot()
    }

    pub async fn wait_ready(&self) {
        let fleet = self.fleet.clone();
        wait_for("devices ready", Duration::from_secs(5), || {
            fleet
                .status(None)
                .unwrap()
                .devices
                .iter()
                .all(|d| d.is_connected() && d.status == "ready")
        })
        .await;
    }

    /// Let at least one full status poll land.
    pub async fn settle_status(&self) {
        tokio::time::sleep(Duration::from_millis(1500)).await;
    }
}

pub async fn wait_for(what: &str, timeout: Duration, f: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
