// src/fleet/mod.rs - Unified operation surface over every configured device
pub mod address;
pub mod hooks;
pub mod infinity;

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::communication::protocol::{Method, Reply};
use crate::communication::serial::SerialConnector;
use crate::config::Config;
use crate::device::parking::{ParkingFailure, ParkingMode, ParkingOutcome};
use crate::device::{DeviceHandle, DeviceSettings, DeviceSnapshot, SlotStatus};
use crate::error::{AddressError, FleetError};
use crate::fleet::address::{SlotAddress, SlotAddressSpace};
use crate::fleet::hooks::{
    FilamentSensor, LoggingHooks, MemoryStore, PersistedState, StateStore, ToolChangeHooks,
};
use crate::fleet::infinity::InfinityOrder;

/// Operation defaults applied by the fleet.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub feed_speed: u32,
    pub retract_speed: u32,
    pub retract_mode: u8,
    pub toolchange_retract_length: u32,
    pub park_timeout: Duration,
    pub retract_wait: Duration,
    pub response_timeout: Duration,
    pub max_dryer_temperature: u32,
    pub min_dryer_temperature: u32,
    pub dryer_fan_speed: u32,
    pub aggressive_parking: bool,
    pub infinity_spool_mode: bool,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Config::default().fleet_settings()
    }
}

/// External collaborators the fleet calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub hooks: Arc<dyn ToolChangeHooks>,
    pub store: Arc<dyn StateStore>,
    pub sensor: Option<Arc<dyn FilamentSensor>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            hooks: Arc::new(LoggingHooks),
            store: Arc::new(MemoryStore::default()),
            sensor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetStatus {
    pub current_slot: Option<usize>,
    pub total_slots: usize,
    pub devices: Vec<DeviceSnapshot>,
}

/// Held for the duration of a tool change; a second one cannot be taken.
struct SelectGuard<'a>(&'a AtomicBool);

impl<'a> SelectGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, FleetError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| FleetError::SelectInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for SelectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct FleetManager {
    space: SlotAddressSpace,
    devices: Vec<DeviceHandle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    settings: FleetSettings,
    hooks: Arc<dyn ToolChangeHooks>,
    store: Arc<dyn StateStore>,
    state: Mutex<PersistedState>,
    selecting: AtomicBool,
    park_ceilings: Vec<Duration>,
}

impl FleetManager {
    /// Spawn one task per device and restore the persisted selection.
    pub fn start(
        devices: Vec<DeviceSettings>,
        settings: FleetSettings,
        connector: Arc<dyn SerialConnector>,
        collaborators: Collaborators,
    ) -> Result<Self, FleetError> {
        let count = u8::try_from(devices.len())
            .map_err(|_| AddressError::InvalidDeviceCount(u8::MAX))?;
        let space = SlotAddressSpace::new(count)?;
        if settings.aggressive_parking && collaborators.sensor.is_none() {
            return Err(FleetError::InvalidParameter(
                "aggressive parking requires a filament sensor".into(),
            ));
        }
        if let Some((pos, device)) = devices.iter().enumerate().find(|(i, d)| d.id as usize != *i) {
            return Err(FleetError::InvalidParameter(format!(
                "device at position {} has id {}",
                pos, device.id
            )));
        }

        let state = restore_state(collaborators.store.as_ref(), space.total_slots());
        if let Some(slot) = state.current_slot {
            tracing::info!("Restored selected slot {}", slot);
        }

        let park_ceilings = devices
            .iter()
            .map(|d| match d.parking_mode {
                ParkingMode::Assist => d.parking.timeout,
                ParkingMode::Sensor => d.parking.sensor_timeout(),
            })
            .collect();

        let mut handles = Vec::with_capacity(devices.len());
        let mut tasks = Vec::with_capacity(devices.len());
        for device in devices {
            let (handle, task) =
                DeviceHandle::spawn(device, connector.clone(), collaborators.sensor.clone());
            handles.push(handle);
            tasks.push(task);
        }
        tracing::info!(
            "Fleet started with {} device(s), {} slots",
            count,
            space.total_slots()
        );

        Ok(Self {
            space,
            devices: handles,
            tasks: Mutex::new(tasks),
            settings,
            hooks: collaborators.hooks,
            store: collaborators.store,
            state: Mutex::new(state),
            selecting: AtomicBool::new(false),
            park_ceilings,
        })
    }

    pub fn from_config(
        config: &Config,
        connector: Arc<dyn SerialConnector>,
        collaborators: Collaborators,
    ) -> Result<Self, FleetError> {
        config
            .validate()
            .map_err(|e| FleetError::InvalidParameter(e.to_string()))?;
        Self::start(
            config.device_settings(),
            config.fleet_settings(),
            connector,
            collaborators,
        )
    }

    pub fn device(&self, id: u8) -> Result<&DeviceHandle, FleetError> {
        self.space.check_device(id)?;
        self.devices.get(id as usize).ok_or_else(|| {
            FleetError::Address(AddressError::InvalidDevice {
                device: id,
                count: self.space.device_count(),
            })
        })
    }

    pub fn current_slot(&self) -> Option<usize> {
        self.lock_state().current_slot
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PersistedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `update` only once the store accepted it.
    fn persist(&self, update: impl FnOnce(&mut PersistedState)) -> Result<(), FleetError> {
        let mut state = self.lock_state();
        let mut next = state.clone();
        update(&mut next);
        self.store.save(&next).map_err(|e| {
            tracing::error!("Failed to persist fleet state: {}", e);
            FleetError::from(e)
        })?;
        *state = next;
        Ok(())
    }

    /// Track what the hardware now holds. Memory always follows; a failed
    /// write only costs the value across a restart.
    fn record(&self, update: impl FnOnce(&mut PersistedState)) {
        let state = {
            let mut state = self.lock_state();
            update(&mut state);
            state.clone()
        };
        if let Err(e) = self.store.save(&state) {
            tracing::warn!("Fleet state kept in memory only, save failed: {}", e);
        }
    }

    fn record_selection(&self, slot: Option<usize>) {
        if self.current_slot() == slot {
            return;
        }
        self.record(|s| s.current_slot = slot);
    }

    async fn call(&self, device: u8, method: Method) -> Result<Reply, FleetError> {
        let handle = self.device(device)?;
        tracing::debug!("Device {}: {}", device, method.name());
        handle
            .call(method, Some(self.settings.response_timeout))
            .await
            .map_err(|e| FleetError::from_device(device, e))
    }

    async fn call_slot(&self, global: usize, method: impl FnOnce(u8) -> Method) -> Result<Reply, FleetError> {
        let addr = self.space.to_local(global)?;
        self.call(addr.device, method(addr.local)).await
    }

    /// Connected and holding filament, or the matching error.
    async fn check_ready(&self, global: usize, addr: SlotAddress) -> Result<(), FleetError> {
        let snapshot = self.device(addr.device)?.snapshot();
        if !snapshot.is_connected() {
            return Err(FleetError::NotConnected { device: addr.device });
        }
        let status = snapshot
            .slot(addr.local)
            .map_or(SlotStatus::Error, |s| s.status);
        if status != SlotStatus::Ready {
            if status == SlotStatus::Empty {
                self.hooks.on_empty_spool(global).await;
            }
            return Err(FleetError::SlotNotReady { slot: global, status });
        }
        Ok(())
    }

    /// Change the active slot: retract the previous one, then park the target.
    /// Returns the slot selected afterwards.
    pub async fn select(&self, target: Option<usize>) -> Result<Option<usize>, FleetError> {
        let _guard = SelectGuard::acquire(&self.selecting)?;
        let previous = self.current_slot();
        if previous == target {
            tracing::info!("Slot {:?} already selected", target);
            return Ok(target);
        }

        let target_addr = target.map(|t| self.space.to_local(t)).transpose()?;
        if let (Some(global), Some(addr)) = (target, target_addr) {
            self.check_ready(global, addr).await?;
        }

        tracing::info!("Tool change {:?} -> {:?}", previous, target);
        self.hooks.before_tool_change(previous, target).await;

        if let Some(prev) = previous {
            if let Err(e) = self.unload(prev).await {
                tracing::warn!("Retract of slot {} failed, continuing: {}", prev, e);
            }
        }
        self.record_selection(None);

        let (Some(global), Some(addr)) = (target, target_addr) else {
            self.hooks.after_tool_change(previous, None).await;
            return Ok(None);
        };

        match self.park(global, addr).await {
            Ok(()) => {
                self.record_selection(Some(global));
                self.hooks.after_tool_change(previous, Some(global)).await;
                tracing::info!("Slot {} selected", global);
                Ok(Some(global))
            }
            Err(e) => {
                tracing::error!("Tool change to slot {} failed: {}", global, e);
                if let FleetError::ParkingFailed { cause: ParkingFailure::Empty, .. } = e {
                    self.hooks.on_empty_spool(global).await;
                }
                Err(e)
            }
        }
    }

    /// Retract `global` out of the toolhead and wait until its bay is ready again.
    async fn unload(&self, global: usize) -> Result<(), FleetError> {
        let addr = self.space.to_local(global)?;
        let handle = self.device(addr.device)?;
        if handle.snapshot().feed_assist_slot == Some(addr.local) {
            self.call(addr.device, Method::StopFeedAssist { index: addr.local }).await?;
        }

        let length = self.settings.toolchange_retract_length;
        let speed = self.settings.retract_speed.max(1);
        self.call(
            addr.device,
            Method::UnwindFilament {
                index: addr.local,
                length,
                speed,
                mode: self.settings.retract_mode,
            },
        )
        .await?;

        let travel = Duration::from_secs_f64(length as f64 / speed as f64 + 1.0);
        tracing::info!("Waiting {:?} for slot {} to retract", travel, global);
        tokio::time::sleep(travel).await;

        let mut rx = handle.subscribe();
        let ready = tokio::time::timeout(
            self.settings.retract_wait,
            rx.wait_for(|s| {
                !s.is_connected() || s.slot(addr.local).is_some_and(|slot| slot.status == SlotStatus::Ready)
            }),
        )
        .await
        .map(|r| r.map(|s| s.is_connected()));
        match ready {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(FleetError::NotConnected { device: addr.device }),
            Ok(Err(_)) => Err(FleetError::DeviceStopped { device: addr.device }),
            Err(_) => Err(FleetError::SlotNotReady {
                slot: global,
                status: handle
                    .snapshot()
                    .slot(addr.local)
                    .map_or(SlotStatus::Error, |s| s.status),
            }),
        }
    }

    /// Run one parking job to its terminal outcome.
    async fn park(&self, global: usize, addr: SlotAddress) -> Result<(), FleetError> {
        let handle = self.device(addr.device)?;
        let job = handle
            .start_parking(addr.local)
            .await
            .map_err(|e| FleetError::from_device(addr.device, e))?;
        let budget = self.park_budget(addr.device);
        let outcome = handle
            .wait_parking(job, budget)
            .await
            .map_err(|e| FleetError::from_device(addr.device, e))?;
        match outcome {
            ParkingOutcome::Settled => Ok(()),
            ParkingOutcome::Failed(cause) => Err(FleetError::ParkingFailed { slot: global, cause }),
        }
    }

    /// How long the fleet waits on a parking job. Never shorter than the
    /// device's own ceiling, so a slow sensor feed is not cut off early.
    fn park_budget(&self, device: u8) -> Duration {
        let ceiling = self
            .park_ceilings
            .get(device as usize)
            .copied()
            .unwrap_or_default();
        self.settings.park_timeout.max(ceiling) + self.settings.response_timeout
    }

    /// Park `global` without retracting anything or changing the selection.
    pub async fn park_to_toolhead(&self, global: usize) -> Result<(), FleetError> {
        let _guard = SelectGuard::acquire(&self.selecting)?;
        let addr = self.space.to_local(global)?;
        self.check_ready(global, addr).await?;
        self.park(global, addr).await
    }

    pub async fn feed(&self, global: usize, length: u32, speed: Option<u32>) -> Result<(), FleetError> {
        if length == 0 {
            return Err(FleetError::InvalidParameter("feed length must be positive".into()));
        }
        let speed = positive_speed(speed.unwrap_or(self.settings.feed_speed))?;
        self.call_slot(global, |index| Method::FeedFilament { index, length, speed })
            .await
            .map(drop)
    }

    pub async fn retract(
        &self,
        global: usize,
        length: u32,
        speed: Option<u32>,
        mode: Option<u8>,
    ) -> Result<(), FleetError> {
        if length == 0 {
            return Err(FleetError::InvalidParameter("retract length must be positive".into()));
        }
        let speed = positive_speed(speed.unwrap_or(self.settings.retract_speed))?;
        let mode = mode.unwrap_or(self.settings.retract_mode);
        if mode > 1 {
            return Err(FleetError::InvalidParameter(format!("retract mode {} (expected 0 or 1)", mode)));
        }
        self.call_slot(global, |index| Method::UnwindFilament { index, length, speed, mode })
            .await
            .map(drop)
    }

    pub async fn stop_feed(&self, global: usize) -> Result<(), FleetError> {
        self.call_slot(global, |index| Method::StopFeedFilament { index })
            .await
            .map(drop)
    }

    pub async fn update_feed_speed(&self, global: usize, speed: u32) -> Result<(), FleetError> {
        let speed = positive_speed(speed)?;
        self.call_slot(global, |index| Method::UpdateFeedingSpeed { index, speed })
            .await
            .map(drop)
    }

    pub async fn stop_retract(&self, global: usize) -> Result<(), FleetError> {
        self.call_slot(global, |index| Method::StopUnwindFilament { index })
            .await
            .map(drop)
    }

    pub async fn update_retract_speed(&self, global: usize, speed: u32) -> Result<(), FleetError> {
        let speed = positive_speed(speed)?;
        self.call_slot(global, |index| Method::UpdateUnwindingSpeed { index, speed })
            .await
            .map(drop)
    }

    pub async fn enable_assist(&self, global: usize) -> Result<(), FleetError> {
        self.call_slot(global, |index| Method::StartFeedAssist { index })
            .await
            .map(drop)
    }

    pub async fn disable_assist(&self, global: usize) -> Result<(), FleetError> {
        self.call_slot(global, |index| Method::StopFeedAssist { index })
            .await
            .map(drop)
    }

    /// Opaque spool metadata as reported by the device.
    pub async fn filament_info(&self, global: usize) -> Result<Value, FleetError> {
        self.call_slot(global, |index| Method::GetFilamentInfo { index })
            .await
            .map(|reply| reply.result)
    }

    /// `duration` is in minutes.
    pub async fn start_drying(&self, device: u8, temp: u32, duration: u32) -> Result<(), FleetError> {
        let (min, max) = (
            self.settings.min_dryer_temperature,
            self.settings.max_dryer_temperature,
        );
        if !(min..=max).contains(&temp) {
            return Err(FleetError::InvalidParameter(format!(
                "dryer temperature {} outside {}..={}",
                temp, min, max
            )));
        }
        if duration == 0 {
            return Err(FleetError::InvalidParameter("drying duration must be at least 1 minute".into()));
        }
        self.call(
            device,
            Method::Drying {
                temp,
                fan_speed: self.settings.dryer_fan_speed,
                duration,
            },
        )
        .await?;
        tracing::info!("Device {}: drying at {}C for {} min", device, temp, duration);
        Ok(())
    }

    pub async fn stop_drying(&self, device: u8) -> Result<(), FleetError> {
        self.call(device, Method::DryingStop).await.map(drop)
    }

    /// Snapshot of one device, or of all of them.
    pub fn status(&self, device: Option<u8>) -> Result<FleetStatus, FleetError> {
        let devices = match device {
            Some(id) => vec![self.device(id)?.snapshot()],
            None => self.devices.iter().map(|d| d.snapshot()).collect(),
        };
        Ok(FleetStatus {
            current_slot: self.current_slot(),
            total_slots: self.space.total_slots(),
            devices,
        })
    }

    pub async fn connect(&self, device: u8) -> Result<(), FleetError> {
        self.device(device)?
            .connect()
            .await
            .map_err(|e| FleetError::from_device(device, e))
    }

    pub async fn disconnect(&self, device: u8) -> Result<(), FleetError> {
        self.device(device)?
            .disconnect()
            .await
            .map_err(|e| FleetError::from_device(device, e))
    }

    /// Replace the infinity spool order and reset its cursor.
    pub fn set_infinity_order(&self, order: &str) -> Result<InfinityOrder, FleetError> {
        let order = InfinityOrder::parse(order, self.space.total_slots())?;
        let text = order.to_string();
        self.persist(|s| {
            s.infinity_order = Some(text);
            s.infinity_position = 0;
        })?;
        tracing::info!("Infinity spool order set: {}", order);
        Ok(order)
    }

    pub fn infinity_order(&self) -> Option<InfinityOrder> {
        let text = self.lock_state().infinity_order.clone()?;
        InfinityOrder::parse(&text, self.space.total_slots()).ok()
    }

    /// The active spool ran out: park the next ready slot from the infinity
    /// order. The exhausted slot is not retracted.
    pub async fn infinity_spool(&self) -> Result<usize, FleetError> {
        if !self.settings.infinity_spool_mode {
            return Err(FleetError::InvalidParameter("infinity spool mode is disabled".into()));
        }
        let _guard = SelectGuard::acquire(&self.selecting)?;
        let Some(current) = self.current_slot() else {
            return Err(FleetError::InvalidParameter("no slot is selected".into()));
        };
        let Some(order) = self.infinity_order() else {
            return Err(FleetError::InvalidParameter("infinity spool order is not set".into()));
        };

        let saved = Some(self.lock_state().infinity_position);
        let from = order.position_of(current, saved);
        if from.is_none() {
            tracing::warn!("Slot {} is not in the infinity order, starting from the top", current);
        }
        let next = order.candidates_after(from).into_iter().find(|&(_, slot)| {
            self.space.to_local(slot).is_ok_and(|addr| {
                self.devices.get(addr.device as usize).is_some_and(|d| {
                    let snap = d.snapshot();
                    snap.is_connected()
                        && snap.slot(addr.local).is_some_and(|s| s.status == SlotStatus::Ready)
                })
            })
        });
        let Some((position, slot)) = next else {
            return Err(FleetError::InvalidParameter("no ready slot left in the infinity order".into()));
        };

        tracing::info!("Infinity spool: {} -> {}", current, slot);
        self.hooks.before_tool_change(Some(current), Some(slot)).await;
        self.record_selection(None);
        let addr = self.space.to_local(slot)?;
        match self.park(slot, addr).await {
            Ok(()) => {
                self.record(|s| {
                    s.current_slot = Some(slot);
                    s.infinity_position = position;
                });
                self.hooks.after_tool_change(Some(current), Some(slot)).await;
                Ok(slot)
            }
            Err(e) => {
                tracing::error!("Infinity spool change to slot {} failed: {}", slot, e);
                if let FleetError::ParkingFailed { cause: ParkingFailure::Empty, .. } = e {
                    self.hooks.on_empty_spool(slot).await;
                }
                Err(e)
            }
        }
    }

    /// Stop every device task and wait for it to exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down fleet");
        for device in &self.devices {
            device.shutdown().await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Device task ended abnormally: {}", e);
            }
        }
    }
}

fn positive_speed(speed: u32) -> Result<u32, FleetError> {
    if speed == 0 {
        return Err(FleetError::InvalidParameter("speed must be positive".into()));
    }
    Ok(speed)
}

/// Load persisted state, dropping anything that no longer fits the fleet.
fn restore_state(store: &dyn StateStore, total_slots: usize) -> PersistedState {
    let mut state = match store.load() {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!("Could not load saved state, starting fresh: {}", e);
            return PersistedState::default();
        }
    };
    if let Some(slot) = state.current_slot {
        if slot >= total_slots {
            tracing::warn!("Saved slot {} is out of range (0-{}), ignoring", slot, total_slots - 1);
            state.current_slot = None;
        }
    }
    if let Some(order) = &state.infinity_order {
        if let Err(e) = InfinityOrder::parse(order, total_slots) {
            tracing::warn!("Saved infinity order '{}' is invalid, ignoring: {}", order, e);
            state.infinity_order = None;
            state.infinity_position = 0;
        }
    }
    state
}
