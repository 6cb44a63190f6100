// src/device/mod.rs - One serial filament device: data model and task handle
pub mod connection;
pub mod parking;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::communication::protocol::{DryerReport, Method, Reply, SlotReport};
use crate::communication::request_channel::RequestResult;
use crate::communication::serial::SerialConnector;
use crate::error::DeviceError;
use crate::device::connection::DeviceConnection;
use crate::device::parking::{
    ParkingFailure, ParkingMode, ParkingOutcome, ParkingReport, ParkingSettings, ParkingView,
};

pub const SLOTS_PER_DEVICE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    /// Manually disconnected; no automatic reconnect.
    Disabled,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
            ConnectionState::Disabled => "disabled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Empty,
    Ready,
    /// Any other reported state, e.g. while filament is moving.
    Busy,
    Error,
}

impl From<&str> for SlotStatus {
    fn from(s: &str) -> Self {
        match s {
            "ready" => SlotStatus::Ready,
            "empty" => SlotStatus::Empty,
            "error" => SlotStatus::Error,
            _ => SlotStatus::Busy,
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotStatus::Empty => "empty",
            SlotStatus::Ready => "ready",
            SlotStatus::Busy => "busy",
            SlotStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Cached bay state. Spool metadata is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slot {
    pub index: u8,
    pub status: SlotStatus,
    pub sku: String,
    pub material: String,
    pub color: Value,
    pub rfid: u8,
}

impl Slot {
    fn empty(index: u8) -> Self {
        Self {
            index,
            status: SlotStatus::Empty,
            sku: String::new(),
            material: String::new(),
            color: Value::Null,
            rfid: 0,
        }
    }

    pub(crate) fn apply(&mut self, report: &SlotReport) {
        self.status = SlotStatus::from(report.status.as_str());
        self.sku = report.sku.clone();
        self.material = report.material.clone();
        self.color = report.color.clone();
        self.rfid = report.rfid;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryerState {
    pub status: String,
    pub target_temp: u32,
    /// Minutes.
    pub duration: u32,
    /// Seconds.
    pub remain_time: u32,
}

impl DryerState {
    /// `None` when the dryer is idle.
    pub(crate) fn from_report(report: &DryerReport) -> Option<Self> {
        if report.status.is_empty() || report.status == "stop" {
            return None;
        }
        Some(Self {
            status: report.status.clone(),
            target_temp: report.target_temp,
            duration: report.duration,
            remain_time: report.remain_time,
        })
    }
}

/// Read-only view published by the device task after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub id: u8,
    pub port: String,
    pub state: ConnectionState,
    pub connect_attempts: u32,
    pub last_error: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub status: String,
    pub temp: f64,
    pub fan_speed: u32,
    pub enable_rfid: bool,
    pub feed_assist_count: u64,
    pub cont_assist_time: f64,
    pub feed_assist_slot: Option<u8>,
    pub slots: [Slot; SLOTS_PER_DEVICE],
    pub dryer: Option<DryerState>,
    pub parking: Option<ParkingView>,
    pub last_parking: Option<ParkingReport>,
}

impl DeviceSnapshot {
    pub fn new(id: u8, port: &str) -> Self {
        Self {
            id,
            port: port.to_string(),
            state: ConnectionState::Disconnected,
            connect_attempts: 0,
            last_error: None,
            model: None,
            firmware: None,
            status: String::new(),
            temp: 0.0,
            fan_speed: 0,
            enable_rfid: false,
            feed_assist_count: 0,
            cont_assist_time: 0.0,
            feed_assist_slot: None,
            slots: [Slot::empty(0), Slot::empty(1), Slot::empty(2), Slot::empty(3)],
            dryer: None,
            parking: None,
            last_parking: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn slot(&self, local: u8) -> Option<&Slot> {
        self.slots.get(local as usize)
    }
}

/// External filament-presence signal at the toolhead.
#[async_trait]
pub trait FilamentSensor: Send + Sync {
    async fn filament_present(&self) -> Result<bool, String>;
}

/// Per-device link and timing settings.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub id: u8,
    pub port: String,
    pub baud: u32,
    pub queue_capacity: usize,
    pub max_payload: usize,
    pub response_timeout: Duration,
    pub write_timeout: Duration,
    pub tick_interval: Duration,
    pub status_interval: Duration,
    pub parking_status_interval: Duration,
    /// Connected with nothing received for this long counts as an I/O error.
    pub liveness_timeout: Duration,
    pub reconnect_interval: Duration,
    pub reconnect_max_interval: Duration,
    pub max_connect_attempts: u32,
    pub parking_mode: ParkingMode,
    pub parking: ParkingSettings,
}

impl DeviceSettings {
    pub fn new(id: u8, port: impl Into<String>) -> Self {
        Self {
            id,
            port: port.into(),
            baud: 115200,
            queue_capacity: 20,
            max_payload: crate::communication::frame::DEFAULT_MAX_PAYLOAD,
            response_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_millis(500),
            tick_interval: Duration::from_millis(50),
            status_interval: Duration::from_secs(1),
            parking_status_interval: Duration::from_millis(200),
            liveness_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(1),
            reconnect_max_interval: Duration::from_secs(10),
            max_connect_attempts: 5,
            parking_mode: ParkingMode::Assist,
            parking: ParkingSettings::default(),
        }
    }
}

pub(crate) enum DeviceCommand {
    Request {
        method: Method,
        timeout: Option<Duration>,
        accepted: oneshot::Sender<Result<u32, DeviceError>>,
        responder: oneshot::Sender<RequestResult>,
    },
    Connect {
        done: oneshot::Sender<Result<(), DeviceError>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
    StartParking {
        slot: u8,
        done: oneshot::Sender<Result<u64, DeviceError>>,
    },
    CancelParking {
        job: u64,
        failure: ParkingFailure,
    },
    Shutdown,
}

/// A queued request whose reply has not arrived yet.
#[derive(Debug)]
pub struct PendingReply {
    pub id: u32,
    rx: oneshot::Receiver<RequestResult>,
}

impl PendingReply {
    pub async fn wait(self) -> Result<Reply, DeviceError> {
        match self.rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeviceError::Stopped),
        }
    }
}

/// Cloneable handle to a running device task.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    id: u8,
    commands: mpsc::Sender<DeviceCommand>,
    snapshot: watch::Receiver<DeviceSnapshot>,
}

impl fmt::Debug for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::Request { method, .. } => write!(f, "Request({})", method.name()),
            DeviceCommand::Connect { .. } => write!(f, "Connect"),
            DeviceCommand::Disconnect { .. } => write!(f, "Disconnect"),
            DeviceCommand::StartParking { slot, .. } => write!(f, "StartParking({})", slot),
            DeviceCommand::CancelParking { job, .. } => write!(f, "CancelParking({})", job),
            DeviceCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl DeviceHandle {
    /// Start the device task. It begins connecting immediately.
    pub fn spawn(
        settings: DeviceSettings,
        connector: Arc<dyn SerialConnector>,
        sensor: Option<Arc<dyn FilamentSensor>>,
    ) -> (Self, JoinHandle<()>) {
        let id = settings.id;
        // requests are rejected, not awaited, once this many are waiting on the task
        let (cmd_tx, cmd_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (snap_tx, snap_rx) = watch::channel(DeviceSnapshot::new(id, &settings.port));
        let connection = DeviceConnection::new(settings, connector, sensor, snap_tx);
        let task = tokio::spawn(connection.run(cmd_rx));
        (
            Self {
                id,
                commands: cmd_tx,
                snapshot: snap_rx,
            },
            task,
        )
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.clone()
    }

    async fn command(&self, cmd: DeviceCommand) -> Result<(), DeviceError> {
        self.commands.send(cmd).await.map_err(|_| DeviceError::Stopped)
    }

    /// Queue a request. Fails at once if the device is not connected or its
    /// queue is full; the reply is awaited separately. A task too busy to
    /// take more requests counts as full.
    pub async fn request(
        &self,
        method: Method,
        timeout: Option<Duration>,
    ) -> Result<PendingReply, DeviceError> {
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (tx, rx) = oneshot::channel();
        self.commands
            .try_send(DeviceCommand::Request {
                method,
                timeout,
                accepted: accepted_tx,
                responder: tx,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => DeviceError::QueueFull,
                TrySendError::Closed(_) => DeviceError::Stopped,
            })?;
        let id = accepted_rx.await.map_err(|_| DeviceError::Stopped)??;
        Ok(PendingReply { id, rx })
    }

    pub async fn call(&self, method: Method, timeout: Option<Duration>) -> Result<Reply, DeviceError> {
        self.request(method, timeout).await?.wait().await
    }

    /// Manual (re)connect. Clears the attempt counter and any `Disabled` state.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        let (tx, rx) = oneshot::channel();
        self.command(DeviceCommand::Connect { done: tx }).await?;
        rx.await.map_err(|_| DeviceError::Stopped)?
    }

    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        let (tx, rx) = oneshot::channel();
        self.command(DeviceCommand::Disconnect { done: tx }).await?;
        rx.await.map_err(|_| DeviceError::Stopped)
    }

    pub async fn start_parking(&self, slot: u8) -> Result<u64, DeviceError> {
        let (tx, rx) = oneshot::channel();
        self.command(DeviceCommand::StartParking { slot, done: tx }).await?;
        rx.await.map_err(|_| DeviceError::Stopped)?
    }

    pub async fn cancel_parking(&self, job: u64, failure: ParkingFailure) -> Result<(), DeviceError> {
        self.command(DeviceCommand::CancelParking { job, failure }).await
    }

    /// Wait for `job` to reach a terminal outcome. On timeout the job is
    /// cancelled on the device and reported as stuck.
    pub async fn wait_parking(&self, job: u64, timeout: Duration) -> Result<ParkingOutcome, DeviceError> {
        let mut rx = self.subscribe();
        let finished = {
            let waited = tokio::time::timeout(
                timeout,
                rx.wait_for(|s| s.last_parking.as_ref().is_some_and(|r| r.job == job)),
            )
            .await;
            match waited {
                Ok(Ok(snapshot)) => Some(
                    snapshot
                        .last_parking
                        .as_ref()
                        .map(|r| r.outcome.clone())
                        .ok_or(DeviceError::Stopped),
                ),
                Ok(Err(_)) => Some(Err(DeviceError::Stopped)),
                Err(_) => None,
            }
        };
        if let Some(outcome) = finished {
            return outcome;
        }
        tracing::warn!("Device {}: parking job {} timed out after {:?}", self.id, job, timeout);
        self.cancel_parking(job, ParkingFailure::StuckOrTimeout).await?;
        Ok(ParkingOutcome::Failed(ParkingFailure::StuckOrTimeout))
    }

    pub async fn shutdown(&self) {
        if self.command(DeviceCommand::Shutdown).await.is_err() {
            tracing::debug!("Device {} task already stopped", self.id);
        }
    }
}
