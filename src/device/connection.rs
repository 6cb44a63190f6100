// src/device/connection.rs - Device task: serial lifecycle, dispatch, polling, parking
//
// The task is the only writer of its link, request channel, parking
// controller and slot cache. Everything else talks to it through
// `DeviceCommand`s and reads the published `DeviceSnapshot`.
use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::communication::frame::{FrameCodec, FrameDecoder};
use crate::communication::protocol::{InfoReport, Method, Reply, Response, StatusReport, encode_request};
use crate::communication::request_channel::{
    Completion, InternalRequest, RequestChannel, RequestResult, Responder,
};
use crate::communication::serial::{SerialConnector, SerialLink};
use crate::device::parking::{ParkingController, ParkingFailure};
use crate::device::{
    ConnectionState, DeviceCommand, DeviceSettings, DeviceSnapshot, DryerState, FilamentSensor,
};
use crate::error::{DeviceError, RequestError};

const READ_BUFFER: usize = 1024;

#[derive(Debug)]
enum LinkEvent {
    Data { generation: u64, bytes: Bytes },
    Closed { generation: u64 },
    Failed { generation: u64, error: String },
}

struct ActiveLink {
    link: Arc<dyn SerialLink>,
    reader: JoinHandle<()>,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub(crate) struct DeviceConnection {
    settings: DeviceSettings,
    connector: Arc<dyn SerialConnector>,
    sensor: Option<Arc<dyn FilamentSensor>>,
    codec: FrameCodec,
    decoder: FrameDecoder,
    channel: RequestChannel,
    parking: ParkingController,
    link: Option<ActiveLink>,
    generation: u64,
    next_attempt: Option<Instant>,
    last_status_poll: Option<Instant>,
    last_rx: Instant,
    view: DeviceSnapshot,
    snapshot_tx: watch::Sender<DeviceSnapshot>,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: Option<mpsc::Receiver<LinkEvent>>,
}

impl DeviceConnection {
    pub(crate) fn new(
        settings: DeviceSettings,
        connector: Arc<dyn SerialConnector>,
        sensor: Option<Arc<dyn FilamentSensor>>,
        snapshot_tx: watch::Sender<DeviceSnapshot>,
    ) -> Self {
        let codec = FrameCodec::new(settings.max_payload);
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            view: DeviceSnapshot::new(settings.id, &settings.port),
            channel: RequestChannel::new(settings.queue_capacity),
            parking: ParkingController::new(settings.parking.clone()),
            settings,
            connector,
            sensor,
            codec,
            decoder: FrameDecoder::new(codec),
            link: None,
            generation: 0,
            next_attempt: Some(Instant::now()),
            last_status_poll: None,
            last_rx: Instant::now(),
            snapshot_tx,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    fn id(&self) -> u8 {
        self.settings.id
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<DeviceCommand>) {
        let Some(mut events) = self.events_rx.take() else {
            return;
        };
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("Device {} task started on {}", self.id(), self.settings.port);

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(DeviceCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                Some(event) = events.recv() => {
                    self.handle_link_event(event);
                }
                _ = interval.tick() => {
                    self.on_tick().await;
                }
            }
            self.publish();
        }

        self.drop_link(ConnectionState::Disabled, "shutdown");
        self.publish();
        tracing::info!("Device {} task stopped", self.id());
    }

    async fn handle_command(&mut self, cmd: DeviceCommand) {
        let now = Instant::now();
        match cmd {
            DeviceCommand::Request {
                method,
                timeout,
                accepted,
                responder,
            } => {
                let result = if self.view.state != ConnectionState::Connected {
                    Err(DeviceError::NotConnected)
                } else {
                    let timeout = timeout.unwrap_or(self.settings.response_timeout);
                    tracing::debug!("Device {}: queueing {}", self.id(), method.name());
                    self.channel
                        .send(method, Responder::Caller(responder), timeout, now)
                        .map_err(|_| DeviceError::QueueFull)
                };
                let _ = accepted.send(result);
            }
            DeviceCommand::Connect { done } => {
                let result = if self.view.state == ConnectionState::Connected {
                    Ok(())
                } else {
                    self.view.connect_attempts = 0;
                    self.try_connect(now).await
                };
                let _ = done.send(result);
            }
            DeviceCommand::Disconnect { done } => {
                tracing::info!("Device {}: disconnect requested", self.id());
                self.drop_link(ConnectionState::Disabled, "disconnected by request");
                let _ = done.send(());
            }
            DeviceCommand::StartParking { slot, done } => {
                let _ = done.send(self.start_parking(slot, now));
            }
            DeviceCommand::CancelParking { job, failure } => {
                let methods = self.parking.cancel(job, failure);
                self.send_parking(methods, now);
            }
            DeviceCommand::Shutdown => {}
        }
    }

    fn start_parking(&mut self, slot: u8, now: Instant) -> Result<u64, DeviceError> {
        if self.view.state != ConnectionState::Connected {
            return Err(DeviceError::NotConnected);
        }
        let (job, methods) = self.parking.start(
            slot,
            self.settings.parking_mode,
            self.view.feed_assist_count,
            now,
        )?;
        tracing::info!("Device {}: parking job {} started for slot {}", self.id(), job, slot);
        for method in methods {
            let responder = Responder::Internal(InternalRequest::Parking { job });
            if self
                .channel
                .send(method, responder, self.settings.response_timeout, now)
                .is_err()
            {
                let exit = self.parking.cancel(
                    job,
                    ParkingFailure::DeviceError("request queue full".into()),
                );
                self.send_parking(exit, now);
                return Err(DeviceError::QueueFull);
            }
        }
        Ok(job)
    }

    /// Queue methods produced by the parking controller.
    fn send_parking(&mut self, methods: Vec<Method>, now: Instant) {
        let kind = match self.parking.view() {
            Some(view) => InternalRequest::Parking { job: view.job },
            None => InternalRequest::Housekeeping,
        };
        for method in methods {
            let name = method.name();
            if self
                .channel
                .send(method, Responder::Internal(kind), self.settings.response_timeout, now)
                .is_err()
            {
                tracing::warn!("Device {}: queue full, dropped parking request {}", self.id(), name);
            }
        }
    }

    async fn try_connect(&mut self, now: Instant) -> Result<(), DeviceError> {
        self.view.state = ConnectionState::Connecting;
        self.publish();
        tracing::info!(
            "Device {}: connecting to {} at {} baud",
            self.id(),
            self.settings.port,
            self.settings.baud
        );

        match self.connector.open(&self.settings.port, self.settings.baud).await {
            Ok(link) => {
                self.attach(link, now);
                Ok(())
            }
            Err(e) => {
                self.view.connect_attempts += 1;
                self.view.state = ConnectionState::Error;
                self.view.last_error = Some(e.to_string());
                if self.view.connect_attempts >= self.settings.max_connect_attempts {
                    tracing::error!(
                        "Device {}: giving up after {} connection attempts: {}",
                        self.id(),
                        self.view.connect_attempts,
                        e
                    );
                    self.next_attempt = None;
                } else {
                    let delay = self.backoff();
                    tracing::warn!(
                        "Device {}: connection attempt {} failed ({}), retrying in {:?}",
                        self.id(),
                        self.view.connect_attempts,
                        e,
                        delay
                    );
                    self.next_attempt = Some(now + delay);
                }
                Err(DeviceError::ConnectFailed(e.to_string()))
            }
        }
    }

    fn backoff(&self) -> Duration {
        let exp = self.view.connect_attempts.saturating_sub(1).min(8);
        let base = self.settings.reconnect_interval.saturating_mul(1 << exp);
        let jitter = Duration::from_millis(rand::rng().random_range(0..250));
        base.min(self.settings.reconnect_max_interval) + jitter
    }

    fn attach(&mut self, link: Arc<dyn SerialLink>, now: Instant) {
        self.generation += 1;
        let reader = tokio::spawn(read_loop(
            link.clone(),
            self.generation,
            self.events_tx.clone(),
        ));
        self.link = Some(ActiveLink { link, reader });
        self.decoder.clear();
        self.view.state = ConnectionState::Connected;
        self.view.connect_attempts = 0;
        self.view.last_error = None;
        self.next_attempt = None;
        self.last_rx = now;
        self.last_status_poll = Some(now);
        tracing::info!("Device {}: connected to {}", self.id(), self.settings.port);

        let timeout = self.settings.response_timeout;
        let initial = [
            (Method::GetInfo, InternalRequest::Info),
            (Method::GetStatus, InternalRequest::StatusPoll),
        ];
        for (method, kind) in initial {
            let name = method.name();
            if self
                .channel
                .send(method, Responder::Internal(kind), timeout, now)
                .is_err()
            {
                tracing::warn!("Device {}: queue full, {} not sent on connect", self.id(), name);
            }
        }
    }

    /// Leave `Connected`: close the link, fail everything outstanding.
    fn drop_link(&mut self, next: ConnectionState, reason: &str) {
        let was = self.view.state;
        self.link = None;
        self.decoder.clear();
        self.parking.abort_connection_lost();
        for completion in self.channel.purge() {
            let _ = completion.deliver();
        }
        self.view.feed_assist_slot = None;
        self.view.state = next;
        if next == ConnectionState::Error {
            self.view.last_error = Some(reason.to_string());
            self.next_attempt = Some(Instant::now() + self.backoff());
        } else {
            self.next_attempt = None;
        }
        if was != next {
            tracing::info!("Device {}: {} -> {} ({})", self.id(), was, next, reason);
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        let now = Instant::now();
        match event {
            LinkEvent::Data { generation, bytes } if generation == self.generation => {
                tracing::trace!("Device {}: <- {} bytes", self.id(), bytes.len());
                self.decoder.extend(&bytes);
                while let Some(payload) = self.decoder.next_frame() {
                    self.last_rx = now;
                    match Response::parse(&payload) {
                        Ok(response) => {
                            if let Some(completion) = self.channel.complete(response) {
                                self.handle_completion(completion, now);
                            }
                        }
                        Err(e) => tracing::warn!("Device {}: malformed response: {}", self.id(), e),
                    }
                }
            }
            LinkEvent::Closed { generation } if generation == self.generation => {
                tracing::error!("Device {}: serial link closed", self.id());
                self.drop_link(ConnectionState::Error, "link closed");
            }
            LinkEvent::Failed { generation, error } if generation == self.generation => {
                tracing::error!("Device {}: serial read error: {}", self.id(), error);
                self.drop_link(ConnectionState::Error, &error);
            }
            stale => tracing::trace!("Device {}: ignoring stale link event {:?}", self.id(), stale),
        }
    }

    fn handle_completion(&mut self, completion: Completion, now: Instant) {
        if let Ok(reply) = &completion.result {
            self.observe(&completion.method, reply, now);
        }
        let Some((kind, method, result)) = completion.deliver() else {
            return;
        };
        match kind {
            InternalRequest::Parking { job } => {
                let methods = self.parking.on_reply(job, &method, &result, now);
                self.send_parking(methods, now);
            }
            InternalRequest::Info | InternalRequest::StatusPoll | InternalRequest::Housekeeping => {
                log_internal_failure(self.id(), &method, &result);
            }
        }
    }

    /// Fold a successful reply into the cached device state.
    fn observe(&mut self, method: &Method, reply: &Reply, now: Instant) {
        match method {
            Method::GetStatus => match StatusReport::from_result(&reply.result) {
                Ok(report) => {
                    self.apply_status(&report);
                    let methods = self.parking.on_status(&report, now);
                    self.send_parking(methods, now);
                }
                Err(e) => tracing::warn!("Device {}: unreadable status: {}", self.id(), e),
            },
            Method::GetInfo => match serde_json::from_value::<InfoReport>(reply.result.clone()) {
                Ok(info) => {
                    tracing::info!(
                        "Device {}: {} firmware {}",
                        self.id(),
                        info.model,
                        info.firmware
                    );
                    self.view.model = Some(info.model);
                    self.view.firmware = Some(info.firmware);
                }
                Err(e) => tracing::warn!("Device {}: unreadable info: {}", self.id(), e),
            },
            Method::StartFeedAssist { index } => self.view.feed_assist_slot = Some(*index),
            Method::StopFeedAssist { index } => {
                if self.view.feed_assist_slot == Some(*index) {
                    self.view.feed_assist_slot = None;
                }
            }
            _ => {}
        }
    }

    fn apply_status(&mut self, report: &StatusReport) {
        self.view.status = report.status.clone();
        self.view.temp = report.temp;
        self.view.fan_speed = report.fan_speed;
        self.view.enable_rfid = report.enable_rfid != 0;
        self.view.feed_assist_count = report.feed_assist_count;
        self.view.cont_assist_time = report.cont_assist_time;
        self.view.dryer = report.dryer.as_ref().and_then(DryerState::from_report);
        for (index, slot_report) in report.indexed_slots() {
            if let Some(slot) = self.view.slots.get_mut(usize::from(index)) {
                slot.apply(slot_report);
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        for completion in self.channel.expire(now) {
            tracing::warn!(
                "Device {}: request {} ({}) timed out",
                self.id(),
                completion.id,
                completion.method.name()
            );
            self.handle_completion(completion, now);
        }

        match self.view.state {
            ConnectionState::Connected => {
                if now.duration_since(self.last_rx) >= self.settings.liveness_timeout {
                    tracing::error!(
                        "Device {}: no response for {:?}",
                        self.id(),
                        self.settings.liveness_timeout
                    );
                    self.drop_link(ConnectionState::Error, "device stopped responding");
                    return;
                }
                let methods = self.parking.on_tick(now);
                self.send_parking(methods, now);
                self.poll_sensor(now).await;
                self.poll_status(now);
                self.dispatch(now).await;
            }
            ConnectionState::Disconnected | ConnectionState::Error => {
                if self.next_attempt.is_some_and(|t| now >= t) {
                    let _ = self.try_connect(now).await;
                }
            }
            ConnectionState::Connecting | ConnectionState::Disabled => {}
        }
    }

    async fn poll_sensor(&mut self, now: Instant) {
        if !self.parking.wants_sensor(now) {
            return;
        }
        let reading = match &self.sensor {
            Some(sensor) => {
                match tokio::time::timeout(self.settings.response_timeout, sensor.filament_present()).await {
                    Ok(reading) => reading,
                    Err(_) => Err("read timed out".to_string()),
                }
            }
            None => Err("no filament sensor configured".to_string()),
        };
        let methods = self.parking.on_sensor(reading, now);
        self.send_parking(methods, now);
    }

    fn poll_status(&mut self, now: Instant) {
        let interval = if self.parking.is_active() {
            self.settings.parking_status_interval
        } else {
            self.settings.status_interval
        };
        let due = self.last_status_poll.is_none_or(|t| now.duration_since(t) >= interval);
        if !due || self.channel.has_pending(InternalRequest::StatusPoll) {
            return;
        }
        self.last_status_poll = Some(now);
        if self
            .channel
            .send(
                Method::GetStatus,
                Responder::Internal(InternalRequest::StatusPoll),
                self.settings.response_timeout,
                now,
            )
            .is_err()
        {
            tracing::debug!("Device {}: queue full, skipping status poll", self.id());
        }
    }

    /// Write the oldest queued request.
    async fn dispatch(&mut self, now: Instant) {
        let Some(link) = self.link.as_ref().map(|l| l.link.clone()) else {
            return;
        };
        let Some((id, method)) = self.channel.next_outgoing() else {
            return;
        };
        let frame = match encode_request(id, &method).and_then(|payload| self.codec.encode(&payload)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Device {}: cannot encode {}: {}", self.id(), method.name(), e);
                let error = RequestError::Device {
                    code: -1,
                    msg: e.to_string(),
                };
                if let Some(completion) = self.channel.abandon(id, error) {
                    self.handle_completion(completion, now);
                }
                return;
            }
        };

        tracing::trace!("Device {}: -> {} id={} ({} bytes)", self.id(), method.name(), id, frame.len());
        match tokio::time::timeout(self.settings.write_timeout, link.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Device {}: serial write error: {}", self.id(), e);
                self.drop_link(ConnectionState::Error, &e.to_string());
            }
            Err(_) => {
                tracing::warn!("Device {}: write of request {} timed out, will retry", self.id(), id);
                self.channel.requeue(id);
            }
        }
    }

    fn publish(&mut self) {
        self.view.parking = self.parking.view();
        self.view.last_parking = self.parking.last_report().cloned();
        let view = &self.view;
        self.snapshot_tx.send_if_modified(|current| {
            if current == view {
                false
            } else {
                *current = view.clone();
                true
            }
        });
    }
}

fn log_internal_failure(device: u8, method: &Method, result: &RequestResult) {
    if let Err(e) = result {
        match e {
            RequestError::ConnectionLost => {
                tracing::debug!("Device {}: {} dropped with the link", device, method.name())
            }
            _ => tracing::warn!("Device {}: {} failed: {}", device, method.name(), e),
        }
    }
}

async fn read_loop(link: Arc<dyn SerialLink>, generation: u64, tx: mpsc::Sender<LinkEvent>) {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let event = match link.read(&mut buf).await {
            Ok(0) => LinkEvent::Closed { generation },
            Ok(n) => LinkEvent::Data {
                generation,
                bytes: Bytes::copy_from_slice(&buf[..n]),
            },
            Err(e) => LinkEvent::Failed {
                generation,
                error: e.to_string(),
            },
        };
        let terminal = !matches!(event, LinkEvent::Data { .. });
        if tx.send(event).await.is_err() || terminal {
            break;
        }
    }
}
