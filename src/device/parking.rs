//! Parking: drive filament from a slot until it is seated at the toolhead.
//!
//! The controller does no I/O. The owning device task feeds it replies,
//! status reports, sensor readings and ticks, and sends whatever methods it
//! returns. A job is `Parking` until it settles or fails; the outcome is
//! kept as the last report and the controller is idle again.
//!
//! Assist mode settles when the device's cumulative feed-assist counter has
//! risen above the value sampled when assist started and has then stayed
//! unchanged for `stable_count` consecutive `ready` status polls.
//!
//! Sensor mode feeds a fixed distance while watching an external filament
//! presence signal, then hands over to feed assist.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::communication::protocol::{Method, StatusReport};
use crate::communication::request_channel::RequestResult;
use crate::device::SlotStatus;
use crate::error::{DeviceError, RequestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParkingMode {
    Assist,
    Sensor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause", content = "detail")]
pub enum ParkingFailure {
    /// The slot ran out of filament. Callers usually pause.
    Empty,
    /// No progress or ceiling reached. Callers usually retry.
    StuckOrTimeout,
    DeviceError(String),
    ConnectionLost,
}

impl fmt::Display for ParkingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParkingFailure::Empty => write!(f, "empty"),
            ParkingFailure::StuckOrTimeout => write!(f, "stuck_or_timeout"),
            ParkingFailure::DeviceError(msg) => write!(f, "device_error: {}", msg),
            ParkingFailure::ConnectionLost => write!(f, "connection_lost"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "failure")]
pub enum ParkingOutcome {
    Settled,
    Failed(ParkingFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParkingReport {
    pub job: u64,
    pub slot: u8,
    pub outcome: ParkingOutcome,
}

/// Read-only view of the active job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParkingView {
    pub job: u64,
    pub slot: u8,
    pub mode: ParkingMode,
    pub stable_hits: u32,
    pub count_increased: bool,
}

#[derive(Debug, Clone)]
pub struct ParkingSettings {
    pub stable_count: u32,
    /// Assist must move the counter within this window.
    pub assist_grace: Duration,
    /// Overall ceiling for assist mode.
    pub timeout: Duration,
    pub max_distance: u32,
    pub speed: u32,
    pub sensor_poll: Duration,
    pub keep_assist: bool,
}

impl Default for ParkingSettings {
    fn default() -> Self {
        Self {
            stable_count: 5,
            assist_grace: Duration::from_secs(3),
            timeout: Duration::from_secs(60),
            max_distance: 100,
            speed: 10,
            sensor_poll: Duration::from_millis(100),
            keep_assist: false,
        }
    }
}

impl ParkingSettings {
    /// Sensor mode ceiling: time to feed the whole distance, plus slack.
    pub fn sensor_timeout(&self) -> Duration {
        let speed = self.speed.max(1) as f64;
        Duration::from_secs_f64(self.max_distance as f64 / speed + 10.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    StartingAssist,
    Assisting,
    Feeding,
    SensorWatch,
    FinalAssist,
}

#[derive(Debug)]
struct ParkingJob {
    id: u64,
    slot: u8,
    mode: ParkingMode,
    phase: Phase,
    deadline: Instant,
    assist_started: Option<Instant>,
    baseline: u64,
    last_count: Option<u64>,
    stable_hits: u32,
    count_increased: bool,
    next_sensor_poll: Instant,
}

#[derive(Debug)]
pub struct ParkingController {
    settings: ParkingSettings,
    next_job: u64,
    job: Option<ParkingJob>,
    last: Option<ParkingReport>,
}

impl ParkingController {
    pub fn new(settings: ParkingSettings) -> Self {
        Self {
            settings,
            next_job: 0,
            job: None,
            last: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.job.is_some()
    }

    pub fn view(&self) -> Option<ParkingView> {
        self.job.as_ref().map(|j| ParkingView {
            job: j.id,
            slot: j.slot,
            mode: j.mode,
            stable_hits: j.stable_hits,
            count_increased: j.count_increased,
        })
    }

    pub fn last_report(&self) -> Option<&ParkingReport> {
        self.last.as_ref()
    }

    /// Begin a job. A second job while one is active is refused, not queued.
    pub fn start(
        &mut self,
        slot: u8,
        mode: ParkingMode,
        baseline_count: u64,
        now: Instant,
    ) -> Result<(u64, Vec<Method>), DeviceError> {
        if self.job.is_some() {
            return Err(DeviceError::ParkingBusy);
        }
        self.next_job += 1;
        let id = self.next_job;
        let (phase, deadline, methods) = match mode {
            ParkingMode::Assist => (
                Phase::StartingAssist,
                now + self.settings.timeout,
                vec![Method::StartFeedAssist { index: slot }],
            ),
            ParkingMode::Sensor => (
                Phase::Feeding,
                now + self.settings.sensor_timeout(),
                vec![Method::FeedFilament {
                    index: slot,
                    length: self.settings.max_distance,
                    speed: self.settings.speed,
                }],
            ),
        };
        self.job = Some(ParkingJob {
            id,
            slot,
            mode,
            phase,
            deadline,
            assist_started: None,
            baseline: baseline_count,
            last_count: None,
            stable_hits: 0,
            count_increased: false,
            next_sensor_poll: now,
        });
        Ok((id, methods))
    }

    /// A request issued for job `job_id` completed.
    pub fn on_reply(
        &mut self,
        job_id: u64,
        method: &Method,
        result: &RequestResult,
        now: Instant,
    ) -> Vec<Method> {
        let Some(job) = self.job.as_mut().filter(|j| j.id == job_id) else {
            return Vec::new();
        };
        match (job.phase, method) {
            (Phase::StartingAssist, Method::StartFeedAssist { .. }) => match result {
                Ok(reply) => {
                    if let Some(count) = reply.result.get("feed_assist_count").and_then(|v| v.as_u64()) {
                        job.baseline = count;
                    }
                    job.last_count = Some(job.baseline);
                    job.assist_started = Some(now);
                    job.phase = Phase::Assisting;
                    Vec::new()
                }
                Err(e) => self.finish(ParkingOutcome::Failed(failure_from(e))),
            },
            (Phase::Feeding, Method::FeedFilament { .. }) => match result {
                Ok(_) => {
                    job.phase = Phase::SensorWatch;
                    Vec::new()
                }
                Err(e) => self.finish(ParkingOutcome::Failed(failure_from(e))),
            },
            (Phase::FinalAssist, Method::StartFeedAssist { .. }) => match result {
                Ok(_) => self.finish(ParkingOutcome::Settled),
                Err(e) => self.finish(ParkingOutcome::Failed(failure_from(e))),
            },
            _ => Vec::new(),
        }
    }

    /// Fold in a fresh status report.
    pub fn on_status(&mut self, report: &StatusReport, now: Instant) -> Vec<Method> {
        let stable_count = self.settings.stable_count;
        let grace = self.settings.assist_grace;
        let Some(job) = self.job.as_mut() else {
            return Vec::new();
        };

        match report.slot(job.slot).map(|s| SlotStatus::from(s.status.as_str())) {
            Some(SlotStatus::Empty) => return self.finish(ParkingOutcome::Failed(ParkingFailure::Empty)),
            Some(SlotStatus::Error) => {
                return self.finish(ParkingOutcome::Failed(ParkingFailure::DeviceError(
                    "slot reported error".to_string(),
                )));
            }
            _ => {}
        }

        if job.phase != Phase::Assisting || report.status != "ready" {
            return Vec::new();
        }

        let count = report.feed_assist_count;
        if job.last_count != Some(count) {
            job.last_count = Some(count);
            job.stable_hits = 0;
            if count > job.baseline {
                job.count_increased = true;
            }
        } else {
            job.stable_hits += 1;
        }
        tracing::trace!(
            "Parking job {} slot {}: count={} baseline={} hits={}",
            job.id,
            job.slot,
            count,
            job.baseline,
            job.stable_hits
        );

        if job.count_increased && job.stable_hits >= stable_count {
            return self.finish(ParkingOutcome::Settled);
        }
        let started = job.assist_started.unwrap_or(now);
        if !job.count_increased && now.duration_since(started) >= grace {
            tracing::warn!("Feed assist for slot {} is not moving filament", job.slot);
            return self.finish(ParkingOutcome::Failed(ParkingFailure::StuckOrTimeout));
        }
        Vec::new()
    }

    /// Whether the sensor should be sampled now.
    pub fn wants_sensor(&self, now: Instant) -> bool {
        self.job
            .as_ref()
            .is_some_and(|j| j.phase == Phase::SensorWatch && now >= j.next_sensor_poll)
    }

    pub fn on_sensor(&mut self, reading: Result<bool, String>, now: Instant) -> Vec<Method> {
        let poll = self.settings.sensor_poll;
        let Some(job) = self.job.as_mut().filter(|j| j.phase == Phase::SensorWatch) else {
            return Vec::new();
        };
        job.next_sensor_poll = now + poll;
        match reading {
            Ok(true) => {
                tracing::info!("Filament detected at toolhead for slot {}", job.slot);
                job.phase = Phase::FinalAssist;
                vec![
                    Method::StopFeedFilament { index: job.slot },
                    Method::StartFeedAssist { index: job.slot },
                ]
            }
            Ok(false) => Vec::new(),
            Err(e) => self.finish(ParkingOutcome::Failed(ParkingFailure::DeviceError(format!(
                "filament sensor: {}",
                e
            )))),
        }
    }

    /// Enforce the overall ceiling.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Method> {
        let Some((id, slot)) = self
            .job
            .as_ref()
            .filter(|j| now >= j.deadline)
            .map(|j| (j.id, j.slot))
        else {
            return Vec::new();
        };
        tracing::warn!("Parking job {} for slot {} hit its time ceiling", id, slot);
        self.finish(ParkingOutcome::Failed(ParkingFailure::StuckOrTimeout))
    }

    /// Caller gave up on `job_id`.
    pub fn cancel(&mut self, job_id: u64, failure: ParkingFailure) -> Vec<Method> {
        if self.job.as_ref().is_some_and(|j| j.id == job_id) {
            self.finish(ParkingOutcome::Failed(failure))
        } else {
            Vec::new()
        }
    }

    /// The link is gone; nothing can be sent.
    pub fn abort_connection_lost(&mut self) {
        if self.job.is_some() {
            self.finish(ParkingOutcome::Failed(ParkingFailure::ConnectionLost));
        }
    }

    fn finish(&mut self, outcome: ParkingOutcome) -> Vec<Method> {
        let Some(job) = self.job.take() else {
            return Vec::new();
        };
        let slot = job.slot;
        let methods = match (&outcome, job.phase) {
            (ParkingOutcome::Failed(ParkingFailure::ConnectionLost), _) => Vec::new(),
            (ParkingOutcome::Settled, _) if self.settings.keep_assist => Vec::new(),
            (_, Phase::Feeding | Phase::SensorWatch) => vec![Method::StopFeedFilament { index: slot }],
            _ => vec![Method::StopFeedAssist { index: slot }],
        };
        match &outcome {
            ParkingOutcome::Settled => tracing::info!("Parking job {} settled on slot {}", job.id, slot),
            ParkingOutcome::Failed(cause) => {
                tracing::error!("Parking job {} failed on slot {}: {}", job.id, slot, cause)
            }
        }
        self.last = Some(ParkingReport {
            job: job.id,
            slot,
            outcome,
        });
        methods
    }
}

fn failure_from(err: &RequestError) -> ParkingFailure {
    match err {
        RequestError::ConnectionLost => ParkingFailure::ConnectionLost,
        RequestError::Timeout { .. } => ParkingFailure::StuckOrTimeout,
        RequestError::Device { msg, .. } => ParkingFailure::DeviceError(msg.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::protocol::{Reply, SlotReport};
    use serde_json::json;

    fn settings() -> ParkingSettings {
        ParkingSettings {
            stable_count: 3,
            ..ParkingSettings::default()
        }
    }

    fn status(count: u64, slot: u8, slot_status: &str) -> StatusReport {
        StatusReport {
            status: "ready".into(),
            feed_assist_count: count,
            slots: vec![SlotReport {
                index: Some(slot),
                status: slot_status.into(),
                ..SlotReport::default()
            }],
            ..StatusReport::default()
        }
    }

    fn ack(count: u64) -> RequestResult {
        Ok(Reply {
            result: json!({ "feed_assist_count": count }),
            msg: "success".into(),
        })
    }

    fn started(ctl: &mut ParkingController, now: Instant) -> u64 {
        let (job, methods) = ctl.start(1, ParkingMode::Assist, 0, now).unwrap();
        assert_eq!(methods, vec![Method::StartFeedAssist { index: 1 }]);
        assert!(ctl.on_reply(job, &methods[0], &ack(10), now).is_empty());
        job
    }

    #[test]
    fn test_second_start_is_rejected() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        ctl.start(0, ParkingMode::Assist, 0, now).unwrap();
        assert_eq!(ctl.start(1, ParkingMode::Assist, 0, now), Err(DeviceError::ParkingBusy));
        assert_eq!(ctl.view().unwrap().slot, 0);
    }

    #[test]
    fn test_settles_after_counter_rises_then_holds() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        let job = started(&mut ctl, now);

        assert!(ctl.on_status(&status(11, 1, "ready"), now).is_empty());
        assert!(ctl.on_status(&status(12, 1, "ready"), now).is_empty());
        assert!(ctl.on_status(&status(12, 1, "ready"), now).is_empty());
        assert!(ctl.on_status(&status(12, 1, "ready"), now).is_empty());
        let exit = ctl.on_status(&status(12, 1, "ready"), now);
        assert_eq!(exit, vec![Method::StopFeedAssist { index: 1 }]);
        assert!(!ctl.is_active());
        let report = ctl.last_report().unwrap();
        assert_eq!(report.job, job);
        assert_eq!(report.outcome, ParkingOutcome::Settled);
    }

    #[test]
    fn test_unchanged_counter_alone_never_settles() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        started(&mut ctl, now);
        for _ in 0..10 {
            ctl.on_status(&status(10, 1, "ready"), now);
        }
        assert!(ctl.is_active());
    }

    #[test]
    fn test_assist_not_moving_fails_after_grace() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        started(&mut ctl, now);
        ctl.on_status(&status(10, 1, "ready"), now + Duration::from_secs(1));
        let exit = ctl.on_status(&status(10, 1, "ready"), now + Duration::from_secs(4));
        assert_eq!(exit, vec![Method::StopFeedAssist { index: 1 }]);
        assert_eq!(
            ctl.last_report().unwrap().outcome,
            ParkingOutcome::Failed(ParkingFailure::StuckOrTimeout)
        );
    }

    #[test]
    fn test_empty_slot_is_distinct_failure() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        started(&mut ctl, now);
        ctl.on_status(&status(11, 1, "empty"), now);
        assert_eq!(
            ctl.last_report().unwrap().outcome,
            ParkingOutcome::Failed(ParkingFailure::Empty)
        );
    }

    #[test]
    fn test_transient_slot_status_keeps_parking() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        let job = started(&mut ctl, now);

        assert!(ctl.on_status(&status(11, 1, "feeding"), now).is_empty());
        assert!(ctl.is_active());
        assert!(ctl.last_report().is_none());

        for _ in 0..2 {
            assert!(ctl.on_status(&status(11, 1, "ready"), now).is_empty());
        }
        let exit = ctl.on_status(&status(11, 1, "ready"), now);
        assert_eq!(exit, vec![Method::StopFeedAssist { index: 1 }]);
        let report = ctl.last_report().unwrap();
        assert_eq!(report.job, job);
        assert_eq!(report.outcome, ParkingOutcome::Settled);
    }

    #[test]
    fn test_slot_error_fails_job() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        started(&mut ctl, now);
        ctl.on_status(&status(11, 1, "error"), now);
        assert!(matches!(
            ctl.last_report().unwrap().outcome,
            ParkingOutcome::Failed(ParkingFailure::DeviceError(_))
        ));
    }

    #[test]
    fn test_ceiling_enforced_on_tick() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        started(&mut ctl, now);
        assert!(ctl.on_tick(now + Duration::from_secs(59)).is_empty());
        assert!(!ctl.on_tick(now + Duration::from_secs(60)).is_empty());
        assert!(!ctl.is_active());
    }

    #[test]
    fn test_assist_start_error_fails_job() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        let (job, methods) = ctl.start(2, ParkingMode::Assist, 0, now).unwrap();
        let err = Err(RequestError::Device { code: 1, msg: "no filament".into() });
        ctl.on_reply(job, &methods[0], &err, now);
        assert_eq!(
            ctl.last_report().unwrap().outcome,
            ParkingOutcome::Failed(ParkingFailure::DeviceError("no filament".into()))
        );
    }

    #[test]
    fn test_connection_loss_sends_nothing() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        started(&mut ctl, now);
        ctl.abort_connection_lost();
        assert_eq!(
            ctl.last_report().unwrap().outcome,
            ParkingOutcome::Failed(ParkingFailure::ConnectionLost)
        );
        assert!(ctl.start(1, ParkingMode::Assist, 0, now).is_ok());
    }

    #[test]
    fn test_keep_assist_after_settle() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(ParkingSettings {
            stable_count: 1,
            keep_assist: true,
            ..ParkingSettings::default()
        });
        started(&mut ctl, now);
        ctl.on_status(&status(11, 1, "ready"), now);
        let exit = ctl.on_status(&status(11, 1, "ready"), now);
        assert!(exit.is_empty());
        assert_eq!(ctl.last_report().unwrap().outcome, ParkingOutcome::Settled);
    }

    #[test]
    fn test_sensor_mode_hands_over_to_assist() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        let (job, methods) = ctl.start(3, ParkingMode::Sensor, 0, now).unwrap();
        assert_eq!(
            methods,
            vec![Method::FeedFilament { index: 3, length: 100, speed: 10 }]
        );
        ctl.on_reply(job, &methods[0], &ack(0), now);
        assert!(ctl.wants_sensor(now));
        assert!(ctl.on_sensor(Ok(false), now).is_empty());
        assert!(!ctl.wants_sensor(now));

        let later = now + Duration::from_millis(100);
        let handover = ctl.on_sensor(Ok(true), later);
        assert_eq!(
            handover,
            vec![
                Method::StopFeedFilament { index: 3 },
                Method::StartFeedAssist { index: 3 },
            ]
        );
        ctl.on_reply(job, &handover[1], &ack(0), later);
        assert_eq!(ctl.last_report().unwrap().outcome, ParkingOutcome::Settled);
    }

    #[test]
    fn test_sensor_mode_timeout_stops_feed() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        let (job, methods) = ctl.start(0, ParkingMode::Sensor, 0, now).unwrap();
        ctl.on_reply(job, &methods[0], &ack(0), now);
        // 100mm at 10mm/s + 10s
        let exit = ctl.on_tick(now + Duration::from_secs(20));
        assert_eq!(exit, vec![Method::StopFeedFilament { index: 0 }]);
    }

    #[test]
    fn test_stale_job_replies_are_ignored() {
        let now = Instant::now();
        let mut ctl = ParkingController::new(settings());
        let (old, methods) = ctl.start(0, ParkingMode::Assist, 0, now).unwrap();
        ctl.cancel(old, ParkingFailure::StuckOrTimeout);
        let (new, _) = ctl.start(0, ParkingMode::Assist, 0, now).unwrap();
        assert_ne!(old, new);
        ctl.on_reply(old, &methods[0], &ack(5), now);
        assert!(ctl.is_active());
    }
}
