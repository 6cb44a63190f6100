// Tool change sequencing across devices, against simulated hardware

mod common;

use ace_fleet::device::parking::ParkingFailure;
use ace_fleet::error::AddressError;
use ace_fleet::simulator::AssistBehaviour;
use ace_fleet::{FleetError, SlotStatus};
use common::{CountingSensor, HarnessBuilder, HookEvent, wait_for};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_select_across_devices_retracts_then_parks() {
    let h = HarnessBuilder::new(2).selected(0).start().await;

    let selected = h.fleet.select(Some(5)).await.unwrap();
    assert_eq!(selected, Some(5));
    assert_eq!(h.fleet.current_slot(), Some(5));
    assert_eq!(h.store.current().current_slot, Some(5));

    let unwinds = h.sims[0].requests_for("unwind_filament");
    assert_eq!(unwinds.len(), 1);
    assert_eq!(unwinds[0].params["index"], 0);
    assert_eq!(unwinds[0].params["length"], 100);

    let assists = h.sims[1].requests_for("start_feed_assist");
    assert_eq!(assists.len(), 1);
    assert_eq!(assists[0].params["index"], 1);
    assert!(unwinds[0].at <= assists[0].at);
    assert!(h.sims[1].requests_for("unwind_filament").is_empty());

    assert_eq!(
        h.hooks.events(),
        vec![
            HookEvent::Before(Some(0), Some(5)),
            HookEvent::After(Some(0), Some(5)),
        ]
    );

    // assist is released once seated
    let sim = h.sims[1].clone();
    wait_for("assist stopped", Duration::from_secs(2), || sim.feed_assist_slot().is_none()).await;
}

#[tokio::test(start_paused = true)]
async fn test_select_empty_slot_fails_without_side_effects() {
    let h = HarnessBuilder::new(1).selected(0).start().await;
    h.sims[0].set_slot_status(2, "empty");
    h.settle_status().await;
    h.sims[0].clear_requests();

    let err = h.fleet.select(Some(2)).await.unwrap_err();
    assert_eq!(
        err,
        FleetError::SlotNotReady {
            slot: 2,
            status: SlotStatus::Empty
        }
    );
    assert_eq!(h.fleet.current_slot(), Some(0));
    assert!(h.sims[0].requests_for("unwind_filament").is_empty());
    assert!(h.sims[0].requests_for("start_feed_assist").is_empty());
    assert_eq!(h.hooks.events(), vec![HookEvent::Empty(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_select_invalid_slot() {
    let h = HarnessBuilder::new(2).start().await;
    let err = h.fleet.select(Some(8)).await.unwrap_err();
    assert_eq!(
        err,
        FleetError::Address(AddressError::InvalidSlot { slot: 8, total: 8 })
    );
}

#[tokio::test(start_paused = true)]
async fn test_select_disconnected_device_is_not_connected() {
    let h = HarnessBuilder::new(2).start().await;
    h.fleet.disconnect(1).await.unwrap();
    let err = h.fleet.select(Some(4)).await.unwrap_err();
    assert_eq!(err, FleetError::NotConnected { device: 1 });
}

#[tokio::test(start_paused = true)]
async fn test_unload_to_none() {
    let h = HarnessBuilder::new(1).selected(3).start().await;
    assert_eq!(h.fleet.select(None).await.unwrap(), None);
    assert_eq!(h.fleet.current_slot(), None);
    assert_eq!(h.store.current().current_slot, None);
    assert_eq!(h.sims[0].requests_for("unwind_filament")[0].params["index"], 3);
    assert!(h.sims[0].requests_for("start_feed_assist").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_selecting_current_slot_is_a_no_op() {
    let h = HarnessBuilder::new(1).selected(1).start().await;
    assert_eq!(h.fleet.select(Some(1)).await.unwrap(), Some(1));
    assert!(h.sims[0].requests_for("unwind_filament").is_empty());
    assert!(h.hooks.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stuck_assist_fails_and_clears_selection() {
    let h = HarnessBuilder::new(1).selected(0).start().await;
    h.sims[0].set_assist(AssistBehaviour::Stuck);

    let err = h.fleet.select(Some(1)).await.unwrap_err();
    assert_eq!(
        err,
        FleetError::ParkingFailed {
            slot: 1,
            cause: ParkingFailure::StuckOrTimeout
        }
    );
    assert_eq!(h.fleet.current_slot(), None);
    assert_eq!(h.store.current().current_slot, None);
    assert!(!h.hooks.events().contains(&HookEvent::Empty(1)));
    assert!(!h.sims[0].requests_for("stop_feed_assist").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slot_running_empty_while_parking() {
    let h = HarnessBuilder::new(2).start().await;
    h.sims[1].set_assist(AssistBehaviour::Seats { polls: 1000 });

    let fleet = h.fleet.clone();
    let select = tokio::spawn(async move { fleet.select(Some(6)).await });

    let sim = h.sims[1].clone();
    wait_for("assist started", Duration::from_secs(5), || {
        !sim.requests_for("start_feed_assist").is_empty()
    })
    .await;
    h.sims[1].set_slot_status(2, "empty");

    let err = select.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        FleetError::ParkingFailed {
            slot: 6,
            cause: ParkingFailure::Empty
        }
    );
    assert_eq!(h.fleet.current_slot(), None);
    assert!(h.hooks.events().contains(&HookEvent::Empty(6)));
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_during_parking() {
    let h = HarnessBuilder::new(2).start().await;
    h.sims[1].set_assist(AssistBehaviour::Seats { polls: 1000 });

    let fleet = h.fleet.clone();
    let select = tokio::spawn(async move { fleet.select(Some(5)).await });

    let sim = h.sims[1].clone();
    wait_for("assist started", Duration::from_secs(5), || {
        !sim.requests_for("start_feed_assist").is_empty()
    })
    .await;

    // one request left hanging on the device when the link goes
    h.sims[1].set_silent(true);
    let pending = h
        .fleet
        .device(1)
        .unwrap()
        .request(
            ace_fleet::communication::Method::GetFilamentInfo { index: 1 },
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.sims[1].drop_link();

    let err = select.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        FleetError::ParkingFailed {
            slot: 5,
            cause: ParkingFailure::ConnectionLost
        }
    );
    assert_eq!(
        pending.wait().await,
        Err(ace_fleet::error::DeviceError::Request(
            ace_fleet::error::RequestError::ConnectionLost
        ))
    );
    assert_eq!(h.fleet.current_slot(), None);

    // device 0 carried on untouched
    assert!(h.snapshot(0).is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_second_select_is_rejected_while_one_runs() {
    let h = HarnessBuilder::new(1).start().await;

    let fleet = h.fleet.clone();
    let first = tokio::spawn(async move { fleet.select(Some(1)).await });

    let sim = h.sims[0].clone();
    wait_for("first select parking", Duration::from_secs(5), || {
        !sim.requests_for("start_feed_assist").is_empty()
    })
    .await;
    assert_eq!(
        h.fleet.select(Some(2)).await.unwrap_err(),
        FleetError::SelectInProgress
    );
    assert_eq!(
        h.fleet.park_to_toolhead(2).await.unwrap_err(),
        FleetError::SelectInProgress
    );

    assert_eq!(first.await.unwrap().unwrap(), Some(1));
    assert_eq!(h.sims[0].requests_for("start_feed_assist").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_park_to_toolhead_keeps_selection() {
    let h = HarnessBuilder::new(1).selected(0).start().await;
    h.fleet.park_to_toolhead(3).await.unwrap();
    assert_eq!(h.fleet.current_slot(), Some(0));
    assert!(h.sims[0].requests_for("unwind_filament").is_empty());
    assert_eq!(h.sims[0].requests_for("start_feed_assist")[0].params["index"], 3);
}

#[tokio::test(start_paused = true)]
async fn test_keep_assist_after_toolchange() {
    let h = HarnessBuilder::new(1)
        .devices(|d| d.parking.keep_assist = true)
        .start()
        .await;
    h.fleet.select(Some(2)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.sims[0].feed_assist_slot(), Some(2));
    assert_eq!(h.snapshot(0).feed_assist_slot, Some(2));
    assert!(h.sims[0].requests_for("stop_feed_assist").is_empty());

    // the next change releases it before retracting
    h.fleet.select(Some(3)).await.unwrap();
    let stop = &h.sims[0].requests_for("stop_feed_assist")[0];
    let unwind = &h.sims[0].requests_for("unwind_filament")[0];
    assert_eq!(stop.params["index"], 2);
    assert!(stop.at <= unwind.at);
}

#[tokio::test(start_paused = true)]
async fn test_sensor_parking_feeds_until_filament_seen() {
    let sensor = Arc::new(CountingSensor::new(3));
    let h = HarnessBuilder::new(1)
        .settings(|s| s.aggressive_parking = true)
        .devices(|d| d.parking_mode = ace_fleet::device::parking::ParkingMode::Sensor)
        .sensor(sensor.clone())
        .start()
        .await;

    assert_eq!(h.fleet.select(Some(1)).await.unwrap(), Some(1));
    assert!(sensor.reads() >= 3);

    let feed = &h.sims[0].requests_for("feed_filament")[0];
    assert_eq!(feed.params["index"], 1);
    assert_eq!(feed.params["length"], 100);
    assert_eq!(feed.params["speed"], 10);
    let stop = &h.sims[0].requests_for("stop_feed_filament")[0];
    let assist = &h.sims[0].requests_for("start_feed_assist")[0];
    assert!(feed.at <= stop.at && stop.at <= assist.at);
}

#[tokio::test(start_paused = true)]
async fn test_long_sensor_feed_outlasts_park_timeout() {
    // roughly eight seconds of sensor polling against a five second park timeout
    let sensor = Arc::new(CountingSensor::new(80));
    let h = HarnessBuilder::new(1)
        .settings(|s| {
            s.aggressive_parking = true;
            s.park_timeout = Duration::from_secs(5);
        })
        .devices(|d| {
            d.parking_mode = ace_fleet::device::parking::ParkingMode::Sensor;
            d.parking.max_distance = 200;
        })
        .sensor(sensor.clone())
        .start()
        .await;

    let started = tokio::time::Instant::now();
    assert_eq!(h.fleet.select(Some(2)).await.unwrap(), Some(2));
    assert!(started.elapsed() > Duration::from_secs(7));
    assert!(sensor.reads() >= 80);
    assert_eq!(h.sims[0].requests_for("feed_filament")[0].params["length"], 200);
}

#[tokio::test(start_paused = true)]
async fn test_aggressive_parking_requires_sensor() {
    let connector = Arc::new(ace_fleet::simulator::SimConnector::new());
    let settings = ace_fleet::FleetSettings {
        aggressive_parking: true,
        ..ace_fleet::FleetSettings::default()
    };
    let result = ace_fleet::FleetManager::start(
        common::device_settings(1),
        settings,
        connector,
        ace_fleet::Collaborators::default(),
    );
    assert!(matches!(result, Err(FleetError::InvalidParameter(_))));
}
