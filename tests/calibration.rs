use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use bgg_config_lib::calibration::{CalibrationError, CalibrationPhase, CalibrationProgress};
use bgg_config_lib::config::DeviceConfig;
use bgg_config_lib::device::{DeviceBackend, DeviceSession, SimulatedBackend, SimulatedFirmware};
use bgg_config_lib::live::{PollChannel, PollKind};

fn start(whammy: Arc<Mutex<i32>>) -> (Arc<DeviceSession>, SimulatedBackend) {
    let backend = SimulatedBackend::new(move || SimulatedFirmware::default().with_whammy(whammy.clone()));
    let info = backend.info().clone();
    let interface = backend.open(&info).unwrap();
    (DeviceSession::start(Uuid::new_v4(), info, interface), backend)
}

/// Moves the simulated whammy through `rest` then `full`, one value per
/// accepted sample, as the calibrator reports progress.
fn sweep(whammy: Arc<Mutex<i32>>, rest: &'static [i32], full: &'static [i32]) -> impl FnMut(CalibrationProgress) {
    move |p| {
        let cycle = match p.phase {
            CalibrationPhase::SamplingRest => rest,
            CalibrationPhase::SamplingFull => full,
            _ => return,
        };
        *whammy.lock().unwrap() = cycle[p.samples % cycle.len()];
    }
}

#[tokio::test(start_paused = true)]
async fn rest_and_full_travel_bounds() {
    let whammy = Arc::new(Mutex::new(-1));
    let (session, _backend) = start(whammy.clone());

    let result = session
        .calibrator()
        .run(sweep(whammy.clone(), &[100, 120, 110], &[60000, 60500, 60200]))
        .await
        .unwrap();

    assert_eq!(result.rest.min, 100);
    assert_eq!(result.rest.max, 120);
    assert_eq!(result.full.min, 60000);
    assert_eq!(result.full.max, 60500);
    assert_eq!(result.min, 0);
    assert_eq!(result.max, 60750);

    let mut config = DeviceConfig::from_json(&serde_json::json!({"WHAMMY": "GP27", "whammy_min": 500})).unwrap();
    result.apply_to(&mut config).unwrap();
    let json = config.to_json();
    assert_eq!(json["whammy_min"], 0);
    assert_eq!(json["whammy_max"], 60750);
}

#[tokio::test(start_paused = true)]
async fn second_attempt_starts_with_empty_buffers() {
    let whammy = Arc::new(Mutex::new(-1));
    let (session, _backend) = start(whammy.clone());

    session
        .calibrator()
        .run(sweep(whammy.clone(), &[100, 120, 110], &[60000, 60500, 60200]))
        .await
        .unwrap();
    let second = session
        .calibrator()
        .run(sweep(whammy.clone(), &[2000], &[40000]))
        .await
        .unwrap();

    assert_eq!((second.rest.min, second.rest.max), (2000, 2000));
    assert_eq!((second.full.min, second.full.max), (40000, 40000));
    assert_eq!(second.min, 1800);
    assert_eq!(second.max, 40200);
}

#[tokio::test(start_paused = true)]
async fn diagnostics_axis_poll_is_restored_afterwards() {
    let whammy = Arc::new(Mutex::new(-1));
    let (session, _backend) = start(whammy.clone());
    let poller = session.poller();
    let diagnostics = Duration::from_millis(250);
    poller.start_polling(PollKind::AxisValue, diagnostics).await.unwrap();

    session
        .calibrator()
        .run(sweep(whammy.clone(), &[100], &[60000]))
        .await
        .unwrap();
    assert_eq!(poller.poll_interval(PollChannel::AxisValue).await, Some(diagnostics));

    // A failed attempt puts it back too.
    *whammy.lock().unwrap() = -1;
    assert!(session.calibrator().run(|_| {}).await.is_err());
    assert_eq!(poller.poll_interval(PollChannel::AxisValue).await, Some(diagnostics));
    assert!(poller.is_active(PollChannel::AxisValue));
}

#[tokio::test(start_paused = true)]
async fn missing_whammy_reports_no_samples() {
    let (session, _backend) = start(Arc::new(Mutex::new(-1)));

    let mut phases = Vec::new();
    let err = session.calibrator().run(|p| phases.push(p.phase)).await.unwrap_err();

    assert_eq!(err, CalibrationError::NoSamples { phase: CalibrationPhase::SamplingRest });
    assert!(matches!(phases.last(), Some(CalibrationPhase::Aborted(_))));
    assert!(!session.calibrator().is_running());
}

#[tokio::test(start_paused = true)]
async fn cancel_aborts_the_attempt() {
    let whammy = Arc::new(Mutex::new(500));
    let (session, _backend) = start(whammy);

    let calibrator = session.calibrator().clone();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        calibrator.cancel();
    });
    let err = session.calibrator().run(|_| {}).await.unwrap_err();
    canceller.await.unwrap();

    assert_eq!(err, CalibrationError::Cancelled);
    assert!(!session.poller().is_active(bgg_config_lib::live::PollChannel::AxisValue));
}

#[tokio::test(start_paused = true)]
async fn concurrent_attempt_is_refused() {
    let whammy = Arc::new(Mutex::new(500));
    let (session, _backend) = start(whammy);

    let calibrator = session.calibrator().clone();
    let first = tokio::spawn(async move { calibrator.run(|_| {}).await });
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(session.calibrator().run(|_| {}).await.unwrap_err(), CalibrationError::Busy);
    assert!(first.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn unplug_mid_window_is_device_lost() {
    let whammy = Arc::new(Mutex::new(500));
    let (session, backend) = start(whammy);

    let calibrator = session.calibrator().clone();
    let run = tokio::spawn(async move { calibrator.run(|_| {}).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    backend.unplug();
    session.close().await;

    assert_eq!(run.await.unwrap().unwrap_err(), CalibrationError::DeviceLost);
}
