//! Synchronized scans against the simulated bench.

mod common;

use common::{config, imager, plan};
use seq_core::config::TriggerSource;
use seq_core::data::Frame;
use seq_core::device::DeviceKind;
use seq_core::{CancellationToken, ScanFailure, SeqError};
use seq_instrument::{ImagerState, ScanPlan};
use seq_sim::{frame_bytes, Fault, SimBench};
use std::time::Duration;

fn expected_pixels(index: u32, height: u32) -> Vec<u16> {
    Frame::from_le_bytes(index, 32, height, &frame_bytes(index, 32, height)).pixels
}

fn assert_safe(bench: &SimBench) {
    assert!(!bench.optics_energized(), "optics left energized");
    assert!(!bench.trigger_armed(), "trigger generator left armed");
    assert!(!bench.camera_capturing(), "camera left capturing");
}

#[tokio::test(start_paused = true)]
async fn hardware_tick_scan_returns_every_bundle() {
    let config = config();
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;

    let bundle = imager.scan(&plan(), &CancellationToken::new()).await.unwrap();

    assert_eq!(bundle.len(), 4);
    for (i, frame) in bundle.frames.iter().enumerate() {
        let i = i as u32;
        assert_eq!(frame.index, i);
        assert_eq!(frame.pixels, expected_pixels(i, 8));
        assert_eq!(frame.nominal_position, Some(1_000 + i64::from(i) * 80));
    }
    assert_eq!(bundle.metadata.bundle_count, 4);
    assert_eq!(bundle.metadata.frame_width, 32);
    assert_eq!(bundle.metadata.trigger_source, TriggerSource::HardwareTick);
    assert_eq!(bundle.metadata.label.as_deref(), Some("test"));
    assert!(bundle.metadata.end_position.unwrap() >= 1_320);

    assert_eq!(imager.state(), ImagerState::Idle);
    assert_eq!(bench.stage_position(DeviceKind::StageX), 5_000);
    assert!(!bench.stage_moving(DeviceKind::StageY));
    assert_safe(&bench);
}

#[tokio::test(start_paused = true)]
async fn software_timer_scan_fires_one_trigger_per_bundle() {
    let mut config = config();
    config.imaging.trigger_source = TriggerSource::SoftwareTimer;
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;
    let camera = bench.handle("camera").unwrap();

    let bundle = imager.scan(&plan(), &CancellationToken::new()).await.unwrap();

    assert_eq!(bundle.len(), 4);
    assert_eq!(
        camera.transcript().iter().filter(|c| c.as_str() == "TRIG").count(),
        4
    );
    assert_eq!(bundle.frames[3].pixels, expected_pixels(3, 8));
    assert_eq!(bench.handle("optics").unwrap().count("TRIGARM"), 0);
    assert_safe(&bench);
}

#[tokio::test(start_paused = true)]
async fn invalid_plan_sends_nothing() {
    let config = config();
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;
    let before = bench.total_commands();

    let backwards = ScanPlan {
        y_end: 900,
        ..plan()
    };
    let err = imager
        .scan(&backwards, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SeqError::InvalidPlan(_)), "{:?}", err);
    assert_eq!(bench.total_commands(), before);
    assert_eq!(imager.state(), ImagerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn stalled_stage_is_a_trajectory_divergence() {
    let config = config();
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;
    bench.stall_stage(DeviceKind::StageY, 1_100);

    let err = imager
        .scan(&plan(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            SeqError::ScanFailed(ScanFailure::TrajectoryDivergence { actual: 1_100, .. })
        ),
        "{:?}",
        err
    );
    assert!(!err.is_fatal());
    assert_eq!(imager.state(), ImagerState::Idle);
    assert_safe(&bench);
}

#[tokio::test(start_paused = true)]
async fn camera_overrun_aborts_the_scan() {
    let config = config();
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;
    bench.overrun_camera_after(2);

    let err = imager
        .scan(&plan(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(err, SeqError::ScanFailed(ScanFailure::BufferOverrun { frames: 2 })),
        "{:?}",
        err
    );
    assert_safe(&bench);
}

#[tokio::test(start_paused = true)]
async fn missing_triggers_are_an_underrun() {
    let config = config();
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;
    bench.drop_triggers_after(2);

    let err = imager
        .scan(&plan(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            SeqError::ScanFailed(ScanFailure::Underrun {
                expected: 4,
                collected: 2
            })
        ),
        "{:?}",
        err
    );
    assert_safe(&bench);
}

#[tokio::test(start_paused = true)]
async fn no_trigger_at_all_fails_after_first_bundle_timeout() {
    let mut config = config();
    config.imaging.first_bundle_timeout = Duration::from_millis(50);
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;
    bench.drop_triggers_after(0);

    let err = imager
        .scan(&plan(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(err, SeqError::ScanFailed(ScanFailure::NoFirstBundle { .. })),
        "{:?}",
        err
    );
    assert_safe(&bench);
}

#[tokio::test(start_paused = true)]
async fn slow_scan_waits_one_trigger_period_for_the_first_bundle() {
    let config = config();
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;
    // 80 step pitch at 10 steps/s: the first bundle needs 8 s of travel.
    let slow = ScanPlan {
        bundles: 1,
        velocity: 10.0,
        ..plan()
    };
    assert!(config.imaging.first_bundle_timeout < Duration::from_secs(8));

    let bundle = imager.scan(&slow, &CancellationToken::new()).await.unwrap();

    assert_eq!(bundle.len(), 1);
    assert_eq!(bundle.frames[0].pixels, expected_pixels(0, 8));
    assert_safe(&bench);
}

#[tokio::test(start_paused = true)]
async fn objective_is_focused_before_the_stage_moves() {
    let config = config();
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;
    let focused = ScanPlan {
        z_position: Some(30_000),
        ..plan()
    };

    imager.scan(&focused, &CancellationToken::new()).await.unwrap();

    assert_eq!(bench.objective_position(), 30_000);
    assert_eq!(bench.handle("optics").unwrap().count("ZMV 30000"), 1);
}

#[tokio::test(start_paused = true)]
async fn frame_timestamps_follow_acquisition_order() {
    let config = config();
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;

    let bundle = imager.scan(&plan(), &CancellationToken::new()).await.unwrap();

    let stamps: Vec<_> = bundle.frames.iter().map(|f| f.timestamp).collect();
    assert!(bundle.metadata.started_at < stamps[0]);
    assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", stamps);
    assert!(stamps[3] <= bundle.metadata.completed_at);
}

#[tokio::test(start_paused = true)]
async fn late_software_trigger_is_jitter() {
    let mut config = config();
    config.imaging.trigger_source = TriggerSource::SoftwareTimer;
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;
    // The first match is TRIGSRC while arming, the second the first TRIG.
    bench
        .handle("camera")
        .unwrap()
        .inject_times("TRIG", Fault::Delay(Duration::from_millis(30)), 2);

    let err = imager
        .scan(&plan(), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        SeqError::ScanFailed(ScanFailure::TriggerJitter { late_by, tolerance }) => {
            assert!(late_by > tolerance);
        }
        other => panic!("expected trigger jitter, got {:?}", other),
    }
    assert_safe(&bench);
}

#[tokio::test(start_paused = true)]
async fn lost_stage_link_is_fatal_but_optics_still_shut_down() {
    let config = config();
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;
    let stage_y = bench.handle("stage_y").unwrap();
    let mut states = imager.subscribe();

    let plan = plan();
    let token = CancellationToken::new();
    let (result, _) = tokio::join!(imager.scan(&plan, &token), async {
        states
            .wait_for(|s| *s == ImagerState::Scanning)
            .await
            .map(|_| ())
            .unwrap();
        stage_y.disconnect();
    });

    let err = result.unwrap_err();
    assert!(err.is_fatal(), "{:?}", err);
    match &err {
        SeqError::ScanFailed(ScanFailure::Device(inner)) => {
            assert!(matches!(**inner, SeqError::Transport { .. }), "{:?}", inner);
        }
        other => panic!("expected a device scan failure, got {:?}", other),
    }
    assert_eq!(imager.state(), ImagerState::Idle);
    assert_safe(&bench);
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_scan_tears_down() {
    let config = config();
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;
    let token = CancellationToken::new();
    let mut states = imager.subscribe();
    let canceller = token.clone();

    let plan = plan();
    let (result, _) = tokio::join!(imager.scan(&plan, &token), async move {
        states
            .wait_for(|s| *s == ImagerState::Scanning)
            .await
            .map(|_| ())
            .unwrap();
        canceller.cancel();
    });

    assert!(
        matches!(result, Err(SeqError::Cancelled { .. })),
        "{:?}",
        result
    );
    assert_eq!(imager.state(), ImagerState::Idle);
    assert!(!bench.stage_moving(DeviceKind::StageY));
    assert_safe(&bench);
}

#[tokio::test(start_paused = true)]
async fn concurrent_scans_take_turns_on_the_optics_path() {
    let config = config();
    let bench = SimBench::new(&config);
    let imager = imager(&bench, &config).await;
    let camera = bench.handle("camera").unwrap();
    camera.clear_transcript();
    let token = CancellationToken::new();

    let second = ScanPlan {
        label: Some("second".into()),
        ..plan()
    };
    let first = plan();
    let (a, b) = tokio::join!(imager.scan(&first, &token), imager.scan(&second, &token));
    assert_eq!(a.unwrap().len(), 4);
    assert_eq!(b.unwrap().metadata.label.as_deref(), Some("second"));

    let arming: Vec<String> = camera
        .transcript()
        .into_iter()
        .filter_map(|c| c.split_whitespace().next().map(str::to_string))
        .filter(|c| c == "ARM" || c == "DISARM")
        .collect();
    assert_eq!(arming, ["ARM", "DISARM", "ARM", "DISARM"]);
}
