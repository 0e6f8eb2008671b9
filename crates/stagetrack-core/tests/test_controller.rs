mod common;

use std::sync::Arc;

use approx::assert_relative_eq;
use ndarray::Array2;

use stagetrack_core::clock::{Clock, ManualClock};
use stagetrack_core::config::TrackingConfig;
use stagetrack_core::controller::{Controller, Mode};
use stagetrack_core::error::TrackError;
use stagetrack_core::events::{AbortReason, ControllerEvent, NoOpSink};
use stagetrack_core::frame::{Frame, Vec2};
use stagetrack_core::sim::{SceneConfig, StageCommand, SyntheticScene};
use stagetrack_core::stage::{Stage, StagePosition};

use common::{scene_config, small_config, Rig};

/// Unit pixel size so image and stage units coincide.
fn unit_config() -> TrackingConfig {
    let mut config = small_config(64);
    config.stage.pixel_size_x = 1.0;
    config.stage.pixel_size_y = 1.0;
    config
}

fn warm_up(rig: &mut Rig) {
    let frames = rig.controller.config().correlator.track_depth + 1;
    for _ in 0..frames {
        rig.step_shifted(0.0, 0.0);
    }
    // Still one frame short of a correlation.
    assert!(!rig.controller.correlator().unwrap().is_ready());
}

fn first_abort(rig: &Rig) -> Option<AbortReason> {
    rig.events.snapshot().into_iter().find_map(|e| match e {
        ControllerEvent::Aborted { reason, .. } => Some(reason),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Run control
// ---------------------------------------------------------------------------

#[test]
fn test_run_without_stage_fails() {
    let clock = Arc::new(ManualClock::new(0));
    let mut controller = Controller::new(small_config(64), clock, Box::new(NoOpSink)).unwrap();
    assert!(matches!(controller.run(), Err(TrackError::NoStage)));
    assert!(!controller.is_running());
}

#[test]
fn test_run_with_z_tracking_needs_focus_model() {
    let mut config = small_config(64);
    config.control.track_z = true;
    let mut rig = Rig::new(config, scene_config(64, 0.5), 0);
    assert!(matches!(rig.controller.run(), Err(TrackError::FocusModelMissing)));
}

#[test]
fn test_mode_is_locked_while_running() {
    let mut rig = Rig::new(small_config(64), scene_config(64, 0.5), 0);
    rig.controller.run().unwrap();

    assert!(matches!(rig.controller.run(), Err(TrackError::AlreadyRunning)));
    assert!(matches!(
        rig.controller.set_mode(Mode::Timing),
        Err(TrackError::ModeLocked)
    ));
    assert!(matches!(
        rig.controller.set_config(small_config(32)),
        Err(TrackError::ModeLocked)
    ));
    assert_eq!(rig.controller.mode(), Mode::Tracking);
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut rig = Rig::new(small_config(64), scene_config(64, 0.5), 0);
    let mut config = small_config(64);
    config.correlator.track_depth = 0;
    assert!(matches!(
        rig.controller.set_config(config),
        Err(TrackError::InvalidConfig(_))
    ));
    assert_eq!(rig.controller.config().correlator.track_depth, 2);
}

#[test]
fn test_stop_ends_run_and_ignores_frames() {
    let mut rig = Rig::new(small_config(64), scene_config(64, 0.5), 0);
    rig.controller.run().unwrap();
    rig.step();
    rig.controller.stop();

    assert!(!rig.controller.is_running());
    assert_eq!(
        rig.events
            .count(|e| matches!(e, ControllerEvent::Stopped { mode: Mode::Tracking })),
        1
    );

    let before = rig.events.snapshot().len();
    rig.step();
    assert_eq!(rig.events.snapshot().len(), before);
}

#[test]
fn test_started_event_and_focus_per_frame() {
    let mut rig = Rig::new(small_config(64), scene_config(64, 0.5), 0);
    rig.controller.run().unwrap();
    rig.run_frames(5);

    assert_eq!(
        rig.events.count(|e| matches!(e, ControllerEvent::Started { .. })),
        1
    );
    assert_eq!(rig.events.count(|e| matches!(e, ControllerEvent::Focus(_))), 5);
    assert_eq!(
        rig.events
            .count(|e| matches!(e, ControllerEvent::ContinuousLog { .. })),
        5
    );
}

#[test]
fn test_spectrum_preview_without_brenner() {
    let mut config = small_config(64);
    config.focus.brenner_enabled = false;
    let mut rig = Rig::new(config, scene_config(64, 0.5), 0);
    rig.controller.run().unwrap();
    rig.run_frames(3);

    assert_eq!(rig.events.count(|e| matches!(e, ControllerEvent::Focus(_))), 0);
    let previews: Vec<Array2<f32>> = rig
        .events
        .snapshot()
        .into_iter()
        .filter_map(|e| match e {
            ControllerEvent::SpectrumPreview(img) => Some(img),
            _ => None,
        })
        .collect();
    assert_eq!(previews.len(), 3);
    assert_eq!(previews[0].dim(), (64, 64));
}

// ---------------------------------------------------------------------------
// Safety
// ---------------------------------------------------------------------------

#[test]
fn test_frame_smaller_than_fft_aborts() {
    let mut rig = Rig::new(small_config(64), scene_config(64, 0.5), 0);
    rig.controller.run().unwrap();
    let frame = Frame::new(Array2::zeros((32, 32)), 20_000, 20_000);
    rig.controller.track_image(&frame);

    assert!(!rig.controller.is_running());
    assert_eq!(rig.stage.stop_count(), 1);
    assert_eq!(
        first_abort(&rig),
        Some(AbortReason::FrameTooSmall {
            width: 32,
            height: 32,
            required_width: 64,
            required_height: 64
        })
    );
}

#[test]
fn test_total_move_limit_aborts_before_moving() {
    let mut config = unit_config();
    config.control.controller_gain = 0.9;
    config.control.predictor_size = 0;
    config.stage.max_total_move = 5.0;
    let mut rig = Rig::new(config, scene_config(64, 1.0), 0);
    rig.controller.run().unwrap();
    warm_up(&mut rig);

    rig.step_shifted(4.0, 0.0);
    assert_eq!(rig.xy_moves(), 1);
    assert_relative_eq!(rig.controller.total_move().x, -3.6, epsilon = 1e-9);

    rig.step_shifted(4.0, 0.0);
    assert_eq!(rig.xy_moves(), 1, "the offending move must not be issued");
    assert!(!rig.controller.is_running());
    assert_eq!(rig.stage.stop_count(), 1);
    assert_relative_eq!(rig.controller.total_move().x, -3.6, epsilon = 1e-9);

    match first_abort(&rig) {
        Some(AbortReason::TotalMoveExceeded { total, limit }) => {
            assert_eq!(limit, 5.0);
            assert_relative_eq!(total.x, -7.2, epsilon = 1e-9);
        }
        other => panic!("expected total move abort, got {other:?}"),
    }

    let before = rig.events.snapshot().len();
    rig.step_shifted(4.0, 0.0);
    assert_eq!(rig.events.snapshot().len(), before);
    assert_eq!(rig.xy_moves(), 1);
}

#[test]
fn test_large_offset_is_saturated() {
    let mut config = unit_config();
    config.control.controller_gain = 0.9;
    let mut rig = Rig::new(config, scene_config(64, 1.0), 0);
    rig.controller.run().unwrap();
    warm_up(&mut rig);

    rig.step_shifted(30.0, 0.0);
    let history = rig.stage.history();
    assert_eq!(history.len(), 1);
    match history[0].command {
        StageCommand::Xy { dx, dy } => {
            assert_relative_eq!(dx, -16.0, epsilon = 1e-12);
            assert_relative_eq!(dy, 0.0, epsilon = 1e-12);
        }
        other => panic!("unexpected command {other:?}"),
    }
}

#[test]
fn test_rejected_move_aborts() {
    let mut rig = Rig::new(unit_config(), scene_config(64, 1.0), 0);
    rig.controller.run().unwrap();
    warm_up(&mut rig);
    rig.stage.set_reject_moves(true);

    rig.step_shifted(4.0, 0.0);
    assert!(!rig.controller.is_running());
    assert_eq!(first_abort(&rig), Some(AbortReason::StageRejected));
}

// ---------------------------------------------------------------------------
// Smith predictor and backpressure
// ---------------------------------------------------------------------------

#[test]
fn test_stale_frame_only_advances_predictor() {
    let mut rig = Rig::new(small_config(64), scene_config(64, 0.5), 0);
    rig.controller.run().unwrap();
    rig.controller.predictor_mut().advance(Vec2::new(1.0, 0.0));

    let frame = rig.capture_shifted(0.0, 0.0);
    let limit = rig.controller.config().control.max_process_delay_us;
    rig.clock.set(frame.process_time_us + limit + 1);
    rig.controller.track_image(&frame);

    let entries: Vec<Vec2> = rig.controller.predictor().iter().copied().collect();
    assert_eq!(entries, vec![Vec2::ZERO, Vec2::new(1.0, 0.0)]);
    assert_eq!(rig.controller.correlator().unwrap().images_tracked(), 0);
    assert_eq!(rig.events.count(|e| matches!(e, ControllerEvent::Focus(_))), 0);
    assert_eq!(
        rig.events
            .count(|e| matches!(e, ControllerEvent::ContinuousLog { .. })),
        1
    );
    assert!(rig.stage.history().is_empty());
}

#[test]
fn test_move_below_deadband_keeps_predictor() {
    let mut rig = Rig::new(unit_config(), scene_config(64, 1.0), 0);
    rig.controller.run().unwrap();
    warm_up(&mut rig);

    rig.controller.predictor_mut().advance(Vec2::new(0.2, 0.0));
    rig.step_shifted(0.0, 0.0);

    let entries: Vec<Vec2> = rig.controller.predictor().iter().copied().collect();
    assert_eq!(entries, vec![Vec2::new(0.2, 0.0), Vec2::ZERO]);
    assert_eq!(rig.xy_moves(), 0);
}

#[test]
fn test_busy_stage_advances_predictor_with_zero() {
    let mut config = unit_config();
    config.control.controller_gain = 0.5;
    let mut rig = Rig::new(config, scene_config(64, 1.0), 100_000);
    rig.controller.run().unwrap();
    warm_up(&mut rig);

    rig.step_shifted(4.0, 0.0);
    let entries: Vec<Vec2> = rig.controller.predictor().iter().copied().collect();
    assert_eq!(entries, vec![Vec2::new(-2.0, 0.0), Vec2::ZERO]);

    rig.step_shifted(4.0, 0.0);
    let entries: Vec<Vec2> = rig.controller.predictor().iter().copied().collect();
    assert_eq!(entries, vec![Vec2::ZERO, Vec2::new(-2.0, 0.0)]);
    assert_eq!(rig.xy_moves(), 1);
}

#[test]
fn test_predictor_length_is_stable() {
    let mut config = small_config(64);
    config.control.predictor_size = 3;
    let mut rig = Rig::new(config, scene_config(64, 0.5), 40_000);
    rig.scene = SyntheticScene::new(SceneConfig {
        drift_um_per_s: Vec2::new(20.0, -10.0),
        ..scene_config(64, 0.5)
    });
    rig.controller.run().unwrap();

    for _ in 0..40 {
        rig.step();
        assert_eq!(rig.controller.predictor().len(), 3);
    }

    rig.controller.set_predictor_size(5);
    assert_eq!(rig.controller.predictor().len(), 5);
    assert_eq!(rig.controller.config().control.predictor_size, 5);
    rig.run_frames(5);
    assert_eq!(rig.controller.predictor().len(), 5);
}

#[test]
fn test_predictor_resize_keeps_order() {
    let mut config = small_config(64);
    config.control.predictor_size = 3;
    let mut rig = Rig::new(config, scene_config(64, 0.5), 0);
    rig.controller.run().unwrap();

    let (a, b, c) = (
        Vec2::new(1.0, -1.0),
        Vec2::new(2.0, -2.0),
        Vec2::new(3.0, -3.0),
    );
    for v in [a, b, c] {
        rig.controller.predictor_mut().advance(v);
    }
    let entries = |rig: &Rig| -> Vec<Vec2> { rig.controller.predictor().iter().copied().collect() };
    assert_eq!(entries(&rig), vec![c, b, a]);

    rig.controller.set_predictor_size(2);
    assert_eq!(entries(&rig), vec![c, b]);

    rig.controller.set_predictor_size(4);
    assert_eq!(entries(&rig), vec![c, b, Vec2::ZERO, Vec2::ZERO]);
    assert!(rig.controller.is_running());
}

#[test]
fn test_transfer_function_gain_and_dead_time() {
    let mut config = small_config(64);
    config.control.controller_gain = 0.5;
    config.stage.pixel_size_x = 0.5;
    config.stage.pixel_size_y = -0.25;
    let clock = Arc::new(ManualClock::new(0));
    let mut controller = Controller::new(config, clock, Box::new(NoOpSink)).unwrap();

    let offset = Vec2::new(4.0, -2.0);
    let out = controller.transfer_function(offset);
    assert_relative_eq!(out.x, -1.0, epsilon = 1e-12);
    assert_relative_eq!(out.y, -0.25, epsilon = 1e-12);

    // A correction already in flight for the same offset cancels it.
    let in_flight = -controller.stage_coordinates(offset);
    controller.predictor_mut().advance(in_flight);
    let out = controller.transfer_function(offset);
    assert_relative_eq!(out.x, 0.0, epsilon = 1e-12);
    assert_relative_eq!(out.y, 0.0, epsilon = 1e-12);
}

#[test]
fn test_coordinate_round_trip() {
    let mut config = small_config(64);
    config.stage.pixel_size_x = 0.37;
    config.stage.pixel_size_y = -1.3;
    let clock = Arc::new(ManualClock::new(0));
    let controller = Controller::new(config, clock, Box::new(NoOpSink)).unwrap();

    for v in [
        Vec2::new(0.0, 0.0),
        Vec2::new(12.5, -7.25),
        Vec2::new(-1e-3, 4e3),
    ] {
        let back = controller.image_coordinates(controller.stage_coordinates(v));
        assert_relative_eq!(back.x, v.x, max_relative = 1e-12);
        assert_relative_eq!(back.y, v.y, max_relative = 1e-12);
    }
    let stage = controller.stage_coordinates(Vec2::new(10.0, 10.0));
    assert_relative_eq!(stage.x, 3.7, epsilon = 1e-12);
    assert_relative_eq!(stage.y, -13.0, epsilon = 1e-12);
}

// ---------------------------------------------------------------------------
// Closed loop on the simulator
// ---------------------------------------------------------------------------

#[test]
fn test_tracking_follows_drift() {
    let mut config = small_config(64);
    config.control.predictor_size = 0;
    let scene = SceneConfig {
        drift_um_per_s: Vec2::new(50.0, -25.0),
        ..scene_config(64, 0.5)
    };
    let mut rig = Rig::new(config, scene, 0);
    rig.controller.run().unwrap();

    assert_eq!(rig.run_frames(200), 200);
    assert!(rig.controller.is_running());

    // The last warm-up frame is the tracking origin.
    let origin = rig
        .scene
        .content_offset(StagePosition::default(), 3 * rig.interval_us);
    let now = rig.clock.now_us();
    let residual = rig.scene.content_offset(rig.stage.position(), now) - origin;
    assert!(residual.x.abs() < 6.0, "residual x {}", residual.x);
    assert!(residual.y.abs() < 6.0, "residual y {}", residual.y);

    // 4 s of drift at (50, -25) µm/s has to be undone by the stage.
    let total = rig.controller.total_move();
    assert!(total.x < -150.0, "total x {}", total.x);
    assert!(total.y > 75.0, "total y {}", total.y);
    assert_eq!(
        rig.stage.commanded_xy(),
        total,
        "every issued move is accounted for"
    );
}

#[test]
fn test_frame_rate_is_reported_once_per_second() {
    let mut rig = Rig::new(small_config(64), scene_config(64, 0.5), 0);
    rig.controller.run().unwrap();
    rig.run_frames(52);

    let rates: Vec<f64> = rig
        .events
        .snapshot()
        .into_iter()
        .filter_map(|e| match e {
            ControllerEvent::FrameRate { fps } => Some(fps),
            _ => None,
        })
        .collect();
    assert_eq!(rates.len(), 1);
    assert_relative_eq!(rates[0], 50.0, epsilon = 1e-9);
    assert_eq!(
        rig.events
            .count(|e| matches!(e, ControllerEvent::StagePosition(_))),
        1
    );
}
