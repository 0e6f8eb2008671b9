mod common;

use approx::assert_relative_eq;

use stagetrack_core::clock::Clock;
use stagetrack_core::config::TrackingConfig;
use stagetrack_core::controller::Mode;
use stagetrack_core::error::TrackError;
use stagetrack_core::events::{AbortReason, ControllerEvent};
use stagetrack_core::frame::Axis;
use stagetrack_core::sim::SceneConfig;
use stagetrack_core::stage::Stage;

use common::{scene_config, small_config, Rig};

/// Focal plane 2 µm above the stage start.
fn focus_scene() -> SceneConfig {
    SceneConfig {
        focus_z: 2.0,
        ..scene_config(64, 0.5)
    }
}

fn zstack_rig(config: TrackingConfig) -> Rig {
    let mut rig = Rig::new(config, focus_scene(), 20_000);
    rig.controller.set_mode(Mode::ZStack).unwrap();
    rig
}

fn acquire(rig: &mut Rig) {
    rig.controller.run().unwrap();
    let frames = rig.run_frames(100);
    assert!(frames < 100, "Z-stack did not finish");
    assert!(rig.controller.focus_tracker().is_ready());
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

#[test]
fn test_zstack_finds_focal_plane() {
    let mut rig = zstack_rig(small_config(64));
    rig.controller.run().unwrap();

    rig.step();
    assert_eq!(rig.stage.z_limits(), Some((-50.0, 50.0)));

    let frames = rig.run_frames(100);
    assert!(frames < 100);
    assert!(!rig.controller.is_running());

    let acquired: Vec<(usize, f64)> = rig
        .events
        .snapshot()
        .into_iter()
        .filter_map(|e| match e {
            ControllerEvent::ZStackAcquired { samples, best_z } => Some((samples, best_z)),
            _ => None,
        })
        .collect();
    assert_eq!(acquired.len(), 1);
    assert_eq!(acquired[0].0, 21);
    assert_relative_eq!(acquired[0].1, 2.0, epsilon = 1e-9);

    assert_eq!(
        rig.events
            .count(|e| matches!(e, ControllerEvent::ZStackProgress { total: 21, .. })),
        20
    );
    assert_eq!(
        rig.events
            .count(|e| matches!(e, ControllerEvent::Stopped { mode: Mode::ZStack })),
        1
    );

    let model = rig.controller.focus_tracker().model().unwrap();
    assert_eq!(model.samples().len(), 21);
    let peak = model
        .samples()
        .iter()
        .max_by(|a, b| a.brenner.total_cmp(&b.brenner))
        .unwrap();
    assert_relative_eq!(peak.z_offset, 2.0, epsilon = 1e-9);

    // Limits are released and the stage heads for the best slice.
    assert_eq!(rig.stage.z_limits(), None);
    rig.clock.advance(20_000);
    assert_relative_eq!(rig.stage.z_pos(), 2.0, epsilon = 1e-9);
}

#[test]
fn test_zstack_start_rejected_by_stage() {
    let mut rig = zstack_rig(small_config(64));
    rig.stage.set_reject_moves(true);

    assert!(matches!(rig.controller.run(), Err(TrackError::ZStack(_))));
    assert!(!rig.controller.is_running());
    assert_eq!(rig.stage.z_limits(), None);
}

#[test]
fn test_zstack_aborts_when_slice_move_fails() {
    let mut rig = zstack_rig(small_config(64));
    rig.controller.run().unwrap();
    rig.step();
    rig.stage.set_reject_moves(true);
    rig.run_frames(10);

    assert!(!rig.controller.is_running());
    let reason = rig.events.snapshot().into_iter().find_map(|e| match e {
        ControllerEvent::Aborted { reason, .. } => Some(reason),
        _ => None,
    });
    assert!(matches!(reason, Some(AbortReason::ZStack(_))));
    assert_eq!(rig.stage.z_limits(), None);
    assert!(!rig.controller.focus_tracker().is_ready());
}

#[test]
fn test_stop_cancels_acquisition() {
    let mut rig = zstack_rig(small_config(64));
    rig.controller.run().unwrap();
    rig.run_frames(5);
    assert!(rig.controller.focus_tracker().is_acquiring());

    rig.controller.stop();
    assert!(!rig.controller.focus_tracker().is_acquiring());
    assert_eq!(rig.stage.z_limits(), None);
}

// ---------------------------------------------------------------------------
// Z autofocus
// ---------------------------------------------------------------------------

#[test]
fn test_autofocus_holds_and_recovers_focus() {
    let mut config = small_config(64);
    config.control.track_z = true;
    config.control.track_xy = false;
    let exposure = config.control.exposure_time_us;
    let mut rig = zstack_rig(config);
    acquire(&mut rig);

    rig.controller.set_mode(Mode::Tracking).unwrap();
    rig.controller.run().unwrap();
    rig.controller.arm_autofocus_capture();
    rig.events.clear();

    // At focus: no corrections, one capture once focus is confirmed.
    rig.run_frames(8);
    assert_relative_eq!(rig.stage.z_pos(), 2.0, epsilon = 1e-9);
    assert_eq!(
        rig.events.count(|e| matches!(e, ControllerEvent::ZMoved { .. })),
        0
    );
    assert_eq!(
        rig.events
            .count(|e| matches!(e, ControllerEvent::AutofocusCapture { .. })),
        1
    );

    let mut stage = rig.stage.clone();
    assert!(stage.move_z(4.0, true));
    assert_relative_eq!(rig.stage.z_pos(), 6.0, epsilon = 1e-9);

    let mut gate_checked = false;
    for _ in 0..60 {
        rig.step();
        let moved = rig
            .events
            .count(|e| matches!(e, ControllerEvent::ZMoved { .. }));
        if moved > 0 && !gate_checked {
            // A motion-complete acknowledgement shortens the settle wait.
            let now = rig.clock.now_us();
            assert!(rig.controller.z_tracker().next_allowed_us() > now + exposure);
            rig.controller.motion_complete(Axis::Z);
            assert_eq!(rig.controller.z_tracker().next_allowed_us(), now + exposure);
            gate_checked = true;
        }
    }
    assert!(gate_checked, "no Z correction after defocus");
    assert!(rig.controller.is_running());

    let first_move = rig.events.snapshot().into_iter().find_map(|e| match e {
        ControllerEvent::ZMoved { distance, .. } => Some(distance),
        _ => None,
    });
    assert!(first_move.unwrap() < 0.0, "first correction must head back down");
    assert!(
        (rig.stage.z_pos() - 2.0).abs() < 3.0,
        "stage ended at z = {}",
        rig.stage.z_pos()
    );
}
