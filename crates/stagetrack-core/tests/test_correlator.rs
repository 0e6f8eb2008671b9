mod common;

use approx::assert_relative_eq;

use stagetrack_core::config::{CorrelatorConfig, FocusConfig};
use stagetrack_core::correlator::{fuse_displacement, Correlator};
use stagetrack_core::fft::FftPlan;
use stagetrack_core::frame::{PixelPos, Vec2};
use stagetrack_core::sim::SyntheticScene;
use stagetrack_core::spectrum::{
    correlation_surface, spatial_maximum, unwrap_periodic, SpectrumImage,
};

use common::{scene_config, shifted_frame};

fn correlator(fft: usize, depth: usize, minimum_offset: f64) -> Correlator {
    let config = CorrelatorConfig {
        fft_width: fft,
        fft_height: fft,
        track_depth: depth,
        minimum_offset,
        subpixel_refinement: false,
    };
    Correlator::new(&config, &FocusConfig::default()).unwrap()
}

// ---------------------------------------------------------------------------
// Correlation surface and peak unwrapping
// ---------------------------------------------------------------------------

#[test]
fn test_unwrap_periodic_negative_shift() {
    let shift = unwrap_periodic(PixelPos { x: 61, y: 5 }, 64, 64);
    assert_eq!(shift, Vec2::new(-3.0, 5.0));
}

#[test]
fn test_unwrap_periodic_half_size_stays_positive() {
    assert_eq!(unwrap_periodic(PixelPos { x: 32, y: 32 }, 64, 64), Vec2::new(32.0, 32.0));
    assert_eq!(unwrap_periodic(PixelPos { x: 33, y: 0 }, 64, 64), Vec2::new(-31.0, 0.0));
}

#[test]
fn test_correlation_peak_of_wrapped_shift() {
    let scene = SyntheticScene::new(scene_config(64, 1.0));
    let plan = FftPlan::new(64, 64);

    let mut previous = SpectrumImage::new(64, 64, 50.0);
    let dc = previous
        .assign_and_transform(&shifted_frame(&scene, 0.0, 0.0), &plan, None)
        .unwrap();
    let mut current = SpectrumImage::new(64, 64, 50.0);
    current
        .assign_and_transform(&shifted_frame(&scene, -3.0, 5.0), &plan, Some(dc))
        .unwrap();

    let surface = correlation_surface(&current, &previous, &plan);
    let peak = spatial_maximum(&surface);
    assert_eq!(peak, PixelPos { x: 61, y: 5 });
    assert_eq!(unwrap_periodic(peak, 64, 64), Vec2::new(-3.0, 5.0));
}

#[test]
fn test_frame_smaller_than_fft_is_rejected() {
    let scene = SyntheticScene::new(scene_config(32, 1.0));
    let mut c = correlator(64, 2, 0.5);
    let err = c.track(&shifted_frame(&scene, 0.0, 0.0)).unwrap_err();
    assert!(err.to_string().contains("smaller than the FFT size"));
}

// ---------------------------------------------------------------------------
// Rolling correlator
// ---------------------------------------------------------------------------

#[test]
fn test_warm_up_returns_zero_until_history_is_full() {
    let scene = SyntheticScene::new(scene_config(64, 1.0));
    let depth = 2;
    let mut c = correlator(64, depth, 0.5);

    // The first depth + 1 frames only fill the ring, however far they moved.
    for i in 0..=depth {
        let offset = c.track(&shifted_frame(&scene, 4.0 * i as f64, 0.0)).unwrap();
        assert_eq!(offset, Vec2::ZERO, "call {} should be suppressed", i + 1);
        assert!(!c.is_ready());
    }

    let offset = c.track(&shifted_frame(&scene, 12.0, 0.0)).unwrap();
    assert!(c.is_ready());
    assert_eq!(offset, Vec2::new(4.0, 0.0));
}

#[test]
fn test_tracks_wrapped_shift_against_origin() {
    let scene = SyntheticScene::new(scene_config(64, 1.0));
    let mut c = correlator(64, 2, 0.5);
    for _ in 0..3 {
        c.track(&shifted_frame(&scene, 0.0, 0.0)).unwrap();
    }

    let offset = c.track(&shifted_frame(&scene, -3.0, 5.0)).unwrap();
    assert_eq!(offset, Vec2::new(-3.0, 5.0));
    assert_eq!(c.current().offset(), Vec2::new(-3.0, 5.0));
}

#[test]
fn test_minimum_offset_suppresses_without_losing_motion() {
    let scene = SyntheticScene::new(scene_config(64, 1.0));
    let mut c = correlator(64, 2, 1.5);
    for _ in 0..3 {
        c.track(&shifted_frame(&scene, 0.0, 0.0)).unwrap();
    }

    let small = c.track(&shifted_frame(&scene, 1.0, 0.0)).unwrap();
    assert_eq!(small, Vec2::ZERO);

    // The suppressed shift is still measured against the origin, so the
    // next report is the full displacement.
    let larger = c.track(&shifted_frame(&scene, 2.0, 0.0)).unwrap();
    assert_eq!(larger, Vec2::new(2.0, 0.0));
}

#[test]
fn test_steady_motion_accumulates() {
    let scene = SyntheticScene::new(scene_config(64, 1.0));
    let mut c = correlator(64, 3, 0.5);
    for _ in 0..4 {
        c.track(&shifted_frame(&scene, 0.0, 0.0)).unwrap();
    }

    for step in 1..=6 {
        let offset = c.track(&shifted_frame(&scene, step as f64, -(step as f64))).unwrap();
        assert_relative_eq!(offset.x, step as f64, epsilon = 1e-9);
        assert_relative_eq!(offset.y, -(step as f64), epsilon = 1e-9);
    }
}

#[test]
fn test_reset_starts_new_origin() {
    let scene = SyntheticScene::new(scene_config(64, 1.0));
    let mut c = correlator(64, 1, 0.5);
    for _ in 0..2 {
        c.track(&shifted_frame(&scene, 0.0, 0.0)).unwrap();
    }
    assert_eq!(c.track(&shifted_frame(&scene, 6.0, 0.0)).unwrap(), Vec2::new(6.0, 0.0));

    c.reset();
    assert_eq!(c.images_tracked(), 0);
    assert!(!c.is_ready());
    for _ in 0..2 {
        assert_eq!(c.track(&shifted_frame(&scene, 6.0, 0.0)).unwrap(), Vec2::ZERO);
    }
    assert_eq!(c.track(&shifted_frame(&scene, 9.0, 0.0)).unwrap(), Vec2::new(3.0, 0.0));
}

#[test]
fn test_focus_is_reported_while_tracking() {
    let scene = SyntheticScene::new(scene_config(64, 1.0));
    let mut c = correlator(64, 1, 0.5);
    c.track(&shifted_frame(&scene, 0.0, 0.0)).unwrap();
    let focus = c.last_focus();
    assert!(focus.brenner > 0.0);
    assert_relative_eq!(focus.focus, focus.brenner.ln_1p(), epsilon = 1e-12);
    assert_relative_eq!(focus.avg_brenner, focus.brenner, epsilon = 1e-12);
}

#[test]
fn test_snapshot_brenner_leaves_history_alone() {
    let scene = SyntheticScene::new(scene_config(64, 1.0));
    let mut c = correlator(64, 1, 0.5);
    let frame = shifted_frame(&scene, 0.0, 0.0);
    let brenner = c.compute_brenner_value_for_snapshot(&frame);
    assert!(brenner > 0.0);
    assert_eq!(c.images_tracked(), 0);
}

// ---------------------------------------------------------------------------
// Consensus over lags
// ---------------------------------------------------------------------------

#[test]
fn test_fuse_rejects_inconsistent_lag() {
    // Lag 2 predicts 62 px on a 256 px window (> 20 %) and measured 10 px.
    let previous = [
        Vec2::new(10.0, 0.0),
        Vec2::new(8.0, 0.0),
        Vec2::new(-50.0, 0.0),
        Vec2::new(4.0, 0.0),
    ];
    let local = [
        Vec2::new(2.0, 0.0),
        Vec2::new(4.2, 0.0),
        Vec2::new(10.0, 0.0),
        Vec2::new(7.9, 0.0),
    ];
    let fused = fuse_displacement(&previous, &local, 256, 256);
    assert_relative_eq!(fused.x, (12.0 + 12.2 + 11.9) / 3.0, epsilon = 1e-9);
    assert_relative_eq!(fused.y, 0.0, epsilon = 1e-12);
}

#[test]
fn test_fuse_large_prediction_accepted_when_it_agrees() {
    // Lag 1 should have seen 12 px, above 13 % of a 64 px window, and
    // measured 12.5 px: within 10 %.
    let previous = [Vec2::new(10.0, 0.0), Vec2::new(0.0, 0.0)];
    let local = [Vec2::new(2.0, 0.0), Vec2::new(12.5, 0.0)];
    let fused = fuse_displacement(&previous, &local, 64, 64);
    assert_relative_eq!(fused.x, 12.25, epsilon = 1e-12);
}

#[test]
fn test_fuse_large_prediction_rejected_when_it_disagrees() {
    let previous = [Vec2::new(10.0, 0.0), Vec2::new(0.0, 0.0)];
    let local = [Vec2::new(2.0, 0.0), Vec2::new(14.0, 0.0)];
    let fused = fuse_displacement(&previous, &local, 64, 64);
    assert_eq!(fused, Vec2::new(12.0, 0.0));
}

#[test]
fn test_fuse_plausible_prediction_accepted_outright() {
    // A 1.5 px prediction takes part whatever lag 1 measured.
    let previous = [Vec2::new(1.0, 0.0), Vec2::ZERO];
    let fused = fuse_displacement(&previous, &[Vec2::new(0.5, 0.0), Vec2::new(4.0, 0.0)], 64, 64);
    assert_relative_eq!(fused.x, 2.75, epsilon = 1e-12);
}

#[test]
fn test_fuse_tiny_prediction_accepted_on_tiny_window() {
    // 1.5 px is above 13 % of an 8 px window, but too small for a
    // relative comparison.
    let previous = [Vec2::new(1.0, 0.0), Vec2::ZERO];
    let fused = fuse_displacement(&previous, &[Vec2::new(0.5, 0.0), Vec2::new(4.0, 0.0)], 8, 8);
    assert_relative_eq!(fused.x, 2.75, epsilon = 1e-12);
}

#[test]
fn test_fuse_without_lags_is_zero() {
    assert_eq!(fuse_displacement(&[], &[], 64, 64), Vec2::ZERO);
}
