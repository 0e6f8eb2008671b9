use std::sync::Arc;

use ndarray::{Array2, ArrayViewMut1, Axis};
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::consts::PARALLEL_PIXEL_THRESHOLD;

/// Forward and inverse 2D FFT plans for one computation size.
///
/// Planning is the expensive part (it can take a long time for awkward
/// sizes), so a plan is built once per correlator and reused for every frame.
/// `FftPlanner` itself is not shared between threads; only the finished
/// `Arc<dyn Fft>` plans are.
#[derive(Clone)]
pub struct FftPlan {
    width: usize,
    height: usize,
    row_forward: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for FftPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FftPlan")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl FftPlan {
    pub fn new(width: usize, height: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            width,
            height,
            row_forward: planner.plan_fft_forward(width),
            col_forward: planner.plan_fft_forward(height),
            row_inverse: planner.plan_fft_inverse(width),
            col_inverse: planner.plan_fft_inverse(height),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// In-place 2D forward FFT: row-wise, then column-wise.
    pub fn forward(&self, data: &mut Array2<Complex<f64>>) {
        debug_assert_eq!(data.dim(), (self.height, self.width));
        let parallel = self.width * self.height >= PARALLEL_PIXEL_THRESHOLD;
        transform_lanes(data, Axis(0), &self.row_forward, parallel);
        transform_lanes(data, Axis(1), &self.col_forward, parallel);
    }

    /// In-place 2D inverse FFT, normalized by `1/(h*w)`.
    pub fn inverse(&self, data: &mut Array2<Complex<f64>>) {
        debug_assert_eq!(data.dim(), (self.height, self.width));
        let parallel = self.width * self.height >= PARALLEL_PIXEL_THRESHOLD;
        transform_lanes(data, Axis(1), &self.col_inverse, parallel);
        transform_lanes(data, Axis(0), &self.row_inverse, parallel);

        let scale = 1.0 / (self.width * self.height) as f64;
        data.mapv_inplace(|v| v * scale);
    }
}

/// Run `fft` over every lane obtained by iterating along `axis`
/// (Axis(0) yields rows, Axis(1) yields columns).
fn transform_lanes(
    data: &mut Array2<Complex<f64>>,
    axis: Axis,
    fft: &Arc<dyn Fft<f64>>,
    parallel: bool,
) {
    if parallel {
        data.axis_iter_mut(axis)
            .into_par_iter()
            .for_each(|lane| transform_lane(lane, fft));
    } else {
        for lane in data.axis_iter_mut(axis) {
            transform_lane(lane, fft);
        }
    }
}

fn transform_lane(mut lane: ArrayViewMut1<'_, Complex<f64>>, fft: &Arc<dyn Fft<f64>>) {
    match lane.as_slice_mut() {
        Some(slice) => fft.process(slice),
        None => {
            let mut buffer = lane.to_vec();
            fft.process(&mut buffer);
            for (dst, src) in lane.iter_mut().zip(buffer) {
                *dst = src;
            }
        }
    }
}
