use ndarray::{Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::consts::PARALLEL_PIXEL_THRESHOLD;
use crate::frame::{Frame, Vec2};
use crate::stage::StagePosition;

/// Defocus blur below this sigma (pixels) is not applied.
const MIN_BLUR_SIGMA: f32 = 0.3;

/// Sigma of the smoothing that turns white noise into the texture.
const TEXTURE_SMOOTHING: f32 = 1.2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub width: usize,
    pub height: usize,
    /// Side length of the periodic texture tile.
    pub tile_size: usize,
    /// True µm per pixel of the simulated optics.
    pub pixel_size: Vec2,
    /// Sample drift in µm per second.
    pub drift_um_per_s: Vec2,
    /// Stage Z of the focal plane (µm).
    pub focus_z: f64,
    /// Defocus blur sigma in pixels per µm away from focus.
    pub blur_per_um: f64,
    pub max_blur_sigma: f32,
    /// Peak-to-peak amplitude of additive uniform noise.
    pub noise: f32,
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 320,
            tile_size: 512,
            pixel_size: Vec2::new(0.5, 0.5),
            drift_um_per_s: Vec2::ZERO,
            focus_z: 0.0,
            blur_per_um: 0.6,
            max_blur_sigma: 8.0,
            noise: 0.01,
            seed: 0x5eed,
        }
    }
}

/// Renders camera frames of a textured sample under the simulated stage.
///
/// The sample is a periodic texture; a stage move or sample drift of `d`
/// µm shifts the image content by `d / pixel_size` pixels. Distance from
/// `focus_z` blurs the frame.
#[derive(Clone, Debug)]
pub struct SyntheticScene {
    config: SceneConfig,
    tile: Array2<f32>,
}

impl SyntheticScene {
    pub fn new(config: SceneConfig) -> Self {
        let tile = generate_tile(config.tile_size.max(8), config.seed);
        Self { config, tile }
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Content offset in pixels for a stage position at time `time_us`.
    pub fn content_offset(&self, stage: StagePosition, time_us: u64) -> Vec2 {
        let t = time_us as f64 * 1e-6;
        let drift = self.config.drift_um_per_s * t;
        let px = self.config.pixel_size;
        Vec2::new((stage.x + drift.x) / px.x, (stage.y + drift.y) / px.y)
    }

    /// Defocus blur sigma in pixels at stage height `z`.
    pub fn blur_sigma(&self, z: f64) -> f32 {
        let sigma = ((z - self.config.focus_z).abs() * self.config.blur_per_um) as f32;
        sigma.min(self.config.max_blur_sigma)
    }

    /// Pixels of the frame seen with the stage at `stage` at `time_us`.
    /// `frame_index` seeds the noise.
    pub fn render(&self, stage: StagePosition, time_us: u64, frame_index: u64) -> Array2<f32> {
        let offset = self.content_offset(stage, time_us);
        let (h, w) = (self.config.height, self.config.width);
        let mut data = Array2::<f32>::zeros((h, w));

        let render_row = |(row, mut line): (usize, ndarray::ArrayViewMut1<f32>)| {
            let y = row as f64 - offset.y;
            for (col, v) in line.iter_mut().enumerate() {
                *v = sample_periodic(&self.tile, y, col as f64 - offset.x);
            }
        };
        if h * w >= PARALLEL_PIXEL_THRESHOLD {
            data.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(render_row);
        } else {
            data.axis_iter_mut(Axis(0)).enumerate().for_each(render_row);
        }

        let sigma = self.blur_sigma(stage.z);
        if sigma >= MIN_BLUR_SIGMA {
            data = gaussian_blur(&data, sigma, EdgeMode::Clamp);
        }

        if self.config.noise > 0.0 {
            let amplitude = self.config.noise;
            let seed = self.config.seed ^ frame_index.wrapping_mul(0x9e37_79b9_7f4a_7c15);
            for (i, v) in data.iter_mut().enumerate() {
                let n = unit_hash(seed, i as u64) - 0.5;
                *v = (*v + n * amplitude).clamp(0.0, 1.0);
            }
        }
        data
    }

    /// Timed frame for the controller.
    pub fn frame(
        &self,
        stage: StagePosition,
        capture_time_us: u64,
        process_time_us: u64,
        frame_index: u64,
    ) -> Frame {
        Frame::new(
            self.render(stage, capture_time_us, frame_index),
            capture_time_us,
            process_time_us,
        )
    }
}

/// Smoothed white noise stretched to [0.1, 0.9]; periodic in both axes.
fn generate_tile(size: usize, seed: u64) -> Array2<f32> {
    let noise = Array2::from_shape_fn((size, size), |(r, c)| {
        unit_hash(seed, (r * size + c) as u64)
    });
    let mut tile = gaussian_blur(&noise, TEXTURE_SMOOTHING, EdgeMode::Wrap);

    let (lo, hi) = tile
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let span = (hi - lo).max(f32::EPSILON);
    tile.mapv_inplace(|v| 0.1 + 0.8 * (v - lo) / span);
    tile
}

/// Bilinear sample with periodic wrap-around.
fn sample_periodic(data: &Array2<f32>, y: f64, x: f64) -> f32 {
    let (h, w) = data.dim();
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = (x - x0) as f32;
    let fy = (y - y0) as f32;

    let wrap = |v: f64, n: usize| v.rem_euclid(n as f64) as usize % n;
    let (c0, r0) = (wrap(x0, w), wrap(y0, h));
    let (c1, r1) = ((c0 + 1) % w, (r0 + 1) % h);

    let v00 = data[[r0, c0]];
    let v10 = data[[r0, c1]];
    let v01 = data[[r1, c0]];
    let v11 = data[[r1, c1]];

    v00 * (1.0 - fx) * (1.0 - fy) + v10 * fx * (1.0 - fy) + v01 * (1.0 - fx) * fy + v11 * fx * fy
}

/// Uniform value in [0, 1) from a seed and an index (splitmix64).
fn unit_hash(seed: u64, index: u64) -> f32 {
    let mut z = seed.wrapping_add(index.wrapping_mul(0x9e37_79b9_7f4a_7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    (z >> 40) as f32 / (1u64 << 24) as f32
}

#[derive(Clone, Copy, Debug)]
enum EdgeMode {
    Clamp,
    Wrap,
}

/// Separable Gaussian blur.
fn gaussian_blur(data: &Array2<f32>, sigma: f32, edge: EdgeMode) -> Array2<f32> {
    let kernel = gaussian_kernel(sigma);
    let rows = convolve(data, &kernel, edge, Axis(1));
    convolve(&rows, &kernel, edge, Axis(0))
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil() as usize;
    let s2 = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-x * x / s2).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// 1D convolution of every lane along `axis`.
fn convolve(data: &Array2<f32>, kernel: &[f32], edge: EdgeMode, axis: Axis) -> Array2<f32> {
    let radius = kernel.len() as isize / 2;
    let mut out = Array2::<f32>::zeros(data.dim());

    let convolve_lane = |(src, mut dst): (ndarray::ArrayView1<f32>, ndarray::ArrayViewMut1<f32>)| {
        let n = src.len() as isize;
        for (i, d) in dst.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for (k, &kv) in kernel.iter().enumerate() {
                let j = i as isize + k as isize - radius;
                let j = match edge {
                    EdgeMode::Clamp => j.clamp(0, n - 1),
                    EdgeMode::Wrap => j.rem_euclid(n),
                };
                sum += src[j as usize] * kv;
            }
            *d = sum;
        }
    };

    // Lanes along `axis` are the views of the other axis.
    let lane_axis = Axis(1 - axis.index());
    if data.len() >= PARALLEL_PIXEL_THRESHOLD {
        data.axis_iter(lane_axis)
            .into_par_iter()
            .zip(out.axis_iter_mut(lane_axis).into_par_iter())
            .for_each(convolve_lane);
    } else {
        data.axis_iter(lane_axis)
            .zip(out.axis_iter_mut(lane_axis))
            .for_each(convolve_lane);
    }
    out
}
