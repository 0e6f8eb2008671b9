use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::consts::FOCUS_AVERAGE_LEN;

/// Snapshot of the focus state of the most recent frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FocusValue {
    /// Raw Brenner gradient value
    pub brenner: f64,
    /// Log-domain focus value, a smoother alternative to `brenner`
    pub focus: f64,
    /// Moving average of `brenner` over the last few frames
    pub avg_brenner: f64,
    /// Moving average of `focus` over the last few frames
    pub avg_focus: f64,
    pub max_intensity: f64,
    pub noise_level: f64,
}

/// Fixed-capacity moving-average register. The newest value is at the front.
#[derive(Clone, Debug)]
pub struct FocusAverager {
    values: VecDeque<f64>,
    capacity: usize,
}

impl Default for FocusAverager {
    fn default() -> Self {
        Self::new(FOCUS_AVERAGE_LEN)
    }
}

impl FocusAverager {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity + 1),
            capacity: capacity.max(1),
        }
    }

    /// Prepend `value`, dropping the oldest once over capacity. Returns the
    /// new average.
    pub fn push(&mut self, value: f64) -> f64 {
        self.values.push_front(value);
        if self.values.len() > self.capacity {
            self.values.pop_back();
        }
        self.average()
    }

    pub fn average(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}
