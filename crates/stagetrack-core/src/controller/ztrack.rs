use std::collections::VecDeque;

use crate::consts::{FOCUS_HISTORY_LEN, IN_FOCUS_CONFIRMATIONS};
use crate::focus_tracker::FocusTracker;

/// What the autofocus wants to do with the newest focus sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ZDecision {
    /// Not enough history yet.
    Wait,
    /// Within the satisfaction band; `confirmed` when the last few samples
    /// all were.
    InFocus { confirmed: bool },
    /// Move by `distance` (µm, unsigned) in `direction` (±1).
    Move { distance: f64, direction: f64 },
}

/// Z autofocus state owned by the controller.
#[derive(Clone, Debug)]
pub struct ZTracker {
    /// Brenner values, newest first.
    history: VecDeque<f64>,
    direction: f64,
    /// Frames captured before this time may show the last Z move.
    next_allowed_us: u64,
    /// Autofocus capture fires at or after this time.
    capture_armed_at_us: Option<u64>,
}

impl Default for ZTracker {
    fn default() -> Self {
        Self {
            history: VecDeque::with_capacity(FOCUS_HISTORY_LEN + 1),
            direction: 1.0,
            next_allowed_us: 0,
            capture_armed_at_us: None,
        }
    }
}

impl ZTracker {
    pub fn reset(&mut self) {
        self.history.clear();
        self.direction = 1.0;
        self.next_allowed_us = 0;
    }

    pub fn history(&self) -> impl Iterator<Item = &f64> {
        self.history.iter()
    }

    pub fn direction(&self) -> f64 {
        self.direction
    }

    pub fn next_allowed_us(&self) -> u64 {
        self.next_allowed_us
    }

    pub fn set_next_allowed_us(&mut self, t: u64) {
        self.next_allowed_us = t;
    }

    pub fn push(&mut self, brenner: f64) {
        self.history.push_front(brenner);
        self.history.truncate(FOCUS_HISTORY_LEN);
    }

    pub fn arm_capture(&mut self, at_us: u64) {
        self.capture_armed_at_us = Some(at_us);
    }

    pub fn disarm_capture(&mut self) {
        self.capture_armed_at_us = None;
    }

    pub fn capture_armed(&self, now_us: u64) -> bool {
        self.capture_armed_at_us.is_some_and(|t| now_us >= t)
    }

    /// Decision tree on the two newest samples and the calibrated model.
    pub fn decide(&mut self, tracker: &FocusTracker) -> ZDecision {
        let (Some(&current), Some(&previous)) = (self.history.front(), self.history.get(1)) else {
            return ZDecision::Wait;
        };

        let noise = tracker.noise_level_from_brenner(current);
        let upper = tracker.upper_threshold_focus() - noise;
        let lower = tracker.lower_threshold_focus();

        if current >= upper {
            let confirmed = self.history.len() >= IN_FOCUS_CONFIRMATIONS
                && self
                    .history
                    .iter()
                    .take(IN_FOCUS_CONFIRMATIONS)
                    .all(|&v| v >= upper);
            return ZDecision::InFocus { confirmed };
        }

        let distance = if current < previous - noise {
            // Focus got worse: the last move went the wrong way (or past the
            // peak). Turn around and undo it with some margin.
            self.direction = -self.direction;
            if previous >= lower {
                2.0 * tracker.correct_focus(previous)
            } else {
                2.0 * tracker.large_correction_step()
            }
        } else if current >= lower {
            tracker.correct_focus(current)
        } else {
            tracker.large_correction_step()
        };

        ZDecision::Move {
            distance,
            direction: self.direction,
        }
    }
}
