use std::collections::VecDeque;

use crate::frame::Vec2;

/// Stage moves that were commanded but are not yet visible in the image.
///
/// Holds exactly `size` entries, newest first. Every processed frame shifts
/// the queue by one, so a move drops out after `size` frames, which is the
/// dead time of the stage/camera loop.
#[derive(Clone, Debug)]
pub struct SmithPredictor {
    entries: VecDeque<Vec2>,
}

impl SmithPredictor {
    pub fn new(size: usize) -> Self {
        Self {
            entries: std::iter::repeat(Vec2::ZERO).take(size).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record this frame's command (zero when nothing was sent) and retire
    /// the oldest entry.
    pub fn advance(&mut self, stage_move: Vec2) {
        let size = self.entries.len();
        self.entries.push_front(stage_move);
        self.entries.truncate(size);
    }

    /// Grow with zero moves or drop the oldest entries; the order of the
    /// remaining entries is kept.
    pub fn resize(&mut self, size: usize) {
        self.entries.resize(size, Vec2::ZERO);
    }

    /// Sum of all pending moves.
    pub fn pending(&self) -> Vec2 {
        self.entries.iter().fold(Vec2::ZERO, |acc, &v| acc + v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vec2> {
        self.entries.iter()
    }

    /// Forget all pending moves, keeping the size.
    pub fn clear(&mut self) {
        for v in &mut self.entries {
            *v = Vec2::ZERO;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_predictor_stays_empty() {
        let mut p = SmithPredictor::new(0);
        p.advance(Vec2::new(1.0, 1.0));
        assert!(p.is_empty());
        assert_eq!(p.pending(), Vec2::ZERO);
    }

    #[test]
    fn advance_is_newest_first() {
        let mut p = SmithPredictor::new(2);
        p.advance(Vec2::new(1.0, 0.0));
        p.advance(Vec2::new(2.0, 0.0));
        let v: Vec<f64> = p.iter().map(|v| v.x).collect();
        assert_eq!(v, vec![2.0, 1.0]);
    }
}
