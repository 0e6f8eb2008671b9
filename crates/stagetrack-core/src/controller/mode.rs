use serde::{Deserialize, Serialize};

/// Operating mode of a run. Fixed while the controller is running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Closed-loop XY tracking with optional Z autofocus.
    #[default]
    Tracking,
    /// Pixel-size calibration from known stage moves.
    Measuring,
    /// Stage command latency measurement.
    Timing,
    /// Z-stack acquisition for the focus model.
    ZStack,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tracking => write!(f, "Tracking"),
            Self::Measuring => write!(f, "Measuring"),
            Self::Timing => write!(f, "Timing"),
            Self::ZStack => write!(f, "Z-stack"),
        }
    }
}
