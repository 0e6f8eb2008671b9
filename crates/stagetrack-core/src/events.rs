use std::sync::mpsc;

use ndarray::Array2;

use crate::controller::{CalibrationAxis, Mode, TimingReport};
use crate::error::TrackError;
use crate::focus::FocusValue;
use crate::frame::Vec2;
use crate::stage::StagePosition;

/// Why a run was stopped by the controller itself.
#[derive(Clone, Debug, PartialEq)]
pub enum AbortReason {
    FrameTooSmall {
        width: usize,
        height: usize,
        required_width: usize,
        required_height: usize,
    },
    TotalMoveExceeded {
        total: Vec2,
        limit: f64,
    },
    StageRejected,
    MeasurementTimeout {
        mode: Mode,
    },
    ImplausiblePixelSize {
        axis: CalibrationAxis,
        pixel_size: f64,
    },
    ZStack(String),
    Internal(String),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameTooSmall {
                width,
                height,
                required_width,
                required_height,
            } => write!(
                f,
                "frame {width}x{height} is smaller than the FFT size {required_width}x{required_height}"
            ),
            Self::TotalMoveExceeded { total, limit } => {
                write!(f, "total stage move {total} exceeds limit of {limit} µm")
            }
            Self::StageRejected => write!(f, "stage rejected a move command"),
            Self::MeasurementTimeout { mode } => {
                write!(f, "{mode}: no stage movement detected before timeout")
            }
            Self::ImplausiblePixelSize { axis, pixel_size } => {
                write!(f, "measured {axis} pixel size {pixel_size} µm is implausible")
            }
            Self::ZStack(msg) => write!(f, "Z-stack failed: {msg}"),
            Self::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<TrackError> for AbortReason {
    fn from(e: TrackError) -> Self {
        match e {
            TrackError::FrameTooSmall {
                width,
                height,
                required_width,
                required_height,
            } => Self::FrameTooSmall {
                width,
                height,
                required_width,
                required_height,
            },
            TrackError::ZStack(msg) => Self::ZStack(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Everything the controller reports to the outside world.
#[derive(Clone, Debug)]
pub enum ControllerEvent {
    Started {
        mode: Mode,
    },
    /// The run finished normally or on request.
    Stopped {
        mode: Mode,
    },
    Aborted {
        mode: Mode,
        reason: AbortReason,
    },
    FrameRate {
        fps: f64,
    },
    Focus(FocusValue),
    StagePosition(StagePosition),
    /// Per-frame Brenner/position record, emitted in every mode.
    ContinuousLog {
        capture_time_us: u64,
        brenner: f64,
        position: StagePosition,
    },
    StageMoved {
        image_offset: Vec2,
        stage_move: Vec2,
    },
    ZMoved {
        distance: f64,
        brenner: f64,
    },
    PixelSizeMeasured {
        pixel_size: Vec2,
    },
    TimingMeasured(TimingReport),
    ZStackProgress {
        done: usize,
        total: usize,
    },
    ZStackAcquired {
        samples: usize,
        best_z: f64,
    },
    AutofocusCapture {
        capture_time_us: u64,
        brenner: f64,
    },
    SpectrumPreview(Array2<f32>),
}

/// Observer of controller events. The controller has no knowledge of who
/// listens (UI, logging, tests).
pub trait EventSink: Send {
    fn emit(&self, event: ControllerEvent);
}

/// Discards all events.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: ControllerEvent) {}
}

/// Forwards events over an mpsc channel. A disconnected receiver is ignored.
pub struct ChannelSink {
    tx: mpsc::Sender<ControllerEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ControllerEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end.
    pub fn pair() -> (Self, mpsc::Receiver<ControllerEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ControllerEvent) {
        let _ = self.tx.send(event);
    }
}
