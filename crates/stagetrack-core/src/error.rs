use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image format error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("Frame {width}x{height} is smaller than the FFT size {required_width}x{required_height}")]
    FrameTooSmall {
        width: usize,
        height: usize,
        required_width: usize,
        required_height: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No stage attached")]
    NoStage,

    #[error("No correlator available")]
    CorrelatorUnavailable,

    #[error("Correlator rebuild still pending")]
    RebuildPending,

    #[error("Z tracking requested without a calibrated focus model")]
    FocusModelMissing,

    #[error("Controller is already running")]
    AlreadyRunning,

    #[error("Mode and configuration cannot change while running")]
    ModeLocked,

    #[error("Z-stack error: {0}")]
    ZStack(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

pub type Result<T> = std::result::Result<T, TrackError>;
