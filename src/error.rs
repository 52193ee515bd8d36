use thiserror::Error;

use crate::capture::PixelFormat;

/// Errors raised while opening or running a frame source
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No capture device found")]
    NoDevice,

    #[error("Device {path} doesn't support video capture")]
    NotCaptureDevice { path: String },

    #[error("Unsupported pixel format for {backend}: {format:?}")]
    UnsupportedFormat {
        backend: &'static str,
        format: PixelFormat,
    },

    #[error("Capture backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the stream clock
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("Invalid clock configuration: {0}")]
    InvalidConfig(String),

    #[error("Capture instant predates the clock origin")]
    BeforeEpoch,

    #[error("Timestamp overflows the clock time base")]
    Overflow,
}

/// Errors raised while creating the hand-off queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue capacity must be non-zero")]
    ZeroCapacity,
}

/// Errors raised while describing a frame or building a sample from it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("Frame has a zero dimension ({width}x{height})")]
    EmptyDimensions { width: u32, height: u32 },

    #[error("Frame holds {actual} bytes, {format:?} needs at least {expected}")]
    ShortBuffer {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by the stream controller
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream resource unavailable: {0}")]
    Unavailable(String),

    #[error("No Tokio runtime available to drive the output timer")]
    NoRuntime,

    #[error(transparent)]
    Capture(#[from] CaptureError),
}
