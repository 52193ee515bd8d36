pub mod capture;
pub mod error;
pub mod pipeline;
pub mod stream;
pub mod utils;

use std::path::Path;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::Frame;
pub use error::{CaptureError, ClockError, ConfigError, QueueError, SampleError, StreamError};
pub use pipeline::{MediaSample, MediaTime, QueueHandle, QueueListener};
pub use stream::{PropertyKey, PropertyValue, StreamController, StreamId};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub capture: CaptureConfig,
    pub clock: ClockConfig,
}

/// The virtual stream as the host sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    V4l2,
    Gstreamer,
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackend,
    /// Exact device name to capture from; empty or unmatched uses the system default
    pub target_device: String,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub name: String,
    pub timescale: u32,
    pub smoothing_events: usize,
    pub smoothing_averages: usize,
    pub min_query_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "vcam".into(),
            width: 1280,
            height: 720,
            fps: 30,
            format: PixelFormat::Yuyv4,
            queue_capacity: 30,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackend::V4l2,
            target_device: String::new(),
            buffer_count: 4,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            name: "vcam clock".into(),
            timescale: pipeline::NANOS_TIMESCALE,
            smoothing_events: 100,
            smoothing_averages: 10,
            min_query_interval_ms: 100,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `VCAM__SECTION__KEY`
    /// environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("VCAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let stream = &self.stream;
        if stream.fps == 0 {
            return Err(ConfigError::Invalid("stream.fps must be non-zero".into()));
        }
        if stream.width == 0 || stream.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "stream size {}x{} has a zero dimension",
                stream.width, stream.height
            )));
        }
        if stream.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "stream.queue_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
