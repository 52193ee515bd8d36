pub mod frame;
#[cfg(feature = "gstreamer-source")]
pub mod gst_capture;
pub mod source;
pub mod stub;
pub mod v4l2;

pub use frame::Frame;
pub use frame::FrameMetadata;
pub use frame::PixelFormat;
#[cfg(feature = "gstreamer-source")]
pub use gst_capture::GstSource;
pub use source::{FrameCallback, FrameSource};
pub use stub::{ManualFeed, ManualSource};
pub use v4l2::V4l2Source;
