use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Arrival instant on the capture side
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Capture-side sequence, unrelated to sample sequence numbers
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Bgra32,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// Four-byte codec tag carried in format descriptions
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Bgra32 => *b"BGRA",
            PixelFormat::Yuyv4 => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Nv12 => *b"NV12",
        }
    }

    /// Smallest byte count a frame of this format can occupy.
    ///
    /// Compressed formats only need to be non-empty.
    pub fn min_frame_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => pixels * 3,
            PixelFormat::Bgra32 => pixels * 4,
            PixelFormat::Yuyv4 => pixels * 2,
            PixelFormat::Nv12 => pixels + pixels / 2,
            PixelFormat::Mjpeg => 1,
        }
    }

    /// Row stride in bytes of the first plane
    pub fn stride(self, width: u32) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => width * 3,
            PixelFormat::Bgra32 => width * 4,
            PixelFormat::Yuyv4 => width * 2,
            PixelFormat::Nv12 | PixelFormat::Mjpeg => width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_frame_len() {
        assert_eq!(PixelFormat::Yuyv4.min_frame_len(4, 2), 16);
        assert_eq!(PixelFormat::Nv12.min_frame_len(4, 2), 12);
        assert_eq!(PixelFormat::Bgra32.min_frame_len(4, 2), 32);
        assert_eq!(PixelFormat::Mjpeg.min_frame_len(1280, 720), 1);
    }

    #[test]
    fn test_fourcc_tags() {
        assert_eq!(&PixelFormat::Yuyv4.fourcc(), b"YUYV");
        assert_eq!(&PixelFormat::Mjpeg.fourcc(), b"MJPG");
    }
}
