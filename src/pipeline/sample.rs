//! Immutable media samples handed to the external reader

use std::sync::Arc;

use serde::Serialize;

use crate::capture::{Frame, PixelFormat};
use crate::error::SampleError;
use crate::pipeline::clock::MediaTime;

/// Samples in this stream never carry discontinuities
pub const NO_DISCONTINUITIES: u32 = 0;

/// Container description: dimensions plus codec tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormatDescription {
    pub width: u32,
    pub height: u32,
    pub codec: [u8; 4],
}

impl FormatDescription {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self, SampleError> {
        if width == 0 || height == 0 {
            return Err(SampleError::EmptyDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            codec: format.fourcc(),
        })
    }

    /// Describe the image actually held by `frame`
    pub fn for_frame(frame: &Frame) -> Result<Self, SampleError> {
        let meta = &frame.meta;
        let description = Self::new(meta.width, meta.height, meta.format)?;

        let expected = meta.format.min_frame_len(meta.width, meta.height);
        if frame.data.len() < expected {
            return Err(SampleError::ShortBuffer {
                format: meta.format,
                expected,
                actual: frame.data.len(),
            });
        }
        Ok(description)
    }

    pub fn codec_str(&self) -> String {
        String::from_utf8_lossy(&self.codec).into_owned()
    }
}

/// Presentation/decode timing of one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleTiming {
    pub presentation: MediaTime,
    /// Always `None`: frames are presented in capture order
    pub decode: Option<MediaTime>,
    pub duration: MediaTime,
}

/// A frame wrapped with its timing and sequence number
#[derive(Debug, Clone)]
pub struct MediaSample {
    frame: Arc<Frame>,
    timing: SampleTiming,
    sequence: u64,
    format: FormatDescription,
    discontinuity_flags: u32,
}

impl MediaSample {
    pub fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }

    pub fn timing(&self) -> SampleTiming {
        self.timing
    }

    pub fn presentation_timestamp(&self) -> MediaTime {
        self.timing.presentation
    }

    pub fn decode_timestamp(&self) -> Option<MediaTime> {
        self.timing.decode
    }

    pub fn duration(&self) -> MediaTime {
        self.timing.duration
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn format(&self) -> &FormatDescription {
        &self.format
    }

    pub fn discontinuity_flags(&self) -> u32 {
        self.discontinuity_flags
    }
}

/// Builds samples for one stream. Each sample is described by the frame it
/// carries, which may differ in size from the stream's declared format.
#[derive(Debug, Clone)]
pub struct SampleBuilder {
    duration: MediaTime,
}

impl SampleBuilder {
    pub fn new(duration: MediaTime) -> Self {
        Self { duration }
    }

    pub fn build(
        &self,
        frame: Arc<Frame>,
        presentation: MediaTime,
        sequence: u64,
    ) -> Result<MediaSample, SampleError> {
        let format = FormatDescription::for_frame(&frame)?;

        Ok(MediaSample {
            frame,
            timing: SampleTiming {
                presentation,
                decode: None,
                duration: self.duration,
            },
            sequence,
            format,
            discontinuity_flags: NO_DISCONTINUITIES,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::stub::test_pattern;
    use crate::pipeline::clock::NANOS_TIMESCALE;
    use bytes::Bytes;

    fn builder() -> SampleBuilder {
        SampleBuilder::new(MediaTime::new(1, 30))
    }

    #[test]
    fn test_build_sample() {
        let frame = Arc::new(test_pattern(8, 4, PixelFormat::Yuyv4, 7));
        let pts = MediaTime::new(33_000_000, NANOS_TIMESCALE);
        let sample = builder().build(Arc::clone(&frame), pts, 3).unwrap();

        assert_eq!(sample.sequence(), 3);
        assert_eq!(sample.presentation_timestamp(), pts);
        assert_eq!(sample.decode_timestamp(), None);
        assert_eq!(sample.duration(), MediaTime::new(1, 30));
        assert_eq!(sample.format().codec_str(), "YUYV");
        assert_eq!(sample.discontinuity_flags(), NO_DISCONTINUITIES);
        assert!(Arc::ptr_eq(sample.frame(), &frame));
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut frame = test_pattern(8, 4, PixelFormat::Yuyv4, 0);
        frame.data = Bytes::from_static(&[0u8; 10]);
        let err = builder()
            .build(Arc::new(frame), MediaTime::new(0, 1), 0)
            .unwrap_err();
        assert!(matches!(err, SampleError::ShortBuffer { expected: 64, actual: 10, .. }));
    }

    #[test]
    fn test_format_follows_frame_size() {
        let frame = Arc::new(test_pattern(16, 6, PixelFormat::Nv12, 0));
        let sample = builder().build(frame, MediaTime::new(0, 1), 0).unwrap();
        assert_eq!(sample.format().width, 16);
        assert_eq!(sample.format().height, 6);
        assert_eq!(sample.format().codec_str(), "NV12");
    }

    #[test]
    fn test_empty_format_description() {
        assert_eq!(
            FormatDescription::new(0, 720, PixelFormat::Yuyv4),
            Err(SampleError::EmptyDimensions { width: 0, height: 720 })
        );
    }
}
