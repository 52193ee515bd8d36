//! Hand-fed frame source for tests and the `--stub` demo

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tracing::{debug, info};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::{FrameCallback, FrameSource};
use crate::error::CaptureError;

#[derive(Default)]
struct Shared {
    callback: Mutex<Option<FrameCallback>>,
    running: AtomicBool,
    sessions: AtomicU64,
    no_device: bool,
}

/// Frame source whose frames are pushed in through a [`ManualFeed`]
pub struct ManualSource {
    shared: Arc<Shared>,
}

/// Sender half of a [`ManualSource`]
#[derive(Clone)]
pub struct ManualFeed {
    shared: Arc<Shared>,
}

impl ManualSource {
    pub fn new() -> (Self, ManualFeed) {
        Self::with_shared(Shared::default())
    }

    /// A source that behaves as if no capture device were attached
    pub fn without_device() -> (Self, ManualFeed) {
        Self::with_shared(Shared {
            no_device: true,
            ..Shared::default()
        })
    }

    fn with_shared(shared: Shared) -> (Self, ManualFeed) {
        let shared = Arc::new(shared);
        (
            Self {
                shared: Arc::clone(&shared),
            },
            ManualFeed { shared },
        )
    }
}

impl FrameSource for ManualSource {
    fn name(&self) -> &str {
        "manual"
    }

    fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError> {
        if self.shared.no_device {
            return Err(CaptureError::NoDevice);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self
            .shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(on_frame);
        self.shared.sessions.fetch_add(1, Ordering::Relaxed);
        info!("Manual frame source started");
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl ManualFeed {
    /// Deliver a frame as the capture device would.
    ///
    /// Returns false when the source is not running.
    pub fn deliver(&self, frame: Frame) -> bool {
        let callback = self
            .shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => {
                callback(frame);
                true
            }
            None => {
                debug!("Manual source idle, frame discarded");
                false
            }
        }
    }

    /// Number of capture sessions opened so far
    pub fn sessions(&self) -> u64 {
        self.shared.sessions.load(Ordering::Relaxed)
    }
}

/// Solid mid-grey frame in the requested format
pub fn test_pattern(width: u32, height: u32, format: PixelFormat, sequence: u64) -> Frame {
    let len = format.min_frame_len(width, height);
    let data = match format {
        // SOI + EOI
        PixelFormat::Mjpeg => vec![0xFF, 0xD8, 0xFF, 0xD9],
        _ => vec![0x80; len],
    };

    Frame::new(
        Bytes::from(data),
        FrameMetadata {
            sequence,
            width,
            height,
            stride: format.stride(width),
            format,
            device_timestamp: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_reaches_callback() {
        let (mut source, feed) = ManualSource::new();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);

        assert!(!feed.deliver(test_pattern(4, 2, PixelFormat::Yuyv4, 1)));

        source
            .start(Arc::new(move |_frame| {
                counter.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        assert!(feed.deliver(test_pattern(4, 2, PixelFormat::Yuyv4, 2)));
        assert_eq!(seen.load(Ordering::Relaxed), 1);

        source.stop();
        assert!(!feed.deliver(test_pattern(4, 2, PixelFormat::Yuyv4, 3)));
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_start_twice_opens_one_session() {
        let (mut source, feed) = ManualSource::new();
        source.start(Arc::new(|_| {})).unwrap();
        source.start(Arc::new(|_| {})).unwrap();
        assert_eq!(feed.sessions(), 1);
    }

    #[test]
    fn test_without_device() {
        let (mut source, _feed) = ManualSource::without_device();
        assert!(matches!(
            source.start(Arc::new(|_| {})),
            Err(CaptureError::NoDevice)
        ));
        assert!(!source.is_running());
    }

    #[test]
    fn test_pattern_size() {
        let frame = test_pattern(8, 4, PixelFormat::Yuyv4, 0);
        assert_eq!(frame.data.len(), 64);
        assert_eq!(frame.meta.stride, 16);
    }
}
