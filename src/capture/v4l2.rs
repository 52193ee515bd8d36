//! V4L2 frame source with memory-mapped streaming on a dedicated capture thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::io;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::{FrameCallback, FrameSource};
use crate::error::CaptureError;
use crate::utils::{self, FoundDevice};
use crate::{CaptureConfig, StreamConfig};

/// Upper bound on one blocking dequeue, and so on how long `stop` takes to
/// reach the capture thread
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(250);

/// Consecutive failed dequeues after which the device is treated as gone
const MAX_CONSECUTIVE_ERRORS: u32 = 100;

/// Minimum spacing between repeated capture error logs
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// V4L2 capture session delivering frames from its own thread
pub struct V4l2Source {
    capture: CaptureConfig,
    width: u32,
    height: u32,
    fps: u32,
    format: PixelFormat,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl V4l2Source {
    pub fn new(stream: &StreamConfig, capture: CaptureConfig) -> Self {
        Self {
            capture,
            width: stream.width,
            height: stream.height,
            fps: stream.fps,
            format: stream.format,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn fourcc(&self) -> Result<FourCC, CaptureError> {
        match self.format {
            PixelFormat::Mjpeg => Ok(FourCC::new(b"MJPG")),
            PixelFormat::Yuyv4 => Ok(FourCC::new(b"YUYV")),
            PixelFormat::Nv12 => Ok(FourCC::new(b"NV12")),
            format => Err(CaptureError::UnsupportedFormat {
                backend: "v4l2",
                format,
            }),
        }
    }

    /// Open and configure the device, returning it with the negotiated size
    fn open(&self, found: &FoundDevice) -> Result<(Device, u32, u32), CaptureError> {
        let device = Device::with_path(&found.path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::NotCaptureDevice {
                path: found.path.clone(),
            });
        }

        let mut fmt = device.format()?;
        fmt.width = self.width;
        fmt.height = self.height;
        fmt.fourcc = self.fourcc()?;
        let fmt = device.set_format(&fmt)?;
        if fmt.width != self.width || fmt.height != self.height {
            warn!(
                "Device negotiated {}x{} instead of {}x{}",
                fmt.width, fmt.height, self.width, self.height
            );
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(self.fps)) {
            warn!("Failed to set capture rate to {} fps: {}", self.fps, e);
        }

        Ok((device, fmt.width, fmt.height))
    }

    /// Wait for the capture thread of an earlier session, at most one dequeue
    /// timeout once its flag is cleared
    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("V4L2 capture thread panicked");
            }
        }
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        "v4l2"
    }

    #[instrument(skip_all, fields(device = %self.capture.target_device))]
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError> {
        if self.is_running() {
            return Ok(());
        }
        // The previous session must release the device before it is reconfigured
        self.join_worker();

        let found = utils::discover_device(&self.capture.target_device)?;
        let (device, width, height) = self.open(&found)?;

        let mut stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, self.capture.buffer_count)?;
        stream.set_timeout(DEQUEUE_TIMEOUT);
        info!(
            "Capture stream started with {} buffers",
            self.capture.buffer_count
        );

        // Fresh flag per session so a worker left over from `stop` never resumes
        let running = Arc::new(AtomicBool::new(true));
        self.running = Arc::clone(&running);
        let format = self.format;

        let worker = std::thread::Builder::new()
            .name("vcam-capture".into())
            .spawn(move || {
                capture_loop(device, stream, running, on_frame, width, height, format)
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("V4L2 capture stopping");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.stop();
        self.join_worker();
    }
}

/// What the capture loop does after a failed dequeue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    /// No frame within the timeout: poll again
    Retry,
    /// Transient error, logged with `suppressed` repeats folded in
    Log { suppressed: u64 },
    /// Transient error inside the log interval
    Suppress,
    /// The device is gone: end the session
    DeviceLost,
}

/// Classifies dequeue failures and throttles their logging
#[derive(Debug)]
struct FailureTracker {
    consecutive: u32,
    suppressed: u64,
    last_logged: Option<Instant>,
}

impl FailureTracker {
    fn new() -> Self {
        Self {
            consecutive: 0,
            suppressed: 0,
            last_logged: None,
        }
    }

    fn on_frame(&mut self) {
        self.consecutive = 0;
    }

    fn on_error(&mut self, e: &io::Error, now: Instant) -> FailureAction {
        if e.kind() == io::ErrorKind::TimedOut {
            return FailureAction::Retry;
        }

        // EIO, ENXIO, ENODEV, EPIPE and ESHUTDOWN all mean the device went away
        let device_lost = matches!(e.raw_os_error(), Some(5 | 6 | 19 | 32 | 108));
        self.consecutive += 1;
        if device_lost || self.consecutive >= MAX_CONSECUTIVE_ERRORS {
            return FailureAction::DeviceLost;
        }

        match self.last_logged {
            Some(at) if now.duration_since(at) < ERROR_LOG_INTERVAL => {
                self.suppressed += 1;
                FailureAction::Suppress
            }
            _ => {
                self.last_logged = Some(now);
                FailureAction::Log {
                    suppressed: std::mem::take(&mut self.suppressed),
                }
            }
        }
    }
}

fn capture_loop(
    _device: Device,
    mut stream: MmapStream<'static>,
    running: Arc<AtomicBool>,
    on_frame: FrameCallback,
    width: u32,
    height: u32,
    format: PixelFormat,
) {
    let mut sequence = 0u64;
    let mut failures = FailureTracker::new();

    while running.load(Ordering::Acquire) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) => {
                match failures.on_error(&e, Instant::now()) {
                    FailureAction::Retry => debug!("No frame within {:?}", DEQUEUE_TIMEOUT),
                    FailureAction::Log { suppressed: 0 } => error!("Capture error: {}", e),
                    FailureAction::Log { suppressed } => {
                        error!("Capture error: {} (suppressed {} repeats)", e, suppressed)
                    }
                    FailureAction::Suppress => {}
                    FailureAction::DeviceLost => {
                        warn!("Capture device stopped delivering: {}", e);
                        break;
                    }
                }
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };
        failures.on_frame();

        let timestamp = Instant::now();
        let data = Bytes::copy_from_slice(buf);
        sequence += 1;

        let frame_meta = FrameMetadata {
            sequence,
            width,
            height,
            stride: format.stride(width),
            format,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec.max(0) as u64)
                    + Duration::from_micros(meta.timestamp.usec.max(0) as u64),
            ),
        };

        metrics::counter!("vcam_frames_captured_total").increment(1);
        on_frame(Frame {
            data,
            meta: Arc::new(frame_meta),
            timestamp,
        });
    }

    // A lost device ends the session; the next `start` reopens it
    running.store(false, Ordering::Release);
    info!("V4L2 capture loop exited after {} frames", sequence);
}
