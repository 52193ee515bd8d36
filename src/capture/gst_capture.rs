//! GStreamer-based frame source: `v4l2src ! … ! appsink` with a new-sample callback

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{info, warn};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::{FrameCallback, FrameSource};
use crate::error::CaptureError;
use crate::utils;
use crate::{CaptureConfig, StreamConfig};

/// GStreamer capture session; frames arrive on the pipeline's streaming thread
pub struct GstSource {
    capture: CaptureConfig,
    width: u32,
    height: u32,
    fps: u32,
    format: PixelFormat,
    pipeline: Option<gst::Pipeline>,
}

impl GstSource {
    pub fn new(stream: &StreamConfig, capture: CaptureConfig) -> Self {
        Self {
            capture,
            width: stream.width,
            height: stream.height,
            fps: stream.fps,
            format: stream.format,
            pipeline: None,
        }
    }

    /// Build the pipeline string delivering the stream's format to the appsink
    fn build_pipeline_string(&self, device: &str) -> Result<String, CaptureError> {
        let (width, height, fps) = (self.width, self.height, self.fps);

        let pipeline = match self.format {
            PixelFormat::Mjpeg => format!(
                "v4l2src device={} name=source ! \
                 image/jpeg,width={},height={},framerate={}/1 ! \
                 queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
                 appsink name=appsink",
                device, width, height, fps
            ),
            format => {
                let raw = raw_format_name(format)?;
                format!(
                    "v4l2src device={} name=source ! \
                     queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
                     videoconvert ! videoscale ! videorate ! \
                     video/x-raw,format={},width={},height={},framerate={}/1 ! \
                     appsink name=appsink",
                    device, raw, width, height, fps
                )
            }
        };

        Ok(pipeline)
    }
}

fn raw_format_name(format: PixelFormat) -> Result<&'static str, CaptureError> {
    match format {
        PixelFormat::Yuyv4 => Ok("YUY2"),
        PixelFormat::Nv12 => Ok("NV12"),
        PixelFormat::Rgb24 => Ok("RGB"),
        PixelFormat::Bgr24 => Ok("BGR"),
        PixelFormat::Bgra32 => Ok("BGRA"),
        PixelFormat::Mjpeg => Err(CaptureError::UnsupportedFormat {
            backend: "gstreamer",
            format,
        }),
    }
}

fn backend_err(context: &str, e: impl std::fmt::Display) -> CaptureError {
    CaptureError::Backend(format!("{}: {}", context, e))
}

impl FrameSource for GstSource {
    fn name(&self) -> &str {
        "gstreamer"
    }

    fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError> {
        if self.pipeline.is_some() {
            return Ok(());
        }

        gst::init().map_err(|e| backend_err("Failed to initialize GStreamer", e))?;

        let found = utils::discover_device(&self.capture.target_device)?;
        let pipeline_str = self.build_pipeline_string(&found.path)?;
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| backend_err("Failed to parse pipeline", e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CaptureError::Backend("Failed to create pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| CaptureError::Backend("Failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CaptureError::Backend("Failed to cast to AppSink".into()))?;

        appsink.set_max_buffers(3);
        appsink.set_drop(true); // Drop old buffers if we can't keep up
        appsink.set_property("sync", false);

        let format = self.format;
        let sequence = Arc::new(AtomicU64::new(0));
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    match frame_from_sample(&sample, format, &sequence) {
                        Some(frame) => {
                            metrics::counter!("vcam_frames_captured_total").increment(1);
                            on_frame(frame);
                        }
                        None => warn!("Discarding unreadable GStreamer sample"),
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| backend_err("Failed to start pipeline", e))?;
        info!("GStreamer capture started on {}", found.path);

        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            info!("Stopping GStreamer pipeline");
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                warn!("Failed to stop pipeline: {:?}", e);
            }
        }
    }

    fn is_running(&self) -> bool {
        self.pipeline.is_some()
    }
}

impl Drop for GstSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Width and height from a caps structure, rejecting negative values
fn caps_dimensions(s: &gst::StructureRef) -> Option<(u32, u32)> {
    let width = u32::try_from(s.get::<i32>("width").ok()?).ok()?;
    let height = u32::try_from(s.get::<i32>("height").ok()?).ok()?;
    Some((width, height))
}

fn frame_from_sample(
    sample: &gst::Sample,
    format: PixelFormat,
    sequence: &AtomicU64,
) -> Option<Frame> {
    let timestamp = Instant::now();
    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;
    let data = Bytes::copy_from_slice(map.as_slice());

    let caps = sample.caps()?;
    let (width, height, stride) = match format {
        PixelFormat::Mjpeg => {
            let (width, height) = caps_dimensions(caps.structure(0)?)?;
            (width, height, width)
        }
        _ => {
            let info = gst_video::VideoInfo::from_caps(caps).ok()?;
            let stride = u32::try_from(*info.stride().first()?).ok()?;
            (info.width(), info.height(), stride)
        }
    };

    Some(Frame {
        data,
        meta: Arc::new(FrameMetadata {
            sequence: sequence.fetch_add(1, Ordering::Relaxed) + 1,
            width,
            height,
            stride,
            format,
            device_timestamp: buffer.pts().map(|pts| Duration::from_nanos(pts.nseconds())),
        }),
        timestamp,
    })
}
