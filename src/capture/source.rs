//! Frame source abstraction shared by every capture backend

use std::sync::Arc;

use crate::capture::Frame;
use crate::error::CaptureError;

/// Callback invoked once per captured frame, on the source's own thread
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// A live capture device delivering frames asynchronously.
///
/// Delivery has no rate guarantee and may stop at any time without an
/// explicit end signal. `start` on a running source must be a no-op so a
/// stream restart never opens a second capture session.
pub trait FrameSource: Send {
    /// Human-readable backend name for logs
    fn name(&self) -> &str;

    /// Open the capture session and begin delivering frames to `on_frame`
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError>;

    /// Stop delivering frames. Safe to call when idle.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}
