//! Stream controller: owns the capture session, clock, queue and output timer
//! of one virtual camera stream

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::capture::{FrameCallback, FrameSource, PixelFormat};
use crate::error::{CaptureError, StreamError};
use crate::pipeline::cache::FrameCache;
use crate::pipeline::clock::{ClockHandle, ClockSettings, StreamClock};
use crate::pipeline::queue::{HandoffQueue, QueueHandle, QueueStats};
use crate::pipeline::sample::{FormatDescription, SampleBuilder};
use crate::pipeline::scheduler::{
    ListenerSlot, OutputScheduler, QueueListener, Registration, SampleProducer, SchedulerState,
};
use crate::Config;

/// Host-assigned object id of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Static stream configuration exposed to property queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamDescriptor {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

/// A resource built at construction: usable, or the reason it is not
#[derive(Debug, Clone)]
pub enum Readiness<T> {
    Ready(T),
    Unavailable(String),
}

impl<T> Readiness<T> {
    fn from_result<E: fmt::Display>(what: &str, result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Readiness::Ready(value),
            Err(e) => {
                error!("{} creation failed: {}", what, e);
                Readiness::Unavailable(format!("{}: {}", what, e))
            }
        }
    }

    pub fn ready(&self) -> Option<&T> {
        match self {
            Readiness::Ready(value) => Some(value),
            Readiness::Unavailable(_) => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready(_))
    }

    fn reason(&self) -> Option<&str> {
        match self {
            Readiness::Ready(_) => None,
            Readiness::Unavailable(reason) => Some(reason),
        }
    }
}

/// Keys answered by the stream's property table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    Name,
    FormatDescription,
    FormatDescriptions,
    Direction,
    FrameRate,
    FrameRates,
    MinimumFrameRate,
    FrameRateRanges,
    Clock,
}

impl PropertyKey {
    pub const ALL: [PropertyKey; 9] = [
        PropertyKey::Name,
        PropertyKey::FormatDescription,
        PropertyKey::FormatDescriptions,
        PropertyKey::Direction,
        PropertyKey::FrameRate,
        PropertyKey::FrameRates,
        PropertyKey::MinimumFrameRate,
        PropertyKey::FrameRateRanges,
        PropertyKey::Clock,
    ];
}

/// Stream direction as seen by the host; a camera is always a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum Direction {
    Source = 0,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameRateRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone)]
pub enum PropertyValue {
    String(String),
    Format(FormatDescription),
    Formats(Vec<FormatDescription>),
    Direction(Direction),
    Float(f64),
    Floats(Vec<f64>),
    FrameRateRanges(Vec<FrameRateRange>),
    Clock(ClockHandle),
}

/// One virtual camera stream.
///
/// The clock, queue and stream format are built once in [`StreamController::new`];
/// if any of them failed, `start` refuses to run and the stream stays idle.
pub struct StreamController {
    id: StreamId,
    descriptor: StreamDescriptor,
    clock: Readiness<StreamClock>,
    queue: Readiness<HandoffQueue>,
    format: Readiness<FormatDescription>,
    cache: FrameCache,
    sequence: Arc<AtomicU64>,
    listener: ListenerSlot,
    source: Mutex<Box<dyn FrameSource>>,
    scheduler: Mutex<OutputScheduler>,
}

impl StreamController {
    pub fn new(id: StreamId, config: &Config, source: Box<dyn FrameSource>) -> Self {
        let stream = &config.stream;
        let descriptor = StreamDescriptor {
            name: stream.name.clone(),
            width: stream.width,
            height: stream.height,
            fps: stream.fps,
            format: stream.format,
        };

        let clock = Readiness::from_result(
            "Stream clock",
            StreamClock::new(ClockSettings {
                name: config.clock.name.clone(),
                timescale: config.clock.timescale,
                fps: stream.fps,
                smoothing_events: config.clock.smoothing_events,
                smoothing_averages: config.clock.smoothing_averages,
                min_query_interval: Duration::from_millis(config.clock.min_query_interval_ms),
            }),
        );
        let queue = Readiness::from_result("Hand-off queue", HandoffQueue::new(stream.queue_capacity));
        let format = Readiness::from_result(
            "Format description",
            FormatDescription::new(stream.width, stream.height, stream.format),
        );

        info!(
            "Created {} {:?}: {}x{} @ {} fps, queue capacity {}",
            id, descriptor.name, descriptor.width, descriptor.height, descriptor.fps,
            stream.queue_capacity
        );

        Self {
            id,
            descriptor,
            clock,
            queue,
            format,
            cache: FrameCache::new(),
            sequence: Arc::new(AtomicU64::new(0)),
            listener: Arc::new(ArcSwapOption::empty()),
            source: Mutex::new(source),
            scheduler: Mutex::new(OutputScheduler::new(stream.fps)),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    /// True when clock, queue and format were all created
    pub fn is_ready(&self) -> bool {
        self.clock.is_ready() && self.queue.is_ready() && self.format.is_ready()
    }

    pub fn is_running(&self) -> bool {
        self.lock_scheduler().state() == SchedulerState::Running
    }

    /// Open the frame source and arm the output timer.
    ///
    /// Does nothing (and logs) when a stream resource is unavailable or no
    /// Tokio runtime is present. A source that cannot start is logged and the
    /// timer runs anyway, skipping every tick until a frame arrives.
    pub fn start(&self) -> Result<(), StreamError> {
        let mut scheduler = self.lock_scheduler();
        if scheduler.state() == SchedulerState::Running {
            return Ok(());
        }

        let (Some(clock), Some(queue), true) =
            (self.clock.ready(), self.queue.ready(), self.format.is_ready())
        else {
            let reasons: Vec<&str> = [self.clock.reason(), self.queue.reason(), self.format.reason()]
                .into_iter()
                .flatten()
                .collect();
            let reasons = reasons.join("; ");
            error!("{} cannot start: {}", self.id, reasons);
            return Err(StreamError::Unavailable(reasons));
        };

        let mut source = self.lock_source();
        let cache = self.cache.clone();
        let on_frame: FrameCallback = Arc::new(move |frame| cache.store(Arc::new(frame)));
        match source.start(on_frame) {
            Ok(()) => info!("Frame source {} started", source.name()),
            Err(CaptureError::NoDevice) => warn!("No capture device connected, stream stays idle"),
            Err(e) => warn!("Frame source {} failed to start: {}", source.name(), e),
        }

        let producer = Arc::new(SampleProducer::new(
            self.id,
            self.cache.clone(),
            clock.clone(),
            queue.clone(),
            SampleBuilder::new(clock.frame_duration()),
            Arc::clone(&self.sequence),
            Arc::clone(&self.listener),
        ));

        if let Err(e) = scheduler.start(producer) {
            error!("{} cannot start: {}", self.id, e);
            source.stop();
            return Err(e);
        }
        info!("{} running", self.id);
        Ok(())
    }

    /// Suspend the output timer and the frame source. Samples already queued
    /// stay available to the reader.
    pub fn stop(&self) {
        drop(self.halt());
    }

    /// Like [`stop`](Self::stop), then wait for an in-flight tick to finish
    pub async fn stop_and_wait(&self) {
        if let Some(task) = self.halt() {
            if let Err(e) = task.await {
                warn!("Output timer task ended abnormally: {}", e);
            }
        }
    }

    fn halt(&self) -> Option<JoinHandle<()>> {
        let task = self.lock_scheduler().stop()?;
        self.lock_source().stop();
        info!("{} stopped", self.id);
        Some(task)
    }

    /// Hand the queue to the external reader and register its listener.
    ///
    /// A later registration replaces the listener; `None` clears it.
    pub fn register_consumer(
        &self,
        listener: Option<Arc<dyn QueueListener>>,
    ) -> Result<QueueHandle, StreamError> {
        let queue = self
            .queue
            .ready()
            .ok_or_else(|| StreamError::Unavailable(self.queue.reason().unwrap_or_default().into()))?;

        self.listener
            .store(listener.map(|listener| Arc::new(Registration { listener })));
        Ok(QueueHandle::new(queue.clone()))
    }

    pub fn clock_handle(&self) -> Option<ClockHandle> {
        self.clock.ready().map(StreamClock::handle)
    }

    pub fn stats(&self) -> Option<QueueStats> {
        self.queue.ready().map(HandoffQueue::stats)
    }

    /// Sequence number the next enqueued sample will carry
    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn property(&self, key: PropertyKey) -> Option<PropertyValue> {
        let fps = f64::from(self.descriptor.fps);
        let value = match key {
            PropertyKey::Name => PropertyValue::String(self.descriptor.name.clone()),
            PropertyKey::FormatDescription => PropertyValue::Format(*self.format.ready()?),
            PropertyKey::FormatDescriptions => PropertyValue::Formats(vec![*self.format.ready()?]),
            PropertyKey::Direction => PropertyValue::Direction(Direction::Source),
            PropertyKey::FrameRate | PropertyKey::MinimumFrameRate => PropertyValue::Float(fps),
            PropertyKey::FrameRates => PropertyValue::Floats(vec![fps]),
            PropertyKey::FrameRateRanges => {
                PropertyValue::FrameRateRanges(vec![FrameRateRange { min: fps, max: fps }])
            }
            PropertyKey::Clock => PropertyValue::Clock(self.clock_handle()?),
        };
        Some(value)
    }

    /// Every property currently answerable
    pub fn properties(&self) -> Vec<(PropertyKey, PropertyValue)> {
        PropertyKey::ALL
            .iter()
            .filter_map(|&key| self.property(key).map(|value| (key, value)))
            .collect()
    }

    fn lock_scheduler(&self) -> MutexGuard<'_, OutputScheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_source(&self) -> MutexGuard<'_, Box<dyn FrameSource>> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.stop();
    }
}
