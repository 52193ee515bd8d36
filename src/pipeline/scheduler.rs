//! Output scheduler: a periodic timer that turns the cached frame into a
//! queued sample on every tick

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::error::{ClockError, SampleError, StreamError};
use crate::pipeline::cache::FrameCache;
use crate::pipeline::clock::StreamClock;
use crate::pipeline::queue::HandoffQueue;
use crate::pipeline::sample::{MediaSample, SampleBuilder};
use crate::stream::StreamId;

/// Notified synchronously on the timer path after every successful enqueue.
///
/// The listener object doubles as the consumer's opaque context. It must
/// return quickly since it delays the next tick.
pub trait QueueListener: Send + Sync {
    fn queue_altered(&self, stream: StreamId, sample: &Arc<MediaSample>);
}

impl<F> QueueListener for F
where
    F: Fn(StreamId, &Arc<MediaSample>) + Send + Sync,
{
    fn queue_altered(&self, stream: StreamId, sample: &Arc<MediaSample>) {
        self(stream, sample)
    }
}

pub(crate) struct Registration {
    pub(crate) listener: Arc<dyn QueueListener>,
}

pub(crate) type ListenerSlot = Arc<ArcSwapOption<Registration>>;

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Enqueued { sequence: u64 },
    QueueFull,
    NoFrame,
    ClockRejected(ClockError),
    SampleRejected(SampleError),
}

impl TickOutcome {
    fn skip_reason(&self) -> Option<&'static str> {
        match self {
            TickOutcome::Enqueued { .. } => None,
            TickOutcome::QueueFull => Some("queue_full"),
            TickOutcome::NoFrame => Some("no_frame"),
            TickOutcome::ClockRejected(_) => Some("clock"),
            TickOutcome::SampleRejected(_) => Some("sample"),
        }
    }
}

/// Everything one tick touches
pub struct SampleProducer {
    stream: StreamId,
    cache: FrameCache,
    clock: StreamClock,
    queue: HandoffQueue,
    builder: SampleBuilder,
    sequence: Arc<AtomicU64>,
    listener: ListenerSlot,
}

impl SampleProducer {
    pub(crate) fn new(
        stream: StreamId,
        cache: FrameCache,
        clock: StreamClock,
        queue: HandoffQueue,
        builder: SampleBuilder,
        sequence: Arc<AtomicU64>,
        listener: ListenerSlot,
    ) -> Self {
        Self {
            stream,
            cache,
            clock,
            queue,
            builder,
            sequence,
            listener,
        }
    }

    /// Sequence number the next enqueued sample will carry
    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Run the per-tick algorithm once for a tick observed at `now`
    pub fn tick(&self, now: Instant) -> TickOutcome {
        let outcome = self.produce(now);
        if let Some(reason) = outcome.skip_reason() {
            metrics::counter!("vcam_ticks_skipped_total", "reason" => reason).increment(1);
        }
        metrics::gauge!("vcam_queue_depth").set(self.queue.count() as f64);
        outcome
    }

    fn produce(&self, now: Instant) -> TickOutcome {
        if self.queue.is_full() {
            self.queue.record_drop();
            debug!(stream = %self.stream, "queue is full, dropping tick");
            return TickOutcome::QueueFull;
        }

        let Some(frame) = self.cache.peek() else {
            debug!(stream = %self.stream, "no frame captured yet");
            return TickOutcome::NoFrame;
        };

        let presentation = match self.clock.timestamp(now) {
            Ok(pts) => pts,
            Err(e) => {
                debug!(stream = %self.stream, "clock rejected timestamp: {}", e);
                return TickOutcome::ClockRejected(e);
            }
        };

        let sequence = self.sequence.load(Ordering::Acquire);
        let sample = match self.builder.build(frame, presentation, sequence) {
            Ok(sample) => Arc::new(sample),
            Err(e) => {
                debug!(stream = %self.stream, "sample construction failed: {}", e);
                return TickOutcome::SampleRejected(e);
            }
        };

        if !self.queue.enqueue(Arc::clone(&sample)) {
            debug!(stream = %self.stream, "queue filled during tick, sample dropped");
            return TickOutcome::QueueFull;
        }

        if let Some(registration) = &*self.listener.load() {
            registration.listener.queue_altered(self.stream, &sample);
        }

        self.sequence.fetch_add(1, Ordering::AcqRel);
        metrics::counter!("vcam_samples_enqueued_total").increment(1);
        trace!(
            stream = %self.stream,
            sequence,
            pts = presentation.value(),
            "sample enqueued"
        );
        TickOutcome::Enqueued { sequence }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

struct RunningTimer {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Fixed-period timer driving a [`SampleProducer`]
pub struct OutputScheduler {
    period: Duration,
    running: Option<RunningTimer>,
}

impl OutputScheduler {
    pub fn new(fps: u32) -> Self {
        Self {
            period: Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1))),
            running: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn state(&self) -> SchedulerState {
        match self.running {
            Some(_) => SchedulerState::Running,
            None => SchedulerState::Idle,
        }
    }

    /// Arm the timer: first fire one period from now, then every period.
    ///
    /// Needs a Tokio runtime; starting while running is a no-op.
    pub fn start(&mut self, producer: Arc<SampleProducer>) -> Result<(), StreamError> {
        if self.running.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StreamError::NoRuntime)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = runtime.spawn(run_timer(producer, self.period, stop_rx));
        info!("Output timer armed at {:?} per frame", self.period);

        self.running = Some(RunningTimer { stop_tx, task });
        Ok(())
    }

    /// Prevent further ticks. A tick already running completes; await the
    /// returned handle to wait for it.
    pub fn stop(&mut self) -> Option<JoinHandle<()>> {
        let timer = self.running.take()?;
        let _ = timer.stop_tx.send(true);
        info!("Output timer suspended");
        Some(timer.task)
    }
}

impl Drop for OutputScheduler {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

async fn run_timer(producer: Arc<SampleProducer>, period: Duration, mut stop_rx: watch::Receiver<bool>) {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = interval.tick() => {
                producer.tick(Instant::now());
            }
        }
    }
    debug!("Output timer task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::stub::test_pattern;
    use crate::capture::PixelFormat;
    use crate::pipeline::clock::{ClockSettings, NANOS_TIMESCALE};
    use std::sync::Mutex;

    struct Fixture {
        cache: FrameCache,
        queue: HandoffQueue,
        listener: ListenerSlot,
        producer: Arc<SampleProducer>,
        origin: Instant,
    }

    fn fixture(capacity: usize) -> Fixture {
        let origin = Instant::now();
        let clock = StreamClock::with_origin(
            ClockSettings {
                name: "scheduler test".into(),
                timescale: NANOS_TIMESCALE,
                fps: 30,
                smoothing_events: 100,
                smoothing_averages: 10,
                min_query_interval: Duration::from_millis(100),
            },
            origin,
        )
        .unwrap();
        let cache = FrameCache::new();
        let queue = HandoffQueue::new(capacity).unwrap();
        let listener: ListenerSlot = Arc::new(ArcSwapOption::empty());
        let builder = SampleBuilder::new(clock.frame_duration());
        let producer = Arc::new(SampleProducer::new(
            StreamId(7),
            cache.clone(),
            clock,
            queue.clone(),
            builder,
            Arc::new(AtomicU64::new(0)),
            listener.clone(),
        ));
        Fixture {
            cache,
            queue,
            listener,
            producer,
            origin,
        }
    }

    fn deliver(cache: &FrameCache) {
        cache.store(Arc::new(test_pattern(8, 4, PixelFormat::Yuyv4, 1)));
    }

    #[test]
    fn test_tick_without_frame_is_skipped() {
        let f = fixture(4);
        for i in 1..=10u32 {
            let outcome = f.producer.tick(f.origin + Duration::from_millis(33) * i);
            assert_eq!(outcome, TickOutcome::NoFrame);
        }
        assert_eq!(f.queue.count(), 0);
        assert_eq!(f.producer.next_sequence(), 0);
    }

    #[test]
    fn test_drop_on_full_keeps_sequence_dense() {
        let f = fixture(30);
        deliver(&f.cache);

        let mut enqueued = Vec::new();
        let mut dropped = 0;
        for i in 1..=40u32 {
            match f.producer.tick(f.origin + Duration::from_millis(33) * i) {
                TickOutcome::Enqueued { sequence } => enqueued.push(sequence),
                TickOutcome::QueueFull => dropped += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(enqueued, (0..30).collect::<Vec<_>>());
        assert_eq!(dropped, 10);
        assert_eq!(f.queue.count(), 30);
        assert_eq!(f.queue.stats().dropped, 10);
        assert_eq!(f.producer.next_sequence(), 30);
    }

    #[test]
    fn test_timestamps_increase_across_ticks() {
        let f = fixture(8);
        deliver(&f.cache);
        let at = f.origin + Duration::from_millis(10);
        for _ in 0..4 {
            f.producer.tick(at);
        }

        let samples: Vec<_> = std::iter::from_fn(|| f.queue.dequeue()).collect();
        assert_eq!(samples.len(), 4);
        for pair in samples.windows(2) {
            assert!(pair[0].presentation_timestamp() < pair[1].presentation_timestamp());
            assert_eq!(pair[0].sequence() + 1, pair[1].sequence());
        }
    }

    #[test]
    fn test_clock_rejection_consumes_no_sequence() {
        let f = fixture(4);
        deliver(&f.cache);
        let before_origin = f.origin - Duration::from_millis(1);
        assert_eq!(
            f.producer.tick(before_origin),
            TickOutcome::ClockRejected(ClockError::BeforeEpoch)
        );
        assert_eq!(
            f.producer.tick(f.origin + Duration::from_millis(1)),
            TickOutcome::Enqueued { sequence: 0 }
        );
    }

    #[test]
    fn test_frame_of_other_size_is_published() {
        let f = fixture(4);
        f.cache
            .store(Arc::new(test_pattern(16, 6, PixelFormat::Yuyv4, 1)));
        let outcome = f.producer.tick(f.origin + Duration::from_millis(1));
        assert_eq!(outcome, TickOutcome::Enqueued { sequence: 0 });

        let sample = f.queue.dequeue().unwrap();
        assert_eq!((sample.format().width, sample.format().height), (16, 6));
    }

    #[test]
    fn test_short_frame_consumes_no_sequence() {
        let f = fixture(4);
        let mut frame = test_pattern(8, 4, PixelFormat::Yuyv4, 1);
        frame.data = bytes::Bytes::from_static(&[0u8; 3]);
        f.cache.store(Arc::new(frame));
        let outcome = f.producer.tick(f.origin + Duration::from_millis(1));
        assert!(matches!(outcome, TickOutcome::SampleRejected(_)));
        assert_eq!(f.producer.next_sequence(), 0);
        assert_eq!(f.queue.count(), 0);
    }

    #[test]
    fn test_listener_notified_after_enqueue() {
        let f = fixture(4);
        deliver(&f.cache);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let queue = f.queue.clone();
        f.listener.store(Some(Arc::new(Registration {
            listener: Arc::new(move |stream: StreamId, sample: &Arc<MediaSample>| {
                // The sample is already visible to the reader
                assert!(queue.count() > 0);
                sink.lock().unwrap().push((stream, sample.sequence()));
            }),
        })));

        f.producer.tick(f.origin + Duration::from_millis(33));
        f.producer.tick(f.origin + Duration::from_millis(66));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(StreamId(7), 0), (StreamId(7), 1)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_every_period() {
        let f = fixture(64);
        deliver(&f.cache);
        let mut scheduler = OutputScheduler::new(30);
        let period = scheduler.period();

        scheduler.start(Arc::clone(&f.producer)).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);

        time::sleep(period / 2).await;
        assert_eq!(f.queue.count(), 0, "first fire is one period after start");

        time::sleep(period * 10).await;
        assert_eq!(f.queue.count(), 10);

        let task = scheduler.stop().unwrap();
        task.await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        time::sleep(period * 10).await;
        assert_eq!(f.queue.count(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_keeps_one_timer() {
        let f = fixture(64);
        deliver(&f.cache);
        let mut scheduler = OutputScheduler::new(30);
        let period = scheduler.period();

        scheduler.start(Arc::clone(&f.producer)).unwrap();
        scheduler.start(Arc::clone(&f.producer)).unwrap();
        time::sleep(period * 5 + period / 2).await;
        assert_eq!(f.queue.count(), 5);
    }

    #[test]
    fn test_start_without_runtime() {
        let f = fixture(4);
        let mut scheduler = OutputScheduler::new(30);
        assert!(matches!(
            scheduler.start(f.producer),
            Err(StreamError::NoRuntime)
        ));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }
}
