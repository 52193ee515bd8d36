//! Stream clock: strictly monotonic presentation timestamps plus the
//! timing-event history the reader uses to correlate stream and host time.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ClockError;

pub const NANOS_TIMESCALE: u32 = 1_000_000_000;

/// Rational time value: `value / timescale` seconds
#[derive(Debug, Clone, Copy)]
pub struct MediaTime {
    value: i64,
    timescale: u32,
}

impl MediaTime {
    /// A zero timescale is treated as 1.
    pub const fn new(value: i64, timescale: u32) -> Self {
        let timescale = if timescale == 0 { 1 } else { timescale };
        Self { value, timescale }
    }

    pub const fn value(self) -> i64 {
        self.value
    }

    pub const fn timescale(self) -> u32 {
        self.timescale
    }

    /// Convert to another timescale, truncating toward zero
    pub fn rescale(self, timescale: u32) -> MediaTime {
        let target = MediaTime::new(0, timescale).timescale;
        let value = self.value as i128 * target as i128 / self.timescale as i128;
        MediaTime::new(value.clamp(i64::MIN as i128, i64::MAX as i128) as i64, target)
    }

    pub fn as_secs_f64(self) -> f64 {
        self.value as f64 / self.timescale as f64
    }
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MediaTime {}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MediaTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.value as i128 * other.timescale as i128;
        let rhs = other.value as i128 * self.timescale as i128;
        lhs.cmp(&rhs)
    }
}

/// Clock parameters fixed at creation
#[derive(Debug, Clone)]
pub struct ClockSettings {
    pub name: String,
    pub timescale: u32,
    pub fps: u32,
    /// Timing events kept for rate smoothing
    pub smoothing_events: usize,
    /// Sub-windows the smoothing history is averaged over
    pub smoothing_averages: usize,
    /// Calls to [`ClockHandle::now`] closer together than this get the cached value
    pub min_query_interval: Duration,
}

impl ClockSettings {
    fn validate(&self) -> Result<(), ClockError> {
        if self.fps == 0 {
            return Err(ClockError::InvalidConfig("frame rate is zero".into()));
        }
        if self.timescale == 0 {
            return Err(ClockError::InvalidConfig("timescale is zero".into()));
        }
        if self.smoothing_events < 2 {
            return Err(ClockError::InvalidConfig(
                "rate smoothing needs at least two events".into(),
            ));
        }
        if self.smoothing_averages == 0 || self.smoothing_averages > self.smoothing_events {
            return Err(ClockError::InvalidConfig(format!(
                "{} averages over {} events",
                self.smoothing_averages, self.smoothing_events
            )));
        }
        Ok(())
    }
}

/// Presentation time paired with the host instant it was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingEvent {
    pub presentation: MediaTime,
    pub host_time: Instant,
}

struct ClockState {
    last: Option<i64>,
    events: HeapRb<TimingEvent>,
    cached_now: Option<(Instant, MediaTime)>,
}

struct ClockInner {
    settings: ClockSettings,
    origin: Instant,
    state: Mutex<ClockState>,
}

impl ClockInner {
    fn state(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ticks_since_origin(&self, at: Instant) -> Result<i64, ClockError> {
        let elapsed = at
            .checked_duration_since(self.origin)
            .ok_or(ClockError::BeforeEpoch)?;
        let ticks = elapsed.as_nanos() * self.settings.timescale as u128
            / NANOS_TIMESCALE as u128;
        i64::try_from(ticks).map_err(|_| ClockError::Overflow)
    }
}

/// Monotonic device clock owned by one stream
#[derive(Clone)]
pub struct StreamClock {
    inner: Arc<ClockInner>,
}

impl StreamClock {
    pub fn new(settings: ClockSettings) -> Result<Self, ClockError> {
        Self::with_origin(settings, Instant::now())
    }

    pub fn with_origin(settings: ClockSettings, origin: Instant) -> Result<Self, ClockError> {
        settings.validate()?;
        debug!(
            "Creating stream clock {:?} ({} Hz time base, {} fps)",
            settings.name, settings.timescale, settings.fps
        );

        let state = ClockState {
            last: None,
            events: HeapRb::new(settings.smoothing_events),
            cached_now: None,
        };
        Ok(Self {
            inner: Arc::new(ClockInner {
                settings,
                origin,
                state: Mutex::new(state),
            }),
        })
    }

    /// Presentation timestamp for a frame appearing at `at`.
    ///
    /// Never returns a value at or below one already issued; jitter that would
    /// do so is absorbed by issuing the previous value plus one tick.
    pub fn timestamp(&self, at: Instant) -> Result<MediaTime, ClockError> {
        let ticks = self.inner.ticks_since_origin(at)?;
        let timescale = self.inner.settings.timescale;

        let mut state = self.inner.state();
        let value = match state.last {
            Some(last) if ticks <= last => last.checked_add(1).ok_or(ClockError::Overflow)?,
            _ => ticks,
        };
        state.last = Some(value);

        let presentation = MediaTime::new(value, timescale);
        state.events.push_overwrite(TimingEvent {
            presentation,
            host_time: at,
        });
        Ok(presentation)
    }

    /// Duration of one frame: the reciprocal of the declared frame rate
    pub fn frame_duration(&self) -> MediaTime {
        MediaTime::new(1, self.inner.settings.fps)
    }

    pub fn time_base(&self) -> u32 {
        self.inner.settings.timescale
    }

    pub fn handle(&self) -> ClockHandle {
        ClockHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Read-only view of a stream clock handed to the external reader
#[derive(Clone)]
pub struct ClockHandle {
    inner: Arc<ClockInner>,
}

impl ClockHandle {
    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    pub fn time_base(&self) -> u32 {
        self.inner.settings.timescale
    }

    pub fn latest_event(&self) -> Option<TimingEvent> {
        self.inner.state().events.iter().last().copied()
    }

    /// Number of timing events currently in the smoothing window
    pub fn event_count(&self) -> usize {
        self.inner.state().events.occupied_len()
    }

    /// Stream seconds advanced per host second, averaged over the
    /// configured number of sub-windows of the event history
    pub fn smoothed_rate(&self) -> Option<f64> {
        let events: Vec<TimingEvent> = self.inner.state().events.iter().copied().collect();
        if events.len() < 2 {
            return None;
        }

        let chunk = events.len().div_ceil(self.inner.settings.smoothing_averages).max(2);
        let rates: Vec<f64> = events
            .windows(chunk)
            .step_by(chunk - 1)
            .filter_map(|window| {
                let (first, last) = (window.first()?, window.last()?);
                let host = last
                    .host_time
                    .checked_duration_since(first.host_time)?
                    .as_secs_f64();
                if host <= 0.0 {
                    return None;
                }
                let stream = last.presentation.as_secs_f64() - first.presentation.as_secs_f64();
                Some(stream / host)
            })
            .collect();

        if rates.is_empty() {
            return None;
        }
        Some(rates.iter().sum::<f64>() / rates.len() as f64)
    }

    /// Host instant at which `presentation` falls, judged from the latest event
    pub fn host_time_for(&self, presentation: MediaTime) -> Option<Instant> {
        let event = self.latest_event()?;
        let delta = presentation.as_secs_f64() - event.presentation.as_secs_f64();
        if delta >= 0.0 {
            event
                .host_time
                .checked_add(Duration::from_secs_f64(delta))
        } else {
            event
                .host_time
                .checked_sub(Duration::from_secs_f64(-delta))
        }
    }

    /// Current stream time. Queries inside the minimum interval reuse the
    /// previous answer.
    pub fn now(&self) -> Result<MediaTime, ClockError> {
        let now = Instant::now();
        let min_interval = self.inner.settings.min_query_interval;

        let mut state = self.inner.state();
        if let Some((queried_at, value)) = state.cached_now {
            if now.saturating_duration_since(queried_at) < min_interval {
                return Ok(value);
            }
        }

        let value = MediaTime::new(
            self.inner.ticks_since_origin(now)?,
            self.inner.settings.timescale,
        );
        state.cached_now = Some((now, value));
        Ok(value)
    }
}

impl std::fmt::Debug for ClockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockHandle")
            .field("name", &self.inner.settings.name)
            .field("time_base", &self.inner.settings.timescale)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ClockSettings {
        ClockSettings {
            name: "test clock".into(),
            timescale: NANOS_TIMESCALE,
            fps: 30,
            smoothing_events: 100,
            smoothing_averages: 10,
            min_query_interval: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_timestamp_in_time_base() {
        let origin = Instant::now();
        let clock = StreamClock::with_origin(settings(), origin).unwrap();
        let pts = clock.timestamp(origin + Duration::from_millis(10)).unwrap();
        assert_eq!(pts.value(), 10_000_000);
        assert_eq!(pts.timescale(), NANOS_TIMESCALE);
    }

    #[test]
    fn test_timestamps_strictly_increase_under_jitter() {
        let origin = Instant::now();
        let clock = StreamClock::with_origin(settings(), origin).unwrap();
        let at = origin + Duration::from_millis(5);

        let a = clock.timestamp(at).unwrap();
        let b = clock.timestamp(at).unwrap();
        let c = clock.timestamp(origin + Duration::from_millis(1)).unwrap();
        let d = clock.timestamp(origin + Duration::from_millis(40)).unwrap();

        assert!(a < b && b < c && c < d);
        assert_eq!(b.value(), a.value() + 1);
        assert_eq!(d.value(), 40_000_000);
    }

    #[test]
    fn test_rejects_instant_before_origin() {
        let origin = Instant::now() + Duration::from_secs(1);
        let clock = StreamClock::with_origin(settings(), origin).unwrap();
        assert_eq!(
            clock.timestamp(origin - Duration::from_millis(1)),
            Err(ClockError::BeforeEpoch)
        );
        assert_eq!(clock.handle().event_count(), 0);
    }

    #[test]
    fn test_invalid_settings() {
        let mut bad = settings();
        bad.fps = 0;
        assert!(matches!(
            StreamClock::new(bad),
            Err(ClockError::InvalidConfig(_))
        ));

        let mut bad = settings();
        bad.smoothing_averages = 200;
        assert!(StreamClock::new(bad).is_err());
    }

    #[test]
    fn test_frame_duration_is_reciprocal_rate() {
        let clock = StreamClock::new(settings()).unwrap();
        let duration = clock.frame_duration();
        assert_eq!(duration, MediaTime::new(1, 30));
        assert_eq!(duration.rescale(NANOS_TIMESCALE).value(), 33_333_333);
    }

    #[test]
    fn test_event_window_is_bounded() {
        let mut small = settings();
        small.smoothing_events = 4;
        small.smoothing_averages = 2;
        let origin = Instant::now();
        let clock = StreamClock::with_origin(small, origin).unwrap();
        for i in 1..=10u64 {
            clock
                .timestamp(origin + Duration::from_millis(i * 33))
                .unwrap();
        }

        let handle = clock.handle();
        assert_eq!(handle.event_count(), 4);
        assert_eq!(handle.latest_event().unwrap().presentation.value(), 330_000_000);
    }

    #[test]
    fn test_smoothed_rate_tracks_real_time() {
        let origin = Instant::now();
        let clock = StreamClock::with_origin(settings(), origin).unwrap();
        let handle = clock.handle();
        assert!(handle.smoothed_rate().is_none());

        for i in 1..=60u64 {
            clock
                .timestamp(origin + Duration::from_millis(i * 33))
                .unwrap();
        }
        let rate = handle.smoothed_rate().unwrap();
        assert!((rate - 1.0).abs() < 1e-6, "rate was {}", rate);
    }

    #[test]
    fn test_host_time_for_presentation() {
        let origin = Instant::now();
        let clock = StreamClock::with_origin(settings(), origin).unwrap();
        let at = origin + Duration::from_millis(500);
        clock.timestamp(at).unwrap();

        let handle = clock.handle();
        assert_eq!(
            handle.host_time_for(MediaTime::new(3, 4)).unwrap(),
            at + Duration::from_millis(250)
        );
        assert_eq!(
            handle.host_time_for(MediaTime::new(1, 4)).unwrap(),
            at - Duration::from_millis(250)
        );
    }

    #[test]
    fn test_media_time_ordering_across_timescales() {
        assert_eq!(MediaTime::new(1, 30), MediaTime::new(2, 60));
        assert!(MediaTime::new(1, 30) < MediaTime::new(34_000_000, NANOS_TIMESCALE));
        assert_eq!(MediaTime::new(5, 0).timescale(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_now_reuses_answer_inside_query_interval() {
        let clock = StreamClock::with_origin(settings(), Instant::now()).unwrap();
        let handle = clock.handle();

        let a = handle.now().unwrap();
        assert_eq!(a.value(), 0);

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(handle.now().unwrap(), a);

        tokio::time::advance(Duration::from_millis(100)).await;
        let c = handle.now().unwrap();
        assert_eq!(c.value(), 150_000_000);
        assert_eq!(c.timescale(), NANOS_TIMESCALE);
    }
}
