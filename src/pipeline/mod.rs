pub mod cache;
pub mod clock;
pub mod queue;
pub mod sample;
pub mod scheduler;

pub use cache::FrameCache;
pub use clock::{ClockHandle, ClockSettings, MediaTime, StreamClock, TimingEvent, NANOS_TIMESCALE};
pub use queue::{HandoffQueue, QueueHandle, QueueStats};
pub use sample::{FormatDescription, MediaSample, SampleBuilder, SampleTiming};
pub use scheduler::{OutputScheduler, QueueListener, SampleProducer, SchedulerState, TickOutcome};
