//! Lock-free bounded hand-off queue between the output timer and the reader

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;

use crate::error::QueueError;
use crate::pipeline::sample::MediaSample;

/// Counters observed since the queue was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Stats {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
}

struct Inner {
    ring: ArrayQueue<Arc<MediaSample>>,
    stats: CachePadded<Stats>,
}

/// Fixed-capacity FIFO of samples.
///
/// Enqueue never blocks: a full queue rejects the new sample.
#[derive(Clone)]
pub struct HandoffQueue {
    inner: Arc<Inner>,
}

impl HandoffQueue {
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                ring: ArrayQueue::new(capacity),
                stats: CachePadded::new(Stats::default()),
            }),
        })
    }

    /// Producer: push a sample, returning false (sample discarded) when full
    pub fn enqueue(&self, sample: Arc<MediaSample>) -> bool {
        match self.inner.ring.push(sample) {
            Ok(()) => {
                self.inner.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_rejected) => {
                self.record_drop();
                false
            }
        }
    }

    /// Count a sample dropped before it reached the queue
    pub(crate) fn record_drop(&self) {
        self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumer: pop the oldest sample
    pub fn dequeue(&self) -> Option<Arc<MediaSample>> {
        let sample = self.inner.ring.pop()?;
        self.inner.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(sample)
    }

    pub fn count(&self) -> usize {
        self.inner.ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.ring.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.inner.ring.is_full()
    }

    pub fn stats(&self) -> QueueStats {
        let stats = &self.inner.stats;
        QueueStats {
            enqueued: stats.enqueued.load(Ordering::Relaxed),
            dequeued: stats.dequeued.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Reader-side handle to a stream's hand-off queue
#[derive(Clone)]
pub struct QueueHandle {
    queue: HandoffQueue,
}

impl QueueHandle {
    pub(crate) fn new(queue: HandoffQueue) -> Self {
        Self { queue }
    }

    pub fn dequeue(&self) -> Option<Arc<MediaSample>> {
        self.queue.dequeue()
    }

    pub fn count(&self) -> usize {
        self.queue.count()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Drain everything currently queued, oldest first
    pub fn drain(&self) -> Vec<Arc<MediaSample>> {
        std::iter::from_fn(|| self.queue.dequeue()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::stub::test_pattern;
    use crate::capture::PixelFormat;
    use crate::pipeline::clock::MediaTime;
    use crate::pipeline::sample::SampleBuilder;

    fn sample(sequence: u64) -> Arc<MediaSample> {
        let frame = Arc::new(test_pattern(4, 2, PixelFormat::Yuyv4, 0));
        let builder = SampleBuilder::new(MediaTime::new(1, 30));
        Arc::new(
            builder
                .build(frame, MediaTime::new(sequence as i64, 30), sequence)
                .unwrap(),
        )
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(HandoffQueue::new(0).err(), Some(QueueError::ZeroCapacity));
    }

    #[test]
    fn test_full_queue_rejects_without_changing_count() {
        let queue = HandoffQueue::new(3).unwrap();
        for seq in 0..3 {
            assert!(queue.enqueue(sample(seq)));
        }
        assert!(queue.is_full());
        assert!(!queue.enqueue(sample(3)));
        assert_eq!(queue.count(), 3);
        assert_eq!(queue.capacity(), 3);

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_fifo_order() {
        let queue = HandoffQueue::new(4).unwrap();
        let handle = QueueHandle::new(queue.clone());
        for seq in 0..4 {
            queue.enqueue(sample(seq));
        }

        assert_eq!(handle.dequeue().unwrap().sequence(), 0);
        let rest: Vec<u64> = handle.drain().iter().map(|s| s.sequence()).collect();
        assert_eq!(rest, vec![1, 2, 3]);
        assert_eq!(handle.count(), 0);
        assert_eq!(handle.stats().dequeued, 4);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let queue = HandoffQueue::new(8).unwrap();
        let handle = QueueHandle::new(queue.clone());

        let consumer = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while seen.len() < 500 {
                if let Some(sample) = handle.dequeue() {
                    seen.push(sample.sequence());
                }
                assert!(handle.count() <= handle.capacity());
            }
            seen
        });

        let mut seq = 0;
        while seq < 500 {
            if queue.enqueue(sample(seq)) {
                seq += 1;
            }
        }

        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
    }
}
