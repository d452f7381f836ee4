//! Message buffering for relay connections.
//!
//! [`MessageBuffer`] is the synchronous accumulator: it tracks pending items,
//! their byte total and the arrival time of the oldest one, and reports when
//! a count or size limit forces a drain. [`BufferPipe`] wraps it for use on a
//! live connection: a timer task drains the buffer when the oldest item
//! reaches `max_age`, and a single consumer task hands drained batches to a
//! [`BatchSink`] strictly in order.

use crate::error::{RelayError, RelayResult};
use crate::message::{Envelope, Outbound};
use crate::strategy::BufferLimits;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Anything with a size that counts against a byte limit
pub trait BufferItem {
    /// Size in bytes
    fn size(&self) -> usize;
}

impl BufferItem for Envelope {
    fn size(&self) -> usize {
        self.encoded_len()
    }
}

impl BufferItem for Outbound {
    fn size(&self) -> usize {
        self.envelope.encoded_len()
    }
}

impl BufferItem for Vec<u8> {
    fn size(&self) -> usize {
        self.len()
    }
}

/// Why a buffer was drained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    /// Pending count reached `max_count`
    Count,
    /// Pending bytes reached `max_bytes`
    Size,
    /// Oldest item reached `max_age`
    Age,
    /// Explicit flush
    Flush,
}

impl DrainReason {
    /// Whether a limit was hit before the timer could drain the buffer
    #[must_use]
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Count | Self::Size)
    }
}

/// Items removed from a buffer in one drain
#[derive(Debug)]
pub struct Drain<T> {
    /// Drained items, oldest first
    pub items: Vec<T>,
    /// What triggered the drain
    pub reason: DrainReason,
}

/// Ordered accumulator with count, size and age limits.
///
/// At rest the buffer never holds `max_count` or more items, nor
/// `max_bytes` or more bytes: a push that reaches either limit drains
/// everything, the new item included.
#[derive(Debug)]
pub struct MessageBuffer<T> {
    limits: BufferLimits,
    items: VecDeque<T>,
    bytes: usize,
    oldest: Option<Instant>,
}

impl<T: BufferItem> MessageBuffer<T> {
    /// Create an empty buffer.
    #[must_use]
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            limits,
            items: VecDeque::new(),
            bytes: 0,
            oldest: None,
        }
    }

    /// Append `item`, arriving at `now`. Returns the drained batch if a
    /// count or size limit was reached.
    pub fn push(&mut self, item: T, now: Instant) -> Option<Drain<T>> {
        if self.items.is_empty() {
            self.oldest = Some(now);
        }
        self.bytes = self.bytes.saturating_add(item.size());
        self.items.push_back(item);

        if self.items.len() >= self.limits.max_count {
            Some(self.drain(DrainReason::Count))
        } else if self.bytes >= self.limits.max_bytes {
            Some(self.drain(DrainReason::Size))
        } else {
            None
        }
    }

    /// When the oldest pending item reaches `max_age`. `None` if the buffer
    /// is empty or the age limit is unbounded.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.oldest
            .and_then(|oldest| oldest.checked_add(self.limits.max_age))
    }

    /// Drain if the oldest item has reached `max_age` by `now`.
    pub fn take_expired(&mut self, now: Instant) -> Option<Drain<T>> {
        match self.deadline() {
            Some(deadline) if now >= deadline => Some(self.drain(DrainReason::Age)),
            _ => None,
        }
    }

    /// Drain unconditionally. `None` if nothing is pending.
    pub fn flush(&mut self) -> Option<Drain<T>> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.drain(DrainReason::Flush))
        }
    }

    /// Number of pending items
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pending byte total
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Configured limits
    #[must_use]
    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    fn drain(&mut self, reason: DrainReason) -> Drain<T> {
        self.bytes = 0;
        self.oldest = None;
        Drain {
            items: self.items.drain(..).collect(),
            reason,
        }
    }
}

/// Receiver of drained batches
#[async_trait]
pub trait BatchSink<T: Send + 'static>: Send + Sync {
    /// Deliver one batch. Batches arrive one at a time, in drain order.
    async fn deliver(&self, batch: Vec<T>);
}

struct PipeShared<T> {
    label: String,
    buffer: Mutex<MessageBuffer<T>>,
    batches: Mutex<Option<mpsc::UnboundedSender<Vec<T>>>>,
    wake: Notify,
}

impl<T: BufferItem> PipeShared<T> {
    fn buffer(&self) -> MutexGuard<'_, MessageBuffer<T>> {
        self.buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn batches(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Vec<T>>>> {
        self.batches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Must be called with the buffer lock held so batches leave in order.
    fn dispatch(&self, drain: Drain<T>) {
        let count = drain.items.len();
        if drain.reason.is_overflow() {
            tracing::trace!("{}: limit reached, draining immediately", self.label);
        }
        tracing::debug!("{}: drained {} items ({:?})", self.label, count, drain.reason);

        let sent = self
            .batches()
            .as_ref()
            .is_some_and(|tx| tx.send(drain.items).is_ok());
        if !sent {
            tracing::warn!("{}: pipe closed, {} items discarded", self.label, count);
        }
    }
}

/// A message buffer bound to a live connection.
///
/// Enqueue and timer-driven drains are mutually exclusive. Drained batches
/// reach the sink one at a time in drain order.
pub struct BufferPipe<T: BufferItem + Send + 'static> {
    shared: Arc<PipeShared<T>>,
    timer: JoinHandle<()>,
    consumer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: BufferItem + Send + 'static> BufferPipe<T> {
    /// Create a pipe delivering to `sink`. Must be called inside a Tokio
    /// runtime.
    #[must_use]
    pub fn new(limits: BufferLimits, sink: Arc<dyn BatchSink<T>>, label: impl Into<String>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<T>>();
        let shared = Arc::new(PipeShared {
            label: label.into(),
            buffer: Mutex::new(MessageBuffer::new(limits)),
            batches: Mutex::new(Some(tx)),
            wake: Notify::new(),
        });

        let timer = tokio::spawn(run_timer(shared.clone()));
        let consumer = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                sink.deliver(batch).await;
            }
        });

        Self {
            shared,
            timer,
            consumer: tokio::sync::Mutex::new(Some(consumer)),
        }
    }

    /// Add an item. Returns the drain reason if the item triggered a drain.
    ///
    /// # Errors
    /// Returns `RelayError::Shutdown` if the pipe has been closed.
    pub fn enqueue(&self, item: T) -> RelayResult<Option<DrainReason>> {
        let mut buffer = self.shared.buffer();
        if self.shared.batches().is_none() {
            return Err(RelayError::Shutdown);
        }

        let was_empty = buffer.is_empty();
        match buffer.push(item, Instant::now()) {
            Some(drain) => {
                let reason = drain.reason;
                self.shared.dispatch(drain);
                Ok(Some(reason))
            }
            None => {
                if was_empty {
                    self.shared.wake.notify_one();
                }
                Ok(None)
            }
        }
    }

    /// Drain whatever is pending. Returns the number of items drained.
    pub fn flush(&self) -> usize {
        let mut buffer = self.shared.buffer();
        match buffer.flush() {
            Some(drain) => {
                let count = drain.items.len();
                self.shared.dispatch(drain);
                count
            }
            None => 0,
        }
    }

    /// Flush, stop accepting items and wait until every drained batch has
    /// been delivered.
    pub async fn close(&self) {
        {
            let mut buffer = self.shared.buffer();
            if let Some(drain) = buffer.flush() {
                self.shared.dispatch(drain);
            }
            self.shared.batches().take();
        }
        self.timer.abort();

        if let Some(consumer) = self.consumer.lock().await.take() {
            let _ = consumer.await;
        }
    }

    /// Number of pending items
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.buffer().len()
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.batches().is_none()
    }
}

impl<T: BufferItem + Send + 'static> Drop for BufferPipe<T> {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

async fn run_timer<T: BufferItem>(shared: Arc<PipeShared<T>>) {
    loop {
        let deadline = shared.buffer().deadline();
        match deadline {
            None => shared.wake.notified().await,
            Some(deadline) => {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {
                        let mut buffer = shared.buffer();
                        if let Some(drain) = buffer.take_expired(Instant::now()) {
                            shared.dispatch(drain);
                        }
                    }
                    () = shared.wake.notified() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits(age_ms: u64, count: usize, bytes: usize) -> BufferLimits {
        BufferLimits::new(Duration::from_millis(age_ms), count, bytes)
    }

    #[test]
    fn test_push_drains_on_count() {
        let mut buffer = MessageBuffer::new(limits(1000, 3, usize::MAX));
        let now = Instant::now();

        assert!(buffer.push(vec![1u8], now).is_none());
        assert!(buffer.push(vec![2u8], now).is_none());
        let drain = buffer.push(vec![3u8], now).unwrap();

        assert_eq!(drain.reason, DrainReason::Count);
        assert_eq!(drain.items, vec![vec![1u8], vec![2u8], vec![3u8]]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.bytes(), 0);
        assert!(buffer.deadline().is_none());
    }

    #[test]
    fn test_push_drains_on_size() {
        let mut buffer = MessageBuffer::new(limits(1000, usize::MAX, 10));
        let now = Instant::now();

        assert!(buffer.push(vec![0u8; 6], now).is_none());
        assert_eq!(buffer.bytes(), 6);
        let drain = buffer.push(vec![0u8; 4], now).unwrap();

        assert_eq!(drain.reason, DrainReason::Size);
        assert_eq!(drain.items.len(), 2);
    }

    #[test]
    fn test_count_one_drains_every_push() {
        let mut buffer = MessageBuffer::new(limits(60_000, 1, usize::MAX));
        let now = Instant::now();

        for i in 0..3u8 {
            let drain = buffer.push(vec![i], now).unwrap();
            assert_eq!(drain.items, vec![vec![i]]);
        }
    }

    #[test]
    fn test_deadline_tracks_oldest() {
        let mut buffer = MessageBuffer::new(limits(2000, usize::MAX, usize::MAX));
        let start = Instant::now();

        buffer.push(vec![1u8], start);
        buffer.push(vec![2u8], start + Duration::from_millis(500));

        assert_eq!(buffer.deadline(), Some(start + Duration::from_millis(2000)));
        assert!(
            buffer
                .take_expired(start + Duration::from_millis(1999))
                .is_none()
        );

        let drain = buffer
            .take_expired(start + Duration::from_millis(2000))
            .unwrap();
        assert_eq!(drain.reason, DrainReason::Age);
        assert_eq!(drain.items.len(), 2);
    }

    #[test]
    fn test_unbounded_age_has_no_deadline() {
        let mut buffer = MessageBuffer::new(BufferLimits::count_only(10));
        buffer.push(vec![1u8], Instant::now());
        assert!(buffer.deadline().is_none());
    }

    #[test]
    fn test_flush() {
        let mut buffer = MessageBuffer::new(limits(1000, 10, 100));
        assert!(buffer.flush().is_none());

        buffer.push(vec![1u8], Instant::now());
        let drain = buffer.flush().unwrap();
        assert_eq!(drain.reason, DrainReason::Flush);
        assert!(buffer.is_empty());
    }

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<(Instant, Vec<Vec<u8>>)>>,
    }

    impl Recorder {
        fn batches(&self) -> Vec<(Instant, Vec<Vec<u8>>)> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchSink<Vec<u8>> for Recorder {
        async fn deliver(&self, batch: Vec<Vec<u8>>) {
            self.batches.lock().unwrap().push((Instant::now(), batch));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipe_age_drain_batches_together() {
        let recorder = Arc::new(Recorder::default());
        let pipe = BufferPipe::new(
            BufferLimits::age_only(Duration::from_millis(2000)),
            recorder.clone(),
            "test",
        );
        let start = Instant::now();

        assert_eq!(pipe.enqueue(vec![1]).unwrap(), None);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(pipe.enqueue(vec![2]).unwrap(), None);

        tokio::time::sleep(Duration::from_millis(1400)).await;
        assert!(recorder.batches().is_empty());
        assert_eq!(pipe.pending(), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let batches = recorder.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1, vec![vec![1], vec![2]]);
        assert_eq!(batches[0].0 - start, Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipe_count_one_sends_each_message() {
        let recorder = Arc::new(Recorder::default());
        let pipe = BufferPipe::new(
            BufferLimits::new(Duration::MAX, 1, usize::MAX),
            recorder.clone(),
            "test",
        );

        for i in 0..3u8 {
            assert_eq!(pipe.enqueue(vec![i]).unwrap(), Some(DrainReason::Count));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        let batches: Vec<_> = recorder.batches().into_iter().map(|(_, b)| b).collect();
        assert_eq!(batches, vec![vec![vec![0]], vec![vec![1]], vec![vec![2]]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipe_close_flushes_pending() {
        let recorder = Arc::new(Recorder::default());
        let pipe = BufferPipe::new(
            BufferLimits::age_only(Duration::from_secs(60)),
            recorder.clone(),
            "test",
        );

        pipe.enqueue(vec![7]).unwrap();
        pipe.enqueue(vec![8]).unwrap();
        pipe.close().await;

        let batches = recorder.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1, vec![vec![7], vec![8]]);
        assert!(pipe.is_closed());
        assert!(matches!(pipe.enqueue(vec![9]), Err(RelayError::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipe_timer_rearms_after_drain() {
        let recorder = Arc::new(Recorder::default());
        let pipe = BufferPipe::new(
            BufferLimits::age_only(Duration::from_millis(100)),
            recorder.clone(),
            "test",
        );

        pipe.enqueue(vec![1]).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        pipe.enqueue(vec![2]).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let batches: Vec<_> = recorder.batches().into_iter().map(|(_, b)| b).collect();
        assert_eq!(batches, vec![vec![vec![1]], vec![vec![2]]]);
    }
}
