//! Blocking frame queue used as the handoff between pipeline stages

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use super::frame::FrameRef;

/// FIFO of frame handles, optionally bounded.
///
/// A full bounded queue sheds new frames on `push` instead of blocking the
/// producer. Consumers block in [`FrameQueue::next`] until a frame arrives or
/// the queue is told to [`wake_and_fail`](FrameQueue::wake_and_fail).
pub struct FrameQueue {
    /// 0 means unbounded
    max_size: usize,
    state: Mutex<State>,
    cond: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct State {
    frames: VecDeque<FrameRef>,
    failed: bool,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicUsize,
    frames_popped: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Counters since the queue was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: usize,
    pub popped: usize,
    pub dropped: usize,
}

impl FrameQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub fn is_limited(&self) -> bool {
        self.max_size != 0
    }

    /// Producer: enqueue without blocking. Returns `false` when the frame was
    /// shed because the queue is full.
    pub fn push(&self, frame: FrameRef) -> bool {
        let mut state = self.state.lock();
        if self.is_limited() && state.frames.len() >= self.max_size {
            drop(state);
            self.record_drop();
            return false;
        }
        state.frames.push_back(frame);
        drop(state);
        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        self.cond.notify_one();
        true
    }

    /// Consumer: block until a frame is available.
    ///
    /// `None` timeout waits forever. Returns `None` on timeout or once the
    /// queue has been woken for shutdown.
    pub fn next(&self, timeout: Option<Duration>) -> Option<FrameRef> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.failed {
                return None;
            }
            if let Some(frame) = state.frames.pop_front() {
                drop(state);
                self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
                self.cond.notify_one();
                return Some(frame);
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        // One last look, a push may have raced the timeout.
                        if state.failed {
                            return None;
                        }
                        let frame = state.frames.pop_front();
                        if frame.is_some() {
                            self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
                        }
                        return frame;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<FrameRef> {
        let frame = self.state.lock().frames.pop_front();
        if frame.is_some() {
            self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
            self.cond.notify_one();
        }
        frame
    }

    /// Peek at the oldest frame without removing it.
    pub fn front(&self) -> Option<FrameRef> {
        self.state.lock().frames.front().cloned()
    }

    /// Abort every pending and future `next` until [`reset`](Self::reset).
    pub fn wake_and_fail(&self) {
        self.state.lock().failed = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        self.state.lock().failed = false;
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    /// Remove and return every queued frame.
    pub fn drain(&self) -> Vec<FrameRef> {
        let frames: Vec<_> = self.state.lock().frames.drain(..).collect();
        self.stats
            .frames_popped
            .fetch_add(frames.len(), Ordering::Relaxed);
        self.cond.notify_all();
        frames
    }

    /// Wait until a push would not be shed. Unbounded queues never wait.
    pub fn wait_for_slots(&self, timeout: Option<Duration>) -> bool {
        if !self.is_limited() {
            return true;
        }
        let max_size = self.max_size;
        self.wait_for(|state| state.frames.len() < max_size, timeout)
    }

    /// Wait until at least one frame is queued.
    pub fn wait_to_be_filled(&self, timeout: Option<Duration>) -> bool {
        self.wait_for(|state| !state.frames.is_empty(), timeout)
    }

    fn wait_for(&self, pred: impl Fn(&State) -> bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if pred(&state) {
                return true;
            }
            if state.failed {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return pred(&state);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// Hold the queue lock for a batch of unlocked operations. One waiter is
    /// woken when the guard drops.
    pub fn lock(&self) -> QueueGuard<'_> {
        QueueGuard {
            queue: self,
            state: Some(self.state.lock()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.is_limited() && self.state.lock().frames.len() >= self.max_size
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            popped: self.stats.frames_popped.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }

    fn record_drop(&self) {
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("screencast_queue_dropped_total").increment(1);
        trace!(max_size = self.max_size, "queue full, shedding frame");
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Exclusive access to a [`FrameQueue`], see [`FrameQueue::lock`].
pub struct QueueGuard<'a> {
    queue: &'a FrameQueue,
    state: Option<MutexGuard<'a, State>>,
}

impl QueueGuard<'_> {
    /// Enqueue ignoring the size limit.
    pub fn push(&mut self, frame: FrameRef) {
        if let Some(state) = self.state.as_mut() {
            state.frames.push_back(frame);
            self.queue
                .stats
                .frames_pushed
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pop(&mut self) -> Option<FrameRef> {
        let frame = self.state.as_mut()?.frames.pop_front();
        if frame.is_some() {
            self.queue
                .stats
                .frames_popped
                .fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    pub fn len(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.frames.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        // Unlock before waking so the waiter can grab the mutex.
        self.state.take();
        self.queue.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::frame::Frame;
    use std::sync::Arc;
    use std::thread;

    fn frame(ts: i64) -> FrameRef {
        Frame::with_capacity(1, ts).into_shared()
    }

    fn drain_timestamps(queue: &FrameQueue) -> Vec<i64> {
        std::iter::from_fn(|| queue.try_pop())
            .map(|f| f.timestamp())
            .collect()
    }

    #[test]
    fn preserves_fifo_order() {
        let queue = FrameQueue::unbounded();
        for ts in 0..10 {
            assert!(queue.push(frame(ts)));
        }
        assert_eq!(queue.front().map(|f| f.timestamp()), Some(0));
        assert_eq!(drain_timestamps(&queue), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn bounded_queue_sheds_when_full() {
        let queue = FrameQueue::new(3);
        for ts in 0..3 {
            assert!(queue.push(frame(ts)));
        }
        assert!(queue.is_full());
        assert!(!queue.push(frame(99)));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.stats().dropped, 1);
        assert_eq!(drain_timestamps(&queue), vec![0, 1, 2]);
    }

    #[test]
    fn fifo_holds_across_interleaved_push_and_pop() {
        let queue = FrameQueue::new(2);
        let mut popped = Vec::new();
        for ts in 0..6 {
            queue.push(frame(ts));
            if ts % 2 == 1 {
                popped.extend(queue.try_pop().map(|f| f.timestamp()));
            }
        }
        popped.extend(drain_timestamps(&queue));
        // 0,1 queued; pop 0; 2 queued; 3 shed (full); pop 1; 4 queued; 5 shed; pop 2
        assert_eq!(popped, vec![0, 1, 2, 4]);
    }

    #[test]
    fn next_times_out_when_empty() {
        let queue = FrameQueue::unbounded();
        assert!(queue.next(Some(Duration::from_millis(10))).is_none());
        assert!(!queue.wait_to_be_filled(Some(Duration::from_millis(5))));
    }

    #[test]
    fn next_receives_frame_from_other_thread() {
        let queue = Arc::new(FrameQueue::unbounded());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(frame(5));
            })
        };
        let got = queue.next(None).map(|f| f.timestamp());
        producer.join().unwrap();
        assert_eq!(got, Some(5));
    }

    #[test]
    fn wake_and_fail_unblocks_infinite_wait() {
        let queue = Arc::new(FrameQueue::unbounded());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let started = Instant::now();
                let got = queue.next(None);
                (got.is_none(), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        queue.wake_and_fail();
        let (was_none, waited) = consumer.join().unwrap();
        assert!(was_none);
        assert!(waited < Duration::from_secs(5));

        // Sticky until reset
        queue.push(frame(1));
        assert!(queue.next(None).is_none());
        queue.reset();
        assert_eq!(queue.next(None).map(|f| f.timestamp()), Some(1));
    }

    #[test]
    fn unbounded_queue_always_has_slots() {
        let queue = FrameQueue::unbounded();
        for ts in 0..100 {
            queue.push(frame(ts));
        }
        assert!(queue.wait_for_slots(Some(Duration::ZERO)));
        assert!(!queue.is_full());
    }

    #[test]
    fn wait_for_slots_sees_consumer_progress() {
        let queue = Arc::new(FrameQueue::new(1));
        queue.push(frame(0));
        assert!(!queue.wait_for_slots(Some(Duration::from_millis(5))));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.try_pop();
            })
        };
        assert!(queue.wait_for_slots(Some(Duration::from_secs(5))));
        consumer.join().unwrap();
    }

    #[test]
    fn guard_batches_operations() {
        let queue = FrameQueue::new(1);
        {
            let mut guard = queue.lock();
            guard.push(frame(0));
            guard.push(frame(1));
            assert_eq!(guard.len(), 2);
            assert_eq!(guard.pop().map(|f| f.timestamp()), Some(0));
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
