//! Bounded inference queue and worker pool.
//!
//! The queue is the single backpressure point of the server: submissions
//! beyond `max_queue_size` are rejected unless the incoming frame is a
//! keyframe, in which case the oldest queued non-keyframe is evicted.
//! With priority scheduling enabled keyframes are popped before normal
//! frames; ties are FIFO by construction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Priority assigned to keyframes when priority scheduling is on.
pub const KEYFRAME_PRIORITY: u8 = 10;
/// Priority assigned to normal frames.
pub const NORMAL_PRIORITY: u8 = 5;

/// One frame awaiting inference.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub client_id: u32,
    pub frame_id: u32,
    pub timestamp: u64,
    pub width: u16,
    pub height: u16,
    pub payload: Vec<u8>,
    pub is_keyframe: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// Queue full and the request was not entitled to evict anything.
    QueueFull,
}

#[derive(Debug, Default)]
struct Queues {
    /// Keyframes, popped first under priority scheduling.
    high: VecDeque<InferenceRequest>,
    normal: VecDeque<InferenceRequest>,
}

impl Queues {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }
}

/// Bounded FIFO (optionally priority) queue feeding the worker pool.
pub struct InferenceScheduler {
    queues: Mutex<Queues>,
    notify: Notify,
    max_queue_size: usize,
    priority_scheduling: bool,
    dropped_frames: AtomicU64,
    accepted_frames: AtomicU64,
    high_water_mark: AtomicU64,
}

impl InferenceScheduler {
    pub fn new(max_queue_size: usize, priority_scheduling: bool) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            max_queue_size,
            priority_scheduling,
            dropped_frames: AtomicU64::new(0),
            accepted_frames: AtomicU64::new(0),
            high_water_mark: AtomicU64::new(0),
        })
    }

    /// Admit one request. Keyframes may evict the oldest queued
    /// non-keyframe when the queue is full; normal frames are rejected.
    pub fn submit(&self, request: InferenceRequest) -> Result<(), SubmitError> {
        {
            let mut queues = self.queues.lock();
            if queues.len() >= self.max_queue_size {
                if !request.is_keyframe {
                    drop(queues);
                    self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    trace!("queue full; dropping frame {}", request.frame_id);
                    return Err(SubmitError::QueueFull);
                }
                // A keyframe may evict the oldest queued non-keyframe.
                match queues.normal.iter().position(|r| !r.is_keyframe) {
                    Some(idx) => {
                        if let Some(evicted) = queues.normal.remove(idx) {
                            debug!(
                                "queue full; keyframe {} evicts frame {}",
                                request.frame_id, evicted.frame_id
                            );
                        }
                        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        // Every queued frame is a keyframe; nothing to evict.
                        drop(queues);
                        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                        return Err(SubmitError::QueueFull);
                    }
                }
            }
            if self.priority_scheduling && request.is_keyframe {
                queues.high.push_back(request);
            } else {
                queues.normal.push_back(request);
            }
            let len = queues.len() as u64;
            self.high_water_mark.fetch_max(len, Ordering::Relaxed);
        }
        self.accepted_frames.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next request, waiting until one is available.
    pub async fn pop(&self) -> InferenceRequest {
        loop {
            if let Some(request) = self.try_pop() {
                return request;
            }
            self.notify.notified().await;
        }
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<InferenceRequest> {
        let mut queues = self.queues.lock();
        queues
            .high
            .pop_front()
            .or_else(|| queues.normal.pop_front())
    }

    pub fn queue_size(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn accepted_frames(&self) -> u64 {
        self.accepted_frames.load(Ordering::Relaxed)
    }

    pub fn high_water_mark(&self) -> u64 {
        self.high_water_mark.load(Ordering::Relaxed)
    }

    /// Wake any parked workers (shutdown path).
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(frame_id: u32, keyframe: bool) -> InferenceRequest {
        InferenceRequest {
            client_id: 1,
            frame_id,
            timestamp: frame_id as u64,
            width: 64,
            height: 64,
            payload: vec![0; 4],
            is_keyframe: keyframe,
        }
    }

    #[test]
    fn queue_never_exceeds_bound() {
        let sched = InferenceScheduler::new(8, false);
        for i in 0..16 {
            let _ = sched.submit(request(i, false));
            assert!(sched.queue_size() <= 8);
        }
        assert_eq!(sched.queue_size(), 8);
        assert_eq!(sched.dropped_frames(), 8);
    }

    #[test]
    fn keyframe_evicts_oldest_normal_frame() {
        let sched = InferenceScheduler::new(2, false);
        sched.submit(request(1, false)).unwrap();
        sched.submit(request(2, false)).unwrap();
        sched.submit(request(3, true)).unwrap();
        assert_eq!(sched.queue_size(), 2);
        assert_eq!(sched.dropped_frames(), 1);
        // frame 1 was evicted
        let first = sched.try_pop().unwrap();
        assert_eq!(first.frame_id, 2);
    }

    #[test]
    fn keyframe_rejected_when_queue_is_all_keyframes() {
        let sched = InferenceScheduler::new(2, false);
        sched.submit(request(1, true)).unwrap();
        sched.submit(request(2, true)).unwrap();
        assert_eq!(sched.submit(request(3, true)), Err(SubmitError::QueueFull));
        assert_eq!(sched.dropped_frames(), 1);
    }

    #[test]
    fn priority_pops_keyframes_first_fifo_within_level() {
        let sched = InferenceScheduler::new(8, true);
        sched.submit(request(1, false)).unwrap();
        sched.submit(request(2, true)).unwrap();
        sched.submit(request(3, false)).unwrap();
        sched.submit(request(4, true)).unwrap();
        let order: Vec<u32> = std::iter::from_fn(|| sched.try_pop().map(|r| r.frame_id)).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn dropped_counter_is_monotone() {
        let sched = InferenceScheduler::new(1, false);
        sched.submit(request(1, false)).unwrap();
        let mut last = 0;
        for i in 2..10 {
            let _ = sched.submit(request(i, false));
            let dropped = sched.dropped_frames();
            assert!(dropped >= last);
            last = dropped;
        }
    }
}
