// SpeedSense: Deferred Execution Bridge
//
// The only path from interrupt / stack-callback context to code that touches
// the radio.  Producers push `Job`s into a fixed-capacity queue; the main loop
// drains it.  Pushing never blocks or allocates: when the queue is full the job
// is dropped and counted, and the main loop reports the count.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use heapless::mpmc;

use crate::config::JOB_QUEUE_DEPTH;
use crate::events::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deferred job queue full, dropped {0:?}")]
pub struct DeferError(pub Job);

// ---------------------------------------------------------------------------
// Job queue (multi-producer, main-loop consumer)
// ---------------------------------------------------------------------------

/// Lock-free bounded queue.  `N` must be a power of two.
pub struct JobQueue<const N: usize = JOB_QUEUE_DEPTH> {
    jobs: mpmc::Queue<Job, N>,
    queued: AtomicUsize,
    dropped: AtomicU32,
}

impl<const N: usize> JobQueue<N> {
    // A producer preempted mid-enqueue can make a concurrent push fail; that
    // push is dropped and counted like any other overflow.
    #[allow(deprecated)]
    pub const fn new() -> Self {
        Self {
            jobs: mpmc::Queue::new(),
            queued: AtomicUsize::new(0),
            dropped: AtomicU32::new(0),
        }
    }

    /// Safe to call from ISR context: no locks, no allocation, no logging.
    pub fn try_defer(&self, job: Job) -> Result<(), DeferError> {
        // Counted before the push so `pop` never decrements below zero.
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.jobs.enqueue(job).map_err(|job| {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            DeferError(job)
        })
    }

    /// Fire-and-forget variant of [`try_defer`](Self::try_defer).
    pub fn defer(&self, job: Job) {
        let _ = self.try_defer(job);
    }

    pub fn pop(&self) -> Option<Job> {
        let job = self.jobs.dequeue()?;
        self.queued.fetch_sub(1, Ordering::AcqRel);
        Some(job)
    }

    /// Jobs queued or being queued right now.
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of jobs dropped since the last call.
    pub fn take_dropped(&self) -> u32 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

impl<const N: usize> Default for JobQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Pending-advertise flag
// ---------------------------------------------------------------------------

/// Set by anyone wanting an advertising cycle; cleared only by the main loop.
pub struct AdvertiseRequest(AtomicBool);

impl AdvertiseRequest {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns `true` at most once per batch of requests.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

impl Default for AdvertiseRequest {
    fn default() -> Self {
        Self::new()
    }
}
