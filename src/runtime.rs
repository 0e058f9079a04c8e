//! Execute encoding jobs on worker threads.
//!
//! The encoder never spawns threads itself. It hands batches of jobs to a `WorkerRuntime`,
//! which may be the shipped thread pool, a deterministic manual queue for tests,
//! or an adapter to an existing scheduler.

use std::collections::VecDeque;
use std::fmt;
#[cfg(feature = "rayon")]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use smallvec::SmallVec;

use crate::encoder::Shared;
use crate::error::{Error, Result, UnitResult};


/// Identifies the job queue of one encoder within a runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueId(pub usize);


/// A flag that one thread waits for and another thread raises.
#[derive(Debug, Default)]
pub struct Condition {
    signalled: Mutex<bool>,
    changed: Condvar,
}

impl Condition {

    /// A condition that has not been signalled.
    pub fn new() -> Self { Self::default() }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.signalled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise the flag and wake every waiting thread.
    pub fn signal(&self) {
        *self.flag() = true;
        self.changed.notify_all();
    }

    /// Lower the flag before registering interest in the next signal.
    pub fn reset(&self) {
        *self.flag() = false;
    }

    /// Whether the flag is raised.
    pub fn is_signalled(&self) -> bool {
        *self.flag()
    }

    /// Block the calling thread until the flag is raised.
    pub fn wait(&self) {
        let mut signalled = self.flag();
        while !*signalled {
            signalled = self.changed.wait(signalled).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block the calling thread until the flag is raised or the timeout expires.
    /// Returns whether the flag is raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let signalled = self.flag();
        if *signalled { return true; }

        let (signalled, _) = self.changed.wait_timeout(signalled, timeout)
            .unwrap_or_else(PoisonError::into_inner);

        *signalled
    }
}


/// One unit of work: encodes a run of code-blocks in one stripe.
/// Running the last job of a stripe also processes the completion of that stripe.
pub struct Job {
    encoder: Arc<Shared>,
    stripe: usize,
    index: usize,
}

impl Job {
    pub(crate) fn new(encoder: Arc<Shared>, stripe: usize, index: usize) -> Self {
        Job { encoder, stripe, index }
    }

    /// The stripe buffer this job reads from.
    pub fn stripe(&self) -> usize { self.stripe }

    /// The position of this job within its stripe.
    pub fn index(&self) -> usize { self.index }

    /// Encode the blocks. Failures are recorded by the encoder and reported when it finishes.
    pub fn run(self) {
        self.encoder.run_job(self.stripe, self.index);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("Job")
            .field("stripe", &self.stripe)
            .field("index", &self.index)
            .finish()
    }
}


/// Consecutive jobs of one stripe, released together.
#[derive(Debug, Default)]
pub struct JobBatch {
    jobs: SmallVec<[Job; 4]>,
}

impl JobBatch {
    pub(crate) fn new(jobs: impl IntoIterator<Item = Job>) -> Self {
        JobBatch { jobs: jobs.into_iter().collect() }
    }

    /// Number of jobs in this batch.
    pub fn len(&self) -> usize { self.jobs.len() }

    /// Whether this batch contains no jobs.
    pub fn is_empty(&self) -> bool { self.jobs.is_empty() }
}

impl IntoIterator for JobBatch {
    type Item = Job;
    type IntoIter = smallvec::IntoIter<[Job; 4]>;
    fn into_iter(self) -> Self::IntoIter { self.jobs.into_iter() }
}


/// Executes encoding jobs.
pub trait WorkerRuntime: Send + Sync {

    /// Number of threads that may execute jobs concurrently.
    fn thread_count(&self) -> usize;

    /// Register the job queue of a new encoder.
    fn attach_queue(&self) -> Result<QueueId>;

    /// Execute the jobs of the batch at some point in the future, on any thread.
    /// `last_for_queue` is true if the queue will not receive more jobs.
    fn submit_batch(&self, queue: QueueId, batch: JobBatch, last_for_queue: bool);

    /// The encoder of the queue has completed. No more jobs will be submitted.
    fn detach_queue(&self, queue: QueueId);

    /// Suspend the producer until the condition is signalled.
    /// Runtimes may execute other jobs meanwhile.
    fn wait_for_condition(&self, condition: &Condition) -> UnitResult {
        condition.wait();
        Ok(())
    }
}


/// Runs jobs on a `rayon_core` thread pool.
#[cfg(feature = "rayon")]
#[derive(Debug)]
pub struct ThreadPoolRuntime {
    pool: rayon_core::ThreadPool,
    next_queue: AtomicUsize,
    attached: AtomicUsize,
}

#[cfg(feature = "rayon")]
impl ThreadPoolRuntime {

    /// A pool with one thread per logical processor.
    pub fn new() -> Result<Self> {
        Self::with_threads(0)
    }

    /// A pool with the specified number of threads, or one per logical processor if zero.
    pub fn with_threads(threads: usize) -> Result<Self> {
        let pool = rayon_core::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("Subband Encoder Thread #{}", index))
            .build()
            .map_err(|error| {
                log::debug!("thread pool unavailable: {}", error);
                Error::unsupported("thread pool could not be created")
            })?;

        Ok(ThreadPoolRuntime { pool, next_queue: AtomicUsize::new(0), attached: AtomicUsize::new(0) })
    }

    /// Number of encoders currently using this pool.
    pub fn attached_queues(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }
}

#[cfg(feature = "rayon")]
impl WorkerRuntime for ThreadPoolRuntime {
    fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn attach_queue(&self) -> Result<QueueId> {
        self.attached.fetch_add(1, Ordering::AcqRel);
        Ok(QueueId(self.next_queue.fetch_add(1, Ordering::Relaxed)))
    }

    fn submit_batch(&self, queue: QueueId, batch: JobBatch, last_for_queue: bool) {
        log::trace!("queue {} receives {} jobs (last: {})", queue.0, batch.len(), last_for_queue);

        for job in batch {
            self.pool.spawn_fifo(move || job.run());
        }
    }

    fn detach_queue(&self, _: QueueId) {
        self.attached.fetch_sub(1, Ordering::AcqRel);
    }

    fn wait_for_condition(&self, condition: &Condition) -> UnitResult {
        // a pool thread keeps executing jobs, which may be the ones it waits for
        if self.pool.current_thread_index().is_none() {
            condition.wait();
            return Ok(());
        }

        while !condition.is_signalled() {
            match rayon_core::yield_now() {
                Some(rayon_core::Yield::Executed) => {},
                _ => { condition.wait_timeout(Duration::from_millis(1)); },
            }
        }

        Ok(())
    }
}


/// A record of one `submit_batch` call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Submission {

    /// The queue the batch was submitted to.
    pub queue: QueueId,

    /// The stripe of the jobs.
    pub stripe: usize,

    /// Index of the first job within its stripe.
    pub first_job: usize,

    /// Number of jobs in the batch.
    pub jobs: usize,

    /// Whether the encoder marked this as the last batch of the queue.
    pub last_for_queue: bool,
}

#[derive(Debug, Default)]
struct ManualQueue {
    jobs: VecDeque<Job>,
    submissions: Vec<Submission>,
    attached: usize,
    detached: Vec<QueueId>,
}

/// Collects submitted jobs until they are run explicitly.
/// Waiting for a condition runs queued jobs on the waiting thread.
/// Intended for tests and for single-threaded hosts that interleave encoding with other work.
#[derive(Debug)]
pub struct ManualRuntime {
    threads: usize,
    queue: Mutex<ManualQueue>,
}

impl ManualRuntime {

    /// A runtime that pretends to have the specified number of threads, for sizing jobs.
    pub fn new(threads: usize) -> Self {
        ManualRuntime { threads: threads.max(1), queue: Mutex::new(ManualQueue::default()) }
    }

    fn queue(&self) -> MutexGuard<'_, ManualQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the oldest queued job. Returns false if no job was queued.
    pub fn run_next(&self) -> bool {
        // the lock must be released before running, as the job may submit more jobs
        let job = self.queue().jobs.pop_front();

        match job {
            Some(job) => { job.run(); true },
            None => false,
        }
    }

    /// Run jobs until none are queued. Returns how many jobs were run.
    pub fn run_all(&self) -> usize {
        let mut count = 0;
        while self.run_next() { count += 1; }
        count
    }

    /// Remove all queued jobs without running them, for example to run them in a different order.
    pub fn take_jobs(&self) -> Vec<Job> {
        self.queue().jobs.drain(..).collect()
    }

    /// Number of queued jobs.
    pub fn pending_jobs(&self) -> usize {
        self.queue().jobs.len()
    }

    /// Every batch submitted so far, in order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.queue().submissions.clone()
    }

    /// Queues whose encoders have completed.
    pub fn detached_queues(&self) -> Vec<QueueId> {
        self.queue().detached.clone()
    }
}

impl WorkerRuntime for ManualRuntime {
    fn thread_count(&self) -> usize { self.threads }

    fn attach_queue(&self) -> Result<QueueId> {
        let mut queue = self.queue();
        queue.attached += 1;
        Ok(QueueId(queue.attached - 1))
    }

    fn submit_batch(&self, id: QueueId, batch: JobBatch, last_for_queue: bool) {
        let mut queue = self.queue();

        if let Some(first) = batch.jobs.first() {
            let submission = Submission {
                queue: id, stripe: first.stripe, first_job: first.index,
                jobs: batch.len(), last_for_queue,
            };

            queue.submissions.push(submission);
        }

        queue.jobs.extend(batch);
    }

    fn detach_queue(&self, id: QueueId) {
        self.queue().detached.push(id);
    }

    fn wait_for_condition(&self, condition: &Condition) -> UnitResult {
        while !condition.is_signalled() {
            if !self.run_next() {
                return Err(Error::invalid("waiting for a condition that no queued job can signal"));
            }
        }

        Ok(())
    }
}
