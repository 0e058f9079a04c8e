//! The subband encoder. Accepts the lines of a subband from a producer, collects them
//! in stripes of one code-block row each, and releases encoding jobs to a worker runtime
//! as soon as the resource provider has made their code-blocks available.
//!
//! Producer, workers and resource provider coordinate through a single atomic word,
//! see `Sched`. Without a runtime, the jobs of each stripe are executed inside `push`.

mod job;
mod layout;
mod options;
mod state;
mod stripes;

pub use self::options::{EncoderOptions, QuantumPacing};
pub use self::state::{Sched, StripeStatus, MAX_IN_FLIGHT, MAX_QUANTA, MAX_STRIPES, QUANTUM_BITS};

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use smallvec::SmallVec;

use crate::block::BlockCoder;
use crate::error::{Error, UnitResult};
use crate::quantize::{self, SampleMapping};
use crate::runtime::{Condition, Job, JobBatch, QueueId, WorkerRuntime};
use crate::sample::{LineBuf, SampleKind};
use crate::subband::{DependencyMonitor, SharedRoi, SubbandParameters, SubbandResources};
use self::job::BlockEncoding;
use self::layout::Layout;
use self::state::AtomicSched;
use self::stripes::{PartialRelease, PushState, Stripe};


/// The collaborators of a subband encoder.
#[derive(Clone)]
pub struct EncoderContext {

    /// Owns the code-block containers and reports their availability.
    pub resources: Arc<dyn SubbandResources>,

    /// Codes the quantized blocks.
    pub coder: Arc<dyn BlockCoder>,

    /// Executes the jobs. Without a runtime, blocks are encoded inside `push`.
    pub runtime: Option<Arc<dyn WorkerRuntime>>,

    /// Learns whether pushing lines into this encoder may block.
    pub dependencies: Option<Arc<dyn DependencyMonitor>>,

    /// Produces the region of interest mask.
    pub roi: Option<SharedRoi>,
}

impl EncoderContext {

    /// Encode synchronously, without region of interest.
    pub fn new(resources: Arc<dyn SubbandResources>, coder: Arc<dyn BlockCoder>) -> Self {
        EncoderContext { resources, coder, runtime: None, dependencies: None, roi: None }
    }

    /// Execute the jobs on the specified runtime.
    pub fn on_runtime(self, runtime: Arc<dyn WorkerRuntime>) -> Self {
        EncoderContext { runtime: Some(runtime), .. self }
    }

    /// Report potential blocking to the specified monitor.
    pub fn with_dependency_monitor(self, dependencies: Arc<dyn DependencyMonitor>) -> Self {
        EncoderContext { dependencies: Some(dependencies), .. self }
    }

    /// Pull one row of the region of interest mask for every pushed line.
    pub fn with_roi(self, roi: SharedRoi) -> Self {
        EncoderContext { roi: Some(roi), .. self }
    }
}

impl fmt::Debug for EncoderContext {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("EncoderContext")
            .field("threads", &self.runtime.as_ref().map(|runtime| runtime.thread_count()))
            .field("dependencies", &self.dependencies.is_some())
            .field("roi", &self.roi.is_some())
            .finish()
    }
}


/// Receives resourcing progress from the subband resource provider.
/// Holds no strong reference, so notifications after the encoder is gone are ignored.
#[derive(Clone, Debug)]
pub struct BlockNotifier {
    encoder: Weak<Shared>,
}

impl BlockNotifier {

    /// `delta` more job quanta have been resourced. `closed` is true if no further
    /// notifications will follow. A zero delta with `closed` completes a deferred detach.
    pub fn update_dependencies(&self, delta: usize, closed: bool) {
        if let Some(encoder) = self.encoder.upgrade() {
            encoder.update_dependencies(delta, closed);
        }
    }
}


/// Signalled once the encoder has quiesced. Holds the outcome of the worker jobs.
#[derive(Debug, Default)]
pub struct Completion {
    done: Condition,
    outcome: Mutex<Option<UnitResult>>,
}

impl Completion {

    /// Whether every job has finished and the encoder has detached from its runtime.
    pub fn is_complete(&self) -> bool { self.done.is_signalled() }

    /// The condition that is signalled on completion.
    pub fn condition(&self) -> &Condition { &self.done }

    fn complete(&self, outcome: UnitResult) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.done.signal();
    }

    fn take(&self) -> Option<UnitResult> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}


/// The state shared between the producer, the jobs, and the resource provider.
pub(crate) struct Shared {
    this: Weak<Shared>,
    layout: Layout,
    encoding: BlockEncoding,
    stripes: Vec<Stripe>,
    sched: AtomicSched,

    runtime: Arc<dyn WorkerRuntime>,
    queue: QueueId,
    dependencies: Option<Arc<dyn DependencyMonitor>>,

    /// Signalled when a stripe becomes available while the producer waits.
    wakeup: Condition,
    block_rows_generated: AtomicUsize,

    dependencies_closed: AtomicBool,
    closing: AtomicBool,
    done: AtomicBool,

    failed: AtomicBool,
    failure: Mutex<Option<Error>>,
    completion: Completion,
}

impl Shared {

    /// Execute one job. Called by the runtime.
    pub(crate) fn run_job(&self, stripe: usize, index: usize) {
        if !self.failed.load(Ordering::Acquire) {
            let result = {
                let lines = self.stripes[stripe].read();
                self.encoding.encode_job(&lines, &self.layout.spans[index])
            };

            if let Err(error) = result {
                self.fail(error);
            }
        }

        if self.stripes[stripe].jobs_completed(1) {
            self.stripe_encoded(stripe);
        }
    }

    fn fail(&self, error: Error) {
        log::error!("encoding job failed: {}", error);

        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_none() { *failure = Some(error); }
        }

        self.failed.store(true, Ordering::Release);
        self.request_termination();
    }

    fn released_jobs(&self, state: Sched, stripe: usize) -> usize {
        let layout = &self.layout;
        state.released_jobs(stripe, layout.num_stripes, layout.jobs_per_stripe, layout.jobs_per_quantum)
    }

    /// Submit the jobs that `new` releases in addition to those released by `old`.
    fn schedule_new_jobs(&self, old: Sched, new: Sched) {
        let this = match self.this.upgrade() {
            Some(this) => this,
            None => return,
        };

        let num_stripes = self.layout.num_stripes;
        let mut more_scheduling_required = new.min_safe_stripes() != Some(0);
        let mut batches: SmallVec<[(usize, Range<usize>); MAX_STRIPES]> = SmallVec::new();

        let mut stripe = new.first_active_stripe();
        for _ in 0 .. num_stripes {
            let status = new.stripe_status(stripe);
            if status == StripeStatus::Available { break; }

            if status.is_schedulable() {
                let start = self.released_jobs(old, stripe);
                let end = self.released_jobs(new, stripe);

                if end > start { batches.push((stripe, start .. end)); }
                if end < self.layout.jobs_per_stripe { more_scheduling_required = true; }
            }

            stripe = (stripe + 1) % num_stripes;
        }

        let count = batches.len();
        for (position, (stripe, jobs)) in batches.into_iter().enumerate() {
            let last_for_queue = position + 1 == count && !more_scheduling_required;
            log::trace!("releasing jobs {:?} of stripe {}", jobs, stripe);

            let batch = JobBatch::new(jobs.map(|index| Job::new(this.clone(), stripe, index)));
            self.runtime.submit_batch(self.queue, batch, last_for_queue);
        }
    }

    /// The last job of a stripe completed, or was skipped because of termination.
    fn stripe_encoded(&self, stripe: usize) {
        let num_stripes = self.layout.num_stripes;
        let (old, new) = self.sched.transition(|state| Some(state.stripe_encoded(stripe, num_stripes)));

        let reclaimed = new.available_stripes() - old.available_stripes();
        if reclaimed == 0 {
            // an earlier stripe is still being encoded
            return;
        }

        if old.producer_waiting() {
            self.wakeup.signal();
        }

        if !old.termination_requested() {
            self.generate_block_rows(reclaimed, new.is_finished());
            self.propagate_availability(old, new);
        }

        let (_, released) = self.sched.transition(|state| Some(state.worker_released()));
        let quiescent = released.termination_requested() || released.min_safe_stripes() == Some(0);

        if quiescent && !released.has_work_in_flight() {
            self.close();
        }
    }

    fn generate_block_rows(&self, rows: usize, subband_finished: bool) {
        let band = &self.encoding.band;
        let first_height = band.first_block_height();
        let nominal_height = band.nominal_block_size.height();

        for row in 0 .. rows {
            let mut height = nominal_height;

            if row == 0 && first_height != nominal_height && self.block_rows_generated.fetch_add(1, Ordering::AcqRel) == 0 {
                height = first_height;
            }

            self.encoding.resources.block_row_generated(height, subband_finished && row + 1 == rows);
        }
    }

    /// Tell the dependency monitor whether `push` may still block, after stripes became available.
    fn propagate_availability(&self, old: Sched, new: Sched) {
        let (old_available, new_available) = (old.available_stripes(), new.available_stripes());

        match new.min_safe_stripes() {
            Some(min_safe) if old_available < min_safe && new_available >= min_safe => {
                if old_available == 0 { self.propagate(-1, -1) }
                else { self.propagate(0, -1) }
            },

            min_safe if old_available == 0 && min_safe != Some(0) => self.propagate(-1, 0),
            _ => {},
        }
    }

    fn propagate(&self, new_dependencies: i32, delta_max_dependencies: i32) {
        if let Some(dependencies) = &self.dependencies {
            dependencies.update_dependencies(new_dependencies, delta_max_dependencies);
        }
    }

    fn update_dependencies(&self, delta: usize, closed: bool) {
        if closed {
            self.dependencies_closed.store(true, Ordering::SeqCst);
        }

        if delta == 0 {
            if closed && self.closing.load(Ordering::SeqCst) {
                self.all_done();
            }

            return;
        }

        let (old, new) = self.sched.transition(|state| state.resourced(delta));
        if old != new {
            self.schedule_new_jobs(old, new);
        }
    }

    /// Stop releasing jobs. Every job that has not been released is treated as completed.
    /// Never blocks.
    fn request_termination(&self) {
        let (old, new) = self.sched.transition(|state| Some(state.terminated()));

        for stripe in 0 .. self.layout.num_stripes {
            if !new.stripe_status(stripe).is_schedulable() { continue; }

            let skipped = self.released_jobs(new, stripe) - self.released_jobs(old, stripe);
            if self.stripes[stripe].jobs_completed(skipped) {
                self.stripe_encoded(stripe);
            }
        }

        if !self.sched.load().has_work_in_flight() {
            self.close();
        }
    }

    /// Detach from the resource provider, then complete.
    fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        // a provider that cannot detach yet sends a final closing notification later
        if self.dependencies_closed.load(Ordering::SeqCst) || self.encoding.resources.detach_block_notifier() {
            self.all_done();
        }
    }

    fn all_done(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        self.runtime.detach_queue(self.queue);

        let failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner).take();
        log::debug!("subband encoder completed{}", if failure.is_some() { " with failure" } else { "" });

        self.completion.complete(failure.map_or(Ok(()), Err));
    }

    /// Suspend the producer until a stripe is available.
    fn wait_for_stripe(&self) -> UnitResult {
        loop {
            let state = self.sched.load();
            if state.termination_requested() { return Err(Error::Aborted); }
            if state.available_stripes() > 0 { return Ok(()); }

            self.wakeup.reset();

            // setting the flag re-checks the available stripes, so no wakeup is lost
            let (old, _) = self.sched.transition(Sched::producer_waits);
            if old.available_stripes() == 0 {
                self.runtime.wait_for_condition(&self.wakeup)?;
            }
        }
    }

    /// The producer has filled the stripe it was writing.
    fn release_stripe(&self, push: &mut PushState) -> UnitResult {
        let layout = &self.layout;
        let num_stripes = layout.num_stripes;

        assert!(push.partial.is_none(), "stripe filled before the previous one was fully released");

        let stripe = push.stripe_closed(num_stripes);
        let stripes_left = layout.stripes_in_subband - push.stripes_filled;
        debug_assert_eq!(self.stripes[stripe.0].pending_jobs(), 0, "stripe refilled with jobs pending");
        self.stripes[stripe.0].expect_jobs(layout.jobs_per_stripe);

        let waiting = if layout.paces_quanta() && stripes_left > 0 {
            PushState::quanta_waiting_for(push.next_stripe_height, layout.lines_per_quantum, layout.scheduling_offset)
        } else { 0 };

        let releasable = if waiting > 0 { Some(layout.quanta_per_stripe.saturating_sub(waiting)) } else { None };

        let (old, new) = self.sched.transition(|state| {
            if state.termination_requested() { None }
            else { Some(state.stripe_filled(stripe.0, releasable, stripes_left, num_stripes)) }
        });

        if new.termination_requested() {
            return Err(Error::Aborted);
        }

        if waiting > 0 {
            push.partial = Some(PartialRelease { stripe, remaining_quanta: waiting });
        }

        self.schedule_new_jobs(old, new);

        if new.available_stripes() == 0 && new.min_safe_stripes() != Some(0) {
            // the next push may block
            self.propagate(1, 0);
        }

        Ok(())
    }

    /// Release quanta of the partially schedulable stripe as lines of the next stripe arrive.
    fn release_quanta(&self, push: &mut PushState) {
        let partial = match push.partial {
            Some(partial) => partial,
            None => return,
        };

        let layout = &self.layout;
        let waiting = PushState::quanta_waiting_for(push.lines_left_in_stripe, layout.lines_per_quantum, layout.scheduling_offset);
        if waiting == partial.remaining_quanta {
            return;
        }

        let releasable = if waiting == 0 { None } else { Some(layout.quanta_per_stripe.saturating_sub(waiting)) };
        let (old, new) = self.sched.transition(|state| state.quanta_released(partial.stripe.0, releasable));

        // termination may have made the stripe fully schedulable already
        let still_partial = new.stripe_status(partial.stripe.0) == StripeStatus::PartiallySchedulable;
        push.partial = if still_partial { Some(PartialRelease { remaining_quanta: waiting, .. partial }) } else { None };

        if old != new {
            self.schedule_new_jobs(old, new);
        }
    }
}


/// A handle for the runtime and the resource provider,
/// valid while the jobs of a started encoder are running.
#[derive(Clone)]
pub struct EncoderQueue {
    shared: Arc<Shared>,
}

impl EncoderQueue {

    /// The runtime queue the jobs are submitted to.
    pub fn id(&self) -> QueueId { self.shared.queue }

    /// Stop releasing jobs and complete as soon as the released jobs have finished.
    /// Does not wait. Subsequent `push` calls fail.
    pub fn request_termination(&self) {
        self.shared.request_termination();
    }

    /// Same as `BlockNotifier::update_dependencies`.
    pub fn update_dependencies(&self, delta: usize, closed: bool) {
        self.shared.update_dependencies(delta, closed);
    }

    /// The maximum number of jobs that can be released at the same time.
    pub fn max_jobs(&self) -> usize { self.shared.layout.max_jobs() }

    /// Signalled after the last job has finished.
    pub fn completion(&self) -> &Completion { &self.shared.completion }

    /// A snapshot of the scheduling state.
    pub fn scheduling_state(&self) -> Sched { self.shared.sched.load() }
}

impl fmt::Debug for EncoderQueue {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("EncoderQueue")
            .field("id", &self.shared.queue)
            .field("state", &self.shared.sched.load())
            .finish()
    }
}


enum Engine {
    Synchronous { encoding: BlockEncoding, stripe: Stripe },
    Threaded(Arc<Shared>),
}


/// Encodes the code-blocks of one subband from lines pushed in increasing row order.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use subband_encoder::prelude::*;
/// # fn encode(band: SubbandParameters, resources: Arc<dyn SubbandResources>, coder: Arc<dyn BlockCoder>, rows: Vec<Vec<i32>>) -> UnitResult {
/// let context = EncoderContext::new(resources, coder);
/// let mut encoder = SubbandEncoder::new(band, context, EncoderOptions::default())?;
///
/// for row in rows {
///     encoder.push(&mut LineBuf::new(row))?;
/// }
///
/// encoder.finish()
/// # }
/// ```
pub struct SubbandEncoder {
    band: SubbandParameters,
    options: EncoderOptions,
    context: EncoderContext,
    layout: Layout,
    kind: SampleKind,
    mapping: Option<SampleMapping>,
    queue: Option<QueueId>,
    engine: Option<Engine>,
    push: PushState,
}

impl SubbandEncoder {

    /// Check the configuration and compute how the subband is partitioned.
    /// Nothing is allocated and no job is released before `start`.
    pub fn new(band: SubbandParameters, context: EncoderContext, options: EncoderOptions) -> crate::error::Result<Self> {
        band.validate()?;
        options.validate()?;

        if band.has_roi_shift() && band.roi_bit_planes - band.max_bit_planes < band.max_bit_planes {
            return Err(Error::invalid(
                "region of interest shift must be at least the number of magnitude bit-planes of the band"
            ));
        }

        let threads = context.runtime.as_ref().map(|runtime| runtime.thread_count());
        let layout = Layout::new(&band, &options, threads)?;
        let kind = SampleKind::select(options.use_shorts, band.reversible);

        let mapping = if band.is_empty() { None } else {
            let step_size = band.step_size * options.normalization;
            Some(SampleMapping::new(kind, band.reversible, band.max_bit_planes, step_size)?)
        };

        let queue = match &context.runtime {
            Some(runtime) if !band.is_empty() => {
                let queue = runtime.attach_queue()?;

                if layout.num_stripes < band.blocks.count.height() {
                    if let Some(dependencies) = &context.dependencies {
                        dependencies.update_dependencies(0, 1);
                    }
                }

                Some(queue)
            },

            _ => None,
        };

        Ok(SubbandEncoder {
            push: PushState::new(&layout, band.size.height()),
            band, options, context, layout, kind, mapping, queue,
            engine: None,
        })
    }

    /// Allocate the stripes and request the first block rows from the resource provider.
    /// Called by the first `push` if necessary. Calling it again has no effect.
    pub fn start(&mut self) -> UnitResult {
        let mapping = match self.mapping {
            Some(mapping) if self.engine.is_none() => mapping,
            _ => return Ok(()),
        };

        let band = &self.band;
        let layout = &self.layout;
        let context = &self.context;

        let quantizer = quantize::select(self.options.accelerated_quantization, band.geometry);
        log::debug!("subband {}x{} uses the {} quantizer", band.size.width(), band.size.height(), quantizer.name());

        let encoding = BlockEncoding::new(
            band.clone(), mapping, quantizer,
            context.resources.clone(), context.coder.clone(), layout.line_offset,
        );

        let roi_stride = if band.needs_roi_mask() && context.roi.is_some() { Some(band.size.width()) } else { None };
        let mut stripes = Stripe::allocate(layout, self.kind, roi_stride);
        self.push = PushState::new(layout, band.size.height());

        let engine = match (&context.runtime, self.queue) {
            (Some(runtime), Some(queue)) => {
                let sched = AtomicSched::new(Sched::started(layout.num_stripes, layout.stripes_in_subband), layout.num_stripes);

                let shared = Arc::new_cyclic(|this| Shared {
                    this: this.clone(),
                    layout: layout.clone(),
                    encoding, stripes, sched,
                    runtime: runtime.clone(),
                    queue,
                    dependencies: context.dependencies.clone(),
                    wakeup: Condition::new(),
                    block_rows_generated: AtomicUsize::new(0),
                    dependencies_closed: AtomicBool::new(false),
                    closing: AtomicBool::new(false),
                    done: AtomicBool::new(false),
                    failed: AtomicBool::new(false),
                    failure: Mutex::new(None),
                    completion: Completion::default(),
                });

                context.resources.attach_block_notifier(BlockNotifier { encoder: Arc::downgrade(&shared) });

                self.push.rows_requested = layout.num_stripes;
                context.resources.advance_block_rows_needed(layout.num_stripes, QUANTUM_BITS, layout.blocks_per_quantum());

                Engine::Threaded(shared)
            },

            _ => match stripes.pop() {
                Some(stripe) => Engine::Synchronous { encoding, stripe },
                None => return Err(Error::invalid("subband layout without stripes")),
            },
        };

        self.engine = Some(engine);
        Ok(())
    }

    /// Accept the next line of the subband. Lines without samples are ignored.
    ///
    /// If the line is exchangeable and aligned, its storage is swapped with an encoder buffer,
    /// leaving arbitrary samples in `line`. When running on a runtime, this call waits
    /// for a free stripe if all stripes are still being encoded.
    pub fn push(&mut self, line: &mut LineBuf) -> UnitResult {
        if self.band.is_empty() || line.is_empty() {
            return Ok(());
        }

        self.start()?;

        if line.len() < self.band.size.width() || line.len() > self.layout.line_width {
            return Err(Error::invalid("line length does not match the subband width"));
        }

        if self.push.is_complete() {
            return Err(Error::invalid("more lines pushed than the subband has rows"));
        }

        let block_row_origin = self.band.blocks.position.height();
        let nominal_height = self.layout.nominal_stripe_height;
        let line_offset = self.layout.line_offset;
        let roi = self.context.roi.as_ref();
        let push = &mut self.push;

        match &self.engine {
            Some(Engine::Synchronous { encoding, stripe }) => {
                if push.needs_stripe() {
                    let height = push.open_stripe(nominal_height);
                    open_stripe(stripe, block_row_origin + push.stripes_filled, height);
                }

                fill_line(stripe, push.line, line, line_offset, roi)?;

                if push.line_pushed() {
                    push.stripe_closed(1);

                    let lines = stripe.read();
                    for span in &self.layout.spans {
                        encoding.encode_job(&lines, span)?;
                    }
                }

                Ok(())
            },

            Some(Engine::Threaded(shared)) => {
                if shared.sched.load().termination_requested() {
                    return Err(Error::Aborted);
                }

                if push.needs_stripe() {
                    shared.wait_for_stripe()?;

                    // request one more row at a time, so jobs are released in order
                    if push.rows_requested < self.layout.stripes_in_subband {
                        push.rows_requested += 1;
                        shared.encoding.resources.advance_block_rows_needed(1, QUANTUM_BITS, self.layout.blocks_per_quantum());
                    }

                    let height = push.open_stripe(nominal_height);
                    open_stripe(&shared.stripes[push.stripe], block_row_origin + push.stripes_filled, height);
                }

                fill_line(&shared.stripes[push.stripe], push.line, line, line_offset, roi)?;

                if push.line_pushed() { shared.release_stripe(push) }
                else { shared.release_quanta(push); Ok(()) }
            },

            None => Err(Error::invalid("encoder has no stripes")),
        }
    }

    /// Wait until every released job has finished and report the outcome.
    /// Terminates early and returns `Error::Aborted` if not every line was pushed.
    /// Returns the first failure of a job, if any.
    pub fn finish(self) -> UnitResult {
        if self.band.is_empty() {
            return Ok(());
        }

        let complete = self.push.is_complete();

        match &self.engine {
            None => Err(Error::Aborted),
            Some(Engine::Synchronous { .. }) => if complete { Ok(()) } else { Err(Error::Aborted) },

            Some(Engine::Threaded(shared)) => {
                if !complete {
                    shared.request_termination();
                }

                shared.runtime.wait_for_condition(shared.completion.condition())?;
                shared.completion.take().unwrap_or(Ok(()))?;

                if complete { Ok(()) } else { Err(Error::Aborted) }
            },
        }
    }

    /// The handle for the runtime, available after `start` if the encoder runs on a runtime.
    pub fn queue(&self) -> Option<EncoderQueue> {
        match &self.engine {
            Some(Engine::Threaded(shared)) => Some(EncoderQueue { shared: shared.clone() }),
            _ => None,
        }
    }

    /// The maximum number of jobs that can be released at the same time.
    pub fn max_jobs(&self) -> usize { self.layout.max_jobs() }

    /// Number of stripe buffers.
    pub fn stripe_count(&self) -> usize { self.layout.num_stripes }

    /// Number of jobs per stripe.
    pub fn jobs_per_stripe(&self) -> usize { self.layout.jobs_per_stripe }

    /// A snapshot of the scheduling state, if the encoder runs on a runtime and has started.
    pub fn scheduling_state(&self) -> Option<Sched> {
        self.queue().map(|queue| queue.scheduling_state())
    }
}

impl Drop for SubbandEncoder {
    fn drop(&mut self) {
        match &self.engine {
            Some(Engine::Threaded(shared)) => {
                if !shared.completion.is_complete() {
                    shared.request_termination();
                }
            },

            // never started, so no job was ever submitted
            None => if let (Some(runtime), Some(queue)) = (&self.context.runtime, self.queue) {
                runtime.detach_queue(queue);
            },

            Some(Engine::Synchronous { .. }) => {},
        }
    }
}

impl fmt::Debug for SubbandEncoder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("SubbandEncoder")
            .field("size", &self.band.size)
            .field("stripes", &self.layout.num_stripes)
            .field("jobs_per_stripe", &self.layout.jobs_per_stripe)
            .field("started", &self.engine.is_some())
            .field("state", &self.scheduling_state())
            .finish()
    }
}

fn open_stripe(stripe: &Stripe, block_row: usize, height: usize) {
    let mut lines = stripe.write();
    lines.block_row = block_row;
    lines.height = height;
}

fn fill_line(stripe: &Stripe, index: usize, line: &mut LineBuf, line_offset: usize, roi: Option<&SharedRoi>) -> UnitResult {
    let mut lines = stripe.write();
    line.transfer_into(&mut lines.lines[index], line_offset)?;

    if let (Some(mask), Some(roi)) = (lines.roi_line_mut(index), roi) {
        roi.lock().unwrap_or_else(PoisonError::into_inner).pull(mask);
    }

    Ok(())
}
