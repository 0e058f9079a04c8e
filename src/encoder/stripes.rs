//! Stripe buffers and the producer's bookkeeping while filling them.
//!
//! A stripe is owned by whoever the scheduling word says: the producer writes
//! stripes with status `Available`, jobs only read stripes that are schedulable.
//! The lock around the lines is therefore never contended.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::sample::{LineSamples, SampleKind};
use super::layout::Layout;


/// Typed index of a stripe buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct StripeId(pub usize);


/// The samples of one block row.
#[derive(Debug)]
pub(crate) struct StripeLines {
    pub lines: Vec<LineSamples>,

    /// Region of interest mask, `roi_stride` bytes per line. Empty if no mask is used.
    pub roi: Vec<u8>,
    pub roi_stride: usize,

    /// Absolute index of the block row held by this stripe.
    pub block_row: usize,

    /// Number of valid lines.
    pub height: usize,
}

impl StripeLines {
    pub fn roi_line_mut(&mut self, line: usize) -> Option<&mut [u8]> {
        if self.roi.is_empty() { return None; }
        let start = line * self.roi_stride;
        self.roi.get_mut(start .. start + self.roi_stride)
    }

    pub fn roi_lines(&self) -> Option<&[u8]> {
        if self.roi.is_empty() { None } else { Some(&self.roi) }
    }
}


/// A stripe buffer and the number of its jobs that have not completed.
#[derive(Debug)]
pub(crate) struct Stripe {
    lines: RwLock<StripeLines>,
    pending_jobs: AtomicUsize,
}

impl Stripe {
    pub fn new(capacity: usize, kind: SampleKind, line_capacity: usize, roi_stride: Option<usize>) -> Self {
        let roi_stride = roi_stride.unwrap_or(0);

        Stripe {
            lines: RwLock::new(StripeLines {
                lines: (0 .. capacity).map(|_| LineSamples::zeroed(kind, line_capacity)).collect(),
                roi: vec![0; roi_stride * capacity],
                roi_stride,
                block_row: 0,
                height: 0,
            }),

            pending_jobs: AtomicUsize::new(0),
        }
    }

    /// Allocate the stripes of a layout.
    pub fn allocate(layout: &Layout, kind: SampleKind, roi_stride: Option<usize>) -> Vec<Self> {
        layout.stripe_capacity.iter()
            .map(|&capacity| Stripe::new(capacity, kind, layout.line_capacity(), roi_stride))
            .collect()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, StripeLines> {
        self.lines.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, StripeLines> {
        self.lines.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by the producer before the stripe is released.
    pub fn expect_jobs(&self, count: usize) {
        self.pending_jobs.store(count, Ordering::Release);
    }

    /// Account for `count` completed jobs. Returns true if these were the last ones.
    pub fn jobs_completed(&self, count: usize) -> bool {
        if count == 0 { return false; }

        let previous = self.pending_jobs.fetch_sub(count, Ordering::AcqRel);
        assert!(previous >= count, "stripe completed {} jobs but only {} were pending", count, previous);
        previous == count
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending_jobs.load(Ordering::Acquire)
    }
}


/// A filled stripe whose quanta are still being released.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PartialRelease {
    pub stripe: StripeId,

    /// Quanta that will only be released after more lines have been pushed.
    pub remaining_quanta: usize,
}


/// Where the producer is within the subband. Only accessed by the producer.
#[derive(Clone, Debug, Default)]
pub(crate) struct PushState {
    pub stripe: usize,
    pub line: usize,
    pub lines_left_in_stripe: usize,
    pub next_stripe_height: usize,
    pub lines_left_in_subband: usize,

    /// Block rows filled so far, also the relative index of the next block row.
    pub stripes_filled: usize,

    /// Block rows announced to the resource provider.
    pub rows_requested: usize,

    pub partial: Option<PartialRelease>,
}

impl PushState {
    pub fn new(layout: &Layout, rows: usize) -> Self {
        PushState {
            next_stripe_height: layout.first_stripe_height,
            lines_left_in_subband: rows,
            .. PushState::default()
        }
    }

    /// Whether every line of the subband has been pushed.
    pub fn is_complete(&self) -> bool {
        self.lines_left_in_subband == 0 && self.lines_left_in_stripe == 0
    }

    /// Whether the next line opens a new stripe.
    pub fn needs_stripe(&self) -> bool {
        self.lines_left_in_stripe == 0
    }

    /// Open the next stripe. Returns its height.
    pub fn open_stripe(&mut self, nominal_height: usize) -> usize {
        let height = self.next_stripe_height;
        self.lines_left_in_stripe = height;
        self.line = 0;
        self.lines_left_in_subband -= height;
        self.next_stripe_height = nominal_height.min(self.lines_left_in_subband);
        height
    }

    /// Account for one pushed line. Returns true if the stripe is now full.
    pub fn line_pushed(&mut self) -> bool {
        self.line += 1;
        self.lines_left_in_stripe -= 1;
        self.lines_left_in_stripe == 0
    }

    /// Move on to the next stripe buffer after a stripe has been filled.
    pub fn stripe_closed(&mut self, num_stripes: usize) -> StripeId {
        let filled = StripeId(self.stripe);
        self.stripe = (self.stripe + 1) % num_stripes;
        self.line = 0;
        self.stripes_filled += 1;
        filled
    }

    /// Quanta of the previous stripe that have to wait for `lines_left` more lines,
    /// released `scheduling_offset` lines early.
    pub fn quanta_waiting_for(lines_left: usize, lines_per_quantum: usize, scheduling_offset: i32) -> usize {
        let lines = lines_left as i64 - i64::from(scheduling_offset);
        if lines <= 0 { 0 } else { (lines / lines_per_quantum as i64) as usize }
    }
}
