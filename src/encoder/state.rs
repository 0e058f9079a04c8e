//! The scheduling state of a subband encoder, packed into one atomic word.
//!
//! Every event is a pure function from one `Sched` value to the next,
//! applied through a single compare-and-swap loop in `AtomicSched::transition`.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use bit_field::BitField;


/// Maximum number of stripes an encoder can buffer.
pub const MAX_STRIPES: usize = 4;

/// One stripe of resourcing lead is `1 << QUANTUM_BITS` units, one unit per job quantum.
pub const QUANTUM_BITS: u32 = 2;

/// Maximum number of job quanta per stripe.
pub const MAX_QUANTA: usize = 1 << QUANTUM_BITS;

/// Maximum number of workers that may simultaneously process stripe completion.
pub const MAX_IN_FLIGHT: usize = 255;

const AVAILABLE_STRIPES: Range<usize> = 0 .. 3;
const PRODUCER_WAITING: usize = 3;
const TERMINATION_REQUESTED: usize = 4;
const FIRST_ACTIVE_STRIPE: Range<usize> = 5 .. 7;
const STRIPE_STATUS_START: usize = 7;
const PARTIAL_QUANTA: Range<usize> = 15 .. 17;
const MIN_SAFE_STRIPES: Range<usize> = 17 .. 20;
const RESOURCED_LEAD: Range<usize> = 20 .. 28;
const IN_FLIGHT: Range<usize> = 28 .. 36;

/// Value of the minimum-safe field while the number of remaining stripes exceeds the buffer.
const MIN_SAFE_UNKNOWN: u64 = 7;

fn stripe_status_bits(stripe: usize) -> Range<usize> {
    let start = STRIPE_STATUS_START + 2 * stripe;
    start .. start + 2
}


/// The status of a single stripe buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StripeStatus {

    /// Free, owned by the producer.
    Available,

    /// All jobs have completed, but an earlier stripe is still being encoded.
    Encoded,

    /// Filled, but only `Sched::partial_quanta` quanta may be released so far.
    PartiallySchedulable,

    /// Filled, all jobs may be released as soon as they are resourced.
    FullySchedulable,
}

impl StripeStatus {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => StripeStatus::Available,
            1 => StripeStatus::Encoded,
            2 => StripeStatus::PartiallySchedulable,
            _ => StripeStatus::FullySchedulable,
        }
    }

    fn bits(self) -> u64 {
        match self {
            StripeStatus::Available => 0,
            StripeStatus::Encoded => 1,
            StripeStatus::PartiallySchedulable => 2,
            StripeStatus::FullySchedulable => 3,
        }
    }

    /// Whether jobs of this stripe may be released.
    pub fn is_schedulable(self) -> bool {
        self == StripeStatus::PartiallySchedulable || self == StripeStatus::FullySchedulable
    }
}


/// A snapshot of the scheduling state.
///
/// Fields, from the least significant bit:
/// available stripes (3 bits), producer waiting (1 bit), termination requested (1 bit),
/// first active stripe (2 bits), status of each of the 4 stripes (2 bits each),
/// releasable quanta of the partially schedulable stripe (2 bits),
/// minimum available stripes for a non-blocking push (3 bits),
/// resourcing lead in quanta relative to the first active stripe (8 bits),
/// and workers currently processing stripe completion (8 bits).
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Sched(u64);

impl Sched {

    /// Reinterpret raw bits.
    pub const fn from_bits(bits: u64) -> Self { Sched(bits) }

    /// The raw bits.
    pub const fn bits(self) -> u64 { self.0 }

    fn field(self, bits: Range<usize>) -> usize {
        self.0.get_bits(bits) as usize
    }

    fn with_field(mut self, bits: Range<usize>, value: usize) -> Self {
        assert!(
            (value as u64) < (1_u64 << bits.len()),
            "scheduling field overflow: {} does not fit {} bits of {:?}", value, bits.len(), self
        );

        self.0.set_bits(bits, value as u64);
        self
    }

    fn with_flag(mut self, bit: usize, value: bool) -> Self {
        self.0.set_bit(bit, value);
        self
    }

    /// Number of stripes the producer may still fill before it has to wait.
    pub fn available_stripes(self) -> usize { self.field(AVAILABLE_STRIPES) }

    /// Whether the producer is waiting for a stripe to become available.
    pub fn producer_waiting(self) -> bool { self.0.get_bit(PRODUCER_WAITING) }

    /// Whether termination has been requested.
    pub fn termination_requested(self) -> bool { self.0.get_bit(TERMINATION_REQUESTED) }

    /// The oldest stripe that has not been reclaimed yet.
    pub fn first_active_stripe(self) -> usize { self.field(FIRST_ACTIVE_STRIPE) }

    /// The status of a stripe buffer.
    pub fn stripe_status(self, stripe: usize) -> StripeStatus {
        StripeStatus::from_bits(self.0.get_bits(stripe_status_bits(stripe)))
    }

    /// Number of quanta that may be released from the partially schedulable stripe.
    pub fn partial_quanta(self) -> usize { self.field(PARTIAL_QUANTA) }

    /// The smallest number of available stripes which guarantees that all
    /// remaining lines can be pushed without waiting, once that number is known.
    pub fn min_safe_stripes(self) -> Option<usize> {
        let value = self.0.get_bits(MIN_SAFE_STRIPES);
        if value == MIN_SAFE_UNKNOWN { None } else { Some(value as usize) }
    }

    fn min_safe_field(self) -> usize { self.field(MIN_SAFE_STRIPES) }

    /// Resourcing lead, in quanta, relative to the first active stripe.
    pub fn resourced_lead(self) -> usize { self.field(RESOURCED_LEAD) }

    /// Number of workers currently processing stripe completion.
    pub fn in_flight(self) -> usize { self.field(IN_FLIGHT) }

    /// Whether any stripe still has unfinished jobs or any worker is still processing a completion.
    pub fn has_work_in_flight(self) -> bool {
        self.in_flight() != 0 || (0 .. MAX_STRIPES).any(|stripe| self.stripe_status(stripe).is_schedulable())
    }

    /// Whether every stripe has been filled and reclaimed.
    pub fn is_finished(self) -> bool {
        self.min_safe_stripes() == Some(0) && (0 .. MAX_STRIPES).all(|stripe| self.stripe_status(stripe) == StripeStatus::Available)
    }

    fn with_status(mut self, stripe: usize, status: StripeStatus) -> Self {
        self.0.set_bits(stripe_status_bits(stripe), status.bits());
        self
    }

    /// The number of jobs at the start of the stripe that have been released,
    /// given the resourcing lead, the status of the stripe, and its position behind the first active stripe.
    pub fn released_jobs(self, stripe: usize, num_stripes: usize, jobs_per_stripe: usize, jobs_per_quantum: usize) -> usize {
        let status = self.stripe_status(stripe);
        if !status.is_schedulable() {
            return 0;
        }

        let position = (stripe + num_stripes - self.first_active_stripe()) % num_stripes;
        let lead = self.resourced_lead();
        let full_stripes_ahead = (lead >> QUANTUM_BITS) as isize - position as isize;

        if full_stripes_ahead < 0 {
            return 0;
        }

        let mut quanta = if full_stripes_ahead > 0 { MAX_QUANTA } else { lead & (MAX_QUANTA - 1) };
        if status == StripeStatus::PartiallySchedulable {
            quanta = quanta.min(self.partial_quanta());
        }

        (quanta * jobs_per_quantum).min(jobs_per_stripe)
    }

    /// The state right after start: every stripe available.
    pub(crate) fn started(num_stripes: usize, stripes_in_subband: usize) -> Self {
        let min_safe = if num_stripes >= stripes_in_subband { stripes_in_subband } else { MIN_SAFE_UNKNOWN as usize };

        Sched::default()
            .with_field(AVAILABLE_STRIPES, num_stripes)
            .with_field(MIN_SAFE_STRIPES, min_safe)
    }

    /// The producer wrote the last line of `stripe`. `releasable_quanta` is `None`
    /// if all quanta may be released, `stripes_left` counts the stripes still to be filled afterwards.
    pub(crate) fn stripe_filled(self, stripe: usize, releasable_quanta: Option<usize>, stripes_left: usize, num_stripes: usize) -> Self {
        assert!(self.available_stripes() > 0, "stripe filled while none was available: {:?}", self);
        assert_eq!(self.stripe_status(stripe), StripeStatus::Available, "filled stripe {} was not available: {:?}", stripe, self);

        let mut next = self.with_field(AVAILABLE_STRIPES, self.available_stripes() - 1);

        if stripes_left == num_stripes {
            next = next.with_field(MIN_SAFE_STRIPES, num_stripes);
        }
        else if stripes_left < num_stripes {
            let min_safe = self.min_safe_field();
            assert!(min_safe > 0 && min_safe != MIN_SAFE_UNKNOWN as usize, "minimum safe stripes out of step: {:?}", self);
            next = next.with_field(MIN_SAFE_STRIPES, min_safe - 1);
        }

        match releasable_quanta {
            None => next.with_status(stripe, StripeStatus::FullySchedulable),
            Some(quanta) => {
                assert_eq!(self.partial_quanta(), 0, "second partially schedulable stripe: {:?}", self);
                next.with_status(stripe, StripeStatus::PartiallySchedulable).with_field(PARTIAL_QUANTA, quanta)
            }
        }
    }

    /// More quanta of the partially schedulable stripe may be released.
    /// Returns `None` if the stripe is not partially schedulable anymore.
    pub(crate) fn quanta_released(self, stripe: usize, releasable_quanta: Option<usize>) -> Option<Self> {
        if self.stripe_status(stripe) != StripeStatus::PartiallySchedulable {
            return None;
        }

        Some(match releasable_quanta {
            None => self.with_status(stripe, StripeStatus::FullySchedulable).with_field(PARTIAL_QUANTA, 0),
            Some(quanta) => self.with_field(PARTIAL_QUANTA, quanta),
        })
    }

    /// The producer registers as waiting, but only if no stripe is available.
    pub(crate) fn producer_waits(self) -> Option<Self> {
        if self.available_stripes() == 0 { Some(self.with_flag(PRODUCER_WAITING, true)) }
        else { None }
    }

    /// The resource provider guarantees `delta` more quanta. Ignored after termination.
    pub(crate) fn resourced(self, delta: usize) -> Option<Self> {
        if self.termination_requested() {
            return None;
        }

        let lead = self.resourced_lead() + delta;
        assert!(lead < (1 << RESOURCED_LEAD.len()), "resourcing lead wrapped around: {:?} + {}", self, delta);
        Some(self.with_field(RESOURCED_LEAD, lead))
    }

    /// The last job of `stripe` completed. If the stripe is the first active one,
    /// it is reclaimed together with all directly following stripes that were already encoded,
    /// and the calling worker is counted as in flight.
    /// Otherwise the stripe is only marked as encoded.
    pub(crate) fn stripe_encoded(self, stripe: usize, num_stripes: usize) -> Self {
        assert_eq!(
            self.stripe_status(stripe), StripeStatus::FullySchedulable,
            "completed stripe {} was not fully schedulable: {:?}", stripe, self
        );

        let first = self.first_active_stripe();
        if first != stripe {
            return self.with_status(stripe, StripeStatus::Encoded);
        }

        let mut advanced = 1;
        while advanced < num_stripes && self.stripe_status((first + advanced) % num_stripes) == StripeStatus::Encoded {
            advanced += 1;
        }

        let reclaimed_lead = advanced << QUANTUM_BITS;
        assert!(self.resourced_lead() >= reclaimed_lead, "resourcing lead underflow when reclaiming {} stripes: {:?}", advanced, self);
        assert!(self.in_flight() < MAX_IN_FLIGHT, "too many workers in flight: {:?}", self);

        let mut next = self
            .with_field(AVAILABLE_STRIPES, self.available_stripes() + advanced)
            .with_field(FIRST_ACTIVE_STRIPE, (first + advanced) % num_stripes)
            .with_field(RESOURCED_LEAD, self.resourced_lead() - reclaimed_lead)
            .with_field(IN_FLIGHT, self.in_flight() + 1)
            .with_flag(PRODUCER_WAITING, false);

        for offset in 0 .. advanced {
            next = next.with_status((first + offset) % num_stripes, StripeStatus::Available);
        }

        next
    }

    /// A worker finished processing a stripe completion.
    pub(crate) fn worker_released(self) -> Self {
        assert!(self.in_flight() > 0, "worker released without being in flight: {:?}", self);
        self.with_field(IN_FLIGHT, self.in_flight() - 1)
    }

    /// Termination: every filled stripe becomes fully schedulable and fully resourced.
    pub(crate) fn terminated(self) -> Self {
        let lead = self.resourced_lead().max(MAX_STRIPES << QUANTUM_BITS);
        let mut next = self
            .with_flag(TERMINATION_REQUESTED, true)
            .with_field(RESOURCED_LEAD, lead)
            .with_field(PARTIAL_QUANTA, 0);

        for stripe in 0 .. MAX_STRIPES {
            if self.stripe_status(stripe) == StripeStatus::PartiallySchedulable {
                next = next.with_status(stripe, StripeStatus::FullySchedulable);
            }
        }

        next
    }

    /// Check the relations between the fields.
    pub fn validate(self, num_stripes: usize) -> std::result::Result<(), &'static str> {
        let statuses = (0 .. MAX_STRIPES).map(|stripe| self.stripe_status(stripe));
        let available = statuses.clone().take(num_stripes).filter(|&status| status == StripeStatus::Available).count();
        let partial = statuses.clone().filter(|&status| status == StripeStatus::PartiallySchedulable).count();

        if available != self.available_stripes() {
            return Err("number of available stripes does not match their status");
        }

        if statuses.skip(num_stripes).any(|status| status != StripeStatus::Available) {
            return Err("status set for a stripe that does not exist");
        }

        if partial > 1 {
            return Err("more than one partially schedulable stripe");
        }

        if partial == 0 && self.partial_quanta() != 0 {
            return Err("releasable quanta without a partially schedulable stripe");
        }

        if self.first_active_stripe() >= num_stripes.max(1) {
            return Err("first active stripe out of range");
        }

        if let Some(min_safe) = self.min_safe_stripes() {
            if min_safe > num_stripes {
                return Err("minimum safe stripes exceeds the buffer");
            }
        }

        let first = self.first_active_stripe();
        if self.stripe_status(first) == StripeStatus::Encoded {
            return Err("first active stripe encoded but not reclaimed");
        }

        Ok(())
    }
}

impl fmt::Debug for Sched {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let statuses: Vec<u64> = (0 .. MAX_STRIPES).map(|stripe| self.stripe_status(stripe).bits()).collect();

        formatter.debug_struct("Sched")
            .field("bits", &format_args!("{:#x}", self.0))
            .field("available", &self.available_stripes())
            .field("waiting", &self.producer_waiting())
            .field("terminating", &self.termination_requested())
            .field("first_active", &self.first_active_stripe())
            .field("status", &statuses)
            .field("partial_quanta", &self.partial_quanta())
            .field("min_safe", &self.min_safe_stripes())
            .field("lead", &self.resourced_lead())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}


/// The shared scheduling word.
#[derive(Debug)]
pub(crate) struct AtomicSched {
    word: AtomicU64,
    num_stripes: usize,
}

impl AtomicSched {
    pub fn new(initial: Sched, num_stripes: usize) -> Self {
        AtomicSched { word: AtomicU64::new(initial.bits()), num_stripes }
    }

    pub fn load(&self) -> Sched {
        Sched(self.word.load(Ordering::Acquire))
    }

    /// Apply `update` atomically, retrying while other threads interfere.
    /// `update` returns `None` to leave the state unchanged.
    /// Returns the previous and the resulting state.
    pub fn transition(&self, mut update: impl FnMut(Sched) -> Option<Sched>) -> (Sched, Sched) {
        let mut old = self.load();

        loop {
            let new = match update(old) {
                Some(new) => new,
                None => return (old, old),
            };

            if let Err(violation) = new.validate(self.num_stripes) {
                panic!("scheduling invariant violated ({}): {:?} -> {:?}", violation, old, new);
            }

            match self.word.compare_exchange_weak(old.bits(), new.bits(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return (old, new),
                Err(current) => old = Sched(current),
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn start_bits(){
        assert_eq!(Sched::started(3, 5).bits(), 0x000E_0003);
        assert_eq!(Sched::started(2, 2).bits(), 0x0004_0002);
        assert_eq!(Sched::started(1, 1).min_safe_stripes(), Some(1));
        assert_eq!(Sched::started(3, 5).min_safe_stripes(), None);
    }

    #[test]
    fn fill_bits(){
        let full = Sched::started(3, 5).stripe_filled(0, None, 4, 3);
        assert_eq!(full.bits(), 0x000E_0182);
        assert_eq!(full.stripe_status(0), StripeStatus::FullySchedulable);
        assert_eq!(full.available_stripes(), 2);

        let partial = Sched::started(3, 5).stripe_filled(0, Some(1), 4, 3);
        assert_eq!(partial.bits(), 0x000E_8102);
        assert_eq!(partial.partial_quanta(), 1);
    }

    #[test]
    fn fill_tracks_min_safe(){
        // 5 stripes in the subband, 3 buffered: known once 3 remain
        let state = Sched::started(3, 5)
            .stripe_filled(0, None, 4, 3)
            .stripe_filled(1, None, 3, 3);

        assert_eq!(state.min_safe_stripes(), Some(3));
        assert_eq!(state.stripe_filled(2, None, 2, 3).min_safe_stripes(), Some(2));
    }

    #[test]
    fn resourced_bits(){
        let state = Sched::from_bits(0x000E_0182).resourced(4).unwrap();
        assert_eq!(state.bits(), 0x004E_0182);
        assert_eq!(state.resourced_lead(), 4);
    }

    #[test]
    fn encoded_bits(){
        let state = Sched::from_bits(0x004E_0182).stripe_encoded(0, 3);
        assert_eq!(state.bits(), 0x100E_0023);
        assert_eq!(state.in_flight(), 1);
        assert_eq!(state.first_active_stripe(), 1);

        assert_eq!(state.worker_released().bits(), 0x000E_0023);
    }

    #[test]
    fn termination_bits(){
        let state = Sched::from_bits(0x000E_8102).resourced(1).unwrap();
        assert_eq!(state.bits(), 0x001E_8102);

        let terminated = state.terminated();
        assert_eq!(terminated.bits(), 0x010E_0192);
        assert_eq!(terminated.resourced(4), None);
    }

    #[test]
    fn waiting_only_without_stripes(){
        assert_eq!(Sched::started(2, 4).producer_waits(), None);

        let full = Sched::started(1, 4).stripe_filled(0, None, 3, 1);
        let waiting = full.producer_waits().unwrap();
        assert!(waiting.producer_waiting());

        // reclaiming clears the flag
        let reclaimed = waiting.resourced(4).unwrap().stripe_encoded(0, 1);
        assert!(!reclaimed.producer_waiting());
        assert_eq!(reclaimed.available_stripes(), 1);
    }

    #[test]
    fn later_stripe_completes_first(){
        let state = Sched::started(3, 8)
            .stripe_filled(0, None, 7, 3)
            .stripe_filled(1, None, 6, 3)
            .stripe_filled(2, None, 5, 3)
            .resourced(12).unwrap();

        let second_done = state.stripe_encoded(1, 3);
        assert_eq!(second_done.stripe_status(1), StripeStatus::Encoded);
        assert_eq!(second_done.available_stripes(), 0);
        assert_eq!(second_done.in_flight(), 0);

        let third_done = second_done.stripe_encoded(2, 3);
        let first_done = third_done.stripe_encoded(0, 3);
        assert_eq!(first_done.available_stripes(), 3);
        assert_eq!(first_done.first_active_stripe(), 0);
        assert_eq!(first_done.resourced_lead(), 0);
        assert_eq!(first_done.in_flight(), 1);
        first_done.validate(3).unwrap();
    }

    #[test]
    #[should_panic]
    fn lead_wrap_is_fatal(){
        let _ = Sched::started(2, 4).resourced(255).unwrap().resourced(1);
    }

    #[test]
    #[should_panic]
    fn lead_underflow_is_fatal(){
        let _ = Sched::started(1, 4).stripe_filled(0, None, 3, 1).resourced(2).unwrap().stripe_encoded(0, 1);
    }

    #[test]
    #[should_panic]
    fn completing_partial_stripe_is_fatal(){
        let _ = Sched::started(2, 4).stripe_filled(0, Some(1), 3, 2).resourced(4).unwrap().stripe_encoded(0, 2);
    }

    #[test]
    fn detects_inconsistent_words(){
        assert!(Sched::started(3, 5).validate(3).is_ok());
        assert!(Sched::started(3, 5).validate(2).is_err());
        assert!(Sched::from_bits(0x000E_0182).validate(3).is_ok());
        assert!(Sched::from_bits(0x000E_0183).validate(3).is_err());
        assert!(Sched::from_bits(0x000E_8182).validate(3).is_err());
    }

    /// Release order modelled directly: the stripe at position `i` behind
    /// the first active stripe owns the quanta from `4 i` up to `4 i + 4` of the lead.
    fn released_reference(state: Sched, stripe: usize, num_stripes: usize, jobs_per_stripe: usize, jobs_per_quantum: usize) -> usize {
        let status = state.stripe_status(stripe);
        if !status.is_schedulable() { return 0; }

        let position = (stripe + num_stripes - state.first_active_stripe()) % num_stripes;
        let owned = state.resourced_lead() as isize - (position * MAX_QUANTA) as isize;
        let mut quanta = owned.max(0).min(MAX_QUANTA as isize) as usize;

        if status == StripeStatus::PartiallySchedulable {
            quanta = quanta.min(state.partial_quanta());
        }

        (quanta * jobs_per_quantum).min(jobs_per_stripe)
    }

    #[test]
    fn released_jobs_for_every_stripe_count(){
        let statuses = [
            StripeStatus::Available, StripeStatus::Encoded,
            StripeStatus::PartiallySchedulable, StripeStatus::FullySchedulable,
        ];

        for num_stripes in 1 ..= MAX_STRIPES {
            for first in 0 .. num_stripes {
                for status in &statuses {
                    for stripe in 0 .. num_stripes {
                        for lead in 0 .. 4 * MAX_QUANTA + 2 {
                            for quanta in 0 .. MAX_QUANTA {
                                for &(jobs_per_stripe, jobs_per_quantum) in &[(1, 1), (2, 1), (3, 1), (5, 2), (16, 4)] {
                                    let mut state = Sched::default()
                                        .with_field(FIRST_ACTIVE_STRIPE, first)
                                        .with_field(RESOURCED_LEAD, lead)
                                        .with_status(stripe, *status);

                                    if *status == StripeStatus::PartiallySchedulable {
                                        state = state.with_field(PARTIAL_QUANTA, quanta);
                                    }

                                    assert_eq!(
                                        state.released_jobs(stripe, num_stripes, jobs_per_stripe, jobs_per_quantum),
                                        released_reference(state, stripe, num_stripes, jobs_per_stripe, jobs_per_quantum),
                                        "{:?} stripe {} of {}", state, stripe, num_stripes
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn reclaims_consecutive_encoded_stripes_for_every_stripe_count(){
        for num_stripes in 1 ..= MAX_STRIPES {
            for first in 0 .. num_stripes {
                // every combination of encoded flags for the stripes behind the first one
                for encoded_mask in 0 .. (1_usize << (num_stripes - 1)) {
                    let mut state = Sched::default()
                        .with_field(FIRST_ACTIVE_STRIPE, first)
                        .with_field(RESOURCED_LEAD, 4 * MAX_QUANTA)
                        .with_field(MIN_SAFE_STRIPES, MIN_SAFE_UNKNOWN as usize)
                        .with_status(first, StripeStatus::FullySchedulable);

                    for offset in 1 .. num_stripes {
                        let status = if encoded_mask & (1 << (offset - 1)) != 0 { StripeStatus::Encoded } else { StripeStatus::FullySchedulable };
                        state = state.with_status((first + offset) % num_stripes, status);
                    }

                    let expected_advance = 1 + (0 .. num_stripes - 1).take_while(|bit| encoded_mask & (1 << bit) != 0).count();
                    let next = state.stripe_encoded(first, num_stripes);

                    assert_eq!(next.available_stripes(), expected_advance);
                    assert_eq!(next.first_active_stripe(), (first + expected_advance) % num_stripes);
                    assert_eq!(next.resourced_lead(), 4 * MAX_QUANTA - MAX_QUANTA * expected_advance);
                    next.validate(num_stripes).unwrap();
                }
            }
        }
    }

    /// Drives the pure transitions like the encoder does, with random interleavings,
    /// and checks that every job is released exactly once and that the state stays consistent.
    fn random_walk(seed: u64, num_stripes: usize, total_stripes: usize, jobs_per_stripe: usize, terminate: bool) {
        let mut random = StdRng::seed_from_u64(seed);
        let jobs_per_quantum = 1 + (jobs_per_stripe - 1) / MAX_QUANTA;
        let quanta_per_stripe = 1 + (jobs_per_stripe - 1) / jobs_per_quantum;

        let mut state = Sched::started(num_stripes, total_stripes);
        let mut filled = 0;
        let mut requested_rows = num_stripes;
        let mut delivered_quanta = 0; // absolute, in lead units
        let mut reclaimed = 0;
        let mut pending = vec![0_usize; num_stripes];
        let mut released_per_stripe = vec![0_usize; num_stripes];
        let mut queued: Vec<usize> = Vec::new(); // stripes of released jobs
        let mut partial: Option<usize> = None;
        let mut steps = 0;

        let schedule = |old: Sched, new: Sched, released: &mut Vec<usize>, queued: &mut Vec<usize>| {
            for stripe in 0 .. num_stripes {
                let before = old.released_jobs(stripe, num_stripes, jobs_per_stripe, jobs_per_quantum);
                let after = new.released_jobs(stripe, num_stripes, jobs_per_stripe, jobs_per_quantum);
                if after > before {
                    released[stripe] += after - before;
                    queued.extend(std::iter::repeat(stripe).take(after - before));
                }
            }
        };

        loop {
            steps += 1;
            assert!(steps < 100_000, "no progress");
            state.validate(num_stripes).unwrap();

            let finished = reclaimed == total_stripes;
            if finished || (state.termination_requested() && queued.is_empty()) {
                assert!(!state.has_work_in_flight());
                break;
            }

            let can_fill = !state.termination_requested() && filled < total_stripes && state.available_stripes() > 0;
            let can_resource = !state.termination_requested()
                && delivered_quanta < (requested_rows << QUANTUM_BITS);

            match random.random_range(0 .. 5) {
                0 if can_fill => {
                    let stripe = filled % num_stripes;
                    filled += 1;
                    pending[stripe] = jobs_per_stripe;
                    released_per_stripe[stripe] = 0;

                    let releasable = if partial.is_none() && quanta_per_stripe > 1 && random.random_bool(0.5) {
                        partial = Some(stripe);
                        Some(random.random_range(0 .. quanta_per_stripe))
                    } else { None };

                    let old = state;
                    state = state.stripe_filled(stripe, releasable, total_stripes - filled, num_stripes);
                    schedule(old, state, &mut released_per_stripe, &mut queued);

                    if requested_rows < total_stripes { requested_rows += 1; }
                },

                1 if can_resource => {
                    // deliver one quantum, completing the row when the last quantum arrives
                    let in_row = delivered_quanta & (MAX_QUANTA - 1);
                    let delta = if in_row + 1 >= quanta_per_stripe { MAX_QUANTA - in_row } else { 1 };
                    delivered_quanta += delta;

                    let old = state;
                    state = state.resourced(delta).unwrap();
                    schedule(old, state, &mut released_per_stripe, &mut queued);
                },

                2 if partial.is_some() => {
                    let stripe = partial.take().unwrap_or_default();
                    let old = state;
                    state = state.quanta_released(stripe, None).unwrap();
                    schedule(old, state, &mut released_per_stripe, &mut queued);
                },

                3 if terminate && !state.termination_requested() && random.random_bool(0.05) => {
                    let old = state;
                    let terminated = state.terminated();
                    state = terminated;
                    partial = None;

                    for stripe in 0 .. num_stripes {
                        let before = old.released_jobs(stripe, num_stripes, jobs_per_stripe, jobs_per_quantum);
                        let after = terminated.released_jobs(stripe, num_stripes, jobs_per_stripe, jobs_per_quantum);
                        let skipped = after - before;
                        if skipped > 0 {
                            pending[stripe] -= skipped;
                            released_per_stripe[stripe] += skipped;
                            if pending[stripe] == 0 {
                                let advanced_before = state.available_stripes();
                                state = state.stripe_encoded(stripe, num_stripes);
                                if state.available_stripes() != advanced_before {
                                    reclaimed += state.available_stripes() - advanced_before;
                                    state = state.worker_released();
                                }
                            }
                        }
                    }
                },

                _ if !queued.is_empty() => {
                    let stripe = queued.swap_remove(random.random_range(0 .. queued.len()));
                    pending[stripe] -= 1;

                    if pending[stripe] == 0 {
                        assert_eq!(released_per_stripe[stripe], jobs_per_stripe, "stripe completed without all jobs released");
                        let before = state.available_stripes();
                        state = state.stripe_encoded(stripe, num_stripes);
                        if state.available_stripes() != before {
                            reclaimed += state.available_stripes() - before;
                            state = state.worker_released();
                        }
                    }
                },

                _ => {}
            }

            for stripe in 0 .. num_stripes {
                assert!(released_per_stripe[stripe] <= jobs_per_stripe, "job released twice");
            }
        }

        if !terminate {
            assert!(state.is_finished(), "{:?}", state);
        }
    }

    #[test]
    fn random_walks_release_every_job_once(){
        for seed in 0 .. 200 {
            let num_stripes = 1 + (seed as usize % MAX_STRIPES);
            let total = num_stripes + (seed as usize / 4) % 6;
            let jobs = 1 + (seed as usize * 7) % 11;
            random_walk(seed, num_stripes, total, jobs, false);
        }
    }

    #[test]
    fn random_walks_with_termination_quiesce(){
        for seed in 0 .. 200 {
            let num_stripes = 1 + (seed as usize % MAX_STRIPES);
            let total = num_stripes + 1 + (seed as usize / 4) % 6;
            let jobs = 1 + (seed as usize * 5) % 9;
            random_walk(1000 + seed, num_stripes, total, jobs, true);
        }
    }

    #[test]
    fn atomic_transitions_report_both_states(){
        let atomic = AtomicSched::new(Sched::started(2, 4), 2);
        let (old, new) = atomic.transition(|state| Some(state.stripe_filled(0, None, 3, 2)));
        assert_eq!(old, Sched::started(2, 4));
        assert_eq!(new.available_stripes(), 1);
        assert_eq!(atomic.load(), new);

        let (old, new) = atomic.transition(Sched::producer_waits);
        assert_eq!(old, new);
    }
}
