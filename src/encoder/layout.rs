//! Partition a subband into stripes, jobs and quanta.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::math::RoundingMode;
use crate::subband::SubbandParameters;
use super::options::{EncoderOptions, QuantumPacing};
use super::state::{MAX_IN_FLIGHT, MAX_STRIPES, QUANTUM_BITS};

/// Jobs grow until their samples, plus half, reach this many.
const LOG2_MIN_JOB_SAMPLES: u32 = 12;

/// Jobs grow towards this many samples, plus half, while there are enough jobs for all threads.
const LOG2_IDEAL_JOB_SAMPLES: u32 = 14;

/// Jobs narrower than this many columns always grow.
const MIN_JOB_WIDTH: usize = 64;

/// Block starts are aligned to multiples of this many samples within a line.
const LINE_ALIGNMENT: usize = 8;


/// The columns of a line covered by one job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct JobSpan {

    /// First sample of the job within the stripe line.
    pub offset: usize,

    /// Number of samples covered.
    pub width: usize,

    /// Number of code-blocks covered.
    pub blocks: usize,

    /// Absolute column index of the first block.
    pub first_block_column: usize,
}


/// How the subband is partitioned. Computed once on construction.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Layout {
    pub num_stripes: usize,
    pub stripes_in_subband: usize,
    pub first_stripe_height: usize,
    pub nominal_stripe_height: usize,

    /// Number of lines allocated per stripe.
    pub stripe_capacity: SmallVec<[usize; MAX_STRIPES]>,

    pub log2_job_blocks: u32,
    pub jobs_per_stripe: usize,
    pub jobs_per_quantum: usize,
    pub quanta_per_stripe: usize,

    /// Zero if quanta are released together with their stripe.
    pub lines_per_quantum: usize,
    pub scheduling_offset: i32,

    /// Samples before the first subband column in each line.
    pub line_offset: usize,

    /// Subband columns in each line, plus one if lines will be extended.
    pub line_width: usize,

    pub spans: Vec<JobSpan>,
}

impl Layout {

    /// A layout without stripes or jobs.
    pub fn empty() -> Self {
        Layout {
            num_stripes: 0, stripes_in_subband: 0,
            first_stripe_height: 0, nominal_stripe_height: 0,
            stripe_capacity: SmallVec::new(),
            log2_job_blocks: 0, jobs_per_stripe: 0, jobs_per_quantum: 0, quanta_per_stripe: 0,
            lines_per_quantum: 0, scheduling_offset: 1,
            line_offset: 0, line_width: 0,
            spans: Vec::new(),
        }
    }

    /// Partition the band for the specified number of worker threads.
    /// `threads` is `None` if jobs are executed synchronously by the producer.
    pub fn new(band: &SubbandParameters, options: &EncoderOptions, threads: Option<usize>) -> Result<Self> {
        band.validate()?;
        options.validate()?;

        if band.is_empty() {
            return Ok(Self::empty());
        }

        let thread_count = threads.unwrap_or(1).max(1);
        if thread_count > MAX_IN_FLIGHT {
            return Err(Error::unsupported("more worker threads than the scheduler can track"));
        }

        let blocks_across = band.blocks.count.width();
        let rows = band.size.height();
        let first_height = band.first_block_height();
        let nominal = band.nominal_block_size;

        let block_height = if first_height == rows { first_height } else { nominal.height() };
        let log2_job_blocks = job_size(blocks_across, nominal.width(), block_height, thread_count);

        let jobs_per_stripe = 1 + ((blocks_across - 1) >> log2_job_blocks);
        let jobs_per_quantum = 1 + ((jobs_per_stripe - 1) >> QUANTUM_BITS);
        let quanta_per_stripe = 1 + (jobs_per_stripe - 1) / jobs_per_quantum;

        let num_stripes = match threads {
            None => 1,
            Some(_) => {
                let ideal = options.stripes.unwrap_or_else(|| ideal_stripes(band.is_top_level, jobs_per_stripe, thread_count));

                let mut num_stripes = 1;
                let mut covered_rows = first_height;
                while num_stripes < ideal && covered_rows < rows {
                    num_stripes += 1;
                    covered_rows += nominal.height();
                }

                num_stripes
            }
        };

        let (lines_per_quantum, scheduling_offset) = match options.pacing {
            _ if quanta_per_stripe < 2 || num_stripes < 2 => (0, 1),
            QuantumPacing::Disabled => (0, 1),

            QuantumPacing::Automatic => {
                if num_stripes > 2 && !band.is_top_level { (1 + (nominal.height() - 1) / quanta_per_stripe, 1) }
                else { (0, 1) }
            },

            QuantumPacing::Fixed { lines_per_quantum, scheduling_offset } => (lines_per_quantum, scheduling_offset),
        };

        let whole_block_stripes = rows >= 4;
        let stripe_capacity = (0 .. num_stripes).map(|stripe| {
            let mut height = nominal.height();

            if stripe == num_stripes - 1 {
                let above = if stripe > 0 { first_height + (stripe - 1) * nominal.height() } else { 0 };
                height = (rows - above).min(nominal.height());
            }

            if whole_block_stripes { RoundingMode::Up.to_multiple(height, 4) } else { height }
        }).collect();

        let first_width = band.first_block_width();
        let line_offset = if blocks_across > 1 { first_width.wrapping_neg() & (LINE_ALIGNMENT - 1) } else { 0 };

        let columns = band.size.width();
        let line_width = if line_offset == 0 && options.line_will_be_extended { columns + 1 } else { columns };

        let spans = job_spans(
            jobs_per_stripe, log2_job_blocks, line_offset, columns,
            first_width, nominal.width(), band.blocks.position.width(), blocks_across,
        );

        log::debug!(
            "subband {}x{}: {} stripes, {} jobs of {} blocks per stripe, {} quanta, {} lines per quantum",
            columns, rows, num_stripes, jobs_per_stripe, 1_usize << log2_job_blocks,
            quanta_per_stripe, lines_per_quantum
        );

        Ok(Layout {
            num_stripes,
            stripes_in_subband: band.blocks.count.height(),
            first_stripe_height: first_height,
            nominal_stripe_height: nominal.height(),
            stripe_capacity,
            log2_job_blocks, jobs_per_stripe, jobs_per_quantum, quanta_per_stripe,
            lines_per_quantum, scheduling_offset,
            line_offset, line_width,
            spans,
        })
    }

    /// Samples allocated per stripe line.
    pub fn line_capacity(&self) -> usize {
        self.line_offset + self.line_width
    }

    /// Blocks per quantum, as reported to the resource provider.
    pub fn blocks_per_quantum(&self) -> usize {
        self.jobs_per_quantum << self.log2_job_blocks
    }

    /// Total number of jobs across all stripes.
    pub fn max_jobs(&self) -> usize {
        self.num_stripes * self.jobs_per_stripe
    }

    /// Whether quanta are released progressively while lines are pushed.
    pub fn paces_quanta(&self) -> bool {
        self.lines_per_quantum > 0
    }
}


/// Returns the base 2 logarithm of the number of blocks per job.
fn job_size(blocks_across: usize, block_width: usize, block_height: usize, threads: usize) -> u32 {
    let blocks = |log2: u32| 1_usize << log2;
    let width = |log2: u32| block_width << log2;
    let samples = |log2: u32| {
        let samples = (block_width * block_height) << log2;
        samples + samples / 2
    };

    let mut log2_blocks = 0;

    while blocks(log2_blocks) < blocks_across
        && (width(log2_blocks) < MIN_JOB_WIDTH || samples(log2_blocks) < 1 << LOG2_MIN_JOB_SAMPLES)
    {
        log2_blocks += 1;
    }

    while blocks(log2_blocks) < blocks_across && samples(log2_blocks) < 1 << LOG2_IDEAL_JOB_SAMPLES {
        // keep at least one job per thread
        if blocks_across / (2 * blocks(log2_blocks)) < threads { break; }
        log2_blocks += 1;
    }

    // a second job that would be much smaller than the first is merged into it
    let blocks_per_job = blocks(log2_blocks);
    if blocks_per_job < blocks_across && blocks_per_job >= blocks_across - blocks_per_job / 2 {
        log2_blocks += 1;
    }

    log2_blocks
}

fn ideal_stripes(is_top_level: bool, jobs_per_stripe: usize, threads: usize) -> usize {
    if is_top_level {
        if jobs_per_stripe < threads && threads > 8 { 3 } else { 2 }
    }
    else if threads > 8 && 2 * jobs_per_stripe < threads { 4 }
    else if threads > 4 { 3 }
    else { 2 }
}

#[allow(clippy::too_many_arguments)]
fn job_spans(
    jobs_per_stripe: usize, log2_job_blocks: u32, line_offset: usize, columns: usize,
    first_block_width: usize, nominal_block_width: usize, first_block_column: usize, blocks_across: usize,
) -> Vec<JobSpan>
{
    let line_end = line_offset + columns;
    let mut offset = line_offset;
    let mut column = first_block_column;
    let mut remaining_blocks = blocks_across;

    (0 .. jobs_per_stripe).map(|job| {
        let blocks = (1_usize << log2_job_blocks).min(remaining_blocks);
        let mut width = nominal_block_width << log2_job_blocks;
        if job == 0 { width = width + first_block_width - nominal_block_width; }
        let width = width.min(line_end - offset);

        let span = JobSpan { offset, width, blocks, first_block_column: column };
        offset += width;
        column += blocks;
        remaining_blocks -= blocks;
        span
    }).collect()
}
