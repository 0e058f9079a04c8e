// shared by several test crates, not all of them use every helper
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use subband_encoder::prelude::*;


pub fn band(size: Vec2<usize>, nominal: Vec2<usize>, first: Vec2<usize>) -> SubbandParameters {
    let count = |length: usize, first: usize, nominal: usize| {
        if length == 0 { 0 } else { 1 + (length - first.min(length) + nominal - 1) / nominal }
    };

    SubbandParameters {
        size,
        nominal_block_size: nominal,
        first_block_size: first,
        blocks: BlockRange {
            position: Vec2(2, 3),
            count: Vec2(count(size.0, first.0, nominal.0), count(size.1, first.1, nominal.1)),
        },
        max_bit_planes: 10,
        roi_bit_planes: 10,
        reversible: true,
        step_size: 1.0,
        msb_wmse: 1.0,
        roi_weight: None,
        geometry: BlockGeometry::IDENTITY,
        is_top_level: false,
    }
}

/// Deterministic samples in the range of a 10 bit-plane band.
pub fn sample(row: usize, column: usize) -> i32 {
    let value = ((row * 37 + column * 11 + row * column) % 1021) as i32;
    value - 510
}

pub fn line(band: &SubbandParameters, row: usize) -> LineBuf {
    LineBuf::new((0 .. band.size.width()).map(|column| sample(row, column)).collect::<Vec<i32>>())
}

/// Push every row of the band, stopping at the first error.
pub fn push_all(encoder: &mut SubbandEncoder, band: &SubbandParameters) -> UnitResult {
    for row in 0 .. band.size.height() {
        encoder.push(&mut line(band, row))?;
    }

    Ok(())
}


/// How `TestBlocks` reports resourcing progress.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Delivery {

    /// Requested rows are resourced within `advance_block_rows_needed`.
    Immediate,

    /// Nothing is resourced until the test calls `deliver_rows` or `deliver_quantum`.
    Manual,
}

#[derive(Debug, Default)]
struct Progress {
    notifier: Option<BlockNotifier>,
    rows_requested: usize,
    quantum_blocks: usize,
    quanta_in_row: usize,
    attached: usize,
}

/// A resource provider that hands out fresh block containers
/// and remembers everything that happened.
#[derive(Debug)]
pub struct TestBlocks {
    band: SubbandParameters,
    delivery: Delivery,
    detach_immediately: bool,
    progress: Mutex<Progress>,

    /// Quanta reported to the encoder, including the jumps to row boundaries.
    delivered: AtomicUsize,

    /// Blocks that were opened before their quantum was resourced.
    violations: AtomicUsize,
    detached: AtomicBool,

    pub closed: Mutex<Vec<CodeBlock>>,
    pub rows_generated: Mutex<Vec<(usize, bool)>>,
}

impl TestBlocks {
    pub fn new(band: &SubbandParameters, delivery: Delivery) -> Arc<Self> {
        Arc::new(Self::create(band, delivery, true))
    }

    /// A provider that only completes the detach when `close_notifier` is called.
    pub fn deferring_detach(band: &SubbandParameters) -> Arc<Self> {
        Arc::new(Self::create(band, Delivery::Immediate, false))
    }

    fn create(band: &SubbandParameters, delivery: Delivery, detach_immediately: bool) -> Self {
        TestBlocks {
            band: band.clone(),
            delivery, detach_immediately,
            progress: Mutex::new(Progress::default()),
            delivered: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            detached: AtomicBool::new(false),
            closed: Mutex::new(Vec::new()),
            rows_generated: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, notifier: Option<BlockNotifier>, quanta: usize, closed: bool) {
        self.delivered.fetch_add(quanta, Ordering::SeqCst);

        // never call into the encoder while holding the lock
        if let Some(notifier) = notifier {
            notifier.update_dependencies(quanta, closed);
        }
    }

    fn quanta_per_row(&self, quantum_blocks: usize) -> usize {
        let blocks = self.band.blocks.count.width();
        (blocks + quantum_blocks - 1) / quantum_blocks.max(1)
    }

    /// Resource the next `rows` block rows at once.
    pub fn deliver_rows(&self, rows: usize) {
        let (notifier, quanta) = {
            let mut progress = self.progress.lock().unwrap();
            let quanta = 4 * rows - progress.quanta_in_row;
            progress.quanta_in_row = 0;
            (progress.notifier.clone(), quanta)
        };

        self.notify(notifier, quanta, false);
    }

    /// Resource the next quantum. The last quantum of a row completes the row.
    pub fn deliver_quantum(&self) {
        let (notifier, quanta) = {
            let mut progress = self.progress.lock().unwrap();
            let per_row = self.quanta_per_row(progress.quantum_blocks);

            if progress.quanta_in_row + 1 >= per_row {
                let quanta = 4 - progress.quanta_in_row;
                progress.quanta_in_row = 0;
                (progress.notifier.clone(), quanta)
            }
            else {
                progress.quanta_in_row += 1;
                (progress.notifier.clone(), 1)
            }
        };

        self.notify(notifier, quanta, false);
    }

    /// The final notification of a provider that could not detach immediately.
    pub fn close_notifier(&self) {
        let notifier = self.progress.lock().unwrap().notifier.take();
        self.notify(notifier, 0, true);
    }

    pub fn rows_requested(&self) -> usize {
        self.progress.lock().unwrap().rows_requested
    }

    pub fn attached(&self) -> usize {
        self.progress.lock().unwrap().attached
    }

    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Closed blocks ordered by index, with the samples outside the block removed.
    pub fn sorted_blocks(&self) -> Vec<CodeBlock> {
        let mut blocks = self.closed.lock().unwrap().clone();
        blocks.sort_by_key(|block| (block.index.1, block.index.0));

        for block in &mut blocks {
            block.samples.truncate(block.size.area());
        }

        blocks
    }

    fn block_size(&self, index: Vec2<usize>) -> Vec2<usize> {
        let band = &self.band;
        let relative = index - band.blocks.position;

        let extent = |relative: usize, length: usize, first: usize, nominal: usize| {
            if relative == 0 { first.min(length) }
            else { nominal.min(length - first - (relative - 1) * nominal) }
        };

        Vec2(
            extent(relative.0, band.size.0, band.first_block_size.0, band.nominal_block_size.0),
            extent(relative.1, band.size.1, band.first_block_size.1, band.nominal_block_size.1),
        )
    }
}

impl SubbandResources for TestBlocks {
    fn attach_block_notifier(&self, notifier: BlockNotifier) {
        let mut progress = self.progress.lock().unwrap();
        progress.notifier = Some(notifier);
        progress.attached += 1;
    }

    fn detach_block_notifier(&self) -> bool {
        self.detached.store(true, Ordering::SeqCst);
        if self.detach_immediately { self.progress.lock().unwrap().notifier = None; }
        self.detach_immediately
    }

    fn advance_block_rows_needed(&self, extra_rows: usize, quantum_bits: u32, quantum_blocks: usize) {
        assert_eq!(quantum_bits, 2);

        let notifier = {
            let mut progress = self.progress.lock().unwrap();
            progress.rows_requested += extra_rows;
            progress.quantum_blocks = quantum_blocks;
            progress.notifier.clone()
        };

        if self.delivery == Delivery::Immediate {
            self.notify(notifier, extra_rows << quantum_bits, false);
        }
    }

    fn open_block(&self, index: Vec2<usize>) -> Result<CodeBlock> {
        let relative = index - self.band.blocks.position;
        let quantum_blocks = self.progress.lock().unwrap().quantum_blocks.max(1);

        // only checked when running on a runtime, as synchronous encoders never resource
        if self.progress.lock().unwrap().attached > 0 {
            let required = 4 * relative.1 + relative.0 / quantum_blocks + 1;
            if self.delivered.load(Ordering::SeqCst) < required {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
        }

        let size = self.block_size(index);
        let size = if self.band.geometry.transpose { size.transposed() } else { size };
        Ok(CodeBlock::new(index, size, self.band.geometry))
    }

    fn close_block(&self, block: CodeBlock) -> UnitResult {
        self.closed.lock().unwrap().push(block);
        Ok(())
    }

    fn block_row_generated(&self, height: usize, subband_finished: bool) {
        self.rows_generated.lock().unwrap().push((height, subband_finished));
    }
}


/// A block coder that records the distortion weight of each block and can fail on request.
#[derive(Debug, Default)]
pub struct TestCoder {
    pub fail_at: Option<Vec2<usize>>,
    pub weights: Mutex<Vec<(Vec2<usize>, f64)>>,
}

impl TestCoder {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn failing_at(index: Vec2<usize>) -> Arc<Self> {
        Arc::new(TestCoder { fail_at: Some(index), .. Self::default() })
    }

    pub fn weight_of(&self, index: Vec2<usize>) -> Option<f64> {
        self.weights.lock().unwrap().iter()
            .find(|(block, _)| *block == index)
            .map(|&(_, weight)| weight)
    }
}

impl BlockCoder for TestCoder {
    fn encode(&self, block: &mut CodeBlock, _: bool, distortion_weight: f64, _: u16) -> UnitResult {
        self.weights.lock().unwrap().push((block.index, distortion_weight));

        if self.fail_at == Some(block.index) {
            return Err(error::Error::coding("test coder refuses this block"));
        }

        Ok(())
    }
}


/// Accumulates the dependency updates of an encoder.
#[derive(Debug, Default)]
pub struct TestDependencies {
    pub updates: Mutex<Vec<(i32, i32)>>,
}

impl TestDependencies {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// The sum of all updates, as `(blocking, max_blocking)`.
    pub fn totals(&self) -> (i32, i32) {
        self.updates.lock().unwrap().iter()
            .fold((0, 0), |(blocking, max), &(new, delta)| (blocking + new, max + delta))
    }
}

impl DependencyMonitor for TestDependencies {
    fn update_dependencies(&self, new_dependencies: i32, delta_max_dependencies: i32) {
        self.updates.lock().unwrap().push((new_dependencies, delta_max_dependencies));
    }
}


/// Marks the columns `0 .. foreground_columns` of every row as foreground.
#[derive(Debug)]
pub struct ColumnMask {
    pub foreground_columns: usize,
    pub rows_pulled: usize,
}

impl RoiSource for ColumnMask {
    fn pull(&mut self, mask: &mut [u8]) {
        for (column, value) in mask.iter_mut().enumerate() {
            *value = (column < self.foreground_columns) as u8;
        }

        self.rows_pulled += 1;
    }
}
