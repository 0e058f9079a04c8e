//! Describes a subband and the collaborators that surround its encoder:
//! the resource provider that owns the code-block containers,
//! the upstream dependency tracker, and the region-of-interest mask source.

use std::sync::{Arc, Mutex};

use crate::block::{BlockGeometry, CodeBlock};
use crate::error::{Error, Result, UnitResult};
use crate::math::{RoundingMode, Vec2};

pub use crate::encoder::BlockNotifier;


/// A rectangular range of code-block indices.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockRange {

    /// Index of the top left block.
    pub position: Vec2<usize>,

    /// Number of blocks across and down.
    pub count: Vec2<usize>,
}


/// Everything the encoder needs to know about a subband.
/// Sizes are measured in subband orientation.
#[derive(Clone, Debug, PartialEq)]
pub struct SubbandParameters {

    /// Number of sample columns and rows.
    pub size: Vec2<usize>,

    /// Size of a code-block that is not clipped by the subband boundary.
    pub nominal_block_size: Vec2<usize>,

    /// Size of the top left code-block, which may be clipped.
    pub first_block_size: Vec2<usize>,

    /// The code-blocks of this subband.
    pub blocks: BlockRange,

    /// Number of magnitude bit-planes, excluding any region of interest shift.
    pub max_bit_planes: u32,

    /// Number of magnitude bit-planes including the region of interest shift.
    /// Equal to `max_bit_planes` if no shift is applied.
    pub roi_bit_planes: u32,

    /// Lossless coding with integer samples.
    pub reversible: bool,

    /// Quantization step size of an irreversible band. Ignored for reversible bands.
    pub step_size: f32,

    /// Weighted MSE contribution of a unit error in the most significant bit-plane.
    pub msb_wmse: f32,

    /// Distortion weight of blocks that contain foreground samples, if a mask is used.
    pub roi_weight: Option<f32>,

    /// Orientation of the code-blocks.
    pub geometry: BlockGeometry,

    /// Whether this is the lowest-resolution band of the decomposition.
    pub is_top_level: bool,
}

impl SubbandParameters {

    /// Whether the band contains no samples.
    pub fn is_empty(&self) -> bool {
        self.size.area() == 0
    }

    /// Height of the first block row, clipped to the subband.
    pub fn first_block_height(&self) -> usize {
        self.first_block_size.height().min(self.size.height())
    }

    /// Width of the first block column, clipped to the subband.
    pub fn first_block_width(&self) -> usize {
        self.first_block_size.width().min(self.size.width())
    }

    /// Whether region of interest samples are shifted above the background.
    pub fn has_roi_shift(&self) -> bool {
        self.roi_bit_planes > self.max_bit_planes
    }

    /// Whether the encoder needs the region of interest mask.
    pub fn needs_roi_mask(&self) -> bool {
        self.has_roi_shift() || self.roi_weight.is_some()
    }

    /// Number of blocks covering `length` samples along one axis.
    fn block_count(length: usize, first: usize, nominal: usize) -> usize {
        if length == 0 { 0 }
        else { 1 + RoundingMode::Up.divide(length - first.min(length), nominal) }
    }

    /// Check that the description is self-consistent.
    pub fn validate(&self) -> UnitResult {
        if self.is_empty() {
            return Ok(());
        }

        if self.nominal_block_size.area() == 0 || self.first_block_size.area() == 0 {
            return Err(Error::invalid("code-block size must not be zero"));
        }

        if self.first_block_size.width() > self.nominal_block_size.width()
            || self.first_block_size.height() > self.nominal_block_size.height()
        {
            return Err(Error::invalid("first code-block larger than nominal code-block"));
        }

        let expected = Vec2(
            Self::block_count(self.size.width(), self.first_block_size.width(), self.nominal_block_size.width()),
            Self::block_count(self.size.height(), self.first_block_size.height(), self.nominal_block_size.height()),
        );

        if expected != self.blocks.count {
            return Err(Error::invalid("code-block count does not match subband size"));
        }

        if self.roi_bit_planes < self.max_bit_planes {
            return Err(Error::invalid("region of interest bit-planes less than band bit-planes"));
        }

        if !self.reversible && !(self.step_size > 0.0) {
            return Err(Error::invalid("quantization step size must be positive"));
        }

        Ok(())
    }
}


/// The authority that owns the code-block containers of a subband.
///
/// Opening and closing a block container is guaranteed not to contend for a lock
/// only for the block rows that the provider has reported as resourced,
/// through the notifier attached at start.
pub trait SubbandResources: Send + Sync {

    /// Receive the notifier through which resourcing progress is reported.
    fn attach_block_notifier(&self, notifier: BlockNotifier);

    /// Release the notifier. Returns true if no notification can arrive anymore.
    /// Returns false if the provider will instead deliver a final closing notification later.
    fn detach_block_notifier(&self) -> bool;

    /// The encoder will need `extra_rows` more block rows. Progress is reported
    /// in units where one row equals `1 << quantum_bits`, and a row is divided
    /// into quanta of `quantum_blocks` blocks each.
    fn advance_block_rows_needed(&self, extra_rows: usize, quantum_bits: u32, quantum_blocks: usize);

    /// Obtain the container for the block at the specified absolute index.
    fn open_block(&self, index: Vec2<usize>) -> Result<CodeBlock>;

    /// Return a coded block container.
    fn close_block(&self, block: CodeBlock) -> UnitResult;

    /// A lower bound for the final rate-distortion slope threshold, which lets the coder skip passes.
    fn conservative_slope_threshold(&self) -> u16 { 0 }

    /// A row of blocks with the specified height has been coded.
    fn block_row_generated(&self, _height: usize, _subband_finished: bool) {}
}


/// The upstream tracker that learns whether pushing lines into this encoder may block.
pub trait DependencyMonitor: Send + Sync {

    /// `new_dependencies` changes the number of currently blocking conditions,
    /// `delta_max_dependencies` changes the number of conditions that may block in the future.
    fn update_dependencies(&self, new_dependencies: i32, delta_max_dependencies: i32);
}


/// Produces the region of interest mask, one row per pushed line.
/// Non-zero mask values mark foreground samples.
pub trait RoiSource: Send {

    /// Fill the mask for the next subband row.
    fn pull(&mut self, mask: &mut [u8]);
}

/// A mask source shared between the encoders of several subbands.
/// The mutex is only taken while lines are pushed, never by quantization jobs.
pub type SharedRoi = Arc<Mutex<dyn RoiSource>>;
