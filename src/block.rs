//! Code-block containers and the interface to the entropy coder.

use crate::error::UnitResult;
use crate::math::Vec2;


/// The orientation of the code-blocks relative to the subband samples.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockGeometry {

    /// Block rows are subband columns.
    pub transpose: bool,

    /// The first block row is the last subband row.
    pub vflip: bool,

    /// The first block column is the last subband column.
    pub hflip: bool,
}

impl BlockGeometry {

    /// No flipping and no transposition.
    pub const IDENTITY: BlockGeometry = BlockGeometry { transpose: false, vflip: false, hflip: false };

    /// Whether samples can be copied row by row without reordering.
    pub fn is_identity(self) -> bool {
        self == Self::IDENTITY
    }
}


/// Sign bit of a quantized sample. The remaining 31 bits hold the magnitude.
pub const SIGN_BIT: u32 = 1 << 31;

/// The magnitude bits of a quantized sample.
pub const MAGNITUDE_MASK: u32 = !SIGN_BIT;

/// Blocks get at least this many samples when their buffer needs to grow.
pub const MIN_BLOCK_SAMPLES: usize = 4096;


/// A code-block container, opened through the subband resource provider.
/// The encoder fills the sample buffer and the bit-plane statistics,
/// then hands the block to the `BlockCoder`.
#[derive(Clone, Debug, PartialEq)]
pub struct CodeBlock {

    /// Absolute index of this block within the subband's block grid.
    pub index: Vec2<usize>,

    /// Width and height of the block, in block orientation.
    pub size: Vec2<usize>,

    /// Orientation of the block relative to the subband.
    pub geometry: BlockGeometry,

    /// Sign-magnitude samples in row-major block order, `size.width()` samples per row.
    pub samples: Vec<u32>,

    /// Number of leading magnitude bit-planes that are zero in every sample.
    pub missing_msbs: u32,

    /// Number of coding passes the coder should generate.
    pub num_passes: u32,

    /// Set once a precision warning has been issued for this block.
    pub insufficient_precision_detected: bool,
}

impl CodeBlock {

    /// An empty block with the specified size and orientation.
    pub fn new(index: Vec2<usize>, size: Vec2<usize>, geometry: BlockGeometry) -> Self {
        CodeBlock {
            index, size, geometry,
            samples: Vec::new(),
            missing_msbs: 0,
            num_passes: 0,
            insufficient_precision_detected: false,
        }
    }

    /// The size of the region this block covers in the subband.
    pub fn transfer_size(&self) -> Vec2<usize> {
        if self.geometry.transpose { self.size.transposed() } else { self.size }
    }

    /// Number of samples the coder may touch, with the height rounded up to whole stripes of 4 rows.
    pub fn padded_sample_count(&self) -> usize {
        ((self.size.height() + 3) & !3) * self.size.width()
    }

    /// Grow the buffer so that all padded samples fit.
    pub(crate) fn reserve_samples(&mut self) {
        let required = self.padded_sample_count();
        if self.samples.len() < required {
            self.samples.resize(required.max(MIN_BLOCK_SAMPLES), 0);
        }
    }
}


/// The entropy coder. Turns quantized samples into compressed bits.
/// Must not call back into the encoder.
pub trait BlockCoder: Send + Sync {

    /// Code the block. `distortion_weight` is the weighted MSE contribution of the most significant
    /// bit-plane, `slope_threshold` a conservative estimate of the final truncation slope.
    fn encode(&self, block: &mut CodeBlock, reversible: bool, distortion_weight: f64, slope_threshold: u16) -> UnitResult;
}
