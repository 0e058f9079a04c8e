//! Encoding of the code-blocks covered by one job:
//! quantization, region of interest adjustment, bit-plane statistics, and block coding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::block::{BlockCoder, CodeBlock, MAGNITUDE_MASK, SIGN_BIT};
use crate::error::{Error, UnitResult};
use crate::math::Vec2;
use crate::quantize::{Quantizer, SampleMapping, Transfer};
use crate::subband::{SubbandParameters, SubbandResources};
use super::layout::JobSpan;
use super::stripes::StripeLines;


/// Everything a job needs besides the stripe it encodes. Fixed on construction.
pub(crate) struct BlockEncoding {
    pub band: SubbandParameters,
    pub mapping: SampleMapping,
    pub quantizer: Box<dyn Quantizer>,
    pub resources: Arc<dyn SubbandResources>,
    pub coder: Arc<dyn BlockCoder>,

    /// Samples before the first subband column in each stripe line.
    pub line_offset: usize,

    precision_warning_issued: AtomicBool,
}

impl std::fmt::Debug for BlockEncoding {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("BlockEncoding")
            .field("mapping", &self.mapping)
            .field("quantizer", &self.quantizer.name())
            .field("line_offset", &self.line_offset)
            .finish()
    }
}

/// Which samples of a block belong to the region of interest.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct RoiCoverage {
    background: bool,
    foreground: bool,
}

impl BlockEncoding {
    pub fn new(
        band: SubbandParameters, mapping: SampleMapping, quantizer: Box<dyn Quantizer>,
        resources: Arc<dyn SubbandResources>, coder: Arc<dyn BlockCoder>, line_offset: usize,
    ) -> Self {
        BlockEncoding {
            band, mapping, quantizer, resources, coder, line_offset,
            precision_warning_issued: AtomicBool::new(false),
        }
    }

    /// Encode every block of the span, in the block row currently held by `lines`.
    pub fn encode_job(&self, lines: &StripeLines, span: &JobSpan) -> UnitResult {
        let first_column = self.band.blocks.position.width();
        let nominal_width = self.band.nominal_block_size.width();
        let span_end = span.offset + span.width;
        let mut offset = span.offset;

        for column in span.first_block_column .. span.first_block_column + span.blocks {
            let width = if column == first_column { self.band.first_block_width() } else { nominal_width };
            let width = width.min(span_end - offset);

            self.encode_block(lines, Vec2(column, lines.block_row), offset, Vec2(width, lines.height))?;
            offset += width;
        }

        Ok(())
    }

    /// Open the container, fill and code it, and hand it back to the provider even if coding failed.
    fn encode_block(&self, lines: &StripeLines, index: Vec2<usize>, offset: usize, size: Vec2<usize>) -> UnitResult {
        let mut block = self.resources.open_block(index)?;
        let coded = self.code_block(lines, &mut block, offset, size);
        let closed = self.resources.close_block(block);
        coded.and(closed)
    }

    fn code_block(&self, lines: &StripeLines, block: &mut CodeBlock, offset: usize, size: Vec2<usize>) -> UnitResult {
        if block.transfer_size() != size || block.geometry != self.band.geometry {
            return Err(Error::invalid("code-block container does not match the subband geometry"));
        }

        block.reserve_samples();

        let transfer = Transfer { offset, size, row_gap: block.size.width(), geometry: block.geometry };
        let mut or_value = self.quantizer.quantize(self.mapping, &lines.lines, &transfer, &mut block.samples)?;

        let max_planes = self.band.max_bit_planes;
        let roi_planes = self.band.roi_bit_planes;

        if roi_planes > max_planes {
            // clear the low bits that background samples are shifted into
            let keep = if max_planes >= 31 { u32::MAX } else { u32::MAX << (31 - max_planes) };
            for_each_sample(&transfer, |target, _, _| block.samples[target] &= keep);
        }

        let mask = lines.roi_lines().filter(|_| self.band.needs_roi_mask());
        let roi_column = offset - self.line_offset;

        let (coverage, scale_distortion) = match mask {
            Some(mask) if roi_planes != max_planes => {
                let downshift = roi_planes - max_planes;
                let mut coverage = RoiCoverage::default();

                for_each_sample(&transfer, |target, row, column| {
                    if mask[row * lines.roi_stride + roi_column + column] == 0 {
                        let value = block.samples[target];
                        block.samples[target] = (value & SIGN_BIT) | shift_down(value & MAGNITUDE_MASK, downshift);
                        coverage.background = true;
                    }
                    else {
                        coverage.foreground = true;
                    }
                });

                if !coverage.foreground {
                    or_value = shift_down(or_value & MAGNITUDE_MASK, downshift);
                }

                (coverage, true)
            },

            Some(mask) => {
                let Vec2(width, height) = size;
                let intersects = (0 .. height).any(|row| {
                    let start = row * lines.roi_stride + roi_column;
                    mask[start .. start + width].iter().any(|&value| value != 0)
                });

                (RoiCoverage::default(), intersects)
            },

            None => (RoiCoverage::default(), true),
        };

        let planes = if coverage.background { roi_planes } else { max_planes };

        if planes > 30 && self.band.reversible && self.band.has_roi_shift() && !block.insufficient_precision_detected {
            block.insufficient_precision_detected = true;

            if !self.precision_warning_issued.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "region of interest shift of {} bit-planes is too large for lossless recovery of foreground and background, \
                    consider a region of interest weight instead",
                    roi_planes - max_planes
                );
            }
        }

        set_bit_plane_statistics(block, or_value, planes.min(31));

        let mut distortion_weight = f64::from(self.band.msb_wmse);
        if scale_distortion {
            distortion_weight *= f64::from(self.band.roi_weight.unwrap_or(1.0));
        }

        let slope_threshold = self.resources.conservative_slope_threshold();
        self.coder.encode(block, self.band.reversible, distortion_weight, slope_threshold)
    }
}

/// Visit every sample of a transfer region with its index in the block buffer
/// and the row and column of the subband sample it came from, relative to the region.
fn for_each_sample(transfer: &Transfer, mut visit: impl FnMut(usize, usize, usize)) {
    let Vec2(width, height) = transfer.size;
    let geometry = transfer.geometry;

    for m in 0 .. height {
        let row = if geometry.vflip { height - 1 - m } else { m };

        for n in 0 .. width {
            let column = if geometry.hflip { width - 1 - n } else { n };
            let target = if geometry.transpose { n * transfer.row_gap + m } else { m * transfer.row_gap + n };
            visit(target, row, column);
        }
    }
}

#[inline]
fn shift_down(magnitude: u32, shift: u32) -> u32 {
    magnitude.checked_shr(shift).unwrap_or(0)
}

/// Count the leading zero magnitude bit-planes and derive the number of coding passes,
/// given the number of bit-planes the block may use.
fn set_bit_plane_statistics(block: &mut CodeBlock, or_value: u32, planes: u32) {
    let magnitude = or_value & MAGNITUDE_MASK;
    let missing = if magnitude == 0 { 31 } else { magnitude.leading_zeros() - 1 };

    if missing >= planes {
        block.missing_msbs = planes;
        block.num_passes = 0;
    }
    else {
        block.missing_msbs = missing;
        block.num_passes = 3 * (planes - missing) - 2;
    }
}
