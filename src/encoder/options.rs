//! Configuration of a subband encoder.

use crate::error::{Error, UnitResult};
use super::state::MAX_STRIPES;


/// How the quanta of a filled stripe are released while the next stripe is being pushed.
/// The constants only affect performance, never correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantumPacing {

    /// Release quanta progressively on lower-resolution bands with more than two stripes,
    /// spreading them evenly over the lines of the next stripe.
    Automatic,

    /// Release every quantum as soon as its stripe is filled.
    Disabled,

    /// Release one quantum per `lines_per_quantum` lines pushed into the next stripe.
    /// Releasing starts `scheduling_offset` lines before the next stripe would be full.
    Fixed {

        /// Lines pushed per released quantum. Must not be zero.
        lines_per_quantum: usize,

        /// Lines before the end of the next stripe at which the last quantum is released.
        scheduling_offset: i32,
    },
}

impl Default for QuantumPacing {
    fn default() -> Self { QuantumPacing::Automatic }
}


/// Specify how the encoder should work.
/// Use `EncoderOptions::default()` unless you have specific requirements.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderOptions {

    /// Store samples with 16 bits. Irreversible bands then use fixed-point samples.
    pub use_shorts: bool,

    /// Multiplies the quantization step size of irreversible bands.
    pub normalization: f32,

    /// Number of stripes to buffer when running on a worker runtime,
    /// overriding the automatic choice. Must be between 1 and 4.
    /// Never more stripes than block rows are used.
    pub stripes: Option<usize>,

    /// How quanta are released while lines are pushed.
    pub pacing: QuantumPacing,

    /// The producer will write one sample beyond the end of each line.
    pub line_will_be_extended: bool,

    /// Allow the lane-parallel quantizer on processors that support it.
    pub accelerated_quantization: bool,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        EncoderOptions {
            use_shorts: false,
            normalization: 1.0,
            stripes: None,
            pacing: QuantumPacing::Automatic,
            line_will_be_extended: false,
            accelerated_quantization: true,
        }
    }
}

impl EncoderOptions {

    /// Deterministic options for debugging: scalar quantization and no pacing.
    pub fn debug() -> Self {
        EncoderOptions {
            pacing: QuantumPacing::Disabled,
            accelerated_quantization: false,
            .. Self::default()
        }
    }

    /// Check the options for values that cannot work.
    pub fn validate(&self) -> UnitResult {
        if let Some(stripes) = self.stripes {
            if stripes == 0 || stripes > MAX_STRIPES {
                return Err(Error::invalid("number of stripes must be between 1 and 4"));
            }
        }

        if let QuantumPacing::Fixed { lines_per_quantum, scheduling_offset } = self.pacing {
            if lines_per_quantum == 0 {
                return Err(Error::invalid("lines per quantum must not be zero"));
            }

            // the last quantum must be released before the final line of the next stripe arrives
            if 1 - i64::from(scheduling_offset) >= lines_per_quantum as i64 {
                return Err(Error::invalid("quantum scheduling offset releases the last quantum too late"));
            }
        }

        if !(self.normalization > 0.0) {
            return Err(Error::invalid("normalization must be positive"));
        }

        Ok(())
    }
}
