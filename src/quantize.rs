//! Quantize subband samples into the sign-magnitude representation of the block coder.
//!
//! Two implementations exist: a scalar one that handles every block geometry,
//! and a lane-parallel one that processes eight samples at a time
//! but only supports blocks without flipping or transposition.
//! Both produce identical output.

use smallvec::SmallVec;

use crate::block::{BlockGeometry, MAGNITUDE_MASK, SIGN_BIT};
use crate::error::{Error, Result};
use crate::math::Vec2;
use crate::sample::{LineSamples, SampleKind, FIXED_POINT_BITS};


/// How a sample value is converted to a sign-magnitude value whose
/// most significant magnitude bit-plane is bit 30.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SampleMapping {

    /// Integer samples are shifted up by `upshift` bits.
    Reversible { upshift: u32 },

    /// 16-bit fixed-point samples are multiplied by an integer scale.
    FixedPoint { scale: i64 },

    /// Float samples are multiplied by a float scale and truncated.
    Float { scale: f32 },
}

impl SampleMapping {

    /// Compute the mapping for a band. Fails if the band needs more bit-planes
    /// than the sample representation can hold.
    pub fn new(kind: SampleKind, reversible: bool, max_bit_planes: u32, step_size: f32) -> Result<Self> {
        if reversible {
            let available = match kind {
                SampleKind::Short => 15,
                SampleKind::Int => 31,
                SampleKind::Float => return Err(Error::invalid("reversible band with float samples")),
            };

            if max_bit_planes > available {
                return Err(Error::unsupported(
                    "insufficient implementation precision for reversible compression of this band"
                ));
            }

            return Ok(SampleMapping::Reversible { upshift: 31 - max_bit_planes });
        }

        // negative exponents divide, for bands with more than 31 bit-planes
        let range_scale = 2_f64.powi(31 - max_bit_planes as i32);

        match kind {
            SampleKind::Short => {
                // any larger scale saturates every nonzero sample anyway
                let scale = range_scale / (f64::from(step_size) * f64::from(1_u32 << FIXED_POINT_BITS));
                let scale = ((scale + 0.5) as i64).min(i64::from(MAGNITUDE_MASK));
                Ok(SampleMapping::FixedPoint { scale })
            },

            SampleKind::Float => {
                let scale = (1.0 / f64::from(step_size)) * range_scale;
                Ok(SampleMapping::Float { scale: scale as f32 })
            },

            SampleKind::Int => Err(Error::invalid("irreversible band with integer samples")),
        }
    }

    /// The sample representation this mapping accepts.
    pub fn accepts(self, kind: SampleKind) -> bool {
        match self {
            SampleMapping::Reversible { .. } => kind == SampleKind::Short || kind == SampleKind::Int,
            SampleMapping::FixedPoint { .. } => kind == SampleKind::Short,
            SampleMapping::Float { .. } => kind == SampleKind::Float,
        }
    }
}

#[inline]
fn sign_magnitude(negative: bool, magnitude: u32) -> u32 {
    if negative { magnitude | SIGN_BIT } else { magnitude }
}

#[inline]
fn shift_integer(value: i32, upshift: u32) -> u32 {
    sign_magnitude(value < 0, (value.unsigned_abs() << upshift) & MAGNITUDE_MASK)
}

#[inline]
fn scale_fixed_point(value: i16, scale: i64) -> u32 {
    let scaled = i64::from(value).saturating_mul(scale);
    let magnitude = scaled.unsigned_abs().min(u64::from(MAGNITUDE_MASK)) as u32;
    sign_magnitude(scaled < 0, magnitude)
}

#[inline]
fn scale_float(value: f32, scale: f32) -> u32 {
    let scaled = value * scale;
    if scaled < 0.0 { sign_magnitude(true, ((-scaled) as u32).min(MAGNITUDE_MASK)) }
    else { (scaled as u32).min(MAGNITUDE_MASK) }
}


/// The region of a stripe that is copied into one code-block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Transfer {

    /// Index of the first sample column within each line.
    pub offset: usize,

    /// Columns and rows to read from the stripe.
    pub size: Vec2<usize>,

    /// Distance between two rows in the block buffer.
    pub row_gap: usize,

    /// Orientation of the block.
    pub geometry: BlockGeometry,
}


/// Converts the lines of a stripe into block samples.
pub trait Quantizer: Send + Sync + std::fmt::Debug {

    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Write the quantized samples of the region into `target`.
    /// Returns the bitwise or of all written samples.
    fn quantize(&self, mapping: SampleMapping, lines: &[LineSamples], transfer: &Transfer, target: &mut [u32]) -> Result<u32>;
}


/// Processes the rows of a region for one concrete sample type.
trait Kernel {
    fn run<T: Copy>(&self, rows: &[&[T]], map: impl Fn(T) -> u32 + Copy, transfer: &Transfer, target: &mut [u32]) -> u32;
}

type Rows<'l, T> = SmallVec<[&'l [T]; 64]>;

fn rows<'l, T>(lines: &'l [LineSamples], extract: impl Fn(&'l LineSamples) -> Option<&'l [T]>) -> Result<Rows<'l, T>> {
    lines.iter()
        .map(|line| extract(line).ok_or_else(|| Error::invalid("stripe lines have mixed sample types")))
        .collect()
}

fn dispatch(kernel: &impl Kernel, mapping: SampleMapping, lines: &[LineSamples], transfer: &Transfer, target: &mut [u32]) -> Result<u32> {
    let Vec2(width, height) = transfer.size;
    if width == 0 || height == 0 { return Ok(0); }

    let lines = lines.get(.. height)
        .ok_or_else(|| Error::invalid("code-block is taller than the stripe"))?;

    if lines.iter().any(|line| line.len() < transfer.offset + width) {
        return Err(Error::invalid("code-block extends beyond the subband line"));
    }

    let extent = if transfer.geometry.transpose { (width - 1) * transfer.row_gap + height }
        else { (height - 1) * transfer.row_gap + width };

    if target.len() < extent {
        return Err(Error::invalid("code-block buffer too small"));
    }

    let kind = lines[0].kind();
    if !mapping.accepts(kind) {
        return Err(Error::invalid("sample type does not match the quantization mode"));
    }

    let or_value = match mapping {
        SampleMapping::Reversible { upshift } => match kind {
            SampleKind::Short => {
                let rows = rows(lines, |line| match line { LineSamples::Short(samples) => Some(samples.as_slice()), _ => None })?;
                kernel.run(&rows, move |value: i16| shift_integer(i32::from(value), upshift), transfer, target)
            },

            _ => {
                let rows = rows(lines, |line| match line { LineSamples::Int(samples) => Some(samples.as_slice()), _ => None })?;
                kernel.run(&rows, move |value: i32| shift_integer(value, upshift), transfer, target)
            },
        },

        SampleMapping::FixedPoint { scale } => {
            let rows = rows(lines, |line| match line { LineSamples::Short(samples) => Some(samples.as_slice()), _ => None })?;
            kernel.run(&rows, move |value: i16| scale_fixed_point(value, scale), transfer, target)
        },

        SampleMapping::Float { scale } => {
            let rows = rows(lines, |line| match line { LineSamples::Float(samples) => Some(samples.as_slice()), _ => None })?;
            kernel.run(&rows, move |value: f32| scale_float(value, scale), transfer, target)
        },
    };

    Ok(or_value)
}


/// Quantizes one sample at a time. Supports all block geometries.
#[derive(Copy, Clone, Debug, Default)]
pub struct ScalarQuantizer;

impl Kernel for ScalarQuantizer {
    fn run<T: Copy>(&self, rows: &[&[T]], map: impl Fn(T) -> u32 + Copy, transfer: &Transfer, target: &mut [u32]) -> u32 {
        let Vec2(width, height) = transfer.size;
        let BlockGeometry { transpose, vflip, hflip } = transfer.geometry;
        let mut or_value = 0;

        for m in 0 .. height {
            let row = rows[if vflip { height - 1 - m } else { m }];
            let source = &row[transfer.offset .. transfer.offset + width];

            for n in 0 .. width {
                let value = map(source[if hflip { width - 1 - n } else { n }]);
                let index = if transpose { n * transfer.row_gap + m } else { m * transfer.row_gap + n };
                target[index] = value;
                or_value |= value;
            }
        }

        or_value
    }
}

impl Quantizer for ScalarQuantizer {
    fn name(&self) -> &'static str { "scalar" }

    fn quantize(&self, mapping: SampleMapping, lines: &[LineSamples], transfer: &Transfer, target: &mut [u32]) -> Result<u32> {
        dispatch(self, mapping, lines, transfer, target)
    }
}


/// Number of samples processed together by the `LaneQuantizer`.
pub const LANES: usize = 8;

/// Quantizes eight samples at a time, which the compiler maps to vector instructions.
/// Blocks that need flipping or transposition are delegated to the scalar implementation.
#[derive(Copy, Clone, Debug, Default)]
pub struct LaneQuantizer;

impl Kernel for LaneQuantizer {
    fn run<T: Copy>(&self, rows: &[&[T]], map: impl Fn(T) -> u32 + Copy, transfer: &Transfer, target: &mut [u32]) -> u32 {
        if !transfer.geometry.is_identity() {
            return ScalarQuantizer.run(rows, map, transfer, target);
        }

        let Vec2(width, height) = transfer.size;
        let mut lanes = [0_u32; LANES];
        let mut or_value = 0;

        for (m, row) in rows[.. height].iter().enumerate() {
            let source = &row[transfer.offset .. transfer.offset + width];
            let start = m * transfer.row_gap;
            let destination = &mut target[start .. start + width];

            let mut source_chunks = source.chunks_exact(LANES);
            let mut destination_chunks = destination.chunks_exact_mut(LANES);

            for (source, destination) in (&mut source_chunks).zip(&mut destination_chunks) {
                let mut values = [0_u32; LANES];
                for lane in 0 .. LANES { values[lane] = map(source[lane]); }
                for lane in 0 .. LANES { lanes[lane] |= values[lane]; }
                destination.copy_from_slice(&values);
            }

            for (&sample, destination) in source_chunks.remainder().iter().zip(destination_chunks.into_remainder()) {
                *destination = map(sample);
                or_value |= *destination;
            }
        }

        lanes.iter().fold(or_value, |or_value, lane| or_value | lane)
    }
}

impl Quantizer for LaneQuantizer {
    fn name(&self) -> &'static str { "lanes" }

    fn quantize(&self, mapping: SampleMapping, lines: &[LineSamples], transfer: &Transfer, target: &mut [u32]) -> Result<u32> {
        dispatch(self, mapping, lines, transfer, target)
    }
}


/// Whether the processor has vector units wide enough for the lane implementation.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn lanes_available() -> bool { is_x86_feature_detected!("sse2") }

/// Whether the processor has vector units wide enough for the lane implementation.
#[cfg(target_arch = "aarch64")]
pub fn lanes_available() -> bool { std::arch::is_aarch64_feature_detected!("neon") }

/// Whether the processor has vector units wide enough for the lane implementation.
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
pub fn lanes_available() -> bool { false }


/// Choose the quantizer for a subband. The lane implementation is only used
/// if allowed, supported by the processor, and useful for the block geometry.
pub fn select(allow_lanes: bool, geometry: BlockGeometry) -> Box<dyn Quantizer> {
    if allow_lanes && geometry.is_identity() && lanes_available() {
        Box::new(LaneQuantizer)
    }
    else {
        Box::new(ScalarQuantizer)
    }
}
