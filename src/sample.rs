//! Lines of transformed subband samples, as produced by the wavelet stage.

use crate::error::{Error, UnitResult};


/// The numeric representation of the samples in a subband line.
/// Chosen once per subband, see `SampleKind::select`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SampleKind {

    /// 16-bit samples. Reversible bands store integers,
    /// irreversible bands store fixed-point values with `FIXED_POINT_BITS` fractional bits.
    Short,

    /// 32-bit integer samples of a reversible band.
    Int,

    /// 32-bit float samples of an irreversible band.
    Float,
}

/// Number of fractional bits in the 16-bit fixed-point representation of irreversible samples.
pub const FIXED_POINT_BITS: u32 = 13;

impl SampleKind {

    /// The representation used for a band with the specified properties.
    pub fn select(use_shorts: bool, reversible: bool) -> Self {
        if use_shorts { SampleKind::Short }
        else if reversible { SampleKind::Int }
        else { SampleKind::Float }
    }

    /// Number of bytes per sample.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleKind::Short => 2,
            SampleKind::Int | SampleKind::Float => 4,
        }
    }
}


/// The samples of a single line, in one of the three representations.
#[derive(Clone, Debug, PartialEq)]
pub enum LineSamples {

    /// 16-bit integer or fixed-point samples.
    Short(Vec<i16>),

    /// 32-bit integer samples.
    Int(Vec<i32>),

    /// 32-bit float samples.
    Float(Vec<f32>),
}

impl LineSamples {

    /// A line of zeroes.
    pub fn zeroed(kind: SampleKind, len: usize) -> Self {
        match kind {
            SampleKind::Short => LineSamples::Short(vec![0; len]),
            SampleKind::Int => LineSamples::Int(vec![0; len]),
            SampleKind::Float => LineSamples::Float(vec![0.0; len]),
        }
    }

    /// The representation of these samples.
    pub fn kind(&self) -> SampleKind {
        match self {
            LineSamples::Short(_) => SampleKind::Short,
            LineSamples::Int(_) => SampleKind::Int,
            LineSamples::Float(_) => SampleKind::Float,
        }
    }

    /// Number of samples in this line.
    pub fn len(&self) -> usize {
        match self {
            LineSamples::Short(samples) => samples.len(),
            LineSamples::Int(samples) => samples.len(),
            LineSamples::Float(samples) => samples.len(),
        }
    }

    /// Whether this line has no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite `source.len()` samples of this line, starting at `offset`.
    pub(crate) fn copy_from(&mut self, offset: usize, source: &LineSamples) -> UnitResult {
        let end = offset + source.len();
        if end > self.len() {
            return Err(Error::invalid("line is wider than the subband"));
        }

        match (self, source) {
            (LineSamples::Short(target), LineSamples::Short(source)) => target[offset..end].copy_from_slice(source),
            (LineSamples::Int(target), LineSamples::Int(source)) => target[offset..end].copy_from_slice(source),
            (LineSamples::Float(target), LineSamples::Float(source)) => target[offset..end].copy_from_slice(source),
            _ => return Err(Error::invalid("line sample type does not match the subband")),
        }

        Ok(())
    }
}

impl From<Vec<i16>> for LineSamples { #[inline] fn from(samples: Vec<i16>) -> Self { LineSamples::Short(samples) } }
impl From<Vec<i32>> for LineSamples { #[inline] fn from(samples: Vec<i32>) -> Self { LineSamples::Int(samples) } }
impl From<Vec<f32>> for LineSamples { #[inline] fn from(samples: Vec<f32>) -> Self { LineSamples::Float(samples) } }


/// A line buffer handed to the encoder by the producer.
///
/// If the line is exchangeable, the encoder may swap its storage with one of its own
/// stripe lines instead of copying the samples. The buffer then contains
/// arbitrary samples of the same type and width after `push` returns.
#[derive(Clone, Debug, PartialEq)]
pub struct LineBuf {
    samples: LineSamples,
    exchangeable: bool,
}

impl LineBuf {

    /// A line that is always copied into the encoder.
    pub fn new(samples: impl Into<LineSamples>) -> Self {
        LineBuf { samples: samples.into(), exchangeable: false }
    }

    /// A line whose storage may be swapped with the encoder's storage.
    pub fn exchangeable(samples: impl Into<LineSamples>) -> Self {
        LineBuf { samples: samples.into(), exchangeable: true }
    }

    /// Whether the storage of this line may be swapped.
    pub fn is_exchangeable(&self) -> bool { self.exchangeable }

    /// The samples of this line.
    pub fn samples(&self) -> &LineSamples { &self.samples }

    /// The samples of this line, for refilling the buffer with the next row.
    pub fn samples_mut(&mut self) -> &mut LineSamples { &mut self.samples }

    /// Number of samples in this line.
    pub fn len(&self) -> usize { self.samples.len() }

    /// Whether this line has no samples.
    pub fn is_empty(&self) -> bool { self.samples.is_empty() }

    /// Move the samples into `target`, either by swapping the storage or by copying.
    /// Returns whether the storage was swapped.
    pub(crate) fn transfer_into(&mut self, target: &mut LineSamples, offset: usize) -> crate::error::Result<bool> {
        let can_swap = self.exchangeable && offset == 0
            && target.len() == self.samples.len()
            && target.kind() == self.samples.kind();

        if can_swap {
            std::mem::swap(target, &mut self.samples);
            Ok(true)
        }
        else {
            target.copy_from(offset, &self.samples)?;
            Ok(false)
        }
    }
}

impl From<LineSamples> for LineBuf {
    fn from(samples: LineSamples) -> Self { LineBuf::new(samples) }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_selection(){
        assert_eq!(SampleKind::select(true, false), SampleKind::Short);
        assert_eq!(SampleKind::select(true, true), SampleKind::Short);
        assert_eq!(SampleKind::select(false, true), SampleKind::Int);
        assert_eq!(SampleKind::select(false, false), SampleKind::Float);
    }

    #[test]
    fn copy_respects_offset(){
        let mut target = LineSamples::zeroed(SampleKind::Int, 6);
        let mut line = LineBuf::new(vec![1, 2, 3, 4]);

        assert!(!line.transfer_into(&mut target, 2).unwrap());
        assert_eq!(target, LineSamples::Int(vec![0, 0, 1, 2, 3, 4]));
        assert_eq!(line.samples(), &LineSamples::Int(vec![1, 2, 3, 4]));
    }

    #[test]
    fn exchange_swaps_storage(){
        let mut target = LineSamples::zeroed(SampleKind::Float, 3);
        let mut line = LineBuf::exchangeable(vec![0.5_f32, 1.5, 2.5]);

        assert!(line.transfer_into(&mut target, 0).unwrap());
        assert_eq!(target, LineSamples::Float(vec![0.5, 1.5, 2.5]));
        assert_eq!(line.samples(), &LineSamples::Float(vec![0.0; 3]));
    }

    #[test]
    fn exchange_falls_back_to_copy_when_misaligned(){
        let mut target = LineSamples::zeroed(SampleKind::Short, 4);
        let mut line = LineBuf::exchangeable(vec![7_i16, 8, 9]);

        assert!(!line.transfer_into(&mut target, 1).unwrap());
        assert_eq!(target, LineSamples::Short(vec![0, 7, 8, 9]));
    }

    #[test]
    fn mismatched_kind_is_rejected(){
        let mut target = LineSamples::zeroed(SampleKind::Short, 4);
        let mut line = LineBuf::new(vec![1_i32, 2]);
        assert!(line.transfer_into(&mut target, 0).is_err());

        let mut too_wide = LineBuf::new(vec![1_i16; 5]);
        assert!(too_wide.transfer_into(&mut target, 0).is_err());
    }
}
