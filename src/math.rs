//! Sizes, block indices and integer rounding.

/// A pair of columns and rows.
/// Used for band sizes, block sizes and absolute block indices.
/// The first component is horizontal, the second vertical.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Vec2<T> (pub T, pub T);

impl<T> Vec2<T> {

    /// Number of samples (or blocks) covered, seeing this vector as a size.
    pub fn area(self) -> T where T: std::ops::Mul<T, Output = T> {
        self.0 * self.1
    }

    /// Swap columns and rows, as a transposed code-block does.
    pub fn transposed(self) -> Self {
        Vec2(self.1, self.0)
    }

    /// The columns.
    pub fn width(self) -> T { self.0 }

    /// The rows.
    pub fn height(self) -> T { self.1 }
}

impl<T: std::ops::Sub<T>> std::ops::Sub<Vec2<T>> for Vec2<T> {
    type Output = Vec2<T::Output>;
    fn sub(self, other: Vec2<T>) -> Self::Output {
        Vec2(self.0 - other.0, self.1 - other.1)
    }
}


/// Whether an integer division rounds towards zero or away from it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RoundingMode {

    /// Truncate.
    Down,

    /// Count a partial remainder as one more.
    Up,
}

impl RoundingMode {

    /// Divide two unsigned values. The divisor must not be zero.
    pub(crate) fn divide(self, dividend: usize, divisor: usize) -> usize {
        match self {
            RoundingMode::Up => (dividend + divisor - 1) / divisor,
            RoundingMode::Down => dividend / divisor,
        }
    }

    /// Round `value` to a multiple of `multiple`, for example a stripe height to whole sample quads.
    pub(crate) fn to_multiple(self, value: usize, multiple: usize) -> usize {
        self.divide(value, multiple) * multiple
    }
}
