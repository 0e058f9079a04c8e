
//! Error type definitions.

use std::borrow::Cow;
use std::error;
use std::fmt;

/// A result that may contain an encoder error.
pub type Result<T> = std::result::Result<T, Error>;

/// A result that, if ok, contains nothing, and otherwise contains an encoder error.
pub type UnitResult = Result<()>;


/// An error that may happen while configuring or running a subband encoder.
/// Distinguishes between four types of errors:
/// aborted encoding, unsupported configurations, invalid input and failures reported by the block coder.
#[derive(Debug)]
pub enum Error {

    /// Encoding was terminated before every row of the subband was pushed.
    Aborted,

    /// The configuration is valid but cannot be represented with the available precision.
    NotSupported(Cow<'static, str>),

    /// The subband description or the pushed data is not valid.
    Invalid(Cow<'static, str>),

    /// The resource provider or the block coder reported a failure while a job was running.
    Coding(Cow<'static, str>),
}


impl Error {

    /// Create an error of the variant `Invalid`.
    pub(crate) fn invalid(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Invalid(message.into())
    }

    /// Create an error of the variant `NotSupported`.
    pub(crate) fn unsupported(message: impl Into<Cow<'static, str>>) -> Self {
        Error::NotSupported(message.into())
    }

    /// Create an error of the variant `Coding`.
    pub fn coding(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Coding(message.into())
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Aborted => write!(formatter, "encoding aborted before the subband was complete"),
            Error::NotSupported(message) => write!(formatter, "not supported: {}", message),
            Error::Invalid(message) => write!(formatter, "invalid: {}", message),
            Error::Coding(message) => write!(formatter, "block coding failed: {}", message),
        }
    }
}
