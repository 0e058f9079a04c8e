
//! Parallel code-block encoding for a single wavelet subband.
//!
//! A producer pushes the lines of a subband into a `SubbandEncoder`, which collects them
//! in stripes of one code-block row each. As soon as a stripe is full and the resource provider
//! has made its code-blocks available, the encoder releases jobs to a `WorkerRuntime`.
//! Each job quantizes a run of code-blocks, applies region of interest adjustments,
//! and hands the blocks to the `BlockCoder`.
//!
//! All coordination between producer, workers and resource provider
//! happens through one atomic scheduling word, without any lock on the hot path.

#![forbid(unsafe_code)]
#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused_extern_crates,
    unused_must_use,
    missing_docs,
    missing_debug_implementations,
)]

pub mod error;
pub mod math;
pub mod sample;
pub mod block;
pub mod subband;
pub mod quantize;
pub mod runtime;
pub mod encoder;


/// Re-exports of all the types needed to drive an encoder.
pub mod prelude {

    // main exports
    pub use crate::encoder::{
        SubbandEncoder, EncoderContext, EncoderOptions, QuantumPacing,
        EncoderQueue, Completion, BlockNotifier,
    };

    // collaborators
    pub use crate::subband::{
        SubbandParameters, BlockRange, SubbandResources,
        DependencyMonitor, RoiSource, SharedRoi,
    };

    pub use crate::block::{BlockCoder, BlockGeometry, CodeBlock};
    pub use crate::runtime::{WorkerRuntime, ManualRuntime, Condition, JobBatch, Job, QueueId};

    #[cfg(feature = "rayon")]
    pub use crate::runtime::ThreadPoolRuntime;

    // secondary data types
    pub use crate::sample::{LineBuf, LineSamples, SampleKind};
    pub use crate::math::Vec2;
    pub use crate::error::{self, Error, Result, UnitResult};
}
