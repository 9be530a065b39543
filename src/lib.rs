//! Per-pixel robust outlier rejection for astronomical image stacking.
//!
//! When many aligned exposures of the same sky region are combined
//! ("stacked"), each output pixel is computed from the set of intensity
//! samples contributed by every input frame at that location. Individual
//! samples can be contaminated by cosmic-ray hits, satellite trails,
//! residual misalignment, or hot/cold sensor artifacts. This crate decides,
//! per pixel location, which samples survive before the caller combines
//! them into the final value.
//!
//! # Module Organization
//!
//! - **stats**: order statistics, dispersion, and least-squares primitives
//! - **rejection**: the six rejection kernels, their dispatcher, and the
//!   run-wide low/high rejection totals
//! - **critical**: Student-t based critical values for the generalized
//!   extreme Studentized deviate test
//!
//! # Usage
//!
//! Build one [`RejectionEngine`] per worker thread (it owns mutable scratch
//! buffers), share one [`RejectionTotals`] across workers, and call
//! [`RejectionEngine::reject`] once per pixel location with that location's
//! sample stack. The first `N'` entries of the stack hold the survivors.

pub mod critical;
pub mod rejection;
pub mod stats;

pub use critical::{esd_critical_values, student_t_ppf, CriticalValueError};
pub use rejection::{
    RejectionAlgorithm, RejectionConfig, RejectionEngine, RejectionError, RejectionSemantics,
    RejectionTotals,
};
