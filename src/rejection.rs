//! Per-pixel outlier rejection kernels and their dispatcher.
//!
//! For one pixel location, the stacking loop hands this module the vector
//! of intensity samples contributed by every aligned input frame. The
//! selected kernel classifies contaminated samples (cosmic-ray hits,
//! satellite trails, hot/cold pixels, residual misalignment) and either
//! removes them by compacting the stack in place or, for the
//! median-replacement strategy, overwrites them. The surviving count is
//! returned; run-wide low/high rejection totals accumulate in a shared
//! [`RejectionTotals`].
//!
//! # Strategies
//!
//! - **Percentile**: single pass, relative deviation from the median
//! - **Sigma clip**: iterative deviation-from-median test against the
//!   sample standard deviation
//! - **Median sigma clip**: same test, rejected samples replaced with the
//!   current median instead of removed
//! - **Winsorized sigma clip**: dispersion estimated from a Winsorized
//!   working copy before the clip test
//! - **Linear fit clip**: residuals against a line fitted to the ordered
//!   distribution
//! - **Generalized ESD**: multi-outlier extreme Studentized deviate test
//!   against precomputed critical values
//!
//! # Concurrency
//!
//! [`RejectionEngine`] owns mutable scratch buffers and must not be shared
//! across threads; build one per worker. [`RejectionTotals`] is atomic and
//! is the one object meant to be shared.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::critical::{self, CriticalValueError};
use crate::stats;

/// Iterative strategies never reject below this many remaining samples.
const REJECTION_FLOOR: usize = 4;

/// Half-width of the Winsorizing clamp, in sigmas.
const WINSOR_CLAMP_SIGMA: f64 = 1.5;

/// Bias correction applied to the standard deviation of Winsorized data.
const WINSOR_SIGMA_CORRECTION: f64 = 1.134;

/// Relative change in sigma below which the Winsorizing loop has converged.
const WINSOR_CONVERGENCE: f64 = 0.0005;

/// Which of the rejection strategies to run at each pixel location.
///
/// The `low`/`high` thresholds in [`RejectionConfig`] are interpreted per
/// strategy: fractional deviations for `Percentile`, sigma multipliers for
/// the clipping strategies, and for `Gesdt` the pair (max outlier fraction,
/// significance level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionAlgorithm {
    /// Keep every sample.
    NoRejection,
    /// Single-pass relative deviation from the median.
    Percentile,
    /// Iterative sigma clipping against the median.
    SigmaClip,
    /// Sigma clipping that replaces rejected samples with the current
    /// median instead of removing them.
    SigmaClipMedian,
    /// Sigma clipping with a Winsorized dispersion estimate.
    Winsorized,
    /// Residual clipping against a line fitted to the sorted stack.
    LinearFit,
    /// Generalized extreme Studentized deviate test.
    Gesdt,
}

/// How a strategy edits the stack, which the downstream weighting stage
/// must distinguish: a compacting strategy returns a true kept-count over
/// the first N' slots, while the replacement strategy always returns the
/// full frame count with rejected entries overwritten in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionSemantics {
    /// Rejected samples are removed and survivors compacted to the front.
    Removal,
    /// Rejected samples are overwritten with the current median; the
    /// sample count never changes.
    Replacement,
}

impl RejectionAlgorithm {
    /// The rejection semantics the combination stage must apply to this
    /// strategy's output.
    pub fn semantics(self) -> RejectionSemantics {
        match self {
            RejectionAlgorithm::SigmaClipMedian => RejectionSemantics::Replacement,
            _ => RejectionSemantics::Removal,
        }
    }
}

/// Rejection strategy selection plus its two strategy-specific thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RejectionConfig {
    pub algorithm: RejectionAlgorithm,
    /// Low-side threshold: fractional deviation (percentile), sigma
    /// multiplier (clipping), or max outlier fraction (GESDT).
    pub low: f64,
    /// High-side threshold: fractional deviation, sigma multiplier, or
    /// GESDT significance level.
    pub high: f64,
}

impl RejectionConfig {
    pub fn new(algorithm: RejectionAlgorithm, low: f64, high: f64) -> Self {
        Self {
            algorithm,
            low,
            high,
        }
    }
}

impl Default for RejectionConfig {
    fn default() -> Self {
        Self::new(RejectionAlgorithm::SigmaClip, 3.0, 3.0)
    }
}

/// Errors detected when building a [`RejectionEngine`].
///
/// The per-pixel path itself never fails; a pixel that cannot be processed
/// reports zero kept samples instead.
#[derive(Debug, Error)]
pub enum RejectionError {
    #[error("rejection requires at least one frame")]
    NoFrames,
    #[error("{which} threshold {value} must be finite and non-negative")]
    InvalidThreshold { which: &'static str, value: f64 },
    #[error(transparent)]
    CriticalValue(#[from] CriticalValueError),
}

/// Running totals of low-side and high-side rejections across one stacking
/// run.
///
/// The counters are the only state shared between workers; increments are
/// atomic, each engine call publishes its per-pixel counts exactly once,
/// and a call that declines to process a degenerate pixel publishes
/// nothing. Reset when a new run begins, read once at run completion for
/// the "N samples rejected low / high" report.
#[derive(Debug, Default)]
pub struct RejectionTotals {
    low: AtomicU64,
    high: AtomicU64,
}

impl RejectionTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one call's classification counts to the run totals.
    pub fn add(&self, low: u64, high: u64) {
        if low > 0 {
            self.low.fetch_add(low, Ordering::Relaxed);
        }
        if high > 0 {
            self.high.fetch_add(high, Ordering::Relaxed);
        }
    }

    /// Samples rejected below the local estimate so far this run.
    pub fn low(&self) -> u64 {
        self.low.load(Ordering::Relaxed)
    }

    /// Samples rejected above the local estimate so far this run.
    pub fn high(&self) -> u64 {
        self.high.load(Ordering::Relaxed)
    }

    /// Clear both totals at the start of a new stacking run.
    pub fn reset(&self) {
        self.low.store(0, Ordering::Relaxed);
        self.high.store(0, Ordering::Relaxed);
    }
}

/// One extreme recorded during GESDT candidate generation.
#[derive(Debug, Clone, Copy)]
struct EsdCandidate {
    value: f64,
    /// Whether the candidate came off the low end of the sorted window.
    from_low: bool,
    /// Whether its statistic exceeded the iteration's critical value.
    significant: bool,
}

/// Per-worker rejection dispatcher.
///
/// Owns the scratch buffers the kernels mutate destructively, sized once
/// for the run's frame count, so the per-pixel path performs no
/// allocation. One engine serves one worker thread; the stack slice passed
/// to [`reject`](Self::reject) is borrowed exclusively for the duration of
/// the call and edited in place.
pub struct RejectionEngine {
    config: RejectionConfig,
    nb_frames: usize,
    /// Sort buffer for median computation.
    sort_buf: Vec<f64>,
    /// Working copy clamped by the Winsorizing inner loop.
    winsor_buf: Vec<f64>,
    /// Rank abscissa for the line-fit kernel.
    fit_x: Vec<f64>,
    /// Extremes recorded by GESDT candidate generation.
    candidates: Vec<EsdCandidate>,
    /// Precomputed GESDT critical values, one per candidate iteration.
    critical: Vec<f64>,
}

impl RejectionEngine {
    /// Build an engine for stacks of `nb_frames` samples.
    ///
    /// Validates the thresholds, allocates exactly the scratch buffers the
    /// selected strategy needs, and for GESDT precomputes the critical
    /// value table for a candidate budget of
    /// `min(floor(nb_frames * low), nb_frames - 3)`.
    pub fn new(config: RejectionConfig, nb_frames: usize) -> Result<Self, RejectionError> {
        if nb_frames == 0 {
            return Err(RejectionError::NoFrames);
        }
        for (which, value) in [("low", config.low), ("high", config.high)] {
            if !value.is_finite() || value < 0.0 {
                return Err(RejectionError::InvalidThreshold { which, value });
            }
        }

        let mut engine = Self {
            config,
            nb_frames,
            sort_buf: Vec::new(),
            winsor_buf: Vec::new(),
            fit_x: Vec::new(),
            candidates: Vec::new(),
            critical: Vec::new(),
        };

        match config.algorithm {
            RejectionAlgorithm::NoRejection => {}
            RejectionAlgorithm::Percentile
            | RejectionAlgorithm::SigmaClip
            | RejectionAlgorithm::SigmaClipMedian => {
                engine.sort_buf = Vec::with_capacity(nb_frames);
            }
            RejectionAlgorithm::Winsorized => {
                engine.sort_buf = Vec::with_capacity(nb_frames);
                engine.winsor_buf = Vec::with_capacity(nb_frames);
            }
            RejectionAlgorithm::LinearFit => {
                engine.fit_x = (0..nb_frames).map(|i| i as f64).collect();
            }
            RejectionAlgorithm::Gesdt => {
                let budget =
                    ((nb_frames as f64 * config.low) as usize).min(nb_frames.saturating_sub(3));
                if budget > 0 {
                    engine.critical =
                        critical::esd_critical_values(nb_frames, budget, config.high)?;
                }
                engine.candidates = Vec::with_capacity(budget);
            }
        }

        debug!(
            algorithm = ?config.algorithm,
            nb_frames,
            low = config.low,
            high = config.high,
            "initialized rejection engine"
        );
        Ok(engine)
    }

    /// The configuration this engine was built with.
    pub fn config(&self) -> &RejectionConfig {
        &self.config
    }

    /// Run the configured strategy over one pixel location's sample stack.
    ///
    /// Returns the surviving count N'. For compacting strategies the first
    /// N' entries of `stack` are the survivors (possibly reordered); for
    /// the replacement strategy N' always equals the frame count. A
    /// degenerate stack (zero median where the strategy divides or scales
    /// by it) yields 0 with the totals untouched.
    ///
    /// # Panics
    ///
    /// Panics if `stack.len()` differs from the frame count the engine was
    /// built for.
    pub fn reject(&mut self, stack: &mut [f64], totals: &RejectionTotals) -> usize {
        assert_eq!(
            stack.len(),
            self.nb_frames,
            "stack length must match the engine's frame count"
        );

        let mut low = 0u64;
        let mut high = 0u64;
        let kept = match self.config.algorithm {
            RejectionAlgorithm::NoRejection => stack.len(),
            RejectionAlgorithm::Percentile => self.percentile_clip(stack, &mut low, &mut high),
            RejectionAlgorithm::SigmaClip => self.sigma_clip(stack, &mut low, &mut high),
            RejectionAlgorithm::SigmaClipMedian => {
                self.sigma_clip_median(stack, &mut low, &mut high)
            }
            RejectionAlgorithm::Winsorized => self.winsorized_clip(stack, &mut low, &mut high),
            RejectionAlgorithm::LinearFit => self.linear_fit_clip(stack, &mut low, &mut high),
            RejectionAlgorithm::Gesdt => self.esd_clip(stack, &mut low, &mut high),
        };

        totals.add(low, high);
        kept
    }

    /// Median of `values` computed through the engine's sort buffer.
    fn median_of(&mut self, values: &[f64]) -> f64 {
        self.sort_buf.clear();
        self.sort_buf.extend_from_slice(values);
        self.sort_buf.sort_unstable_by(f64::total_cmp);
        stats::median_sorted(&self.sort_buf)
    }

    /// One compacting clip pass: keep samples within `low`/`high` sigma of
    /// the median, write survivors to the front of `stack[..n]`, and stop
    /// rejecting once only [`REJECTION_FLOOR`] samples would remain.
    fn deviation_pass(
        stack: &mut [f64],
        n: usize,
        median: f64,
        sigma: f64,
        low: f64,
        high: f64,
        low_count: &mut u64,
        high_count: &mut u64,
    ) -> usize {
        let mut kept = 0;
        let mut rejected = 0;
        for i in 0..n {
            let x = stack[i];
            if n - rejected <= REJECTION_FLOOR {
                stack[kept] = x;
                kept += 1;
                continue;
            }
            if median - x > low * sigma {
                rejected += 1;
                *low_count += 1;
            } else if x - median > high * sigma {
                rejected += 1;
                *high_count += 1;
            } else {
                stack[kept] = x;
                kept += 1;
            }
        }
        kept
    }

    /// Single-pass rejection on relative deviation from the median.
    fn percentile_clip(&mut self, stack: &mut [f64], low_count: &mut u64, high_count: &mut u64) -> usize {
        let n = stack.len();
        let median = self.median_of(stack);
        if median == 0.0 {
            return 0;
        }

        let (low, high) = (self.config.low, self.config.high);
        let mut kept = 0;
        for i in 0..n {
            let x = stack[i];
            if (median - x) / median > low {
                *low_count += 1;
            } else if (x - median) / median > high {
                *high_count += 1;
            } else {
                stack[kept] = x;
                kept += 1;
            }
        }
        kept
    }

    /// Iterative sigma clipping with compaction.
    fn sigma_clip(&mut self, stack: &mut [f64], low_count: &mut u64, high_count: &mut u64) -> usize {
        let (low, high) = (self.config.low, self.config.high);
        let mut n = stack.len();
        let mut median = self.median_of(&stack[..n]);
        if median == 0.0 {
            return 0;
        }

        loop {
            let sigma = stats::std_dev(&stack[..n]);
            let kept =
                Self::deviation_pass(stack, n, median, sigma, low, high, low_count, high_count);
            let changed = kept != n;
            n = kept;
            if !changed || n <= 3 {
                break;
            }
            median = self.median_of(&stack[..n]);
        }
        n
    }

    /// Sigma clipping that overwrites rejected samples with the current
    /// median; the stack length never changes.
    fn sigma_clip_median(
        &mut self,
        stack: &mut [f64],
        low_count: &mut u64,
        high_count: &mut u64,
    ) -> usize {
        let (low, high) = (self.config.low, self.config.high);
        let n = stack.len();
        loop {
            let sigma = stats::std_dev(stack);
            let median = self.median_of(stack);
            let mut changed = false;
            for x in stack.iter_mut() {
                if median - *x > low * sigma {
                    *x = median;
                    *low_count += 1;
                    changed = true;
                } else if *x - median > high * sigma {
                    *x = median;
                    *high_count += 1;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        n
    }

    /// Sigma clipping with the dispersion estimated from a Winsorized
    /// working copy.
    ///
    /// The inner loop clamps the copy to median ± 1.5σ, re-estimates the
    /// median and the bias-corrected sigma from the clamped data, and
    /// repeats until sigma moves by less than 0.05% between iterations. A
    /// previous sigma of exactly zero (perfectly flat working set) is
    /// treated as already converged. The clip test then runs against the
    /// original, non-clamped values.
    fn winsorized_clip(
        &mut self,
        stack: &mut [f64],
        low_count: &mut u64,
        high_count: &mut u64,
    ) -> usize {
        let (low, high) = (self.config.low, self.config.high);
        let mut n = stack.len();
        loop {
            let mut sigma = stats::std_dev(&stack[..n]);
            let mut median = self.median_of(&stack[..n]);
            self.winsor_buf.clear();
            self.winsor_buf.extend_from_slice(&stack[..n]);

            loop {
                let sigma0 = sigma;
                let lo_bound = median - WINSOR_CLAMP_SIGMA * sigma;
                let hi_bound = median + WINSOR_CLAMP_SIGMA * sigma;
                for w in &mut self.winsor_buf {
                    *w = w.clamp(lo_bound, hi_bound);
                }

                self.sort_buf.clear();
                self.sort_buf.extend_from_slice(&self.winsor_buf);
                self.sort_buf.sort_unstable_by(f64::total_cmp);
                median = stats::median_sorted(&self.sort_buf);
                sigma = WINSOR_SIGMA_CORRECTION * stats::std_dev(&self.winsor_buf);

                if sigma0 == 0.0 || ((sigma - sigma0) / sigma0).abs() < WINSOR_CONVERGENCE {
                    break;
                }
            }

            let kept =
                Self::deviation_pass(stack, n, median, sigma, low, high, low_count, high_count);
            let changed = kept != n;
            n = kept;
            if !changed || n <= 3 {
                break;
            }
        }
        n
    }

    /// Residual clipping against a least-squares line fitted to the
    /// ascending-sorted stack, with the mean absolute residual as the
    /// dispersion estimate. Re-sorts and re-fits on the reduced set each
    /// iteration.
    fn linear_fit_clip(
        &mut self,
        stack: &mut [f64],
        low_count: &mut u64,
        high_count: &mut u64,
    ) -> usize {
        let (low, high) = (self.config.low, self.config.high);
        let mut n = stack.len();
        loop {
            stack[..n].sort_unstable_by(f64::total_cmp);
            let (slope, intercept) = stats::linear_fit(&self.fit_x[..n], &stack[..n]);

            let mut dispersion = 0.0;
            for (i, &x) in stack[..n].iter().enumerate() {
                dispersion += (x - (slope * i as f64 + intercept)).abs();
            }
            dispersion /= n as f64;

            let mut kept = 0;
            let mut rejected = 0;
            for i in 0..n {
                let x = stack[i];
                if n - rejected <= REJECTION_FLOOR {
                    stack[kept] = x;
                    kept += 1;
                    continue;
                }
                let predicted = slope * i as f64 + intercept;
                if predicted - x > low * dispersion {
                    rejected += 1;
                    *low_count += 1;
                } else if x - predicted > high * dispersion {
                    rejected += 1;
                    *high_count += 1;
                } else {
                    stack[kept] = x;
                    kept += 1;
                }
            }

            let changed = kept != n;
            n = kept;
            if !changed || n <= 3 {
                break;
            }
        }
        n
    }

    /// Generalized extreme Studentized deviate test.
    ///
    /// Phase 1 sorts the stack, fixes the median, and for up to the
    /// precomputed budget strips the most extreme remaining sample off one
    /// end of the shrinking window, recording its statistic against the
    /// iteration's critical value. Phase 2 confirms every candidate up to
    /// and including the last significant one; confirmed candidates are
    /// classified cold or hot against the phase-1 median and removed.
    fn esd_clip(&mut self, stack: &mut [f64], low_count: &mut u64, high_count: &mut u64) -> usize {
        let n = stack.len();
        stack.sort_unstable_by(f64::total_cmp);

        let budget = self.critical.len();
        if budget == 0 {
            return n;
        }
        let median = stats::median_sorted(stack);

        self.candidates.clear();
        let mut win_lo = 0;
        let mut win_hi = n;
        for iter in 0..budget {
            let window = &stack[win_lo..win_hi];
            let (g, index) = stats::max_standardized_deviation(window);
            if g == 0.0 {
                // Flat window, no extremes left worth testing.
                break;
            }
            let from_low = index == 0;
            let value = window[index];
            if from_low {
                win_lo += 1;
            } else {
                win_hi -= 1;
            }
            self.candidates.push(EsdCandidate {
                value,
                from_low,
                significant: g > self.critical[iter],
            });
        }

        // The last significant candidate confirms itself and every earlier
        // one, including those whose own statistic fell short.
        let confirmed = self
            .candidates
            .iter()
            .rposition(|c| c.significant)
            .map_or(0, |i| i + 1);
        trace!(
            generated = self.candidates.len(),
            confirmed,
            "esd candidate confirmation"
        );
        if confirmed == 0 {
            return n;
        }

        let mut removed_low = 0;
        for c in &self.candidates[..confirmed] {
            if c.value > median {
                *high_count += 1;
            } else {
                *low_count += 1;
            }
            if c.from_low {
                removed_low += 1;
            }
        }
        let removed_high = confirmed - removed_low;

        stack.copy_within(removed_low..n - removed_high, 0);
        n - confirmed
    }
}
