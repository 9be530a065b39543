//! Numeric primitives for per-stack robust statistics.
//!
//! These are the building blocks the rejection kernels consume: order
//! statistics, Bessel-corrected dispersion, a least-squares line fit, and
//! the extreme Studentized deviate statistic. All functions are pure and
//! operate on flat `f64` slices; the only allocation is the sort copy made
//! by [`median`].

/// Calculate the median of a slice of f64 values.
///
/// Sorts a copy of the input; for even-length data returns the average of
/// the two middle values. Callers on a hot path that already hold sorted
/// data should use [`median_sorted`] instead.
///
/// # Panics
///
/// Debug-asserts that `values` is non-empty; the rejection engine
/// guarantees this for every stack it processes.
pub fn median(values: &[f64]) -> f64 {
    debug_assert!(!values.is_empty(), "median of empty slice");

    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    median_sorted(&sorted)
}

/// Median of data already sorted in ascending order, without copying.
pub fn median_sorted(sorted: &[f64]) -> f64 {
    debug_assert!(!sorted.is_empty(), "median of empty slice");

    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Sample standard deviation (Bessel-corrected, divisor n-1).
///
/// Uses the two-pass formula, which stays numerically stable down to the
/// four-sample stacks the rejection floor permits. Returns 0.0 for fewer
/// than two values.
pub fn std_dev(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }

    let mean = values.iter().sum::<f64>() / n as f64;
    let sum_sq = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
    (sum_sq / (n - 1) as f64).sqrt()
}

/// Ordinary least-squares line fit, returning `(slope, intercept)`.
///
/// The rejection engine calls this with `x` as the rank index of an
/// ascending-sorted stack, so the fit models the ordered distribution of
/// samples rather than a time series. A degenerate denominator (all `x`
/// identical) yields a flat line through the mean of `y`.
///
/// # Panics
///
/// Debug-asserts that `x` and `y` have the same non-zero length.
pub fn linear_fit(x: &[f64], y: &[f64]) -> (f64, f64) {
    debug_assert_eq!(x.len(), y.len(), "linear_fit input length mismatch");
    debug_assert!(!x.is_empty(), "linear_fit of empty slices");

    let n = x.len() as f64;
    let sum_x = x.iter().sum::<f64>();
    let sum_y = y.iter().sum::<f64>();
    let sum_xx = x.iter().map(|v| v * v).sum::<f64>();
    let sum_xy = x.iter().zip(y).map(|(a, b)| a * b).sum::<f64>();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom == 0.0 {
        return (0.0, sum_y / n);
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    (slope, intercept)
}

/// Largest standardized deviation from the mean of an ascending-sorted
/// slice, returning `(G, index)`.
///
/// Because the data is sorted, only the two end elements can be the
/// extreme; `index` is therefore either 0 or `sorted.len() - 1`. Ties break
/// toward the high end. Zero dispersion yields `G = 0.0` with the high
/// index, so a perfectly flat window never produces a spurious extreme.
pub fn max_standardized_deviation(sorted: &[f64]) -> (f64, usize) {
    debug_assert!(!sorted.is_empty(), "deviation of empty slice");

    let n = sorted.len();
    let mean = sorted.iter().sum::<f64>() / n as f64;
    let sd = std_dev(sorted);

    let dev_low = mean - sorted[0];
    let dev_high = sorted[n - 1] - mean;

    if sd == 0.0 {
        return (0.0, n - 1);
    }

    if dev_high >= dev_low {
        (dev_high / sd, n - 1)
    } else {
        (dev_low / sd, 0)
    }
}
