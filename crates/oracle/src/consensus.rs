//! Consensus over node feeds.
//!
//! The consensus value is the linear-interpolated median of the submitted
//! feeds, computed in exact integer arithmetic: a quantile at `num/den` of
//! a sorted list lands at fractional index `num * (n - 1) / den`, and the
//! interpolated value is kept as an exact fraction until the final
//! half-to-even rounding. No floating point anywhere.
//!
//! Outlier fencing uses the interquartile range when enough feeds are
//! present; below the applicability threshold, or when the fence collapses,
//! a per-mille divergence band around the median takes over.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use feedline_core::NodeId;

/// Minimum feed count for the IQR fence to be meaningful.
pub const IQR_APPLICABILITY_THRESHOLD: usize = 4;

/// Rounds `num / den` half to even. `den` must be positive.
fn round_half_even(num: i128, den: i128) -> i128 {
    debug_assert!(den > 0);
    let floor = num.div_euclid(den);
    let rem = num.rem_euclid(den);
    match (2 * rem).cmp(&den) {
        std::cmp::Ordering::Less => floor,
        std::cmp::Ordering::Greater => floor + 1,
        std::cmp::Ordering::Equal => {
            if floor % 2 == 0 {
                floor
            } else {
                floor + 1
            }
        }
    }
}

/// Exact quantile of a sorted list as a fraction `(numerator, denominator)`.
///
/// The quantile `num/den` sits at index `num * (n - 1) / den`; with integer
/// part `j` and fractional part `g/den` the value is
/// `(den - g) * x[j] + g * x[j + 1]`, all over `den`.
fn quantile_fraction(sorted: &[u64], num: u64, den: u64) -> (u128, u128) {
    debug_assert!(!sorted.is_empty());
    debug_assert!(den > 0 && num <= den);
    let n = sorted.len() as u128;
    let den = den as u128;
    let pos = num as u128 * (n - 1);
    let j = (pos / den) as usize;
    let g = pos % den;
    if g == 0 {
        (sorted[j] as u128 * den, den)
    } else {
        (
            (den - g) * sorted[j] as u128 + g * sorted[j + 1] as u128,
            den,
        )
    }
}

/// Linear-interpolated quantile with half-to-even rounding.
pub fn quantile(sorted: &[u64], num: u64, den: u64) -> u64 {
    let (value_num, value_den) = quantile_fraction(sorted, num, den);
    round_half_even(value_num as i128, value_den as i128) as u64
}

/// Interpolated median of a sorted list.
pub fn median(sorted: &[u64]) -> u64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    quantile(sorted, 1, 2)
}

/// Inclusive acceptance bounds from the IQR fence.
///
/// `multiplier` is a percentage: 150 means a fence of 1.5 x IQR beyond the
/// quartiles. Bounds are rounded half to even; the lower bound may be
/// negative, hence the signed result.
fn iqr_bounds(sorted: &[u64], multiplier: u64) -> (i128, i128) {
    let (q1, den) = quantile_fraction(sorted, 1, 4);
    let (q3, _) = quantile_fraction(sorted, 3, 4);
    let iqr = q3 as i128 - q1 as i128;
    let fence = multiplier as i128 * iqr;
    let scale = den as i128 * 100;
    let lower = round_half_even(q1 as i128 * 100 - fence, scale);
    let upper = round_half_even(q3 as i128 * 100 + fence, scale);
    (lower, upper)
}

/// Inclusive acceptance band of `factor` per mille around the median.
fn divergence_bounds(median: u64, factor: u64) -> (i128, i128) {
    let delta = median as i128 * factor as i128 / 1000;
    (median as i128 - delta, median as i128 + delta)
}

/// The subset of nodes whose feeds enter consensus and earn rewards.
///
/// A single feed is accepted unconditionally. With at least
/// [`IQR_APPLICABILITY_THRESHOLD`] feeds the IQR fence applies; with fewer,
/// or when the fence collapses to a zero-width range, the median-divergence
/// band takes over.
pub fn consensus_set(
    feeds: &BTreeMap<NodeId, u64>,
    iqr_fence_multiplier: u64,
    median_divergence_factor: u64,
) -> BTreeSet<NodeId> {
    if feeds.is_empty() {
        return BTreeSet::new();
    }
    if feeds.len() == 1 {
        return feeds.keys().copied().collect();
    }

    let mut sorted: Vec<u64> = feeds.values().copied().collect();
    sorted.sort_unstable();
    let mid = median(&sorted);

    let (lower, upper) = if sorted.len() >= IQR_APPLICABILITY_THRESHOLD {
        let bounds = iqr_bounds(&sorted, iqr_fence_multiplier);
        if bounds.1 > bounds.0 {
            bounds
        } else {
            debug!(median = mid, "iqr fence collapsed, using divergence band");
            divergence_bounds(mid, median_divergence_factor)
        }
    } else {
        divergence_bounds(mid, median_divergence_factor)
    };

    feeds
        .iter()
        .filter(|(_, feed)| {
            let feed = **feed as i128;
            lower <= feed && feed <= upper
        })
        .map(|(id, _)| *id)
        .collect()
}
