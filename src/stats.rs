use anyhow::{Context, Result};
use ndarray::ArrayView2;
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::Uniform;

/// Midpoints of consecutive bin edges.
pub fn bin_centers(edges: &[f64]) -> Vec<f64> {
    edges
        .windows(2)
        .map(|pair| 0.5 * (pair[0] + pair[1]))
        .collect()
}

/// Histogram of `samples` over the given bin edges, optionally weighted.
///
/// Bins are half-open except the last, which includes its right edge;
/// samples outside the range are dropped.
pub fn histogram(samples: &[f64], weights: Option<&[f64]>, edges: &[f64]) -> Vec<f64> {
    let n_bins = edges.len().saturating_sub(1);
    let mut counts = vec![0.0; n_bins];
    if n_bins == 0 {
        return counts;
    }

    for (i_sample, &sample) in samples.iter().enumerate() {
        if !sample.is_finite() || sample < edges[0] || sample > edges[n_bins] {
            continue;
        }
        let bin = edges[1..n_bins]
            .iter()
            .take_while(|&&edge| sample >= edge)
            .count();
        counts[bin] += weights.map_or(1.0, |weights| weights[i_sample]);
    }
    counts
}

/// Average `(x, value)` samples into bins over `x`: the weighted histogram
/// of values divided by the per-bin sample count. Non-finite values are
/// dropped before binning; an empty bin averages to zero.
pub fn binned_average(samples: &[(f64, f64)], edges: &[f64]) -> Vec<f64> {
    let clean: Vec<(f64, f64)> = samples
        .iter()
        .copied()
        .filter(|&(_, value)| value.is_finite())
        .collect();
    let xs: Vec<f64> = clean.iter().map(|&(x, _)| x).collect();
    let values: Vec<f64> = clean.iter().map(|&(_, value)| value).collect();

    let sums = histogram(&xs, Some(&values), edges);
    let counts = histogram(&xs, None, edges);
    sums.iter()
        .zip(counts.iter())
        .map(|(&sum, &count)| sum / (1e-10 + count))
        .collect()
}

/// Geometric mean down each column, skipping entries that are not finite
/// and positive. A column with no usable entry yields NaN.
pub fn column_geometric_mean(matrix: ArrayView2<f64>) -> Vec<f64> {
    matrix
        .columns()
        .into_iter()
        .map(|column| {
            let mut log_sum = 0.0;
            let mut count = 0usize;
            for &value in column {
                if value.is_finite() && value > 0.0 {
                    log_sum += value.ln();
                    count += 1;
                }
            }
            if count == 0 {
                f64::NAN
            } else {
                (log_sum / count as f64).exp()
            }
        })
        .collect()
}

/// Confidence band per bin from bootstrap resampling.
#[derive(Debug, Clone)]
pub struct BootstrapBands {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

/// RNG for bootstrap resampling: reproducible when a seed is given, OS
/// entropy otherwise.
///
/// # Errors
/// Returns an error if OS entropy is unavailable.
pub fn bootstrap_rng(seed: Option<u64>) -> Result<ChaCha12Rng> {
    match seed {
        Some(seed) => Ok(ChaCha12Rng::seed_from_u64(seed)),
        None => ChaCha12Rng::try_from_os_rng().context("failed to seed RNG from OS entropy"),
    }
}

/// Bootstrap the binned average over patients: resample the patient set
/// with replacement, recompute the binned average per replicate, and take
/// the 2.5% and 97.5% quantiles per bin. A bin with no finite replicate
/// reports NaN bands.
///
/// The caller's RNG advances across calls, so successive trajectories
/// resample with fresh draws; thread one RNG through a whole analysis.
///
/// # Errors
/// Returns an error if the patient set is empty.
pub fn bootstrap_binned_average(
    per_patient: &[Vec<(f64, f64)>],
    edges: &[f64],
    n_replicates: usize,
    rng: &mut impl Rng,
) -> Result<BootstrapBands> {
    let patient_dist =
        Uniform::new(0, per_patient.len()).context("failed to construct patient sampler")?;

    let n_bins = edges.len().saturating_sub(1);
    let mut replicates = Vec::with_capacity(n_replicates);
    for _ in 0..n_replicates {
        let mut resampled = Vec::new();
        for _ in 0..per_patient.len() {
            let i_patient = patient_dist.sample(rng);
            resampled.extend_from_slice(&per_patient[i_patient]);
        }
        replicates.push(binned_average(&resampled, edges));
    }

    let mut lower = Vec::with_capacity(n_bins);
    let mut upper = Vec::with_capacity(n_bins);
    for bin in 0..n_bins {
        let mut values: Vec<f64> = replicates
            .iter()
            .map(|replicate| replicate[bin])
            .filter(|value| value.is_finite())
            .collect();
        values.sort_by(|a, b| a.total_cmp(b));
        lower.push(quantile(&values, 0.025));
        upper.push(quantile(&values, 0.975));
    }

    Ok(BootstrapBands { lower, upper })
}

/// Linearly interpolated quantile of sorted values; NaN when empty.
fn quantile(sorted: &[f64], fraction: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = fraction * (sorted.len() - 1) as f64;
    let below = rank.floor() as usize;
    let above = rank.ceil() as usize;
    let weight = rank - below as f64;
    sorted[below] * (1.0 - weight) + sorted[above] * weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn histogram_counts_with_inclusive_last_edge() {
        let edges = [0.0, 1.0, 2.0];
        let counts = histogram(&[0.5, 1.0, 1.5, 2.0, 2.5], None, &edges);
        assert_eq!(counts, vec![1.0, 3.0]);
    }

    #[test]
    fn histogram_applies_weights() {
        let edges = [0.0, 1.0, 2.0];
        let counts = histogram(&[0.5, 1.5], Some(&[2.0, 0.5]), &edges);
        assert_eq!(counts, vec![2.0, 0.5]);
    }

    #[test]
    fn binned_average_weights_by_value() {
        let edges = [0.0, 10.0, 20.0];
        let samples = [(1.0, 2.0), (2.0, 4.0), (15.0, 10.0), (5.0, f64::NAN)];
        let avg = binned_average(&samples, &edges);
        assert!((avg[0] - 3.0).abs() < 1e-9);
        assert!((avg[1] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn empty_bin_averages_to_zero() {
        let edges = [0.0, 10.0, 20.0];
        let avg = binned_average(&[(1.0, 2.0)], &edges);
        assert!(avg[1].abs() < 1e-9);
    }

    #[test]
    fn bin_centers_are_midpoints() {
        assert_eq!(bin_centers(&[0.0, 2.0, 6.0]), vec![1.0, 4.0]);
    }

    #[test]
    fn geometric_mean_skips_nan_and_nonpositive() {
        let matrix = array![[1.0, f64::NAN], [4.0, -1.0]];
        let means = column_geometric_mean(matrix.view());
        assert!((means[0] - 2.0).abs() < 1e-12);
        assert!(means[1].is_nan());
    }

    fn staircase_patients() -> Vec<Vec<(f64, f64)>> {
        (0..6)
            .map(|i_patient| {
                (0..20)
                    .map(|i_sample| (5.0, 1.0 + 0.01 * (i_patient + i_sample) as f64))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn bootstrap_is_reproducible_and_brackets_estimate() {
        let per_patient = staircase_patients();
        let edges = [0.0, 10.0];

        let mut rng = bootstrap_rng(Some(42)).unwrap();
        let bands = bootstrap_binned_average(&per_patient, &edges, 50, &mut rng).unwrap();
        let mut rng = bootstrap_rng(Some(42)).unwrap();
        let again = bootstrap_binned_average(&per_patient, &edges, 50, &mut rng).unwrap();
        assert_eq!(bands.lower, again.lower);
        assert_eq!(bands.upper, again.upper);

        let point = binned_average(&per_patient.concat(), &edges)[0];
        assert!(bands.lower[0] <= point && point <= bands.upper[0]);
        assert!(bands.lower[0] <= bands.upper[0]);
    }

    #[test]
    fn successive_draws_from_one_rng_differ() {
        let per_patient = staircase_patients();
        let edges = [0.0, 10.0];

        let mut rng = bootstrap_rng(Some(42)).unwrap();
        let first = bootstrap_binned_average(&per_patient, &edges, 50, &mut rng).unwrap();
        let second = bootstrap_binned_average(&per_patient, &edges, 50, &mut rng).unwrap();
        assert!(first.lower != second.lower || first.upper != second.upper);
    }

    #[test]
    fn quantile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert!((quantile(&sorted, 0.5) - 2.5).abs() < 1e-12);
        assert!((quantile(&sorted, 0.0) - 1.0).abs() < 1e-12);
        assert!((quantile(&sorted, 1.0) - 4.0).abs() < 1e-12);
        assert!(quantile(&[], 0.5).is_nan());
    }
}
