use crate::masked::{MaskedSeries, running_average_masked};
use anyhow::{Context, Result, bail};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Result of fitting a line through the origin: the slope and the mean
/// weighted squared residual. Either is NaN when fewer than three valid
/// pairs were available.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RatePoint {
    pub slope: f64,
    pub gof: f64,
}

impl RatePoint {
    fn undefined() -> Self {
        Self {
            slope: f64::NAN,
            gof: f64::NAN,
        }
    }
}

/// Which fitted quantity a rate map reports per site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateQuantity {
    Slope,
    Gof,
}

/// Fit `y ≈ slope * x` by weighted least squares over the unmasked pairs.
///
/// The weight `1 / (y + 3e-3)` models shot noise with a sequencing-error
/// floor; the additive constant is fixed because downstream rate
/// comparisons are sensitive to it. Fewer than three valid pairs is not an
/// error but a defined missing-value outcome.
///
/// # Errors
/// Returns an error if `x` and `y` have different lengths.
pub fn weighted_linear_regression(x: &[f64], y: &MaskedSeries) -> Result<RatePoint> {
    if x.len() != y.len() {
        bail!("x length must be {}, but is {}", y.len(), x.len());
    }

    let pairs: Vec<(f64, f64)> = x
        .iter()
        .copied()
        .zip(y.iter())
        .filter(|&(_, (_, masked))| !masked)
        .map(|(xi, (yi, _))| (xi, yi))
        .collect();
    if pairs.len() < 3 {
        return Ok(RatePoint::undefined());
    }

    let mut num = 0.0;
    let mut den = 0.0;
    for &(xi, yi) in &pairs {
        let weight = yi + 3e-3;
        num += xi * yi / weight;
        den += xi * xi / weight;
    }
    let slope = num / den;

    let gof = pairs
        .iter()
        .map(|&(xi, yi)| (xi * slope - yi).powi(2) / (yi + 3e-3))
        .sum::<f64>()
        / pairs.len() as f64;

    Ok(RatePoint { slope, gof })
}

/// Estimates per-site substitution rates from a masked divergence
/// time-series: smooth each time point's profile along the genome, then
/// fit a line through the origin at every site.
pub struct RateEstimator {
    window_size: usize,
    quantity: RateQuantity,
}

impl RateEstimator {
    pub fn new(window_size: usize, quantity: RateQuantity) -> Self {
        Self {
            window_size,
            quantity,
        }
    }

    /// Compute one rate per site from divergence profiles sampled at
    /// `times` (years since infection).
    ///
    /// A profile that fails to smooth is logged and replaced by an
    /// all-masked profile, so a single bad series never aborts the batch.
    ///
    /// # Errors
    /// Returns an error if the profile lengths are inconsistent or do not
    /// match the number of time points.
    pub fn site_rates(&self, times: &[f64], profiles: &[MaskedSeries]) -> Result<Vec<f64>> {
        if times.len() != profiles.len() {
            bail!(
                "number of time points must be {}, but is {}",
                profiles.len(),
                times.len()
            );
        }
        let Some(first) = profiles.first() else {
            return Ok(Vec::new());
        };
        let n_sites = first.len();
        if profiles.iter().any(|profile| profile.len() != n_sites) {
            bail!("divergence profiles must all have length {n_sites}");
        }

        let smoothed: Vec<MaskedSeries> = profiles
            .iter()
            .enumerate()
            .map(
                |(i_time, profile)| match running_average_masked(profile, self.window_size) {
                    Ok(avg) => avg,
                    Err(error) => {
                        log::warn!("failed to smooth divergence at time point {i_time}: {error:#}");
                        MaskedSeries::all_masked(n_sites)
                    }
                },
            )
            .collect();

        let mut rates = Vec::with_capacity(n_sites);
        for site in 0..n_sites {
            let values = smoothed
                .iter()
                .map(|profile| profile.values()[site])
                .collect();
            let mask = smoothed
                .iter()
                .map(|profile| profile.is_masked(site))
                .collect();
            let series = MaskedSeries::new(values, mask)?;

            let point = weighted_linear_regression(times, &series)?;
            rates.push(match self.quantity {
                RateQuantity::Slope => point.slope,
                RateQuantity::Gof => point.gof,
            });
        }

        Ok(rates)
    }
}

/// Per-patient site rates gathered onto a shared reference coordinate
/// system. Unmapped or undefined entries are NaN.
#[derive(Debug, Serialize, Deserialize)]
pub struct RateMap {
    pub patients: Vec<String>,
    pub site_rates: Vec<Vec<f64>>,
    pub reference: Array2<f64>,
}

impl RateMap {
    pub fn new(reference_length: usize) -> Self {
        Self {
            patients: Vec::new(),
            site_rates: Vec::new(),
            reference: Array2::from_elem((0, reference_length), f64::NAN),
        }
    }

    /// Append one patient's rates, scattering them onto reference
    /// coordinates through `(reference, patient)` position pairs.
    ///
    /// # Errors
    /// Returns an error if a map coordinate falls outside either axis.
    pub fn push_patient(
        &mut self,
        code: &str,
        rates: Vec<f64>,
        reference_map: &[(usize, usize)],
    ) -> Result<()> {
        let reference_length = self.reference.ncols();
        let mut row = vec![f64::NAN; reference_length];
        for &(ref_pos, pat_pos) in reference_map {
            if ref_pos >= reference_length {
                bail!("reference position {ref_pos} exceeds length {reference_length}");
            }
            let Some(&rate) = rates.get(pat_pos) else {
                bail!("patient position {pat_pos} exceeds length {}", rates.len());
            };
            row[ref_pos] = rate;
        }

        self.reference
            .push_row(ndarray::ArrayView1::from(&row))
            .context("failed to append reference row")?;
        self.patients.push(code.to_string());
        self.site_rates.push(rates);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regression_needs_three_valid_pairs() {
        let x = vec![1.0, 2.0, 3.0];
        let y = MaskedSeries::new(vec![0.1, 0.2, 0.3], vec![false, false, true]).unwrap();
        let point = weighted_linear_regression(&x, &y).unwrap();
        assert!(point.slope.is_nan());
        assert!(point.gof.is_nan());
    }

    #[test]
    fn regression_recovers_exact_line() {
        let x: Vec<f64> = (1..=20).map(|idx| idx as f64).collect();
        let y = MaskedSeries::from_values(x.iter().map(|&xi| 0.05 * xi).collect());
        let point = weighted_linear_regression(&x, &y).unwrap();
        assert!((point.slope - 0.05).abs() < 1e-12);
        assert!(point.gof.abs() < 1e-12);
    }

    #[test]
    fn regression_example_from_four_points() {
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let y = MaskedSeries::from_values(vec![0.1, 0.2, 0.3, 0.4]);
        let point = weighted_linear_regression(&x, &y).unwrap();
        assert!((point.slope - 0.1).abs() < 1e-12);
        assert!(point.gof.abs() < 1e-12);
    }

    #[test]
    fn regression_ignores_masked_pairs() {
        // The masked outlier would dominate the fit if it leaked through.
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let y = MaskedSeries::new(
            vec![0.1, 0.2, 10.0, 0.4],
            vec![false, false, true, false],
        )
        .unwrap();
        let point = weighted_linear_regression(&x, &y).unwrap();
        assert!((point.slope - 0.1).abs() < 1e-12);
    }

    #[test]
    fn regression_rejects_mismatched_lengths() {
        let y = MaskedSeries::from_values(vec![0.1, 0.2]);
        assert!(weighted_linear_regression(&[1.0], &y).is_err());
    }

    #[test]
    fn site_rates_recover_linear_divergence() {
        // Divergence grows as 0.02 per year at every site; with a window
        // of 1 the smoothing is the identity and every site fits exactly.
        let times = vec![0.5, 1.0, 2.0, 3.0];
        let profiles: Vec<MaskedSeries> = times
            .iter()
            .map(|&t| MaskedSeries::from_values(vec![0.02 * t; 8]))
            .collect();

        let estimator = RateEstimator::new(1, RateQuantity::Slope);
        let rates = estimator.site_rates(&times, &profiles).unwrap();
        assert_eq!(rates.len(), 8);
        for rate in rates {
            assert!((rate - 0.02).abs() < 1e-12);
        }
    }

    #[test]
    fn site_rates_yield_nan_with_too_few_time_points() {
        let times = vec![1.0, 2.0];
        let profiles: Vec<MaskedSeries> = times
            .iter()
            .map(|&t| MaskedSeries::from_values(vec![0.02 * t; 4]))
            .collect();

        let estimator = RateEstimator::new(1, RateQuantity::Slope);
        let rates = estimator.site_rates(&times, &profiles).unwrap();
        assert!(rates.iter().all(|rate| rate.is_nan()));
    }

    #[test]
    fn rate_map_scatters_onto_reference() {
        let mut map = RateMap::new(6);
        map.push_patient("p1", vec![0.1, 0.2, 0.3], &[(0, 0), (2, 1), (5, 2)])
            .unwrap();

        assert_eq!(map.reference.nrows(), 1);
        assert!((map.reference[[0, 2]] - 0.2).abs() < 1e-12);
        assert!(map.reference[[0, 1]].is_nan());
        assert!(map.push_patient("p2", vec![0.1], &[(6, 0)]).is_err());
    }
}
