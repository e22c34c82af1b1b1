use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// A fixed-length series of observations with a parallel validity mask.
///
/// Masked entries mark missing or unreliable observations (e.g. positions
/// below the coverage cutoff); their values never enter aggregate
/// computations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskedSeries {
    values: Vec<f64>,
    mask: Vec<bool>,
}

impl MaskedSeries {
    /// Create a series from values and a mask of equal length.
    ///
    /// # Errors
    /// Returns an error if the lengths differ.
    pub fn new(values: Vec<f64>, mask: Vec<bool>) -> Result<Self> {
        if values.len() != mask.len() {
            bail!(
                "mask length must be {}, but is {}",
                values.len(),
                mask.len()
            );
        }
        Ok(Self { values, mask })
    }

    /// Create a fully valid series.
    pub fn from_values(values: Vec<f64>) -> Self {
        let mask = vec![false; values.len()];
        Self { values, mask }
    }

    /// Create a series of the given length with every entry masked.
    pub fn all_masked(len: usize) -> Self {
        Self {
            values: vec![f64::NAN; len],
            mask: vec![true; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    pub fn is_masked(&self, idx: usize) -> bool {
        self.mask[idx]
    }

    /// Whether no entry is masked.
    pub fn fully_valid(&self) -> bool {
        self.mask.iter().all(|&masked| !masked)
    }

    /// Iterate over `(value, masked)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (f64, bool)> + '_ {
        self.values.iter().copied().zip(self.mask.iter().copied())
    }

    /// Mean of the valid entries, or NaN if none are valid.
    pub fn mean_valid(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for (val, masked) in self.iter() {
            if !masked {
                sum += val;
                count += 1;
            }
        }
        if count == 0 {
            return f64::NAN;
        }
        sum / count as f64
    }
}

/// Smooth a masked series with a centered running average of width `ws`.
///
/// Each output point is the mean of the valid observations inside the
/// window `[i - ws/2, i + (ws-1)/2]` (an even `ws` extends one extra sample
/// to the left). If the input carries masked entries, an output point is
/// itself masked when fewer than 95% of the window's samples were valid;
/// window samples falling outside the series count as invalid, so points
/// within half a window of either boundary are usually masked. A fully
/// valid input instead gets its boundary points rescaled by the number of
/// real samples in the window and comes back fully valid.
///
/// # Errors
/// Returns an error if `ws` is zero. Batch callers should log the error
/// and substitute an all-masked series rather than abort the batch.
pub fn running_average_masked(obs: &MaskedSeries, ws: usize) -> Result<MaskedSeries> {
    if ws == 0 {
        bail!("window size must be positive");
    }

    let n = obs.len();
    let mut values = Vec::with_capacity(n);
    let mut mask = Vec::with_capacity(n);

    // Prefix sums of the zero-filled values and of the validity indicator.
    let mut val_sums = vec![0.0; n + 1];
    let mut valid_sums = vec![0.0; n + 1];
    for idx in 0..n {
        let valid = !obs.is_masked(idx);
        val_sums[idx + 1] = val_sums[idx] + if valid { obs.values[idx] } else { 0.0 };
        valid_sums[idx + 1] = valid_sums[idx] + if valid { 1.0 } else { 0.0 };
    }

    let fully_valid = obs.fully_valid();
    let valid_min = 0.95 * ws as f64;

    for idx in 0..n {
        let lo = idx.saturating_sub(ws / 2);
        let hi = usize::min(idx + (ws - 1) / 2, n - 1);

        let window_sum = val_sums[hi + 1] - val_sums[lo];
        let window_valid = valid_sums[hi + 1] - valid_sums[lo];
        let window_real = (hi - lo + 1) as f64;

        if fully_valid {
            // Every real sample is valid; dividing by the real count keeps
            // boundary points unbiased despite the shortened window.
            values.push(window_sum / window_real);
            mask.push(false);
        } else {
            values.push(if window_valid > 0.0 {
                window_sum / window_valid
            } else {
                f64::NAN
            });
            mask.push(window_valid < valid_min);
        }
    }

    MaskedSeries::new(values, mask)
}
