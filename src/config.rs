use crate::rates::RateQuantity;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Analysis configuration parameters.
///
/// Loaded from a TOML file and validated before use; every field has a
/// default matching the published analysis, so a missing or partial file
/// is fine. See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rates: RatesConfig,
    pub divdiv: DivDivConfig,
    pub bootstrap: BootstrapConfig,
    pub plot: PlotConfig,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatesConfig {
    /// Number of genome positions averaged per smoothed point.
    pub window_size: usize,
    /// Minimum read coverage for a position to count as observed.
    pub cov_min: f64,
    /// Allele frequencies below this are treated as zero.
    pub min_frequency: f64,
    /// Which fitted quantity the rate map reports.
    pub report: RateQuantity,
    /// Length of the shared reference coordinate system.
    pub reference_length: usize,
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            window_size: 300,
            cov_min: 200.0,
            min_frequency: 2e-3,
            report: RateQuantity::Slope,
            reference_length: 10_000,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RegionClass {
    pub name: String,
    pub proteins: Vec<String>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DivDivConfig {
    /// Minimum read coverage for a position to count as observed.
    pub cov_min: f64,
    /// Time bin edges in days since infection.
    pub time_bins: Vec<f64>,
    /// Number of site-frequency-spectrum bins over [0.01, 0.99].
    pub sfs_bins: usize,
    /// Only time points later than this (days) enter the spectrum.
    pub sfs_tmin: f64,
    /// Minimum number of synonymous target nucleotides for a position to
    /// count as synonymous.
    pub syn_degeneracy: usize,
    /// Region classes grouping proteins for the aggregated trajectories.
    pub regions: Vec<RegionClass>,
}

impl Default for DivDivConfig {
    fn default() -> Self {
        let region = |name: &str, proteins: &[&str]| RegionClass {
            name: name.to_string(),
            proteins: proteins.iter().map(|&protein| protein.to_string()).collect(),
        };
        Self {
            cov_min: 100.0,
            time_bins: vec![0.0, 200.0, 500.0, 1000.0, 1500.0, 2000.0, 3000.0, 5000.0],
            sfs_bins: 10,
            sfs_tmin: 1000.0,
            syn_degeneracy: 2,
            regions: vec![
                region("structural", &["gag"]),
                region("enzymes", &["pol"]),
                region("accessory", &["vif", "nef", "vpr", "vpu", "tat", "rev"]),
                region("envelope", &["env"]),
            ],
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub n_replicates: usize,
    /// Fixed seed for reproducible bands; OS entropy when absent.
    pub seed: Option<u64>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            n_replicates: 100,
            seed: None,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlotConfig {
    /// Cycle of per-patient line colors as `#rrggbb` strings.
    pub patient_colors: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub font_size: u32,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            patient_colors: [
                "#a6cee3", "#1f78b4", "#b2df8a", "#33a02c", "#fb9a99", "#e31a1c", "#fdbf6f",
                "#ff7f00", "#cab2d6",
            ]
            .iter()
            .map(|&color| color.to_string())
            .collect(),
            width: 900,
            height: 700,
            font_size: 16,
        }
    }
}

impl Config {
    /// Load a [`Config`] from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized, or if
    /// the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;

        let config: Config = toml::from_str(&contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_num(self.rates.window_size, 1..10_000).context("invalid window size")?;
        check_num(self.rates.cov_min, 0.0..1e9).context("invalid rates coverage cutoff")?;
        check_num(self.rates.min_frequency, 0.0..1.0).context("invalid minimum frequency")?;
        check_num(self.rates.reference_length, 1..100_000_000)
            .context("invalid reference length")?;

        check_num(self.divdiv.cov_min, 0.0..1e9).context("invalid divdiv coverage cutoff")?;
        check_bins(&self.divdiv.time_bins).context("invalid time bins")?;
        check_num(self.divdiv.sfs_bins, 2..10_000).context("invalid number of SFS bins")?;
        check_num(self.divdiv.sfs_tmin, 0.0..1e9).context("invalid SFS time cutoff")?;
        check_num(self.divdiv.syn_degeneracy, 1..10).context("invalid synonymous degeneracy")?;
        if self.divdiv.regions.is_empty() {
            bail!("at least one region class is required");
        }
        for region in &self.divdiv.regions {
            if region.proteins.is_empty() {
                bail!("region class {} lists no proteins", region.name);
            }
        }

        check_num(self.bootstrap.n_replicates, 1..100_000)
            .context("invalid number of bootstrap replicates")?;

        if self.plot.patient_colors.is_empty() {
            bail!("at least one patient color is required");
        }
        for color in &self.plot.patient_colors {
            check_color(color).with_context(|| format!("invalid color {color:?}"))?;
        }
        check_num(self.plot.width, 100..10_000).context("invalid figure width")?;
        check_num(self.plot.height, 100..10_000).context("invalid figure height")?;
        check_num(self.plot.font_size, 4..100).context("invalid font size")?;

        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_bins(bins: &[f64]) -> Result<()> {
    if bins.len() < 2 {
        bail!("at least two bin edges are required");
    }
    if bins.windows(2).any(|pair| pair[0] >= pair[1]) {
        bail!("bin edges must be strictly increasing");
    }
    Ok(())
}

fn check_color(color: &str) -> Result<()> {
    let Some(digits) = color.strip_prefix('#') else {
        bail!("color must start with '#'");
    };
    if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("color must have six hex digits");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: Config = toml::from_str("[rates]\nwindow_size = 100\n").unwrap();
        assert_eq!(config.rates.window_size, 100);
        assert_eq!(config.divdiv.sfs_bins, 10);
        assert_eq!(config.rates.report, RateQuantity::Slope);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.rates.window_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.divdiv.time_bins = vec![0.0, 200.0, 100.0];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.plot.patient_colors = vec!["red".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn report_quantity_parses_from_toml() {
        let config: Config = toml::from_str("[rates]\nreport = \"gof\"\n").unwrap();
        assert_eq!(config.rates.report, RateQuantity::Gof);
    }
}
