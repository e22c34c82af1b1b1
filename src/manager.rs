use crate::config::Config;
use crate::divdiv::{DivDivCollector, DivDivData};
use crate::patient::PatientData;
use crate::plot;
use crate::rates::{RateEstimator, RateMap};
use crate::tree::{self, TreeNode};
use anyhow::{Context, Result, bail};
use glob::glob;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

/// Orchestrates the analyses over a data directory: discovers patient
/// files, loads the configuration, reuses cached products unless asked to
/// recompute, and writes figures.
pub struct Manager {
    data_dir: PathBuf,
    fig_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    /// Set up a manager for a data directory.
    ///
    /// Reads `config.toml` from the directory when present, falling back
    /// to the built-in defaults, and creates the figure directory.
    pub fn new<P: AsRef<Path>>(data_dir: P, fig_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let fig_dir = fig_dir.unwrap_or_else(|| data_dir.join("figures"));

        let config_file = data_dir.join("config.toml");
        let cfg = if config_file.is_file() {
            Config::from_file(&config_file).context("failed to construct cfg")?
        } else {
            Config::default()
        };
        log::info!("{cfg:#?}");

        fs::create_dir_all(&fig_dir).with_context(|| format!("failed to create {fig_dir:?}"))?;

        Ok(Self {
            data_dir,
            fig_dir,
            cfg,
        })
    }

    /// Estimate per-site substitution rates and plot them on reference
    /// coordinates.
    ///
    /// With an empty `patients` list, every discovered patient file is
    /// used. A cached rate map is reused unless `redo` is set, regardless
    /// of the patient list.
    pub fn run_rates(&self, patients: &[String], redo: bool) -> Result<()> {
        let cache_file = self.data_dir.join("rates.msgpack");

        let map = if cache_file.is_file() && !redo {
            log::info!("loading cached rates from {cache_file:?}");
            self.load_cache(&cache_file)?
        } else {
            let map = self.compute_rates(patients)?;
            self.save_cache(&map, &cache_file)?;
            map
        };

        let figure = self.fig_dir.join("evolutionary_rates.svg");
        plot::plot_rates(&map, &self.cfg.plot, &figure).context("failed to plot rates")?;
        log::info!("wrote {figure:?}");

        Ok(())
    }

    fn compute_rates(&self, patients: &[String]) -> Result<RateMap> {
        let rates_cfg = &self.cfg.rates;
        let estimator = RateEstimator::new(rates_cfg.window_size, rates_cfg.report);
        let mut map = RateMap::new(rates_cfg.reference_length);

        for code in self.patient_codes(patients)? {
            let Some(patient) = self.load_patient(&code) else {
                continue;
            };

            let years = patient.years_since_infection();
            let profiles =
                patient.divergence_profiles(rates_cfg.cov_min, rates_cfg.min_frequency);

            let totals: Vec<String> = years
                .iter()
                .zip(profiles.iter())
                .map(|(&year, profile)| format!("{year:.2}y: {:.3}", profile.mean_valid()))
                .collect();
            log::info!("{code} mean divergence per time point: {}", totals.join(", "));

            let rates = match estimator.site_rates(&years, &profiles) {
                Ok(rates) => rates,
                Err(error) => {
                    log::warn!("failed to estimate rates for patient {code}: {error:#}");
                    continue;
                }
            };
            map.push_patient(&code, rates, &patient.reference_map)
                .with_context(|| format!("failed to map rates of patient {code}"))?;
        }

        if map.patients.is_empty() {
            bail!("no patient could be loaded");
        }
        Ok(map)
    }

    /// Aggregate synonymous/nonsynonymous divergence, diversity, and the
    /// site-frequency spectra, then plot both figures.
    pub fn run_divdiv(&self, redo: bool) -> Result<()> {
        let cache_file = self.data_dir.join("divdiv.msgpack");

        let data: DivDivData = if cache_file.is_file() && !redo {
            log::info!("loading cached data from {cache_file:?}");
            self.load_cache(&cache_file)?
        } else {
            let data = self.compute_divdiv()?;
            self.save_cache(&data, &cache_file)?;
            data
        };

        let divdiv_figure = self.fig_dir.join("divdiv.svg");
        plot::plot_divdiv(&data, &self.cfg.plot, &divdiv_figure)
            .context("failed to plot divergence/diversity")?;
        log::info!("wrote {divdiv_figure:?}");

        let sfs_figure = self.fig_dir.join("sfs.svg");
        plot::plot_sfs(&data.sfs, &self.cfg.plot, &sfs_figure)
            .context("failed to plot site-frequency spectra")?;
        log::info!("wrote {sfs_figure:?}");

        Ok(())
    }

    fn compute_divdiv(&self) -> Result<DivDivData> {
        let mut collector =
            DivDivCollector::new(self.cfg.divdiv.clone(), self.cfg.bootstrap.clone());

        let mut n_loaded = 0usize;
        for code in self.patient_codes(&[])? {
            let Some(patient) = self.load_patient(&code) else {
                continue;
            };
            collector.add_patient(&patient);
            n_loaded += 1;
        }
        if n_loaded == 0 {
            bail!("no patient could be loaded");
        }

        collector.finish()
    }

    /// Draw a phylogenetic tree from a JSON file.
    pub fn run_tree(&self, json: &Path) -> Result<()> {
        let tree = TreeNode::from_json_file(json)
            .with_context(|| format!("failed to load tree from {json:?}"))?;
        log::info!("loaded tree with {} tips", tree.count_tips());

        let layout = tree::layout(&tree, true);

        let figure = self.fig_dir.join("tree.svg");
        plot::plot_tree(&layout, &self.cfg.plot, &figure).context("failed to plot tree")?;
        log::info!("wrote {figure:?}");

        Ok(())
    }

    /// The requested patient codes, or every code discovered in the data
    /// directory when the request is empty.
    fn patient_codes(&self, patients: &[String]) -> Result<Vec<String>> {
        if !patients.is_empty() {
            return Ok(patients.to_vec());
        }

        let pattern = self.data_dir.join("patient-*.msgpack");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let mut codes: Vec<String> = glob(pattern)
            .context("failed to glob patient files")?
            .filter_map(Result::ok)
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.strip_prefix("patient-"))
                    .map(str::to_string)
            })
            .collect();
        codes.sort();

        if codes.is_empty() {
            bail!("no patient files found in {:?}", self.data_dir);
        }
        Ok(codes)
    }

    /// Load one patient, logging and skipping on failure so a bad input
    /// never aborts the batch.
    fn load_patient(&self, code: &str) -> Option<PatientData> {
        let file = self.patient_file(code);
        match PatientData::load(&file) {
            Ok(patient) => Some(patient),
            Err(error) => {
                log::warn!("can't load patient {code}: {error:#}");
                None
            }
        }
    }

    pub fn patient_file(&self, code: &str) -> PathBuf {
        self.data_dir.join(format!("patient-{code}.msgpack"))
    }

    fn load_cache<T: DeserializeOwned>(&self, file: &Path) -> Result<T> {
        let file_handle =
            File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file_handle);
        rmp_serde::decode::from_read(&mut reader)
            .with_context(|| format!("failed to deserialize {file:?}"))
    }

    fn save_cache<T: Serialize>(&self, value: &T, file: &Path) -> Result<()> {
        let file_handle =
            File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file_handle);
        rmp_serde::encode::write(&mut writer, value)
            .with_context(|| format!("failed to serialize {file:?}"))?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }
}
