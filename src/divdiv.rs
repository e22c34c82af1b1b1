use crate::config::{BootstrapConfig, DivDivConfig};
use crate::patient::{MutClass, PatientData};
use crate::stats::{
    bin_centers, binned_average, bootstrap_binned_average, bootstrap_rng, histogram,
};
use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A per-bin averaged trajectory with bootstrap confidence bands.
#[derive(Debug, Serialize, Deserialize)]
pub struct BinnedTrajectory {
    /// Bin centers (days since infection).
    pub bins: Vec<f64>,
    pub avg: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

/// Aggregated divergence and diversity of one region class and mutation
/// class.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegionTrajectory {
    pub region: String,
    pub class: MutClass,
    pub divergence: BinnedTrajectory,
    pub diversity: BinnedTrajectory,
}

/// Site-frequency spectra accumulated over patients, split by mutation
/// class. Raw counts; normalization happens at plot time.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpectrumData {
    pub edges: Vec<f64>,
    pub syn: Vec<f64>,
    pub nonsyn: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DivDivData {
    pub trajectories: Vec<RegionTrajectory>,
    pub sfs: SpectrumData,
}

const CLASSES: [MutClass; 2] = [MutClass::Syn, MutClass::Nonsyn];

/// Accumulates per-patient divergence/diversity samples and spectrum
/// counts, then bins and bootstraps them into a [`DivDivData`].
pub struct DivDivCollector {
    cfg: DivDivConfig,
    bootstrap: BootstrapConfig,
    sfs_edges: Vec<f64>,
    /// (time, value) samples per region class, mutation class, and patient.
    divergence: Vec<[Vec<Vec<(f64, f64)>>; 2]>,
    diversity: Vec<[Vec<Vec<(f64, f64)>>; 2]>,
    sfs: [Vec<f64>; 2],
}

impl DivDivCollector {
    pub fn new(cfg: DivDivConfig, bootstrap: BootstrapConfig) -> Self {
        let n_regions = cfg.regions.len();
        let n_bins = cfg.sfs_bins;

        let sfs_edges: Vec<f64> = (0..=n_bins)
            .map(|idx| 0.01 + 0.98 * idx as f64 / n_bins as f64)
            .collect();

        Self {
            cfg,
            bootstrap,
            sfs_edges,
            divergence: (0..n_regions).map(|_| [Vec::new(), Vec::new()]).collect(),
            diversity: (0..n_regions).map(|_| [Vec::new(), Vec::new()]).collect(),
            sfs: [vec![0.0; n_bins], vec![0.0; n_bins]],
        }
    }

    /// Fold one patient into the accumulated samples.
    pub fn add_patient(&mut self, patient: &PatientData) {
        let times = &patient.days_since_infection;
        let regions = self.cfg.regions.clone();

        for (i_region, region) in regions.iter().enumerate() {
            for (i_class, &class) in CLASSES.iter().enumerate() {
                let mut divergence_samples = Vec::new();
                let mut diversity_samples = Vec::new();

                for name in &region.proteins {
                    let Some(protein) = patient.protein(name) else {
                        log::warn!("patient {} has no protein {name}", patient.code);
                        continue;
                    };
                    let protein = protein.clone();

                    let positions =
                        patient.class_positions(&protein, class, self.cfg.syn_degeneracy);
                    log::info!(
                        "{} {}: {} {} positions",
                        patient.code,
                        protein.name,
                        positions.len(),
                        class.label()
                    );

                    for (i_time, &time) in times.iter().enumerate() {
                        divergence_samples.push((
                            time,
                            patient.divergence(i_time, &positions, self.cfg.cov_min),
                        ));
                        diversity_samples.push((
                            time,
                            patient.diversity(i_time, &positions, self.cfg.cov_min),
                        ));
                    }

                    self.add_spectrum(patient, &protein, class, i_class);
                }

                self.divergence[i_region][i_class].push(divergence_samples);
                self.diversity[i_region][i_class].push(diversity_samples);
            }
        }
    }

    fn add_spectrum(
        &mut self,
        patient: &PatientData,
        protein: &crate::patient::ProteinRegion,
        class: MutClass,
        i_class: usize,
    ) {
        let cells = patient.derived_cells(protein, class);

        for (i_time, &time) in patient.days_since_infection.iter().enumerate() {
            if time <= self.cfg.sfs_tmin {
                continue;
            }
            let frequencies: Vec<f64> = cells
                .iter()
                .map(|&(nuc, pos)| patient.frequency(i_time, nuc, pos))
                .collect();
            let counts = histogram(&frequencies, None, &self.sfs_edges);
            for (bin, count) in self.sfs[i_class].iter_mut().zip(counts) {
                *bin += count;
            }
        }
    }

    /// Bin, bootstrap, and package the accumulated samples.
    ///
    /// # Errors
    /// Returns an error if no patient was added, leaving nothing to
    /// bootstrap.
    pub fn finish(self) -> Result<DivDivData> {
        let centers = bin_centers(&self.cfg.time_bins);
        // One RNG for the whole analysis; each trajectory advances it.
        let mut rng = bootstrap_rng(self.bootstrap.seed)?;

        let mut trajectories = Vec::new();
        for (i_region, region) in self.cfg.regions.iter().enumerate() {
            for (i_class, &class) in CLASSES.iter().enumerate() {
                let divergence = self
                    .bin_with_bands(&self.divergence[i_region][i_class], &centers, &mut rng)
                    .with_context(|| {
                        format!("failed to aggregate {} {} divergence", region.name, class.label())
                    })?;
                let diversity = self
                    .bin_with_bands(&self.diversity[i_region][i_class], &centers, &mut rng)
                    .with_context(|| {
                        format!("failed to aggregate {} {} diversity", region.name, class.label())
                    })?;

                trajectories.push(RegionTrajectory {
                    region: region.name.clone(),
                    class,
                    divergence,
                    diversity,
                });
            }
        }

        let [syn, nonsyn] = self.sfs;
        Ok(DivDivData {
            trajectories,
            sfs: SpectrumData {
                edges: self.sfs_edges,
                syn,
                nonsyn,
            },
        })
    }

    fn bin_with_bands(
        &self,
        per_patient: &[Vec<(f64, f64)>],
        centers: &[f64],
        rng: &mut impl Rng,
    ) -> Result<BinnedTrajectory> {
        let pooled: Vec<(f64, f64)> = per_patient.concat();
        let avg = binned_average(&pooled, &self.cfg.time_bins);
        let bands = bootstrap_binned_average(
            per_patient,
            &self.cfg.time_bins,
            self.bootstrap.n_replicates,
            rng,
        )?;

        Ok(BinnedTrajectory {
            bins: centers.to_vec(),
            avg,
            lower: bands.lower,
            upper: bands.upper,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patient::tests::toy_patient;

    fn test_cfg() -> (DivDivConfig, BootstrapConfig) {
        let cfg = DivDivConfig {
            time_bins: vec![0.0, 500.0, 1200.0],
            sfs_tmin: 300.0,
            regions: vec![crate::config::RegionClass {
                name: "structural".to_string(),
                proteins: vec!["gag".to_string()],
            }],
            ..DivDivConfig::default()
        };
        let bootstrap = BootstrapConfig {
            n_replicates: 20,
            seed: Some(7),
        };
        (cfg, bootstrap)
    }

    #[test]
    fn collects_binned_trajectories_per_class() {
        let (cfg, bootstrap) = test_cfg();
        let mut collector = DivDivCollector::new(cfg, bootstrap);
        collector.add_patient(&toy_patient());
        let data = collector.finish().unwrap();

        assert_eq!(data.trajectories.len(), 2);
        let syn = &data.trajectories[0];
        assert_eq!(syn.class, MutClass::Syn);
        assert_eq!(syn.divergence.bins, vec![250.0, 850.0]);

        // The synonymous class is position 1, drifting by 0.1 per sample:
        // divergences 0, 0.1 land in the first bin, 0.2, 0.3 in the second.
        assert!((syn.divergence.avg[0] - 0.05).abs() < 1e-9);
        assert!((syn.divergence.avg[1] - 0.25).abs() < 1e-9);

        // The nonsynonymous class is position 0, which never diverges.
        let nonsyn = &data.trajectories[1];
        assert_eq!(nonsyn.class, MutClass::Nonsyn);
        assert!(nonsyn.divergence.avg[0].abs() < 1e-9);
    }

    #[test]
    fn spectrum_only_counts_late_time_points() {
        let (cfg, bootstrap) = test_cfg();
        let mut collector = DivDivCollector::new(cfg, bootstrap);
        collector.add_patient(&toy_patient());
        let data = collector.finish().unwrap();

        // Derived synonymous frequencies past day 300: 0.1, 0.2, and 0.3.
        assert!((data.sfs.syn.iter().sum::<f64>() - 3.0).abs() < 1e-9);
        // The nonsynonymous cell never leaves zero frequency, which falls
        // outside the [0.01, 0.99] spectrum range.
        assert!(data.sfs.nonsyn.iter().sum::<f64>() < 1e-9);
    }

    #[test]
    fn missing_protein_is_skipped() {
        let (mut cfg, bootstrap) = test_cfg();
        cfg.regions.push(crate::config::RegionClass {
            name: "envelope".to_string(),
            proteins: vec!["env".to_string()],
        });
        let mut collector = DivDivCollector::new(cfg, bootstrap);
        collector.add_patient(&toy_patient());
        let data = collector.finish().unwrap();

        // The missing protein contributes empty sample sets, not errors.
        assert_eq!(data.trajectories.len(), 4);
        assert!(data.trajectories[2].divergence.avg.iter().all(|&avg| avg.abs() < 1e-9));
    }
}
