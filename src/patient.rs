use crate::masked::MaskedSeries;
use anyhow::{Context, Result, bail};
use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::BufReader,
    path::Path,
};

/// A coding region given as a half-open position range on the patient
/// genome coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProteinRegion {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

/// Mutation class of a site or nucleotide cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutClass {
    Syn,
    Nonsyn,
}

impl MutClass {
    pub fn label(self) -> &'static str {
        match self {
            MutClass::Syn => "synonymous",
            MutClass::Nonsyn => "nonsynonymous",
        }
    }
}

/// Longitudinal deep-sequencing dataset of one patient.
///
/// Loaded from a MessagePack-encoded file and validated before use. Allele
/// frequencies are indexed as (time point, nucleotide, position); the
/// founder state per position defines divergence.
#[derive(Debug, Serialize, Deserialize)]
pub struct PatientData {
    pub code: String,

    /// Sampling times in estimated days since infection.
    pub days_since_infection: Vec<f64>,

    /// Allele frequencies, shape (time, nucleotide, position).
    pub frequencies: Array3<f64>,
    /// Read coverage, shape (time, position).
    pub coverage: Array2<f64>,

    /// Founder nucleotide index per position.
    pub founder_indices: Array1<usize>,

    /// Per (nucleotide, position): mutating to that nucleotide leaves the
    /// encoded amino acid unchanged.
    pub synonymous: Array2<bool>,
    /// Externally annotated constrained positions.
    pub constrained: Array1<bool>,
    /// Gap-affected codon positions.
    pub gaps: Array1<bool>,

    /// (reference coordinate, patient coordinate) pairs onto the shared
    /// reference genome.
    pub reference_map: Vec<(usize, usize)>,

    pub proteins: Vec<ProteinRegion>,
}

impl PatientData {
    /// Load a [`PatientData`] from a MessagePack file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized, or if
    /// the array shapes are inconsistent.
    pub fn load<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let reader = BufReader::new(file);

        let patient: PatientData =
            rmp_serde::decode::from_read(reader).context("failed to deserialize patient data")?;

        patient.validate().context("failed to validate patient data")?;

        Ok(patient)
    }

    fn validate(&self) -> Result<()> {
        let (n_times, n_nucs, n_positions) = self.frequencies.dim();

        if self.days_since_infection.len() != n_times {
            bail!(
                "number of sampling times must be {n_times}, but is {}",
                self.days_since_infection.len()
            );
        }
        if self.coverage.dim() != (n_times, n_positions) {
            bail!(
                "coverage shape must be {:?}, but is {:?}",
                (n_times, n_positions),
                self.coverage.dim()
            );
        }
        if self.founder_indices.len() != n_positions {
            bail!(
                "founder indices length must be {n_positions}, but is {}",
                self.founder_indices.len()
            );
        }
        if self.founder_indices.iter().any(|&nuc| nuc >= n_nucs) {
            bail!("founder indices must be below {n_nucs}");
        }
        if self.synonymous.dim() != (n_nucs, n_positions) {
            bail!(
                "synonymous mask shape must be {:?}, but is {:?}",
                (n_nucs, n_positions),
                self.synonymous.dim()
            );
        }
        if self.constrained.len() != n_positions || self.gaps.len() != n_positions {
            bail!("constrained and gap masks must have length {n_positions}");
        }
        if self
            .reference_map
            .iter()
            .any(|&(_, pat_pos)| pat_pos >= n_positions)
        {
            bail!("reference map patient coordinates must be below {n_positions}");
        }
        for protein in &self.proteins {
            if protein.start > protein.end || protein.end > n_positions {
                bail!(
                    "protein {} range {}..{} exceeds {n_positions} positions",
                    protein.name,
                    protein.start,
                    protein.end
                );
            }
        }

        Ok(())
    }

    pub fn n_time_points(&self) -> usize {
        self.frequencies.dim().0
    }

    pub fn n_positions(&self) -> usize {
        self.frequencies.dim().2
    }

    /// Sampling times in years since infection.
    pub fn years_since_infection(&self) -> Vec<f64> {
        self.days_since_infection
            .iter()
            .map(|&days| days / 365.25)
            .collect()
    }

    pub fn protein(&self, name: &str) -> Option<&ProteinRegion> {
        self.proteins.iter().find(|protein| protein.name == name)
    }

    fn covered(&self, i_time: usize, pos: usize, cov_min: f64) -> bool {
        self.coverage[[i_time, pos]] >= cov_min
    }

    /// Per-site divergence profiles, one masked series per time point.
    ///
    /// Divergence at a position is the summed frequency of all states
    /// minus the founder frequency; frequencies below `min_frequency` are
    /// zeroed first. Positions below the coverage cutoff are masked.
    pub fn divergence_profiles(&self, cov_min: f64, min_frequency: f64) -> Vec<MaskedSeries> {
        let (n_times, n_nucs, n_positions) = self.frequencies.dim();

        let mut profiles = Vec::with_capacity(n_times);
        for i_time in 0..n_times {
            let mut values = Vec::with_capacity(n_positions);
            let mut mask = Vec::with_capacity(n_positions);
            for pos in 0..n_positions {
                let founder = self.founder_indices[pos];
                let mut total = 0.0;
                let mut founder_freq = 0.0;
                for nuc in 0..n_nucs {
                    let mut freq = self.frequencies[[i_time, nuc, pos]];
                    if freq < min_frequency {
                        freq = 0.0;
                    }
                    total += freq;
                    if nuc == founder {
                        founder_freq = freq;
                    }
                }
                values.push(total - founder_freq);
                mask.push(!self.covered(i_time, pos, cov_min));
            }
            // Lengths agree by construction.
            profiles.push(MaskedSeries::new(values, mask).unwrap_or_else(|_| {
                MaskedSeries::all_masked(n_positions)
            }));
        }

        profiles
    }

    /// Number of synonymous target nucleotides at a position.
    fn synonymous_degree(&self, pos: usize) -> usize {
        self.synonymous
            .column(pos)
            .iter()
            .filter(|&&syn| syn)
            .count()
    }

    /// Positions of a region belonging to a mutation class.
    ///
    /// Synonymous positions carry at least `syn_degeneracy` synonymous
    /// targets; nonsynonymous positions carry at most one and must not be
    /// constrained. Gap positions belong to neither class.
    pub fn class_positions(
        &self,
        region: &ProteinRegion,
        class: MutClass,
        syn_degeneracy: usize,
    ) -> Vec<usize> {
        (region.start..region.end)
            .filter(|&pos| {
                if self.gaps[pos] {
                    return false;
                }
                match class {
                    MutClass::Syn => self.synonymous_degree(pos) >= syn_degeneracy,
                    MutClass::Nonsyn => {
                        self.synonymous_degree(pos) <= 1 && !self.constrained[pos]
                    }
                }
            })
            .collect()
    }

    /// Mean divergence from the founder state over the given positions at
    /// one time point, skipping positions below the coverage cutoff. NaN
    /// if no position is left.
    pub fn divergence(&self, i_time: usize, positions: &[usize], cov_min: f64) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for &pos in positions {
            if !self.covered(i_time, pos, cov_min) {
                continue;
            }
            let founder = self.founder_indices[pos];
            sum += 1.0 - self.frequencies[[i_time, founder, pos]];
            count += 1;
        }
        if count == 0 {
            return f64::NAN;
        }
        sum / count as f64
    }

    /// Mean heterozygosity over the given positions at one time point,
    /// skipping positions below the coverage cutoff. NaN if no position is
    /// left.
    pub fn diversity(&self, i_time: usize, positions: &[usize], cov_min: f64) -> f64 {
        let n_nucs = self.frequencies.dim().1;

        let mut sum = 0.0;
        let mut count = 0usize;
        for &pos in positions {
            if !self.covered(i_time, pos, cov_min) {
                continue;
            }
            for nuc in 0..n_nucs {
                let freq = self.frequencies[[i_time, nuc, pos]];
                sum += freq * (1.0 - freq);
            }
            count += 1;
        }
        if count == 0 {
            return f64::NAN;
        }
        sum / count as f64
    }

    /// Derived (non-founder) nucleotide cells of a region belonging to a
    /// mutation class, as (nucleotide, position) pairs. These are the
    /// cells whose frequencies enter the site-frequency spectrum.
    pub fn derived_cells(&self, region: &ProteinRegion, class: MutClass) -> Vec<(usize, usize)> {
        let n_nucs = self.frequencies.dim().1;

        let mut cells = Vec::new();
        for pos in region.start..region.end {
            for nuc in 0..n_nucs {
                if nuc == self.founder_indices[pos] {
                    continue;
                }
                let keep = match class {
                    MutClass::Syn => self.synonymous[[nuc, pos]],
                    MutClass::Nonsyn => {
                        !self.synonymous[[nuc, pos]]
                            && !self.constrained[pos]
                            && !self.gaps[pos]
                    }
                };
                if keep {
                    cells.push((nuc, pos));
                }
            }
        }
        cells
    }

    pub fn frequency(&self, i_time: usize, nuc: usize, pos: usize) -> f64 {
        self.frequencies[[i_time, nuc, pos]]
    }
}
