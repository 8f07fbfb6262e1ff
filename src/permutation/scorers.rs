// The recurring observed-statistic functions and permutation axes.
//
// Each scorer pairs a dataset shape with a pure statistic; each strategy
// names the axis the null distribution permutes (a target vector, a label
// vector, or a symbol-to-class lookup table). Scorers never touch
// randomness - the engine evaluates them inside a forbidden zone.

use crate::governor::GovernedRng;
use crate::permutation::engine::{Cohort, PermuteStrategy, Scorer};
use crate::permutation::stats::{mean, spearman};
use anyhow::{ensure, Result};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Rank correlation with confound residualization
// ---------------------------------------------------------------------------

/// Two paired measurement series, optionally with a shared confound to
/// regress out before correlating.
#[derive(Debug, Clone)]
pub struct PairedSamples {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// Confound regressed out of both series before ranking
    pub confound: Option<Vec<f64>>,
}

impl Cohort for PairedSamples {
    fn group_count(&self) -> usize {
        // The two paired series are the groups under comparison
        usize::from(!self.x.is_empty()) + usize::from(!self.y.is_empty())
    }

    fn sample_size(&self) -> usize {
        self.x.len().min(self.y.len())
    }
}

/// Spearman rank correlation, computed on OLS residuals when a confound is
/// present.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResidualRankCorrelation;

impl Scorer<PairedSamples> for ResidualRankCorrelation {
    fn score(&self, data: &PairedSamples) -> Result<f64> {
        ensure!(
            data.x.len() == data.y.len(),
            "paired series must have equal length ({} vs {})",
            data.x.len(),
            data.y.len()
        );
        if let Some(confound) = &data.confound {
            ensure!(
                confound.len() == data.x.len(),
                "confound length {} does not match series length {}",
                confound.len(),
                data.x.len()
            );
            let rx = residualize(&data.x, confound);
            let ry = residualize(&data.y, confound);
            Ok(spearman(&rx, &ry))
        } else {
            Ok(spearman(&data.x, &data.y))
        }
    }
}

/// Permutes the `y` series, breaking any pairing with `x` while keeping
/// both marginal distributions intact.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShuffleTarget;

impl PermuteStrategy<PairedSamples> for ShuffleTarget {
    fn permute(&self, data: &mut PairedSamples, rng: &mut GovernedRng) -> Result<()> {
        rng.shuffle(&mut data.y)?;
        Ok(())
    }
}

/// OLS residuals of `v` against `confound` (single regressor plus
/// intercept).
fn residualize(v: &[f64], confound: &[f64]) -> Vec<f64> {
    let n = v.len();
    let mv = mean(v);
    let mc = mean(confound);

    let mut cov = 0.0;
    let mut var_c = 0.0;
    for i in 0..n {
        cov += (confound[i] - mc) * (v[i] - mv);
        var_c += (confound[i] - mc) * (confound[i] - mc);
    }

    // Constant confound carries no information; residual is the centered value
    let slope = if var_c == 0.0 { 0.0 } else { cov / var_c };
    let intercept = mv - slope * mc;

    v.iter()
        .zip(confound)
        .map(|(&vi, &ci)| vi - (intercept + slope * ci))
        .collect()
}

// ---------------------------------------------------------------------------
// Mutual information over equivalence classes
// ---------------------------------------------------------------------------

/// Categorical observations with a symbol-to-equivalence-class lookup
/// table. The statistic reads symbols through the table; one permutation
/// axis is the table itself.
#[derive(Debug, Clone)]
pub struct CategorizedSamples {
    /// Raw category symbol per observation
    pub symbols: Vec<u32>,
    /// Outcome category per observation
    pub outcomes: Vec<u32>,
    /// Symbol -> equivalence class encoding
    pub class_of: BTreeMap<u32, u32>,
}

impl Cohort for CategorizedSamples {
    fn group_count(&self) -> usize {
        let mut distinct: Vec<u32> = self.outcomes.clone();
        distinct.sort_unstable();
        distinct.dedup();
        distinct.len()
    }

    fn sample_size(&self) -> usize {
        self.symbols.len().min(self.outcomes.len())
    }
}

/// Mutual information (in nats) between the equivalence-class encoding of
/// the symbols and the outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EquivalenceClassMi;

impl Scorer<CategorizedSamples> for EquivalenceClassMi {
    fn score(&self, data: &CategorizedSamples) -> Result<f64> {
        ensure!(
            data.symbols.len() == data.outcomes.len(),
            "symbol and outcome vectors must have equal length ({} vs {})",
            data.symbols.len(),
            data.outcomes.len()
        );

        let mut classes = Vec::with_capacity(data.symbols.len());
        for symbol in &data.symbols {
            let class = data
                .class_of
                .get(symbol)
                .ok_or_else(|| anyhow::anyhow!("symbol {symbol} missing from class table"))?;
            classes.push(*class);
        }

        Ok(mutual_information(&classes, &data.outcomes))
    }
}

/// Permutes the outcome vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShuffleOutcomes;

impl PermuteStrategy<CategorizedSamples> for ShuffleOutcomes {
    fn permute(&self, data: &mut CategorizedSamples, rng: &mut GovernedRng) -> Result<()> {
        rng.shuffle(&mut data.outcomes)?;
        Ok(())
    }
}

/// Permutes the class table: class assignments are shuffled across
/// symbols, preserving the class multiset but destroying which symbol maps
/// where.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShuffleClassTable;

impl PermuteStrategy<CategorizedSamples> for ShuffleClassTable {
    fn permute(&self, data: &mut CategorizedSamples, rng: &mut GovernedRng) -> Result<()> {
        let keys: Vec<u32> = data.class_of.keys().copied().collect();
        let mut classes: Vec<u32> = keys.iter().map(|k| data.class_of[k]).collect();
        rng.shuffle(&mut classes)?;
        for (key, class) in keys.into_iter().zip(classes) {
            data.class_of.insert(key, class);
        }
        Ok(())
    }
}

/// Mutual information between two categorical vectors, in nats.
fn mutual_information(a: &[u32], b: &[u32]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }

    let mut joint: BTreeMap<(u32, u32), f64> = BTreeMap::new();
    let mut pa: BTreeMap<u32, f64> = BTreeMap::new();
    let mut pb: BTreeMap<u32, f64> = BTreeMap::new();
    let weight = 1.0 / n as f64;
    for i in 0..n {
        *joint.entry((a[i], b[i])).or_default() += weight;
        *pa.entry(a[i]).or_default() += weight;
        *pb.entry(b[i]).or_default() += weight;
    }

    joint
        .iter()
        .map(|(&(x, y), &pxy)| pxy * (pxy / (pa[&x] * pb[&y])).ln())
        .sum()
}

// ---------------------------------------------------------------------------
// Centroid separation after a train/test split
// ---------------------------------------------------------------------------

/// Feature vectors with a binary class label per row.
#[derive(Debug, Clone)]
pub struct LabeledVectors {
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<u32>,
}

impl Cohort for LabeledVectors {
    fn group_count(&self) -> usize {
        let mut distinct: Vec<u32> = self.labels.clone();
        distinct.sort_unstable();
        distinct.dedup();
        distinct.len()
    }

    fn sample_size(&self) -> usize {
        self.rows.len()
    }
}

/// Margin between class centroids: fit centroids on the train split, then
/// average, over held-out rows, the cosine similarity to the own-class
/// centroid minus the similarity to the other centroid.
///
/// The split is deterministic (every `stride`-th row is held out), so the
/// statistic stays pure and permutation-comparable.
#[derive(Debug, Clone, Copy)]
pub struct CentroidCosineSeparation {
    /// Every `stride`-th row goes to the held-out test split; must be >= 2
    pub holdout_stride: usize,
}

impl Default for CentroidCosineSeparation {
    fn default() -> Self {
        // 1-in-4 holdout
        CentroidCosineSeparation { holdout_stride: 4 }
    }
}

impl Scorer<LabeledVectors> for CentroidCosineSeparation {
    fn score(&self, data: &LabeledVectors) -> Result<f64> {
        ensure!(self.holdout_stride >= 2, "holdout_stride must be >= 2");
        ensure!(
            data.rows.len() == data.labels.len(),
            "row and label vectors must have equal length ({} vs {})",
            data.rows.len(),
            data.labels.len()
        );
        ensure!(
            data.group_count() == 2,
            "centroid separation requires exactly two classes, got {}",
            data.group_count()
        );

        let mut classes: Vec<u32> = data.labels.clone();
        classes.sort_unstable();
        classes.dedup();
        let class_index = |label: u32| usize::from(label == classes[1]);

        let dim = data.rows.first().map(Vec::len).unwrap_or(0);
        let mut centroids = [vec![0.0; dim], vec![0.0; dim]];
        let mut counts = [0usize; 2];

        for (i, (row, &label)) in data.rows.iter().zip(&data.labels).enumerate() {
            if i % self.holdout_stride == 0 {
                continue; // held out
            }
            ensure!(row.len() == dim, "ragged feature rows");
            let c = class_index(label);
            for (acc, v) in centroids[c].iter_mut().zip(row) {
                *acc += v;
            }
            counts[c] += 1;
        }
        ensure!(
            counts[0] > 0 && counts[1] > 0,
            "train split left a class empty; cohort too small for this stride"
        );
        for (centroid, count) in centroids.iter_mut().zip(counts) {
            for v in centroid.iter_mut() {
                *v /= count as f64;
            }
        }

        let mut margin_sum = 0.0;
        let mut held_out = 0usize;
        for (i, (row, &label)) in data.rows.iter().zip(&data.labels).enumerate() {
            if i % self.holdout_stride != 0 {
                continue;
            }
            let own = class_index(label);
            margin_sum += cosine(row, &centroids[own]) - cosine(row, &centroids[1 - own]);
            held_out += 1;
        }
        ensure!(held_out > 0, "holdout split is empty");

        Ok(margin_sum / held_out as f64)
    }
}

/// Permutes the label vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShuffleLabels;

impl PermuteStrategy<LabeledVectors> for ShuffleLabels {
    fn permute(&self, data: &mut LabeledVectors, rng: &mut GovernedRng) -> Result<()> {
        rng.shuffle(&mut data.labels)?;
        Ok(())
    }
}

/// Cosine similarity; 0.0 when either vector is zero.
fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = (na * nb).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    dot / denom
}
