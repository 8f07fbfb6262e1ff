// Null-distribution summaries: the numeric half of a test outcome.

use crate::permutation::stats::{mean, quantile, std_dev};
use serde::{Deserialize, Serialize};

/// Directional sense of a test: which tail of the null counts as
/// "at least as extreme as observed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tail {
    /// Extreme means small (e.g., a distance that should shrink)
    Lower,
    /// Extreme means large (e.g., a correlation that should grow)
    Upper,
}

/// Percentile bands of the null distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileBands {
    pub p1: f64,
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
}

impl PercentileBands {
    fn from_samples(samples: &[f64]) -> Self {
        PercentileBands {
            p1: quantile(samples, 0.01),
            p5: quantile(samples, 0.05),
            p25: quantile(samples, 0.25),
            p50: quantile(samples, 0.50),
            p75: quantile(samples, 0.75),
            p95: quantile(samples, 0.95),
            p99: quantile(samples, 0.99),
        }
    }

    /// Bands of a valid empirical distribution never decrease.
    pub fn is_monotonic(&self) -> bool {
        let bands = [
            self.p1, self.p5, self.p25, self.p50, self.p75, self.p95, self.p99,
        ];
        bands.windows(2).all(|w| w[0] <= w[1])
    }
}

/// Summary of an empirical null distribution, computed once per test and
/// immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullDistributionSummary {
    /// Mean of the null samples
    pub mean: f64,
    /// Population standard deviation of the null samples
    pub std_dev: f64,
    /// Percentile bands of the null samples
    pub percentiles: PercentileBands,
    /// Fraction of null samples at least as extreme as the observed value,
    /// in the requested tail direction
    pub p_value: f64,
    /// Standardized distance of the observed value from the null mean.
    /// When the null has zero spread the observed-vs-expected relation is
    /// resolved by sign instead of dividing by zero.
    pub z_score: f64,
    /// Number of null samples summarized
    pub n_samples: usize,
}

impl NullDistributionSummary {
    /// Summarize `samples` against `observed` with the given tail sense.
    pub fn from_null_samples(observed: f64, samples: &[f64], tail: Tail) -> Self {
        let n = samples.len();
        let null_mean = mean(samples);
        let null_std = std_dev(samples);

        let extreme = samples
            .iter()
            .filter(|&&s| match tail {
                Tail::Upper => s >= observed,
                Tail::Lower => s <= observed,
            })
            .count();
        let p_value = if n == 0 { 1.0 } else { extreme as f64 / n as f64 };

        let z_score = if null_std > 0.0 {
            (observed - null_mean) / null_std
        } else {
            // Degenerate null: sign of the relation, not a division
            match observed.partial_cmp(&null_mean) {
                Some(std::cmp::Ordering::Greater) => 1.0,
                Some(std::cmp::Ordering::Less) => -1.0,
                _ => 0.0,
            }
        };

        NullDistributionSummary {
            mean: null_mean,
            std_dev: null_std,
            percentiles: PercentileBands::from_samples(samples),
            p_value,
            z_score,
            n_samples: n,
        }
    }
}
