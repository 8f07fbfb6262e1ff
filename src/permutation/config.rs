// Configuration for permutation hypothesis testing
//
// Key Invariant: No magic numbers at call sites. Significance level,
// effect-size floor, and cohort minimums live here so every analyzer
// classifies results under the same rule.

use serde::{Deserialize, Serialize};

/// Configuration for a permutation test
///
/// The joint classification rule reads two thresholds from here:
/// - `significance_level`: p-value ceiling for statistical significance
/// - `min_effect_size`: floor the observed effect must clear as well,
///   preventing "statistically significant but practically negligible"
///   false positives
///
/// # Example
/// ```
/// use semilla::permutation::PermutationConfig;
///
/// let config = PermutationConfig::default();
/// assert_eq!(config.significance_level, 0.05); // 95% confidence
/// assert_eq!(config.n_permutations, 1000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationConfig {
    /// Number of permutations used to build the null distribution
    ///
    /// More permutations give finer p-value resolution: the smallest
    /// nonzero p-value is 1/n_permutations.
    pub n_permutations: usize,

    /// Statistical significance level (alpha) for hypothesis testing
    ///
    /// - 0.05 (default): 95% confidence
    /// - 0.01: 99% confidence, stricter
    /// - 0.10: 90% confidence, looser
    pub significance_level: f64,

    /// Minimum effect size the observed statistic must reach before a
    /// significant p-value is allowed to classify as `Significant`
    pub min_effect_size: f64,

    /// Minimum eligible cohort size; smaller inputs terminate as
    /// `insufficient_data` without permuting
    pub min_group_size: usize,

    /// Emit a progress event every this many permutations
    pub progress_every: usize,
}

impl Default for PermutationConfig {
    fn default() -> Self {
        Self {
            n_permutations: 1000,    // 0.001 p-value resolution
            significance_level: 0.05, // 95% confidence (standard in science)
            min_effect_size: 0.1,    // negligible-effect floor
            min_group_size: 5,       // below this a null is meaningless
            progress_every: 1000,
        }
    }
}

impl PermutationConfig {
    /// Strict configuration (fewer false positives, more false negatives)
    pub fn strict() -> Self {
        Self {
            n_permutations: 10_000,
            significance_level: 0.01,
            min_effect_size: 0.2,
            min_group_size: 10,
            progress_every: 1000,
        }
    }

    /// Permissive configuration (more false positives, fewer false negatives)
    pub fn permissive() -> Self {
        Self {
            n_permutations: 500,
            significance_level: 0.10,
            min_effect_size: 0.05,
            min_group_size: 3,
            progress_every: 1000,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.n_permutations == 0 {
            return Err("n_permutations must be >= 1".to_string());
        }

        if !(0.0..=1.0).contains(&self.significance_level) {
            return Err(format!(
                "significance_level must be in [0, 1], got {}",
                self.significance_level
            ));
        }

        if self.min_effect_size < 0.0 {
            return Err(format!(
                "min_effect_size must be non-negative, got {}",
                self.min_effect_size
            ));
        }

        if self.min_group_size < 2 {
            return Err(format!(
                "min_group_size must be >= 2, got {}",
                self.min_group_size
            ));
        }

        if self.progress_every == 0 {
            return Err("progress_every must be >= 1".to_string());
        }

        Ok(())
    }
}
