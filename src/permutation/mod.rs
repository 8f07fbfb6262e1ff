// Permutation-based hypothesis testing
//
// Every domain analyzer in the pipeline instantiates the same test shape:
// compute an observed statistic, rebuild it under many randomized
// relabelings of the data to form an empirical null distribution, and
// classify the observed value against that null.
//
// Scientific Foundation:
// - Good, P. (2005). Permutation, Parametric and Bootstrap Tests of
//   Hypotheses. Exact inference without distributional assumptions.
// - Sullivan, G. M., & Feinn, R. (2012). Using effect size - or why the
//   p value is not enough. Verdicts here are a joint rule over p-value
//   AND a minimum-effect-size floor, never the p-value alone.
//
// Determinism: the permutation stream runs inside a seeded governor zone
// derived from the run seed plus the test identifier, so every null
// distribution is independently reproducible and its seed is ledgered.

mod config;
mod engine;
mod scorers;
mod stats;
mod summary;
mod verdict;

pub use config::PermutationConfig;
pub use engine::{
    CancelToken, Cohort, PermutationEngine, PermutationTestSpec, PermuteStrategy, Scorer,
    TestOutcome,
};
pub use scorers::{
    CategorizedSamples, CentroidCosineSeparation, EquivalenceClassMi, LabeledVectors,
    PairedSamples, ResidualRankCorrelation, ShuffleClassTable, ShuffleLabels, ShuffleOutcomes,
    ShuffleTarget,
};
pub use stats::{mean, pearson, quantile, ranks, spearman, std_dev};
pub use summary::{NullDistributionSummary, PercentileBands, Tail};
pub use verdict::{classify, Determination};
