// The permutation test engine.
//
// Shared shape across all analyzers: score the real data, then rebuild the
// same score under N randomized relabelings to form the null distribution.
// The observed statistic is computed inside a forbidden governor zone (a
// scorer must be analytically pure); the permutation stream runs inside a
// seeded zone whose seed is derived from the run seed plus the test
// identifier, so every null distribution is independently reproducible and
// its seed appears in the ledger.

use crate::governor::{GovernedRng, RandomnessGovernor};
use crate::id_service::DeterministicIdGenerator;
use crate::permutation::config::PermutationConfig;
use crate::permutation::summary::{NullDistributionSummary, Tail};
use crate::permutation::verdict::{classify, Determination};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Eligibility view of a dataset: how many groups it distinguishes and how
/// many observations it carries.
pub trait Cohort {
    fn group_count(&self) -> usize;
    fn sample_size(&self) -> usize;
}

/// A pluggable observed-statistic function.
///
/// Scorers must be analytically pure: the engine evaluates them inside a
/// forbidden zone, so any randomness primitive call inside `score` fails
/// with a violation.
pub trait Scorer<D: ?Sized> {
    fn score(&self, data: &D) -> Result<f64>;

    /// Effect-size magnitude of an observed score, on the scorer's own
    /// scale. Defaults to the absolute value.
    fn effect_size(&self, observed: f64) -> f64 {
        observed.abs()
    }
}

/// A pluggable permutation of the relevant axis (a label vector, a lookup
/// table, ...). Receives the governed generator of the seeded zone.
pub trait PermuteStrategy<D: ?Sized> {
    fn permute(&self, data: &mut D, rng: &mut GovernedRng) -> Result<()>;
}

/// Cooperative cancellation for long permutation loops.
///
/// Checked between iterations; a cancelled test yields a clearly tagged
/// `Cancelled` outcome, never a silently truncated summary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// One test to run: the dataset, its statistic, and its permutation axis.
pub struct PermutationTestSpec<'a, D> {
    /// Identifier embedded in outcome, ledger label, and stream derivation
    pub test_id: String,
    /// The observed dataset
    pub data: &'a D,
    /// Observed-statistic function
    pub scorer: &'a dyn Scorer<D>,
    /// Permutation-generation strategy
    pub strategy: &'a dyn PermuteStrategy<D>,
    /// Directional sense of the p-value
    pub tail: Tail,
    /// Explicit seed; defaults to the calling thread's active run seed
    pub seed: Option<u64>,
    /// Optional cooperative cancellation
    pub cancel: Option<&'a CancelToken>,
}

/// Structured result handed back to the analyzer and, from there, to the
/// provenance writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test_id: String,
    /// Observed statistic; None when the data was insufficient to score
    pub observed: Option<f64>,
    /// Permutations actually performed
    pub n_permutations: usize,
    /// Null-distribution summary; None for insufficient or cancelled tests
    pub summary: Option<NullDistributionSummary>,
    pub determination: Determination,
    /// Nested diagnostic counts and derivation details
    pub details: BTreeMap<String, serde_json::Value>,
    pub duration_seconds: f64,
}

enum LoopResult {
    Completed(Vec<f64>),
    Cancelled { completed: usize },
}

/// Runs permutation tests under a governor and a shared configuration.
pub struct PermutationEngine {
    governor: RandomnessGovernor,
    config: PermutationConfig,
}

impl PermutationEngine {
    /// Create an engine; fails on an invalid configuration.
    pub fn new(governor: RandomnessGovernor, config: PermutationConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid permutation config: {e}"))?;
        Ok(PermutationEngine { governor, config })
    }

    pub fn config(&self) -> &PermutationConfig {
        &self.config
    }

    /// Run one permutation test to completion (or to its designed terminal
    /// state: insufficient data, or cooperative cancellation).
    pub fn run<D: Clone + Cohort>(&self, spec: PermutationTestSpec<'_, D>) -> Result<TestOutcome> {
        let started = Instant::now();

        let groups = spec.data.group_count();
        let cohort = spec.data.sample_size();
        let mut details = BTreeMap::new();
        details.insert("group_count".to_string(), json!(groups));
        details.insert("sample_size".to_string(), json!(cohort));

        if groups < 2 {
            return Ok(self.insufficient(
                spec.test_id,
                format!("fewer than two eligible groups ({groups})"),
                details,
                started,
            ));
        }
        if cohort < self.config.min_group_size {
            return Ok(self.insufficient(
                spec.test_id,
                format!(
                    "cohort size {cohort} below minimum {}",
                    self.config.min_group_size
                ),
                details,
                started,
            ));
        }

        // The observed statistic must not depend on undeclared randomness.
        let observed = self
            .governor
            .assert_pure(&format!("observed:{}", spec.test_id), || {
                spec.scorer.score(spec.data)
            })
            .with_context(|| format!("scoring observed data for '{}'", spec.test_id))?;

        let base_seed = spec
            .seed
            .or_else(crate::run::active_seed)
            .context("no seed available: open a run or set PermutationTestSpec.seed")?;
        let stream_seed = DeterministicIdGenerator::new(base_seed)
            .fork(&spec.test_id)
            .seed();
        details.insert("base_seed".to_string(), json!(base_seed));
        details.insert("stream_seed".to_string(), json!(stream_seed));

        let label = format!("permutation:{}", spec.test_id);
        let n = self.config.n_permutations;
        let progress_every = self.config.progress_every;

        let loop_result = self.governor.with_seed(
            &label,
            stream_seed,
            "null distribution permutation stream",
            |rng| -> Result<LoopResult> {
                let mut scratch = spec.data.clone();
                let mut null = Vec::with_capacity(n);
                let mut running_sum = 0.0;

                for i in 0..n {
                    if let Some(token) = spec.cancel {
                        if token.is_cancelled() {
                            return Ok(LoopResult::Cancelled { completed: i });
                        }
                    }

                    spec.strategy
                        .permute(&mut scratch, rng)
                        .with_context(|| format!("permutation {i} of '{}'", spec.test_id))?;
                    let score = spec
                        .scorer
                        .score(&scratch)
                        .with_context(|| format!("scoring permutation {i} of '{}'", spec.test_id))?;
                    running_sum += score;
                    null.push(score);

                    let done = i + 1;
                    if done % progress_every == 0 && done < n {
                        tracing::info!(
                            test_id = %spec.test_id,
                            completed = done,
                            total = n,
                            elapsed_secs = started.elapsed().as_secs_f64(),
                            running_mean = running_sum / done as f64,
                            "permutation progress"
                        );
                    }
                }

                Ok(LoopResult::Completed(null))
            },
        )?;

        let effect = spec.scorer.effect_size(observed);
        details.insert("effect_size".to_string(), json!(effect));

        let outcome = match loop_result {
            LoopResult::Completed(null) => {
                let summary = NullDistributionSummary::from_null_samples(observed, &null, spec.tail);
                let determination = classify(summary.p_value, effect, &self.config);
                TestOutcome {
                    test_id: spec.test_id,
                    observed: Some(observed),
                    n_permutations: null.len(),
                    summary: Some(summary),
                    determination,
                    details,
                    duration_seconds: started.elapsed().as_secs_f64(),
                }
            }
            LoopResult::Cancelled { completed } => {
                tracing::warn!(
                    test_id = %spec.test_id,
                    completed,
                    total = n,
                    "permutation test cancelled"
                );
                TestOutcome {
                    test_id: spec.test_id,
                    observed: Some(observed),
                    n_permutations: completed,
                    summary: None,
                    determination: Determination::Cancelled { completed },
                    details,
                    duration_seconds: started.elapsed().as_secs_f64(),
                }
            }
        };

        Ok(outcome)
    }

    fn insufficient(
        &self,
        test_id: String,
        reason: String,
        details: BTreeMap<String, serde_json::Value>,
        started: Instant,
    ) -> TestOutcome {
        tracing::info!(test_id = %test_id, reason = %reason, "insufficient data for permutation test");
        TestOutcome {
            test_id,
            observed: None,
            n_permutations: 0,
            summary: None,
            determination: Determination::InsufficientData { reason },
            details,
            duration_seconds: started.elapsed().as_secs_f64(),
        }
    }
}
