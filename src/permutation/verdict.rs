// Determination verdicts: the categorical half of a test outcome.
//
// The classification is a joint rule over the p-value AND a minimum
// effect-size floor, never the p-value alone. A microscopic effect with a
// tiny p-value is real but negligible; it classifies as Indeterminate.

use crate::permutation::config::PermutationConfig;
use serde::{Deserialize, Serialize};

/// Categorical outcome of a permutation test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Determination {
    /// p-value below the significance level AND effect size above the floor
    Significant,

    /// Statistically significant but the effect is below the floor, or the
    /// evidence is otherwise inconclusive
    Indeterminate,

    /// No statistically significant departure from the null
    Null,

    /// The input cannot support a meaningful test. A designed terminal
    /// state, not an error.
    InsufficientData { reason: String },

    /// The permutation loop was cancelled cooperatively after `completed`
    /// iterations; the partial null distribution was discarded.
    Cancelled { completed: usize },
}

impl Determination {
    /// True only for a completed, jointly significant result.
    pub fn is_significant(&self) -> bool {
        matches!(self, Determination::Significant)
    }
}

/// Classify a completed test under the joint rule.
///
/// `effect_size` is the magnitude the observed statistic represents on the
/// scorer's own scale (e.g., |rho| for a rank correlation).
pub fn classify(p_value: f64, effect_size: f64, config: &PermutationConfig) -> Determination {
    if p_value < config.significance_level {
        if effect_size.abs() >= config.min_effect_size {
            Determination::Significant
        } else {
            Determination::Indeterminate
        }
    } else {
        Determination::Null
    }
}
