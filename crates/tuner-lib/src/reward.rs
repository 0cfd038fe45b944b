//! Reward evaluation
//!
//! Scores consecutive observations into a scalar reward with a full
//! component breakdown. The weights deliberately favor relative improvement
//! over absolute performance: the objective is gain over the broker's
//! current operating point, not an absolute target.

use crate::models::{RewardBreakdown, StateVector};
use serde::Deserialize;

/// Reward weights; configuration, not logic
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    /// Absolute throughput term
    pub alpha: f32,
    /// Absolute latency term (applied negatively)
    pub beta: f32,
    /// Throughput-improvement term
    pub gamma: f32,
    /// Latency-improvement term
    pub delta: f32,
    /// Stability-penalty term
    pub epsilon: f32,
    /// Resource-penalty term
    pub zeta: f32,
    /// Thrashing coefficient inside the stability penalty
    pub stability_k: f32,
    /// CPU/memory utilization above which the resource penalty activates
    pub resource_threshold: f32,
    /// Linear penalty slope above the threshold
    pub resource_slope: f32,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            alpha: 10.0,
            beta: 5.0,
            gamma: 50.0,
            delta: 30.0,
            epsilon: 1.0,
            zeta: 1.0,
            stability_k: 2.0,
            resource_threshold: 0.9,
            resource_slope: 50.0,
        }
    }
}

/// Stateless evaluator over a weight set
#[derive(Debug, Clone)]
pub struct RewardEvaluator {
    weights: RewardWeights,
}

impl RewardEvaluator {
    pub fn new(weights: RewardWeights) -> Self {
        Self { weights }
    }

    /// Compute the reward for transitioning into `next`. Improvement terms
    /// are zero on the first step of an episode. Returns the breakdown and
    /// whether a non-finite total had to be replaced with zero.
    pub fn compute(
        &self,
        prev: Option<&StateVector>,
        next: &StateVector,
    ) -> (RewardBreakdown, bool) {
        let w = &self.weights;

        let throughput_abs = next.throughput;
        let latency_abs = next.latency_p50;

        let (throughput_improvement, latency_improvement) = match prev {
            Some(p) => (
                throughput_abs - p.throughput,
                // Lower latency is the improvement
                p.latency_p50 - latency_abs,
            ),
            None => (0.0, 0.0),
        };

        let stability_penalty = if prev.is_some() {
            -w.stability_k * (throughput_improvement.abs() + latency_improvement.abs())
        } else {
            0.0
        };

        let mut resource_penalty = 0.0;
        if next.cpu_ratio > w.resource_threshold {
            resource_penalty -= w.resource_slope * (next.cpu_ratio - w.resource_threshold);
        }
        if next.mem_ratio > w.resource_threshold {
            resource_penalty -= w.resource_slope * (next.mem_ratio - w.resource_threshold);
        }

        let total = w.alpha * throughput_abs
            + w.beta * (-latency_abs)
            + w.gamma * throughput_improvement
            + w.delta * latency_improvement
            + w.epsilon * stability_penalty
            + w.zeta * resource_penalty;

        let non_finite = !total.is_finite();
        let breakdown = RewardBreakdown {
            throughput_abs,
            latency_abs,
            throughput_improvement,
            latency_improvement,
            stability_penalty,
            resource_penalty,
            total: if non_finite { 0.0 } else { total },
        };
        (breakdown, non_finite)
    }
}
