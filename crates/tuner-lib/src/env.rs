//! The apply-measure-score environment loop
//!
//! `reset` brings the broker to its baseline configuration and returns the
//! first observation; `step` decodes an action, applies it, restarts the
//! workload when the broker restarted underneath it, settles, samples, and
//! scores. Only a broker that cannot be brought back up ends an episode
//! early; every other failure degrades the step and raises a flag.

use crate::broker::ConfigApplier;
use crate::config::EnvConfig;
use crate::error::{flags, EnvError};
use crate::knobs::{decode, KnobSet, ACTION_DIM};
use crate::models::{MetricSnapshot, RewardBreakdown, StateVector, StepInfo, StepOutcome};
use crate::reward::RewardEvaluator;
use crate::sampler::MetricsSource;
use crate::state::{RollingHistory, StateBuilder};
use crate::workload::WorkloadDriver;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Where the step pipeline currently is; surfaced for logging and
/// introspection, never branched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ApplyingConfig,
    BrokerRestarting,
    WorkloadRestarting,
    Stabilizing,
    MetricSettling,
    Sampling,
    Scoring,
}

/// Everything that belongs to one episode and nothing that survives it
#[derive(Debug, Clone)]
pub struct EpisodeState {
    /// Steps completed since the last reset
    pub step: u32,
    /// Step indices at which the broker was restarted
    pub restart_steps: Vec<u32>,
    /// Cumulative workload restart attempts
    pub workload_restarts: u32,
    pub prev_state: Option<StateVector>,
    pub prev_breakdown: Option<RewardBreakdown>,
    pub history: RollingHistory,
}

impl EpisodeState {
    fn new(history_window: usize) -> Self {
        Self {
            step: 0,
            restart_steps: Vec::new(),
            workload_restarts: 0,
            prev_state: None,
            prev_breakdown: None,
            history: RollingHistory::new(history_window),
        }
    }
}

/// Orchestrates one live broker, one workload, and one metrics feed
pub struct Environment {
    applier: Box<dyn ConfigApplier>,
    workload: Box<dyn WorkloadDriver>,
    metrics: Box<dyn MetricsSource>,
    state_builder: StateBuilder,
    evaluator: RewardEvaluator,
    cfg: EnvConfig,
    episode: EpisodeState,
    phase: Phase,
}

impl Environment {
    pub fn new(
        cfg: EnvConfig,
        applier: Box<dyn ConfigApplier>,
        workload: Box<dyn WorkloadDriver>,
        metrics: Box<dyn MetricsSource>,
    ) -> Self {
        let state_builder = StateBuilder::new(cfg.norms.clone());
        let evaluator = RewardEvaluator::new(cfg.weights.clone());
        let episode = EpisodeState::new(cfg.orchestrator.history_window);
        Self {
            applier,
            workload,
            metrics,
            state_builder,
            evaluator,
            cfg,
            episode,
            phase: Phase::Idle,
        }
    }

    pub fn episode(&self) -> &EpisodeState {
        &self.episode
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Start a new episode: baseline configuration, fresh workload, first
    /// observation. Fails only if the broker cannot be started at all.
    pub async fn reset(&mut self) -> Result<StateVector, EnvError> {
        info!("environment reset");
        self.episode = EpisodeState::new(self.cfg.orchestrator.history_window);

        let baseline = KnobSet::default();
        self.phase = Phase::ApplyingConfig;
        self.applier.apply(&baseline).await?;

        self.phase = Phase::WorkloadRestarting;
        if let Err(e) = self.restart_workload_with_budget().await {
            warn!(error = %e, "workload did not come up on reset; continuing");
        }

        self.phase = Phase::Stabilizing;
        sleep(self.cfg.orchestrator.workload_settle()).await;
        self.phase = Phase::MetricSettling;
        sleep(self.cfg.orchestrator.metrics_settle()).await;

        self.phase = Phase::Sampling;
        let (snapshot, _) = self.sample_with_retries().await;
        let (state, _) = self.state_builder.build(
            &snapshot,
            &self.episode.history,
            self.cfg.sampler.rate_1min_divisor,
        );

        self.episode.prev_state = Some(state.clone());
        self.episode
            .history
            .push(state.throughput, state.latency_p50);
        self.phase = Phase::Idle;
        Ok(state)
    }

    /// One apply-measure-score cycle
    pub async fn step(&mut self, action: &[f32; ACTION_DIM]) -> StepOutcome {
        self.episode.step += 1;
        let step = self.episode.step;
        let knobs = decode(action);
        let mut raised: Vec<String> = Vec::new();
        info!(step, "step begin");

        self.phase = Phase::ApplyingConfig;
        let restarted = match self.applier.apply(&knobs).await {
            Ok(restarted) => restarted,
            Err(e) if e.is_fatal() => {
                error!(step, error = %e, "broker unusable; terminating episode");
                return self.failed_outcome(knobs, e.flag());
            }
            Err(e) => {
                warn!(step, error = %e, "non-fatal apply failure; continuing");
                raised.push(e.flag().to_string());
                false
            }
        };

        if restarted {
            self.phase = Phase::BrokerRestarting;
            self.episode.restart_steps.push(step);
            self.phase = Phase::WorkloadRestarting;
            if let Err(e) = self.restart_workload_with_budget().await {
                warn!(step, error = %e, "workload restart budget exhausted");
                raised.push(flags::WORKLOAD_DEGRADED.to_string());
            }
        }

        self.phase = Phase::Stabilizing;
        sleep(self.cfg.orchestrator.workload_settle()).await;
        self.phase = Phase::MetricSettling;
        sleep(self.cfg.orchestrator.metrics_settle()).await;

        self.phase = Phase::Sampling;
        let (snapshot, sampling_failed) = self.sample_with_retries().await;
        if sampling_failed {
            raised.push(flags::SAMPLING_FAILED.to_string());
        }

        self.phase = Phase::Scoring;
        let (state, state_flags) = self.state_builder.build(
            &snapshot,
            &self.episode.history,
            self.cfg.sampler.rate_1min_divisor,
        );
        raised.extend(state_flags);

        let (breakdown, non_finite) = self
            .evaluator
            .compute(self.episode.prev_state.as_ref(), &state);
        if non_finite {
            raised.push(flags::REWARD_NON_FINITE.to_string());
        }

        self.episode
            .history
            .push(state.throughput, state.latency_p50);
        self.episode.prev_state = Some(state.clone());
        self.episode.prev_breakdown = Some(breakdown);
        self.phase = Phase::Idle;

        let done = step >= self.cfg.orchestrator.max_steps;
        info!(
            step,
            reward = breakdown.total,
            done,
            flags = ?raised,
            "step complete"
        );
        StepOutcome {
            state,
            reward: breakdown.total,
            done,
            info: StepInfo {
                knobs,
                step,
                workload_restarts: self.episode.workload_restarts,
                flags: raised,
                reward: breakdown,
            },
        }
    }

    /// Terminal outcome for a step whose broker could not be brought up.
    /// The observation is all zeros; the penalty is the configured constant.
    fn failed_outcome(&mut self, knobs: KnobSet, flag: &str) -> StepOutcome {
        let penalty = self.cfg.orchestrator.failed_step_penalty;
        let breakdown = RewardBreakdown {
            total: penalty,
            ..RewardBreakdown::default()
        };
        self.phase = Phase::Idle;
        StepOutcome {
            state: StateVector::zeroed(),
            reward: penalty,
            done: true,
            info: StepInfo {
                knobs,
                step: self.episode.step,
                workload_restarts: self.episode.workload_restarts,
                flags: vec![flag.to_string()],
                reward: breakdown,
            },
        }
    }

    /// Restart the workload, verifying traffic flows, until it comes up or
    /// the retry budget runs out. Every attempt counts toward the episode
    /// total the agent sees.
    async fn restart_workload_with_budget(&mut self) -> Result<(), EnvError> {
        let budget = self.cfg.orchestrator.workload_retry_budget;
        let mut last_reason = String::new();
        for attempt in 1..=budget {
            // The baseline bring-up during reset is not a restart the
            // agent's action caused; only in-step attempts count
            if self.episode.step > 0 {
                self.episode.workload_restarts += 1;
            }
            match self.workload.restart().await {
                Ok(()) => match self.workload.verify_traffic().await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(attempt, error = %e, "workload up but traffic probe failed");
                        last_reason = e.to_string();
                    }
                },
                Err(e) => {
                    warn!(attempt, error = %e, "workload restart attempt failed");
                    last_reason = e.to_string();
                }
            }
        }
        Err(EnvError::WorkloadRestart {
            attempts: budget,
            reason: last_reason,
        })
    }

    /// Sample within the retry budget; exhaustion degrades to an all-zero
    /// snapshot rather than failing the step.
    async fn sample_with_retries(&mut self) -> (MetricSnapshot, bool) {
        let window = self.cfg.sampler.window();
        let pid = self.applier.broker_pid();
        for attempt in 1..=self.cfg.orchestrator.sampling_retries {
            match self.metrics.sample(window, pid).await {
                Ok(snapshot) => return (snapshot, false),
                Err(e) => {
                    warn!(attempt, error = %e, "sampling attempt failed");
                }
            }
        }
        (MetricSnapshot::zeroed(), true)
    }
}
