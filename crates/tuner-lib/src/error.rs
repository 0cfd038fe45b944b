//! Failure taxonomy for the environment pipeline
//!
//! Only conditions that leave the broker itself unusable are fatal; every
//! other failure degrades the step and surfaces as a diagnostic flag in the
//! step info so the agent keeps receiving a signal.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    /// The rendered broker configuration could not be written. Fatal.
    #[error("failed to write broker configuration {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The broker process exited immediately or never bound its port. Fatal.
    #[error("broker failed to start: {reason}")]
    ProcessStart { reason: String },

    /// A bounded readiness poll ran out of attempts.
    #[error("{subject} not ready after {attempts} attempts")]
    ReadinessTimeout { subject: String, attempts: u32 },

    /// The workload process group could not be restarted.
    #[error("workload restart failed after {attempts} attempts: {reason}")]
    WorkloadRestart { attempts: u32, reason: String },

    /// No metrics connection could be established within the retry budget.
    /// An all-zero counter map from a live connection is NOT this error.
    #[error("metrics sampling failed: {reason}")]
    Sampling { reason: String },

    /// Reward computation produced a non-finite value.
    #[error("reward computation produced a non-finite value")]
    RewardComputation,
}

impl EnvError {
    /// Whether this failure terminates the episode. Everything non-fatal is
    /// handled in-pipeline with retries or zero-filled substitutes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EnvError::ConfigWrite { .. } | EnvError::ProcessStart { .. }
        )
    }

    /// The diagnostic flag this failure raises in step info
    pub fn flag(&self) -> &'static str {
        match self {
            EnvError::ConfigWrite { .. } | EnvError::ProcessStart { .. } => flags::BROKER_FATAL,
            EnvError::ReadinessTimeout { .. } => flags::READINESS_TIMEOUT,
            EnvError::WorkloadRestart { .. } => flags::WORKLOAD_DEGRADED,
            EnvError::Sampling { .. } => flags::SAMPLING_FAILED,
            EnvError::RewardComputation => flags::REWARD_NON_FINITE,
        }
    }
}

/// Diagnostic flag names carried in step info
pub mod flags {
    /// The metrics feed produced no usable sample; a zero snapshot was used.
    pub const SAMPLING_FAILED: &str = "sampling_failed";
    /// Workload restart retries were exhausted; metrics may reflect silence.
    pub const WORKLOAD_DEGRADED: &str = "workload_degraded";
    /// Latency percentiles came from configured fallbacks, not the feed.
    pub const LATENCY_FALLBACK: &str = "latency_fallback";
    /// Reward total was non-finite and replaced with zero.
    pub const REWARD_NON_FINITE: &str = "reward_non_finite";
    /// The broker became unusable; the episode terminated.
    pub const BROKER_FATAL: &str = "broker_fatal";
    /// Broker readiness polling timed out; proceeding best-effort.
    pub const READINESS_TIMEOUT: &str = "readiness_timeout";
}
