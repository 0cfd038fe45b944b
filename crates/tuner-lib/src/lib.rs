//! Environment orchestrator for reinforcement-learning broker tuning
//!
//! This crate provides the core functionality for:
//! - Decoding normalized control vectors into broker configuration knobs
//! - Applying configuration through a full broker stop/start cycle
//! - Driving an external synthetic workload process group
//! - Sampling broker metrics over MQTT and OS process counters
//! - Building observation vectors and scoring rewards
//! - The `reset`/`step` environment loop consumed by a learning agent

pub mod broker;
pub mod config;
pub mod env;
pub mod error;
pub mod knobs;
pub mod models;
pub mod poll;
pub mod process;
pub mod reward;
pub mod sampler;
pub mod state;
pub mod workload;

#[cfg(test)]
mod mqtt_stub;

pub use config::EnvConfig;
pub use env::{Environment, EpisodeState};
pub use error::EnvError;
pub use knobs::{KnobSet, KnobValue, ACTION_DIM};
pub use models::{MetricSnapshot, RewardBreakdown, StateVector, StepInfo, StepOutcome, STATE_DIM};
