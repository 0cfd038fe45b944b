//! Broker Tuner - smoke driver for the tuning environment
//!
//! Runs the environment against a live Mosquitto broker and a real
//! `emqtt_bench` workload, stepping with small perturbations around the
//! baseline configuration. Useful for validating an installation before
//! attaching a learning agent.

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tuner_lib::broker::MosquittoApplier;
use tuner_lib::knobs::{encode, ACTION_DIM};
use tuner_lib::sampler::{MqttSampler, ProcReader};
use tuner_lib::workload::WorkloadCoordinator;
use tuner_lib::{EnvConfig, Environment, KnobSet};

/// Baseline action with a small time-seeded perturbation on each channel,
/// clamped to the unit interval
fn jittered_action(step: u32) -> [f32; ACTION_DIM] {
    let mut action = encode(&KnobSet::default());
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let mut seed = u64::from(nanos) ^ (u64::from(step) << 32) | 1;
    for channel in action.iter_mut() {
        // xorshift64
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let unit = (seed >> 11) as f32 / (1u64 << 53) as f32;
        *channel = (*channel + (unit - 0.5) * 0.1).clamp(0.0, 1.0);
    }
    action
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting broker-tuner");

    let cfg = EnvConfig::load()?;
    info!(
        broker_port = cfg.broker.port,
        max_steps = cfg.orchestrator.max_steps,
        "environment configured"
    );

    let applier = MosquittoApplier::new(cfg.broker.clone());
    let workload =
        WorkloadCoordinator::new(cfg.workload.clone(), cfg.broker.host.clone(), cfg.broker.port);
    let proc_reader = ProcReader::new(cfg.proc.clone());
    let sampler = MqttSampler::new(
        cfg.sampler.clone(),
        cfg.broker.host.clone(),
        cfg.broker.port,
        proc_reader,
    );

    let mut env = Environment::new(
        cfg,
        Box::new(applier),
        Box::new(workload),
        Box::new(sampler),
    );

    let first = env.reset().await?;
    info!(observation = ?first.to_array(), "episode started");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut step = 0u32;
    loop {
        step += 1;
        let action = jittered_action(step);
        let outcome = tokio::select! {
            _ = &mut shutdown => {
                info!("SIGINT received; shutting down");
                break;
            }
            outcome = env.step(&action) => outcome,
        };

        info!(
            step = outcome.info.step,
            reward = outcome.reward,
            breakdown = %serde_json::to_string(&outcome.info.reward)?,
            flags = ?outcome.info.flags,
            "step complete"
        );
        if outcome.done {
            if !outcome.info.flags.is_empty() {
                warn!(flags = ?outcome.info.flags, "episode ended with warnings");
            }
            info!(
                steps = outcome.info.step,
                workload_restarts = outcome.info.workload_restarts,
                "episode complete"
            );
            break;
        }
    }

    Ok(())
}
