//! End-to-end episode tests over the public environment API
//!
//! The broker, workload, and metrics feed are replaced with scripted
//! doubles; everything else is the real pipeline.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tuner_lib::broker::ConfigApplier;
use tuner_lib::error::{flags, EnvError};
use tuner_lib::knobs::ACTION_DIM;
use tuner_lib::models::topics;
use tuner_lib::sampler::MetricsSource;
use tuner_lib::workload::WorkloadDriver;
use tuner_lib::{EnvConfig, Environment, KnobSet, MetricSnapshot};

struct ScriptedApplier {
    fail_on_calls: Vec<u32>,
    calls: AtomicU32,
}

impl ScriptedApplier {
    fn reliable() -> Self {
        Self {
            fail_on_calls: Vec::new(),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ConfigApplier for ScriptedApplier {
    async fn apply(&mut self, _knobs: &KnobSet) -> Result<bool, EnvError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_calls.contains(&call) {
            return Err(EnvError::ProcessStart {
                reason: "broker never bound its port".into(),
            });
        }
        Ok(true)
    }

    fn broker_pid(&self) -> Option<u32> {
        Some(31337)
    }
}

struct ScriptedWorkload {
    fail_first_n: u32,
    restarts: Arc<AtomicU32>,
}

#[async_trait]
impl WorkloadDriver for ScriptedWorkload {
    async fn start(&mut self) -> Result<(), EnvError> {
        Ok(())
    }
    async fn stop(&mut self) {}
    async fn restart(&mut self) -> Result<(), EnvError> {
        let n = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first_n {
            Err(EnvError::WorkloadRestart {
                attempts: 1,
                reason: "publisher group exited immediately".into(),
            })
        } else {
            Ok(())
        }
    }
    fn is_running(&mut self) -> bool {
        true
    }
    async fn verify_traffic(&mut self) -> Result<(), EnvError> {
        Ok(())
    }
}

/// Replays a sequence of snapshots, holding the last one forever
struct ScriptedMetrics {
    script: Arc<Mutex<Vec<MetricSnapshot>>>,
    position: usize,
}

impl ScriptedMetrics {
    fn replaying(snapshots: Vec<MetricSnapshot>) -> Self {
        Self {
            script: Arc::new(Mutex::new(snapshots)),
            position: 0,
        }
    }
}

#[async_trait]
impl MetricsSource for ScriptedMetrics {
    async fn sample(
        &mut self,
        _window: Duration,
        _broker_pid: Option<u32>,
    ) -> Result<MetricSnapshot, EnvError> {
        let script = self.script.lock().unwrap();
        let index = self.position.min(script.len() - 1);
        self.position += 1;
        Ok(script[index].clone())
    }
}

fn snapshot(load_1min: f64, latency_p50: f64, latency_p95: f64) -> MetricSnapshot {
    MetricSnapshot {
        counters: HashMap::from([
            (topics::CLIENTS_CONNECTED.to_string(), 200.0),
            (topics::LOAD_RECEIVED_1MIN.to_string(), load_1min),
            (topics::MESSAGES_STORED.to_string(), 100.0),
            (topics::LATENCY_P50.to_string(), latency_p50),
            (topics::LATENCY_P95.to_string(), latency_p95),
        ]),
        captured_at: 0,
        cpu_ratio: 0.3,
        mem_ratio: 0.1,
        ctxt_ratio: 0.05,
    }
}

fn fast_config(max_steps: u32) -> EnvConfig {
    let mut cfg = EnvConfig::default();
    cfg.orchestrator.workload_settle_secs = 0;
    cfg.orchestrator.metrics_settle_secs = 0;
    cfg.orchestrator.max_steps = max_steps;
    cfg
}

#[tokio::test]
async fn improving_metrics_yield_positive_rewards() {
    let metrics = ScriptedMetrics::replaying(vec![
        snapshot(60_000.0, 50.0, 120.0), // reset baseline
        snapshot(90_000.0, 40.0, 100.0), // step 1: better
        snapshot(120_000.0, 30.0, 80.0), // step 2: better still
    ]);
    let mut env = Environment::new(
        fast_config(10),
        Box::new(ScriptedApplier::reliable()),
        Box::new(ScriptedWorkload {
            fail_first_n: 0,
            restarts: Arc::new(AtomicU32::new(0)),
        }),
        Box::new(metrics),
    );

    env.reset().await.unwrap();
    let first = env.step(&[0.6; ACTION_DIM]).await;
    let second = env.step(&[0.7; ACTION_DIM]).await;

    assert!(first.reward > 0.0, "reward was {}", first.reward);
    assert!(second.reward > 0.0, "reward was {}", second.reward);
    assert!(first.info.reward.throughput_improvement > 0.0);
    assert!(first.info.reward.latency_improvement > 0.0);
    assert!(second.state.throughput > first.state.throughput);
}

#[tokio::test]
async fn regressing_metrics_are_penalized() {
    let metrics = ScriptedMetrics::replaying(vec![
        snapshot(120_000.0, 30.0, 80.0),
        snapshot(30_000.0, 200.0, 500.0), // sharp regression
    ]);
    let mut env = Environment::new(
        fast_config(10),
        Box::new(ScriptedApplier::reliable()),
        Box::new(ScriptedWorkload {
            fail_first_n: 0,
            restarts: Arc::new(AtomicU32::new(0)),
        }),
        Box::new(metrics),
    );

    env.reset().await.unwrap();
    let outcome = env.step(&[0.2; ACTION_DIM]).await;

    assert!(outcome.reward < 0.0, "reward was {}", outcome.reward);
    assert!(outcome.info.reward.throughput_improvement < 0.0);
    assert!(outcome.info.reward.latency_improvement < 0.0);
    assert!(!outcome.done);
}

#[tokio::test]
async fn workload_flapping_is_absorbed_within_the_budget() {
    let restarts = Arc::new(AtomicU32::new(0));
    let mut env = Environment::new(
        fast_config(10),
        Box::new(ScriptedApplier::reliable()),
        // Two failed attempts, then healthy
        Box::new(ScriptedWorkload {
            fail_first_n: 2,
            restarts: restarts.clone(),
        }),
        Box::new(ScriptedMetrics::replaying(vec![snapshot(
            60_000.0, 50.0, 120.0,
        )])),
    );

    let outcome = env.step(&[0.5; ACTION_DIM]).await;

    assert!(!outcome.done);
    assert_eq!(restarts.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.info.workload_restarts, 3);
    assert!(!outcome
        .info
        .flags
        .contains(&flags::WORKLOAD_DEGRADED.to_string()));
}

#[tokio::test]
async fn broker_failure_mid_episode_terminates_with_penalty() {
    let mut env = Environment::new(
        fast_config(10),
        // reset ok, step 1 ok, step 2 fails
        Box::new(ScriptedApplier {
            fail_on_calls: vec![3],
            calls: AtomicU32::new(0),
        }),
        Box::new(ScriptedWorkload {
            fail_first_n: 0,
            restarts: Arc::new(AtomicU32::new(0)),
        }),
        Box::new(ScriptedMetrics::replaying(vec![snapshot(
            60_000.0, 50.0, 120.0,
        )])),
    );

    env.reset().await.unwrap();
    let healthy = env.step(&[0.5; ACTION_DIM]).await;
    assert!(!healthy.done);

    let failed = env.step(&[0.9; ACTION_DIM]).await;
    assert!(failed.done);
    assert_eq!(failed.reward, -3.0);
    assert!(failed
        .info
        .flags
        .contains(&flags::BROKER_FATAL.to_string()));
    assert!(failed.state.to_array().iter().all(|v| *v == 0.0));
}

#[tokio::test]
async fn environment_is_reusable_after_a_terminated_episode() {
    let mut env = Environment::new(
        fast_config(2),
        Box::new(ScriptedApplier::reliable()),
        Box::new(ScriptedWorkload {
            fail_first_n: 0,
            restarts: Arc::new(AtomicU32::new(0)),
        }),
        Box::new(ScriptedMetrics::replaying(vec![snapshot(
            60_000.0, 50.0, 120.0,
        )])),
    );

    env.reset().await.unwrap();
    env.step(&[0.5; ACTION_DIM]).await;
    let done = env.step(&[0.5; ACTION_DIM]).await;
    assert!(done.done);

    let state = env.reset().await.unwrap();
    assert!(state.is_finite());
    assert_eq!(env.episode().step, 0);
    let next = env.step(&[0.5; ACTION_DIM]).await;
    assert_eq!(next.info.step, 1);
    assert!(!next.done);
}
