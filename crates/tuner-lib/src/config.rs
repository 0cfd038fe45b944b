//! Environment configuration
//!
//! Every delay, budget, port and normalization constant in the pipeline is
//! configurable here; defaults are the empirically-tuned values for a stock
//! Mosquitto with `sys_interval 10`. Loaded from `TUNER_`-prefixed
//! environment variables with `__` as the section separator
//! (e.g. `TUNER_BROKER__PORT=1884`).

use crate::reward::RewardWeights;
use crate::workload::WorkloadSpec;
use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Broker process and configuration-file settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Broker executable; started with `-c <config_path>` as its sole
    /// configuration source
    pub binary: PathBuf,
    /// Where the rendered configuration document is written
    pub config_path: PathBuf,
    /// `$SYS` publish interval written into the rendered configuration
    pub sys_interval_secs: u64,
    /// SIGTERM grace before SIGKILL when stopping the broker
    pub stop_grace_ms: u64,
    pub port_release_attempts: u32,
    pub port_release_interval_ms: u64,
    /// Delay before checking whether the freshly-started process exited
    pub start_check_delay_ms: u64,
    /// Bind-readiness poll budget after start
    pub readiness_attempts: u32,
    pub readiness_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            binary: PathBuf::from("mosquitto"),
            config_path: PathBuf::from("broker_tuner.conf"),
            sys_interval_secs: 10,
            stop_grace_ms: 2000,
            port_release_attempts: 10,
            port_release_interval_ms: 500,
            start_check_delay_ms: 2000,
            readiness_attempts: 20,
            readiness_interval_ms: 1000,
        }
    }
}

impl BrokerConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
    pub fn port_release_interval(&self) -> Duration {
        Duration::from_millis(self.port_release_interval_ms)
    }
    pub fn start_check_delay(&self) -> Duration {
        Duration::from_millis(self.start_check_delay_ms)
    }
    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }
}

/// MQTT metrics-feed sampling settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub client_id: String,
    /// Subscription filters for the metrics feed
    pub topics: Vec<String>,
    pub keepalive_secs: u64,
    /// Full collection window per sample; counters arrive at different
    /// sub-intervals, so the window is never cut short
    pub window_secs: u64,
    pub connect_attempts: u32,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
    /// The 1-minute load counters are messages per minute; divide by this
    /// to get messages per second
    pub rate_1min_divisor: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            client_id: "broker-tuner-monitor".to_string(),
            topics: vec!["$SYS/#".to_string()],
            keepalive_secs: 30,
            window_secs: 12,
            connect_attempts: 3,
            connect_timeout_secs: 5,
            reconnect_delay_ms: 1000,
            rate_1min_divisor: 60.0,
        }
    }
}

impl SamplerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Normalization references for OS process readings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcConfig {
    /// Kernel clock ticks per second (USER_HZ)
    pub cpu_tick_hz: f64,
    /// Resident memory that counts as ratio 1.0
    pub mem_norm_bytes: u64,
    /// Context switches per window that count as ratio 1.0
    pub ctxt_norm: f64,
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self {
            cpu_tick_hz: 100.0,
            mem_norm_bytes: 1024 * 1024 * 1024,
            ctxt_norm: 1e6,
        }
    }
}

/// Fixed reference constants for observation normalization
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateNorms {
    /// Connection count that normalizes to 1.0
    pub connections: f64,
    /// Messages per second that normalize to 1.0
    pub msg_rate: f64,
    /// Latency in milliseconds that normalizes to 1.0
    pub latency_ms: f64,
    /// Queued message count that normalizes to 1.0
    pub queue_depth: f64,
    /// Stand-in latency percentiles when the feed publishes none
    pub latency_fallback_p50_ms: f64,
    pub latency_fallback_p95_ms: f64,
}

impl Default for StateNorms {
    fn default() -> Self {
        Self {
            connections: 1000.0,
            msg_rate: 10_000.0,
            latency_ms: 1000.0,
            queue_depth: 10_000.0,
            latency_fallback_p50_ms: 20.0,
            latency_fallback_p95_ms: 80.0,
        }
    }
}

/// Workload generator settings: the process side plus the per-episode spec
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// `emqtt_bench`-compatible load generator executable
    pub bench_binary: PathBuf,
    /// Delay before checking whether a freshly-spawned group exited
    pub startup_check_delay_ms: u64,
    /// SIGTERM grace before SIGKILL when stopping a group
    pub stop_grace_ms: u64,
    /// Pause between stop and start during a restart
    pub restart_pause_ms: u64,
    /// Loopback traffic-verification window
    pub verify_timeout_secs: u64,
    /// The load shape held constant across every step of an episode
    pub spec: WorkloadSpec,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            bench_binary: PathBuf::from("emqtt_bench"),
            startup_check_delay_ms: 1000,
            stop_grace_ms: 5000,
            restart_pause_ms: 1000,
            verify_timeout_secs: 5,
            spec: WorkloadSpec::default(),
        }
    }
}

impl WorkloadConfig {
    pub fn startup_check_delay(&self) -> Duration {
        Duration::from_millis(self.startup_check_delay_ms)
    }
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

/// Step-pipeline sequencing and budgets
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Episode length; `done` turns true at this step count
    pub max_steps: u32,
    /// Settle time after a workload restart before trusting traffic
    pub workload_settle_secs: u64,
    /// Settle time after a broker restart before trusting the `$SYS` feed;
    /// must outlast the broker's own publish interval
    pub metrics_settle_secs: u64,
    /// Workload restart attempts per step before degrading the step
    pub workload_retry_budget: u32,
    /// Sampling attempts per step before substituting a zero snapshot
    pub sampling_retries: u32,
    /// Reward substituted when the broker fails fatally mid-step
    pub failed_step_penalty: f32,
    /// Rolling-window length for throughput/latency smoothing
    pub history_window: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: 200,
            workload_settle_secs: 30,
            metrics_settle_secs: 12,
            workload_retry_budget: 3,
            sampling_retries: 3,
            failed_step_penalty: -3.0,
            history_window: 5,
        }
    }
}

impl OrchestratorConfig {
    pub fn workload_settle(&self) -> Duration {
        Duration::from_secs(self.workload_settle_secs)
    }
    pub fn metrics_settle(&self) -> Duration {
        Duration::from_secs(self.metrics_settle_secs)
    }
}

/// Top-level environment configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub broker: BrokerConfig,
    pub sampler: SamplerConfig,
    pub proc: ProcConfig,
    pub norms: StateNorms,
    pub weights: RewardWeights,
    pub workload: WorkloadConfig,
    pub orchestrator: OrchestratorConfig,
}

impl EnvConfig {
    /// Load configuration from `TUNER_`-prefixed environment variables,
    /// falling back to defaults for anything unset
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("TUNER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }
}
