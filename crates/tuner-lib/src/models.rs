//! Core data models for the tuner environment

use crate::knobs::KnobSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Observation vector dimension
pub const STATE_DIM: usize = 10;

/// Well-known `$SYS` topics the state builder reads
pub mod topics {
    pub const CLIENTS_CONNECTED: &str = "$SYS/broker/clients/connected";
    pub const MESSAGES_RECEIVED: &str = "$SYS/broker/messages/received";
    pub const LOAD_RECEIVED_1MIN: &str = "$SYS/broker/load/messages/received/1min";
    pub const MESSAGES_STORED: &str = "$SYS/broker/messages/stored";
    pub const LATENCY_P50: &str = "$SYS/broker/latency/p50";
    pub const LATENCY_P95: &str = "$SYS/broker/latency/p95";
}

/// One time-windowed capture of the broker metrics feed plus OS-level
/// process readings. Created fresh each sampling call and superseded, never
/// merged, by the next snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Named numeric counters/gauges keyed by `$SYS` topic
    pub counters: HashMap<String, f64>,
    /// Capture timestamp (end of the sampling window)
    pub captured_at: i64,
    /// Broker process CPU time over the window, normalized to [0, 1]
    pub cpu_ratio: f32,
    /// Broker resident memory against the configured reference, [0, 1]
    pub mem_ratio: f32,
    /// Context switches over the window against the configured reference
    pub ctxt_ratio: f32,
}

impl MetricSnapshot {
    /// An all-zero snapshot, used when sampling degrades past its retry
    /// budget. Zero counters are a valid measurement; the caller flags the
    /// degradation separately.
    pub fn zeroed() -> Self {
        Self {
            counters: HashMap::new(),
            captured_at: chrono::Utc::now().timestamp(),
            cpu_ratio: 0.0,
            mem_ratio: 0.0,
            ctxt_ratio: 0.0,
        }
    }

    pub fn counter(&self, topic: &str) -> Option<f64> {
        self.counters.get(topic).copied()
    }
}

/// Fixed-dimension observation exposed to the agent. Every field is finite;
/// the state builder substitutes 0 for invalid inputs before exposure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    pub connections: f32,
    pub throughput: f32,
    pub cpu_ratio: f32,
    pub mem_ratio: f32,
    pub ctxt_ratio: f32,
    pub latency_p50: f32,
    pub latency_p95: f32,
    pub queue_depth: f32,
    pub throughput_avg: f32,
    pub latency_avg: f32,
}

impl StateVector {
    pub fn zeroed() -> Self {
        Self {
            connections: 0.0,
            throughput: 0.0,
            cpu_ratio: 0.0,
            mem_ratio: 0.0,
            ctxt_ratio: 0.0,
            latency_p50: 0.0,
            latency_p95: 0.0,
            queue_depth: 0.0,
            throughput_avg: 0.0,
            latency_avg: 0.0,
        }
    }

    pub fn to_array(&self) -> [f32; STATE_DIM] {
        [
            self.connections,
            self.throughput,
            self.cpu_ratio,
            self.mem_ratio,
            self.ctxt_ratio,
            self.latency_p50,
            self.latency_p95,
            self.queue_depth,
            self.throughput_avg,
            self.latency_avg,
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

/// Named reward components plus the final scalar. Recomputed fully each
/// step, never accumulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub throughput_abs: f32,
    pub latency_abs: f32,
    pub throughput_improvement: f32,
    pub latency_improvement: f32,
    pub stability_penalty: f32,
    pub resource_penalty: f32,
    pub total: f32,
}

/// Per-step diagnostics returned alongside the observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    /// The configuration that was applied for this step
    pub knobs: KnobSet,
    /// Current step index within the episode (1-based; 0 after reset)
    pub step: u32,
    /// Cumulative workload restart attempts this episode
    pub workload_restarts: u32,
    /// Diagnostic flags raised during the step
    pub flags: Vec<String>,
    /// Full reward component breakdown
    pub reward: RewardBreakdown,
}

/// Result of one apply-measure-score cycle
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub state: StateVector,
    pub reward: f32,
    pub done: bool,
    pub info: StepInfo,
}

/// Lifecycle state of an externally-owned process or process group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}
