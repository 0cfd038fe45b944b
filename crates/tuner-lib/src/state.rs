//! Observation building
//!
//! Pure transformation from a metrics snapshot plus rolling history into the
//! fixed-dimension observation vector. Raw metrics are normalized by fixed
//! reference constants; anything missing or non-finite becomes 0 with a
//! named diagnostic flag, so the vector itself is always finite.

use crate::config::StateNorms;
use crate::error::flags;
use crate::models::{topics, MetricSnapshot, StateVector};
use std::collections::VecDeque;

/// Bounded history of recent per-step measurements, used to smooth the
/// noisy throughput and latency channels
#[derive(Debug, Clone)]
pub struct RollingHistory {
    throughput: VecDeque<f32>,
    latency: VecDeque<f32>,
    window: usize,
}

impl RollingHistory {
    pub fn new(window: usize) -> Self {
        Self {
            throughput: VecDeque::with_capacity(window),
            latency: VecDeque::with_capacity(window),
            window: window.max(1),
        }
    }

    /// Record the measurements of a completed step, evicting the oldest
    /// entry once the window is full
    pub fn push(&mut self, throughput: f32, latency: f32) {
        if self.throughput.len() == self.window {
            self.throughput.pop_front();
        }
        if self.latency.len() == self.window {
            self.latency.pop_front();
        }
        self.throughput.push_back(throughput);
        self.latency.push_back(latency);
    }

    pub fn throughput_avg(&self) -> f32 {
        mean(&self.throughput)
    }

    pub fn latency_avg(&self) -> f32 {
        mean(&self.latency)
    }

    pub fn len(&self) -> usize {
        self.throughput.len()
    }

    pub fn is_empty(&self) -> bool {
        self.throughput.is_empty()
    }
}

fn mean(values: &VecDeque<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// Builds observation vectors from snapshots
#[derive(Debug, Clone)]
pub struct StateBuilder {
    norms: StateNorms,
}

impl StateBuilder {
    pub fn new(norms: StateNorms) -> Self {
        Self { norms }
    }

    /// Build an observation from one snapshot and the episode history.
    /// Returns the vector plus any diagnostic flags raised while
    /// sanitizing inputs.
    pub fn build(
        &self,
        snapshot: &MetricSnapshot,
        history: &RollingHistory,
        rate_1min_divisor: f64,
    ) -> (StateVector, Vec<String>) {
        let mut raised = Vec::new();

        let connections =
            snapshot.counter(topics::CLIENTS_CONNECTED).unwrap_or(0.0) / self.norms.connections;

        // Rate-windowed counters survive broker restarts; the cumulative
        // counter resets and would corrupt the rate, so it is only a
        // last resort
        let msg_per_sec = match snapshot.counter(topics::LOAD_RECEIVED_1MIN) {
            Some(per_min) => per_min / rate_1min_divisor,
            None => snapshot.counter(topics::MESSAGES_RECEIVED).unwrap_or(0.0),
        };
        let throughput = msg_per_sec / self.norms.msg_rate;

        let (latency_p50_ms, latency_p95_ms) = match (
            snapshot.counter(topics::LATENCY_P50),
            snapshot.counter(topics::LATENCY_P95),
        ) {
            (Some(p50), Some(p95)) => (p50, p95),
            _ => {
                raised.push(flags::LATENCY_FALLBACK.to_string());
                (
                    self.norms.latency_fallback_p50_ms,
                    self.norms.latency_fallback_p95_ms,
                )
            }
        };

        let queue_depth =
            snapshot.counter(topics::MESSAGES_STORED).unwrap_or(0.0) / self.norms.queue_depth;

        let state = StateVector {
            connections: sanitize("connections", connections as f32, &mut raised),
            throughput: sanitize("throughput", throughput as f32, &mut raised),
            cpu_ratio: sanitize("cpu_ratio", snapshot.cpu_ratio, &mut raised),
            mem_ratio: sanitize("mem_ratio", snapshot.mem_ratio, &mut raised),
            ctxt_ratio: sanitize("ctxt_ratio", snapshot.ctxt_ratio, &mut raised),
            latency_p50: sanitize(
                "latency_p50",
                (latency_p50_ms / self.norms.latency_ms) as f32,
                &mut raised,
            ),
            latency_p95: sanitize(
                "latency_p95",
                (latency_p95_ms / self.norms.latency_ms) as f32,
                &mut raised,
            ),
            queue_depth: sanitize("queue_depth", queue_depth as f32, &mut raised),
            throughput_avg: sanitize("throughput_avg", history.throughput_avg(), &mut raised),
            latency_avg: sanitize("latency_avg", history.latency_avg(), &mut raised),
        };

        debug_assert!(state.is_finite());
        (state, raised)
    }
}

/// Replace a non-finite channel with 0 and record which one was invalid
fn sanitize(field: &str, value: f32, raised: &mut Vec<String>) -> f32 {
    if value.is_finite() {
        value
    } else {
        raised.push(format!("non_finite:{field}"));
        0.0
    }
}
