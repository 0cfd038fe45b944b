//! Broker metrics capture
//!
//! A persistent MQTT client subscribes to the broker's `$SYS` tree and
//! drains retained publishes for a fixed window. Payloads are numeric
//! strings or JSON objects with a `value` field; anything else is skipped.
//! OS-level readings for the broker pid are folded into the same snapshot.

mod procfs;

pub use procfs::{ProcReader, ProcReading};

use crate::config::SamplerConfig;
use crate::error::EnvError;
use crate::models::MetricSnapshot;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

/// Seam between the orchestrator and the metrics feed
#[async_trait]
pub trait MetricsSource: Send {
    /// Capture one windowed snapshot. `broker_pid` enables OS-level
    /// readings; an all-zero counter map from a live connection is a valid
    /// sample, not an error.
    async fn sample(
        &mut self,
        window: Duration,
        broker_pid: Option<u32>,
    ) -> Result<MetricSnapshot, EnvError>;
}

/// Parse a metrics payload into a number. Accepts bare numerics, numbers
/// with trailing units, and JSON objects carrying a `value` field.
pub fn parse_payload(payload: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if let Ok(v) = text.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    if let Some(first) = text.split_whitespace().next() {
        if let Ok(v) = first.parse::<f64>() {
            return v.is_finite().then_some(v);
        }
    }
    let json: serde_json::Value = serde_json::from_str(text).ok()?;
    json.get("value").and_then(serde_json::Value::as_f64)
}

/// Windowed `$SYS` sampler over a persistent broker connection
pub struct MqttSampler {
    cfg: SamplerConfig,
    broker_host: String,
    broker_port: u16,
    connection: Option<(AsyncClient, EventLoop)>,
    proc: ProcReader,
}

impl MqttSampler {
    pub fn new(
        cfg: SamplerConfig,
        broker_host: impl Into<String>,
        broker_port: u16,
        proc: ProcReader,
    ) -> Self {
        Self {
            cfg,
            broker_host: broker_host.into(),
            broker_port,
            connection: None,
            proc,
        }
    }

    /// Connect and subscribe, waiting for the broker's ConnAck. Each broker
    /// restart invalidates the session, so reconnects are routine.
    async fn connect_once(&mut self) -> Result<(AsyncClient, EventLoop), EnvError> {
        let mut options = MqttOptions::new(
            self.cfg.client_id.clone(),
            self.broker_host.clone(),
            self.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(self.cfg.keepalive_secs));
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let acked = timeout(self.cfg.connect_timeout(), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }
        })
        .await;
        match acked {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(EnvError::Sampling {
                    reason: format!("connect failed: {e}"),
                })
            }
            Err(_) => {
                return Err(EnvError::Sampling {
                    reason: format!(
                        "no ConnAck within {}s",
                        self.cfg.connect_timeout().as_secs()
                    ),
                })
            }
        }

        for topic in &self.cfg.topics {
            client
                .subscribe(topic.clone(), QoS::AtMostOnce)
                .await
                .map_err(|e| EnvError::Sampling {
                    reason: format!("subscribe {topic} failed: {e}"),
                })?;
        }
        Ok((client, eventloop))
    }

    async fn ensure_connected(&mut self) -> Result<(), EnvError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let mut last_reason = String::new();
        for attempt in 1..=self.cfg.connect_attempts {
            match self.connect_once().await {
                Ok(conn) => {
                    debug!(attempt, "metrics connection established");
                    self.connection = Some(conn);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "metrics connection attempt failed");
                    last_reason = e.to_string();
                    if attempt < self.cfg.connect_attempts {
                        sleep(self.cfg.reconnect_delay()).await;
                    }
                }
            }
        }
        Err(EnvError::Sampling {
            reason: format!(
                "no connection after {} attempts: {last_reason}",
                self.cfg.connect_attempts
            ),
        })
    }

    /// Drain publishes until the window deadline. A mid-window connection
    /// loss triggers one reconnect; if that fails too, whatever was captured
    /// so far stands.
    async fn drain_window(&mut self, window: Duration) -> HashMap<String, f64> {
        let mut counters = HashMap::new();
        let deadline = Instant::now() + window;
        let mut reconnected = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some((_, eventloop)) = self.connection.as_mut() else {
                break;
            };
            match timeout(remaining, eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    if let Some(value) = parse_payload(&publish.payload) {
                        counters.insert(publish.topic.clone(), value);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "metrics connection lost mid-window");
                    self.connection = None;
                    if reconnected || self.ensure_connected().await.is_err() {
                        break;
                    }
                    reconnected = true;
                }
                Err(_) => break, // window elapsed
            }
        }
        counters
    }
}

#[async_trait]
impl MetricsSource for MqttSampler {
    async fn sample(
        &mut self,
        window: Duration,
        broker_pid: Option<u32>,
    ) -> Result<MetricSnapshot, EnvError> {
        self.ensure_connected().await?;
        let counters = self.drain_window(window).await;
        debug!(topics = counters.len(), "metrics window drained");

        let reading = match broker_pid {
            Some(pid) => self.proc.read(pid, window),
            None => ProcReading::default(),
        };

        Ok(MetricSnapshot {
            counters,
            captured_at: chrono::Utc::now().timestamp(),
            cpu_ratio: reading.cpu_ratio,
            mem_ratio: reading.mem_ratio,
            ctxt_ratio: reading.ctxt_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcConfig;

    #[test]
    fn test_parse_bare_numeric_payloads() {
        assert_eq!(parse_payload(b"42"), Some(42.0));
        assert_eq!(parse_payload(b"  123.45 \n"), Some(123.45));
        assert_eq!(parse_payload(b"0"), Some(0.0));
    }

    #[test]
    fn test_parse_numeric_with_trailing_unit() {
        assert_eq!(parse_payload(b"17 seconds"), Some(17.0));
    }

    #[test]
    fn test_parse_json_value_field() {
        assert_eq!(parse_payload(br#"{"value": 9.5}"#), Some(9.5));
        assert_eq!(parse_payload(br#"{"value": 120, "unit": "ms"}"#), Some(120.0));
    }

    #[test]
    fn test_non_numeric_payloads_are_skipped() {
        assert_eq!(parse_payload(b"mosquitto version 2.0.18"), None);
        assert_eq!(parse_payload(br#"{"other": 1}"#), None);
        assert_eq!(parse_payload(b"NaN"), None);
        assert_eq!(parse_payload(&[0xff, 0xfe]), None);
    }

    fn sampler_on(port: u16) -> MqttSampler {
        let cfg = SamplerConfig {
            connect_attempts: 1,
            connect_timeout_secs: 2,
            reconnect_delay_ms: 10,
            ..Default::default()
        };
        MqttSampler::new(cfg, "127.0.0.1", port, ProcReader::new(ProcConfig::default()))
    }

    #[tokio::test]
    async fn test_silent_live_feed_is_a_valid_empty_sample() {
        let port = crate::mqtt_stub::spawn(Vec::new()).await;
        let mut sampler = sampler_on(port);

        // Connected but nothing published in the window: a measurement of
        // zero activity, not a sampling failure
        let snapshot = sampler
            .sample(Duration::from_millis(300), None)
            .await
            .unwrap();
        assert!(snapshot.counters.is_empty());
        assert_eq!(snapshot.cpu_ratio, 0.0);
    }

    #[tokio::test]
    async fn test_sample_collects_published_counters() {
        let port = crate::mqtt_stub::spawn(vec![
            ("$SYS/broker/clients/connected".to_string(), b"5".to_vec()),
            (
                "$SYS/broker/load/messages/received/1min".to_string(),
                b"600.0".to_vec(),
            ),
            (
                "$SYS/broker/version".to_string(),
                b"mosquitto version 2.0.18".to_vec(),
            ),
        ])
        .await;
        let mut sampler = sampler_on(port);

        let snapshot = sampler
            .sample(Duration::from_millis(300), None)
            .await
            .unwrap();
        assert_eq!(snapshot.counter("$SYS/broker/clients/connected"), Some(5.0));
        assert_eq!(
            snapshot.counter("$SYS/broker/load/messages/received/1min"),
            Some(600.0)
        );
        // Non-numeric payloads are skipped, not stored as garbage
        assert_eq!(snapshot.counter("$SYS/broker/version"), None);
    }

    #[tokio::test]
    async fn test_sample_fails_without_connection() {
        let cfg = SamplerConfig {
            connect_attempts: 1,
            connect_timeout_secs: 1,
            reconnect_delay_ms: 10,
            ..Default::default()
        };
        // Nothing listens on this port
        let mut sampler = MqttSampler::new(
            cfg,
            "127.0.0.1",
            1,
            ProcReader::new(ProcConfig::default()),
        );

        let err = sampler
            .sample(Duration::from_millis(100), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::Sampling { .. }));
        assert!(!err.is_fatal());
    }
}
