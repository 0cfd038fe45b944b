//! Synthetic MQTT workload lifecycle
//!
//! The workload is two `emqtt_bench` process groups, one subscribing and one
//! publishing. Each bench invocation forks its own children, so every group
//! is started in its own session and torn down by process-group signal;
//! signalling only the leader would orphan the fan-out workers.

use crate::config::WorkloadConfig;
use crate::error::EnvError;
use crate::process::terminate_group;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Shape of the synthetic load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSpec {
    pub publishers: u32,
    pub subscribers: u32,
    /// Payload size in bytes
    pub message_size: u32,
    pub qos: u8,
    pub publish_interval_ms: u32,
    pub topic: String,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            publishers: 100,
            subscribers: 100,
            message_size: 100,
            qos: 0,
            publish_interval_ms: 100,
            topic: "bench/%i".to_string(),
        }
    }
}

/// Seam between the orchestrator and the load generator
#[async_trait]
pub trait WorkloadDriver: Send {
    async fn start(&mut self) -> Result<(), EnvError>;
    async fn stop(&mut self);
    /// Full stop/start cycle with the same spec
    async fn restart(&mut self) -> Result<(), EnvError>;
    fn is_running(&mut self) -> bool;
    /// Subscribe to the workload topic and wait for one generator-produced
    /// message within a bounded window
    async fn verify_traffic(&mut self) -> Result<(), EnvError>;
}

/// Subscription filter covering every client of a bench topic pattern: the
/// `%i` client-index placeholder and everything below it become a `#`
/// wildcard.
fn subscription_filter(topic: &str) -> String {
    match topic.split('/').position(|segment| segment.contains("%i")) {
        Some(0) => "#".to_string(),
        Some(i) => {
            let prefix: Vec<&str> = topic.split('/').take(i).collect();
            format!("{}/#", prefix.join("/"))
        }
        None => topic.to_string(),
    }
}

enum BenchRole {
    Subscribe,
    Publish,
}

impl BenchRole {
    fn name(&self) -> &'static str {
        match self {
            BenchRole::Subscribe => "sub",
            BenchRole::Publish => "pub",
        }
    }
}

struct BenchGroup {
    role: BenchRole,
    pgid: u32,
    child: Child,
}

/// Manages the bench process groups against one broker endpoint
pub struct WorkloadCoordinator {
    cfg: WorkloadConfig,
    broker_host: String,
    broker_port: u16,
    groups: Vec<BenchGroup>,
}

impl WorkloadCoordinator {
    pub fn new(cfg: WorkloadConfig, broker_host: impl Into<String>, broker_port: u16) -> Self {
        Self {
            cfg,
            broker_host: broker_host.into(),
            broker_port,
            groups: Vec::new(),
        }
    }

    fn bench_args(&self, role: &BenchRole) -> Vec<String> {
        let spec = &self.cfg.spec;
        let (mode, clients) = match role {
            BenchRole::Subscribe => ("sub", spec.subscribers),
            BenchRole::Publish => ("pub", spec.publishers),
        };
        let mut args = vec![
            mode.to_string(),
            "-h".to_string(),
            self.broker_host.clone(),
            "-p".to_string(),
            self.broker_port.to_string(),
            "-c".to_string(),
            clients.to_string(),
            "-t".to_string(),
            spec.topic.clone(),
            "-q".to_string(),
            spec.qos.to_string(),
        ];
        if matches!(role, BenchRole::Publish) {
            args.push("-I".to_string());
            args.push(spec.publish_interval_ms.to_string());
            args.push("-s".to_string());
            args.push(spec.message_size.to_string());
        }
        args
    }

    async fn spawn_group(&mut self, role: BenchRole) -> Result<(), EnvError> {
        let args = self.bench_args(&role);
        let mut child = Command::new(&self.cfg.bench_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // New group with pgid = child pid, so the whole fan-out dies on one signal
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EnvError::WorkloadRestart {
                attempts: 1,
                reason: format!(
                    "failed to spawn {} {}: {e}",
                    self.cfg.bench_binary.display(),
                    role.name()
                ),
            })?;

        sleep(self.cfg.startup_check_delay()).await;

        if let Ok(Some(status)) = child.try_wait() {
            let output = child.wait_with_output().await.ok();
            let stderr = output
                .map(|o| String::from_utf8_lossy(&o.stderr).trim().to_string())
                .unwrap_or_default();
            return Err(EnvError::WorkloadRestart {
                attempts: 1,
                reason: format!("{} group exited immediately ({status}): {stderr}", role.name()),
            });
        }

        let pgid = child.id().ok_or_else(|| EnvError::WorkloadRestart {
            attempts: 1,
            reason: format!("{} group has no pid", role.name()),
        })?;

        debug!(role = role.name(), pgid, "workload group started");
        self.groups.push(BenchGroup { role, pgid, child });
        Ok(())
    }
}

#[async_trait]
impl WorkloadDriver for WorkloadCoordinator {
    async fn start(&mut self) -> Result<(), EnvError> {
        if !self.groups.is_empty() {
            self.stop().await;
        }
        // Subscribers first, so publishers never fire into a void
        self.spawn_group(BenchRole::Subscribe).await?;
        if let Err(e) = self.spawn_group(BenchRole::Publish).await {
            self.stop().await;
            return Err(e);
        }
        info!(
            subscribers = self.cfg.spec.subscribers,
            publishers = self.cfg.spec.publishers,
            "workload running"
        );
        Ok(())
    }

    async fn stop(&mut self) {
        for mut group in self.groups.drain(..) {
            debug!(role = group.role.name(), pgid = group.pgid, "stopping workload group");
            terminate_group(group.pgid, self.cfg.stop_grace()).await;
            let _ = tokio::time::timeout(self.cfg.stop_grace(), group.child.wait()).await;
        }
    }

    async fn restart(&mut self) -> Result<(), EnvError> {
        self.stop().await;
        sleep(self.cfg.restart_pause()).await;
        self.start().await
    }

    fn is_running(&mut self) -> bool {
        // try_wait also reaps any group leader that exited since the last
        // check, so a zombie never reads as alive
        !self.groups.is_empty()
            && self
                .groups
                .iter_mut()
                .all(|g| matches!(g.child.try_wait(), Ok(None)))
    }

    async fn verify_traffic(&mut self) -> Result<(), EnvError> {
        let filter = subscription_filter(&self.cfg.spec.topic);
        let mut options = MqttOptions::new(
            "broker-tuner-probe",
            self.broker_host.clone(),
            self.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(10));
        let (client, mut eventloop) = AsyncClient::new(options, 10);

        // Listen only; a message here can only come from the generator
        let listen = async {
            client
                .subscribe(filter.clone(), QoS::AtMostOnce)
                .await
                .map_err(|e| EnvError::WorkloadRestart {
                    attempts: 1,
                    reason: format!("probe subscribe failed: {e}"),
                })?;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => {
                        return Err(EnvError::WorkloadRestart {
                            attempts: 1,
                            reason: format!("probe connection failed: {e}"),
                        });
                    }
                }
            }
        };

        match timeout(self.cfg.verify_timeout(), listen).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    filter = %filter,
                    timeout_secs = self.cfg.verify_timeout().as_secs(),
                    "no workload traffic observed"
                );
                Err(EnvError::ReadinessTimeout {
                    subject: format!("workload traffic on {filter}"),
                    attempts: 1,
                })
            }
        }
    }
}
