//! Broker configuration rendering and process lifecycle
//!
//! Applying a knob set always renders the complete configuration document
//! and drives the broker through a full stop/start cycle. A partial reload
//! could silently skip parameters; a full restart guarantees the running
//! process reflects exactly the rendered file, which is the broker's sole
//! configuration source.

use crate::config::BrokerConfig;
use crate::error::EnvError;
use crate::knobs::KnobSet;
use crate::process::{terminate_pid, wait_port_bound, wait_port_released};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Seam between the orchestrator and the broker lifecycle. The return value
/// reports whether a process restart occurred (the Mosquitto applier always
/// restarts; mocks exercise the reload path).
#[async_trait]
pub trait ConfigApplier: Send {
    async fn apply(&mut self, knobs: &KnobSet) -> Result<bool, EnvError>;

    /// Pid of the currently-running broker, for OS-level metric reads
    fn broker_pid(&self) -> Option<u32>;
}

/// Identity of the currently-running broker process. Replaced, never
/// mutated, on each restart.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    pub pid: u32,
    pub port_bound: bool,
    /// The configuration the process was started with
    pub knobs: KnobSet,
}

/// Static header of the rendered configuration document
pub fn base_template(cfg: &BrokerConfig) -> String {
    format!(
        "# broker-tuner managed configuration; fully regenerated on every apply\n\
         listener {}\n\
         allow_anonymous true\n\
         sys_interval {}\n\
         log_type none\n",
        cfg.port, cfg.sys_interval_secs
    )
}

/// Render the full configuration document: template header plus exactly one
/// directive line per knob. A directive already present in the template is
/// replaced in place so no duplicate or stale line survives.
pub fn render_config(template: &str, knobs: &KnobSet) -> String {
    let mut lines: Vec<String> = template.lines().map(str::to_string).collect();
    let mut pending: Vec<(&'static str, String)> = Vec::new();

    for (name, value) in knobs.iter() {
        let rendered = value.render();
        let existing = lines.iter_mut().find(|line| {
            line.split_whitespace().next() == Some(name) && !line.trim_start().starts_with('#')
        });
        match existing {
            Some(line) => *line = format!("{name} {rendered}"),
            None => pending.push((name, rendered)),
        }
    }

    if !pending.is_empty() {
        lines.push(String::new());
        lines.push("# tuned directives".to_string());
        for (name, rendered) in pending {
            lines.push(format!("{name} {rendered}"));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Parse directive lines back out of a rendered configuration document
pub fn parse_directives(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            let mut parts = trimmed.splitn(2, char::is_whitespace);
            match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => Some((key.to_string(), value.trim().to_string())),
                _ => None,
            }
        })
        .collect()
}

/// Drives a Mosquitto process through render → stop → start → verify
pub struct MosquittoApplier {
    cfg: BrokerConfig,
    handle: Option<BrokerHandle>,
    child: Option<Child>,
}

impl MosquittoApplier {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self {
            cfg,
            handle: None,
            child: None,
        }
    }

    /// The currently-running broker, if any
    pub fn handle(&self) -> Option<&BrokerHandle> {
        self.handle.as_ref()
    }

    async fn stop_existing(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                debug!(pid, "stopping broker process");
                terminate_pid(pid, self.cfg.stop_grace()).await;
            }
            // Reap; after SIGKILL escalation this returns promptly
            let _ = tokio::time::timeout(self.cfg.stop_grace(), child.wait()).await;
        } else if let Some(handle) = self.handle.take() {
            // A previous instance we no longer hold a child for
            terminate_pid(handle.pid, self.cfg.stop_grace()).await;
        }
        self.handle = None;

        let released = wait_port_released(
            &self.cfg.host,
            self.cfg.port,
            self.cfg.port_release_attempts,
            self.cfg.port_release_interval(),
        )
        .await;
        if !released.is_ready() {
            warn!(
                port = self.cfg.port,
                attempts = self.cfg.port_release_attempts,
                "listening port still bound after stop; new broker may fail to bind"
            );
        }
    }

    async fn start(&mut self, knobs: &KnobSet) -> Result<(), EnvError> {
        let mut command = Command::new(&self.cfg.binary);
        command
            .arg("-c")
            .arg(&self.cfg.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| EnvError::ProcessStart {
            reason: format!("failed to spawn {}: {e}", self.cfg.binary.display()),
        })?;

        sleep(self.cfg.start_check_delay()).await;

        if let Ok(Some(status)) = child.try_wait() {
            let output = child.wait_with_output().await.ok();
            let stderr = output
                .map(|o| String::from_utf8_lossy(&o.stderr).trim().to_string())
                .unwrap_or_default();
            return Err(EnvError::ProcessStart {
                reason: format!("broker exited immediately ({status}): {stderr}"),
            });
        }

        let pid = child.id().ok_or_else(|| EnvError::ProcessStart {
            reason: "broker process has no pid".to_string(),
        })?;

        let bound = wait_port_bound(
            &self.cfg.host,
            self.cfg.port,
            self.cfg.readiness_attempts,
            self.cfg.readiness_interval(),
        )
        .await;
        if !bound.is_ready() {
            let _ = child.start_kill();
            return Err(EnvError::ProcessStart {
                reason: format!(
                    "broker pid {pid} never bound port {} within {} attempts",
                    self.cfg.port, self.cfg.readiness_attempts
                ),
            });
        }

        info!(pid, port = self.cfg.port, "broker ready");
        self.handle = Some(BrokerHandle {
            pid,
            port_bound: true,
            knobs: knobs.clone(),
        });
        self.child = Some(child);
        Ok(())
    }
}

#[async_trait]
impl ConfigApplier for MosquittoApplier {
    async fn apply(&mut self, knobs: &KnobSet) -> Result<bool, EnvError> {
        let rendered = render_config(&base_template(&self.cfg), knobs);
        tokio::fs::write(&self.cfg.config_path, rendered)
            .await
            .map_err(|source| EnvError::ConfigWrite {
                path: self.cfg.config_path.clone(),
                source,
            })?;
        debug!(path = %self.cfg.config_path.display(), "broker configuration written");

        self.stop_existing().await;
        self.start(knobs).await?;
        Ok(true)
    }

    fn broker_pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid)
    }
}
