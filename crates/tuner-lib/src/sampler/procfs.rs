//! OS-level readings for the broker process
//!
//! Reads `/proc/<pid>/stat` for CPU ticks and `/proc/<pid>/status` for
//! resident memory and context switches. Ticks and switches are cumulative,
//! so each reading is diffed against the previous one for the same pid; the
//! first reading for a pid reports zero activity.

use crate::config::ProcConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct ProcCounters {
    pid: u32,
    cpu_ticks: u64,
    ctxt_switches: u64,
}

/// Per-process readings normalized against the configured references
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcReading {
    pub cpu_ratio: f32,
    pub mem_ratio: f32,
    pub ctxt_ratio: f32,
}

pub struct ProcReader {
    cfg: ProcConfig,
    proc_root: PathBuf,
    last: Option<ProcCounters>,
}

impl ProcReader {
    pub fn new(cfg: ProcConfig) -> Self {
        Self::with_proc_root(cfg, PathBuf::from("/proc"))
    }

    /// Test hook: read from a fixture tree instead of the live /proc
    pub fn with_proc_root(cfg: ProcConfig, proc_root: PathBuf) -> Self {
        Self {
            cfg,
            proc_root,
            last: None,
        }
    }

    /// Read the process and diff against the previous reading. Any read or
    /// parse failure degrades to zeros; OS metrics never fail a sample.
    pub fn read(&mut self, pid: u32, window: Duration) -> ProcReading {
        let current = match self.read_counters(pid) {
            Some(c) => c,
            None => {
                warn!(pid, "could not read process counters; reporting zeros");
                self.last = None;
                return ProcReading::default();
            }
        };
        let mem_ratio = self
            .read_rss_bytes(pid)
            .map(|rss| (rss as f64 / self.cfg.mem_norm_bytes as f64) as f32)
            .unwrap_or(0.0);

        let reading = match self.last {
            Some(prev) if prev.pid == pid => {
                let cpu_delta = current.cpu_ticks.saturating_sub(prev.cpu_ticks) as f64;
                let ctxt_delta = current.ctxt_switches.saturating_sub(prev.ctxt_switches) as f64;
                let window_secs = window.as_secs_f64().max(f64::EPSILON);
                ProcReading {
                    cpu_ratio: (cpu_delta / (self.cfg.cpu_tick_hz * window_secs)) as f32,
                    mem_ratio,
                    ctxt_ratio: (ctxt_delta / self.cfg.ctxt_norm) as f32,
                }
            }
            // First reading for this pid establishes the baseline
            _ => ProcReading {
                cpu_ratio: 0.0,
                mem_ratio,
                ctxt_ratio: 0.0,
            },
        };
        self.last = Some(current);
        reading
    }

    fn read_counters(&self, pid: u32) -> Option<ProcCounters> {
        let stat = std::fs::read_to_string(self.proc_root.join(pid.to_string()).join("stat")).ok()?;
        // Fields after the parenthesized comm; utime and stime are fields 14
        // and 15 of the full line
        let after_comm = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;

        let status =
            std::fs::read_to_string(self.proc_root.join(pid.to_string()).join("status")).ok()?;
        let mut voluntary = 0u64;
        let mut nonvoluntary = 0u64;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("voluntary_ctxt_switches:") {
                voluntary = rest.trim().parse().ok()?;
            } else if let Some(rest) = line.strip_prefix("nonvoluntary_ctxt_switches:") {
                nonvoluntary = rest.trim().parse().ok()?;
            }
        }

        Some(ProcCounters {
            pid,
            cpu_ticks: utime + stime,
            ctxt_switches: voluntary + nonvoluntary,
        })
    }

    fn read_rss_bytes(&self, pid: u32) -> Option<u64> {
        let status =
            std::fs::read_to_string(self.proc_root.join(pid.to_string()).join("status")).ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
                return Some(kb * 1024);
            }
        }
        None
    }
}
