//! Prober — repeats a health check until it passes or a grace period ends.
//!
//! The prober is started once an instance reports it is up. It probes on
//! a fixed interval; transient failures only cost an attempt, and the
//! sole fatal outcome is the grace deadline elapsing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use convoy_state::HealthCheck;

use crate::checker::{exec_probe, http_probe, tcp_probe, Exec, ProbeResult};

/// The grace period elapsed without a passing probe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("health check did not pass within {grace:?} ({attempts} attempts)")]
pub struct ProbeTimeout {
    pub grace: Duration,
    pub attempts: u32,
}

/// Outcome of a successful probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// A running instance as seen by the prober.
#[derive(Clone)]
pub struct ProbeTarget {
    /// Address the instance's published ports are reachable on.
    pub address: String,
    /// Port name → published host port.
    pub ports: BTreeMap<String, u16>,
    /// How to run commands inside the instance.
    pub exec: Option<Arc<dyn Exec>>,
}

impl ProbeTarget {
    pub fn new(address: &str, ports: BTreeMap<String, u16>) -> Self {
        Self {
            address: address.to_string(),
            ports,
            exec: None,
        }
    }

    pub fn with_exec(mut self, exec: Arc<dyn Exec>) -> Self {
        self.exec = Some(exec);
        self
    }

    /// `address:port` for a symbolic port name.
    fn endpoint(&self, port: &str) -> Option<String> {
        self.ports.get(port).map(|p| format!("{}:{p}", self.address))
    }
}

impl std::fmt::Debug for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeTarget")
            .field("address", &self.address)
            .field("ports", &self.ports)
            .field("exec", &self.exec.is_some())
            .finish()
    }
}

/// Schedules health probes.
#[derive(Debug, Clone, Copy)]
pub struct Prober {
    /// Delay between attempts.
    pub interval: Duration,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for Prober {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

impl Prober {
    pub fn new(interval: Duration, attempt_timeout: Duration) -> Self {
        Self {
            interval,
            attempt_timeout,
        }
    }

    /// Run one attempt of `check` against `target`.
    pub async fn probe(&self, check: &HealthCheck, target: &ProbeTarget, timeout: Duration) -> ProbeResult {
        match check {
            HealthCheck::Http { path, port } => match target.endpoint(port) {
                Some(addr) => http_probe(&addr, path, timeout).await,
                None => {
                    warn!(%port, "http check port is not published");
                    ProbeResult::Failed
                }
            },
            HealthCheck::Tcp { port } => match target.endpoint(port) {
                Some(addr) => tcp_probe(&addr, timeout).await,
                None => {
                    warn!(%port, "tcp check port is not published");
                    ProbeResult::Failed
                }
            },
            HealthCheck::Exec { command } => match &target.exec {
                Some(exec) => exec_probe(exec.as_ref(), command, timeout).await,
                None => {
                    warn!("exec check without an exec handle");
                    ProbeResult::Failed
                }
            },
        }
    }

    /// Probe every `interval` until a probe passes or `grace` elapses.
    ///
    /// The last attempt happens no later than the deadline, and no
    /// attempt runs past it.
    pub async fn await_healthy(
        &self,
        check: &HealthCheck,
        target: &ProbeTarget,
        grace: Duration,
    ) -> Result<ProbeReport, ProbeTimeout> {
        let started = Instant::now();
        let deadline = started + grace;
        let mut attempts = 0u32;

        debug!(kind = check.kind(), ?grace, "health probing started");
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeout = self.attempt_timeout.min(remaining.max(Duration::from_millis(1)));
            attempts += 1;
            let result = self.probe(check, target, timeout).await;
            if result.passed() {
                let elapsed = started.elapsed();
                info!(kind = check.kind(), attempts, ?elapsed, "health check passed");
                return Ok(ProbeReport { attempts, elapsed });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(kind = check.kind(), attempts, ?grace, "health check grace period elapsed");
                return Err(ProbeTimeout { grace, attempts });
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}
