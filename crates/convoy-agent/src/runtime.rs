//! Instance runtime seam.
//!
//! The agent does not know how instances are provisioned; it asks an
//! [`InstanceRuntime`] to start and stop them. [`ScriptedRuntime`] is an
//! in-memory runtime whose per-host behavior is configured up front, used
//! for dry runs and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use convoy_health::{BoxFuture, Exec};
use convoy_state::{HostId, JobId, JobSpec};

/// A started instance of a job on a host.
#[derive(Clone)]
pub struct Instance {
    pub id: String,
    /// Address the published ports are reachable on.
    pub address: String,
    /// Port name → published host port.
    pub ports: BTreeMap<String, u16>,
    /// Runs commands inside the instance, for exec health checks.
    pub exec: Option<Arc<dyn Exec>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

/// Provisions and tears down instances on the local host.
pub trait InstanceRuntime: Send + Sync {
    /// Start an instance; resolves once it reports it is up.
    fn start<'a>(&'a self, host: &'a str, job: &'a JobSpec) -> BoxFuture<'a, anyhow::Result<Instance>>;

    fn stop<'a>(&'a self, instance: &'a Instance) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Published port per declared port: the external port if fixed,
/// otherwise the internal one.
pub fn published_ports(job: &JobSpec) -> BTreeMap<String, u16> {
    job.ports
        .iter()
        .map(|(name, m)| (name.clone(), m.external_port.unwrap_or(m.internal_port)))
        .collect()
}

// ── Scripted runtime ──────────────────────────────────────────────

/// What starting an instance does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartBehavior {
    #[default]
    Succeed,
    Fail,
    /// Never reports up.
    Hang,
}

/// Scripted behavior for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostScript {
    pub start: StartBehavior,
    pub start_delay: Duration,
    /// Exec checks pass once this long has passed since start; `None`
    /// means never.
    pub healthy_after: Option<Duration>,
}

impl Default for HostScript {
    fn default() -> Self {
        Self {
            start: StartBehavior::Succeed,
            start_delay: Duration::ZERO,
            healthy_after: Some(Duration::ZERO),
        }
    }
}

impl HostScript {
    pub fn unhealthy() -> Self {
        Self {
            healthy_after: None,
            ..Self::default()
        }
    }

    pub fn failing_start() -> Self {
        Self {
            start: StartBehavior::Fail,
            ..Self::default()
        }
    }

    pub fn hanging_start() -> Self {
        Self {
            start: StartBehavior::Hang,
            ..Self::default()
        }
    }
}

struct ScriptedExec {
    healthy_at: Option<Instant>,
}

impl Exec for ScriptedExec {
    fn exec<'a>(&'a self, _command: &'a [String]) -> BoxFuture<'a, anyhow::Result<i32>> {
        let healthy = self.healthy_at.is_some_and(|at| Instant::now() >= at);
        Box::pin(async move { Ok(if healthy { 0 } else { 1 }) })
    }
}

#[derive(Default)]
struct Ledger {
    /// Every start attempt, in order.
    attempts: Vec<(HostId, JobId)>,
    /// Live instance id → (host, job).
    running: HashMap<String, (HostId, JobId)>,
    next_id: u64,
}

/// In-memory runtime with per-host scripted behavior.
#[derive(Default)]
pub struct ScriptedRuntime {
    default: HostScript,
    scripts: Mutex<HashMap<HostId, HostScript>>,
    ledger: Mutex<Ledger>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behavior for hosts without their own script.
    pub fn with_default(mut self, script: HostScript) -> Self {
        self.default = script;
        self
    }

    pub fn script(&self, host: &str, script: HostScript) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_string(), script);
    }

    fn script_for(&self, host: &str) -> HostScript {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .copied()
            .unwrap_or(self.default)
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hosts a start was attempted on, in attempt order.
    pub fn attempted_hosts(&self) -> Vec<HostId> {
        self.ledger().attempts.iter().map(|(h, _)| h.clone()).collect()
    }

    /// Jobs with a live instance on `host`.
    pub fn running_on(&self, host: &str) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = self
            .ledger()
            .running
            .values()
            .filter(|(h, _)| h == host)
            .map(|(_, j)| j.clone())
            .collect();
        jobs.sort();
        jobs
    }
}

impl InstanceRuntime for ScriptedRuntime {
    fn start<'a>(&'a self, host: &'a str, job: &'a JobSpec) -> BoxFuture<'a, anyhow::Result<Instance>> {
        Box::pin(async move {
            let script = self.script_for(host);
            let job_id = job.id();
            self.ledger().attempts.push((host.to_string(), job_id.clone()));

            tokio::time::sleep(script.start_delay).await;
            match script.start {
                StartBehavior::Fail => anyhow::bail!("scripted start failure on {host}"),
                StartBehavior::Hang => std::future::pending::<()>().await,
                StartBehavior::Succeed => {}
            }

            let id = {
                let mut ledger = self.ledger();
                ledger.next_id += 1;
                let id = format!("{host}-{}", ledger.next_id);
                ledger.running.insert(id.clone(), (host.to_string(), job_id));
                id
            };
            debug!(%host, instance = %id, "scripted instance started");
            Ok(Instance {
                id,
                address: "127.0.0.1".to_string(),
                ports: published_ports(job),
                exec: Some(Arc::new(ScriptedExec {
                    healthy_at: script.healthy_after.map(|d| Instant::now() + d),
                })),
            })
        })
    }

    fn stop<'a>(&'a self, instance: &'a Instance) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.ledger().running.remove(&instance.id);
            debug!(instance = %instance.id, "scripted instance stopped");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_state::{PortMapping, Protocol};

    fn job() -> JobSpec {
        let mut ports = BTreeMap::new();
        ports.insert(
            "http".to_string(),
            PortMapping {
                internal_port: 8080,
                external_port: Some(18080),
                protocol: Protocol::Tcp,
            },
        );
        ports.insert(
            "admin".to_string(),
            PortMapping {
                internal_port: 9090,
                external_port: None,
                protocol: Protocol::Tcp,
            },
        );
        JobSpec {
            name: "web".to_string(),
            version: "1".to_string(),
            image: "web:1".to_string(),
            command: vec![],
            env: Default::default(),
            ports,
            resources: Default::default(),
            health_check: None,
        }
    }

    #[test]
    fn published_ports_prefer_external() {
        let ports = published_ports(&job());
        assert_eq!(ports["http"], 18080);
        assert_eq!(ports["admin"], 9090);
    }

    #[tokio::test]
    async fn scripted_start_and_stop() {
        let runtime = ScriptedRuntime::new();
        let job = job();
        let instance = runtime.start("h1", &job).await.unwrap();
        assert_eq!(runtime.running_on("h1"), vec![job.id()]);

        let code = instance.exec.as_ref().unwrap().exec(&[]).await.unwrap();
        assert_eq!(code, 0);

        runtime.stop(&instance).await.unwrap();
        assert!(runtime.running_on("h1").is_empty());
        assert_eq!(runtime.attempted_hosts(), vec!["h1"]);
    }

    #[tokio::test]
    async fn scripted_failures() {
        let runtime = ScriptedRuntime::new();
        runtime.script("bad", HostScript::failing_start());
        runtime.script("sick", HostScript::unhealthy());
        let job = job();

        assert!(runtime.start("bad", &job).await.is_err());

        let instance = runtime.start("sick", &job).await.unwrap();
        let code = instance.exec.as_ref().unwrap().exec(&[]).await.unwrap();
        assert_eq!(code, 1);

        runtime.script("stuck", HostScript::hanging_start());
        let hung =
            tokio::time::timeout(Duration::from_millis(50), runtime.start("stuck", &job)).await;
        assert!(hung.is_err());
    }
}
