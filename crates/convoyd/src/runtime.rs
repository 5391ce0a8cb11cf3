//! Process-backed instance runtime.
//!
//! Each instance is the job's `command` run as a child process of the
//! daemon, with the job's environment plus one `CONVOY_PORT_<NAME>`
//! variable per published port. Exec health checks run on the local host.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use convoy_agent::{Instance, InstanceRuntime, published_ports};
use convoy_health::{BoxFuture, LocalExec};
use convoy_state::JobSpec;

#[derive(Default)]
pub struct ProcessRuntime {
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn running(&self) -> usize {
        self.children.lock().await.len()
    }
}

impl InstanceRuntime for ProcessRuntime {
    fn start<'a>(&'a self, host: &'a str, job: &'a JobSpec) -> BoxFuture<'a, anyhow::Result<Instance>> {
        Box::pin(async move {
            let (program, args) = job
                .command
                .split_first()
                .with_context(|| format!("job {} has no command", job.name))?;
            let ports = published_ports(job);

            let mut command = Command::new(program);
            command.args(args).envs(&job.env).kill_on_drop(true);
            for (name, port) in &ports {
                command.env(format!("CONVOY_PORT_{}", name.to_uppercase()), port.to_string());
            }
            let mut child = command
                .spawn()
                .with_context(|| format!("failed to spawn {program}"))?;

            if let Some(status) = child.try_wait()? {
                anyhow::bail!("{program} exited immediately with {status}");
            }
            let id = format!("{host}-{}-{}", job.name, child.id().unwrap_or_default());
            info!(%host, instance = %id, image = %job.image, "process started");
            self.children.lock().await.insert(id.clone(), child);

            Ok(Instance {
                id,
                address: "127.0.0.1".to_string(),
                ports,
                exec: Some(Arc::new(LocalExec)),
            })
        })
    }

    fn stop<'a>(&'a self, instance: &'a Instance) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let Some(mut child) = self.children.lock().await.remove(&instance.id) else {
                debug!(instance = %instance.id, "process already gone");
                return Ok(());
            };
            if let Err(e) = child.kill().await {
                warn!(instance = %instance.id, error = %e, "failed to kill process");
                return Err(e.into());
            }
            info!(instance = %instance.id, "process stopped");
            Ok(())
        })
    }
}
