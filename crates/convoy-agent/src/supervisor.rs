//! Per-host agent: one [`DeploymentMachine`] per desired deployment.
//!
//! The agent watches `/deployments/{host}` and reconciles each change
//! against its machine slots:
//!
//! - a new entry spawns a machine;
//! - a newer generation retires the current machine, then spawns one for
//!   the new generation;
//! - a removed entry lets the current machine report STOPPED and exit.
//!
//! All status nodes are owned by the agent's session, so if the agent
//! dies they vanish with it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use convoy_state::{
    ChangeKind, Deployment, DeploymentState, Guard, HostId, JobId, SessionId, StoreClient,
    StoreError, StoreResult, TaskStatus, Versioned, epoch_millis, paths,
};

use crate::error::DeployError;
use crate::machine::{DeploymentMachine, MachineConfig, MachineOutcome};
use crate::runtime::InstanceRuntime;

struct Slot {
    generation: u64,
    state: watch::Receiver<DeploymentState>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<MachineOutcome>,
}

pub struct Agent {
    host: HostId,
    client: StoreClient,
    runtime: Arc<dyn InstanceRuntime>,
    config: MachineConfig,
    session: SessionId,
    slots: Mutex<HashMap<JobId, Slot>>,
}

impl Agent {
    /// Open the agent's session. Call [`Agent::run`] to start reconciling.
    pub async fn start(
        host: &str,
        client: StoreClient,
        runtime: Arc<dyn InstanceRuntime>,
        config: MachineConfig,
    ) -> StoreResult<Self> {
        let session = client.open_session().await?;
        info!(%host, session, "agent session opened");
        Ok(Self {
            host: host.to_string(),
            client,
            runtime,
            config,
            session,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Reconcile desired deployments until `shutdown` fires, then stop
    /// every machine.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> StoreResult<()> {
        let prefix = paths::host_deployments(&self.host);
        let mut events = self.client.watch(&prefix).await?;

        for desired in self.client.list_deployments(&self.host).await? {
            self.reconcile(&desired.value.job_id, false).await;
        }
        info!(host = %self.host, "agent reconciling");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) if event.path != prefix => {
                        let job_id = JobId::from(paths::leaf(&event.path));
                        self.reconcile(&job_id, event.kind == ChangeKind::Deleted).await;
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        self.stop_all().await;
        info!(host = %self.host, "agent stopped");
        Ok(())
    }

    /// Bring the slot for `job_id` in line with its desired entry.
    /// `removed` forces the current machine to be retired first.
    async fn reconcile(&self, job_id: &JobId, removed: bool) {
        let mut slots = self.slots.lock().await;

        if removed {
            if let Some(old) = slots.remove(job_id) {
                // The machine sees the removal itself and reports STOPPED.
                retire(job_id, old, false).await;
            }
        }

        let desired = match self.client.read_deployment(&self.host, job_id).await {
            Ok(d) => d,
            Err(e) => {
                warn!(host = %self.host, job = %job_id, error = %e, "failed to read desired deployment");
                return;
            }
        };
        let Some(desired) = desired else {
            if let Some(old) = slots.remove(job_id) {
                retire(job_id, old, false).await;
            }
            return;
        };

        if let Some(slot) = slots.get(job_id) {
            if slot.generation >= desired.value.generation {
                return;
            }
        }
        if let Some(old) = slots.remove(job_id) {
            debug!(
                host = %self.host,
                job = %job_id,
                from = old.generation,
                to = desired.value.generation,
                "superseding deployment"
            );
            retire(job_id, old, true).await;
        }

        if let Some(slot) = self.spawn(job_id, desired).await {
            slots.insert(job_id.clone(), slot);
        }
    }

    async fn spawn(&self, job_id: &JobId, desired: Versioned<Deployment>) -> Option<Slot> {
        let job = match self.client.read_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(host = %self.host, job = %job_id, "desired deployment references unknown job");
                self.report_missing_job(&desired).await;
                return None;
            }
            Err(e) => {
                warn!(host = %self.host, job = %job_id, error = %e, "failed to read job spec");
                return None;
            }
        };

        let generation = desired.value.generation;
        let machine = DeploymentMachine::new(
            self.client.clone(),
            self.session,
            self.runtime.clone(),
            self.config,
            job,
            desired,
        );
        let state = machine.state();
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(machine.run(rx));
        Some(Slot {
            generation,
            state,
            shutdown,
            handle,
        })
    }

    async fn report_missing_job(&self, desired: &Versioned<Deployment>) {
        let d = &desired.value;
        let status = TaskStatus {
            job_id: d.job_id.clone(),
            host: self.host.clone(),
            generation: d.generation,
            state: DeploymentState::Failed,
            message: Some(DeployError::JobNotFound(d.job_id.to_string()).to_string()),
            ports: Default::default(),
            updated_at: epoch_millis(),
        };
        let guard = Guard {
            path: paths::deployment(&self.host, &d.job_id),
            version: desired.version,
        };
        let path = paths::status(&self.host, &d.job_id);
        match self
            .client
            .put_actual(self.session, &path, &status, Some(&guard))
            .await
        {
            Ok(()) => {}
            Err(e) if e.path() == Some(guard.path.as_str()) => {}
            Err(e) => warn!(%path, error = %e, "failed to report missing job"),
        }
    }

    /// Current lifecycle state per job, with the generation it belongs to.
    pub async fn states(&self) -> HashMap<JobId, (u64, DeploymentState)> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|(job_id, slot)| (job_id.clone(), (slot.generation, *slot.state.borrow())))
            .collect()
    }

    pub async fn state(&self, job_id: &JobId) -> Option<DeploymentState> {
        self.slots
            .lock()
            .await
            .get(job_id)
            .map(|slot| *slot.state.borrow())
    }

    /// Cancel every machine and wait for their instances to stop.
    pub async fn stop_all(&self) {
        let drained: Vec<(JobId, Slot)> = self.slots.lock().await.drain().collect();
        for (job_id, slot) in drained {
            retire(&job_id, slot, true).await;
        }
    }

    /// Stop all machines and end the session; every status node owned
    /// by this agent disappears.
    pub async fn shutdown(self) -> StoreResult<()> {
        self.stop_all().await;
        match self.client.close_session(self.session).await {
            Ok(()) | Err(StoreError::SessionExpired(_)) => {}
            Err(e) => return Err(e),
        }
        info!(host = %self.host, "agent session closed");
        Ok(())
    }
}

/// Wait for a machine to exit, signalling it first when `cancel` is set.
async fn retire(job_id: &JobId, slot: Slot, cancel: bool) {
    if cancel {
        slot.shutdown.send_replace(true);
    }
    match slot.handle.await {
        Ok(outcome) => debug!(job = %job_id, generation = slot.generation, ?outcome, "machine retired"),
        Err(e) => warn!(job = %job_id, error = %e, "machine task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::runtime::{HostScript, ScriptedRuntime};
    use convoy_health::Prober;
    use convoy_state::{HealthCheck, JobSpec, LocalStore};

    const HOST: &str = "h1";

    fn job(version: &str) -> JobSpec {
        JobSpec {
            name: "web".to_string(),
            version: version.to_string(),
            image: format!("web:{version}"),
            command: vec![],
            env: Default::default(),
            ports: Default::default(),
            resources: Default::default(),
            health_check: Some(HealthCheck::exec(&["check"])),
        }
    }

    fn config() -> MachineConfig {
        MachineConfig {
            start_timeout: Duration::from_millis(500),
            prober: Prober::new(Duration::from_millis(10), Duration::from_millis(50)),
        }
    }

    struct Harness {
        client: StoreClient,
        runtime: Arc<ScriptedRuntime>,
        agent: Arc<Agent>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<StoreResult<()>>,
    }

    async fn harness() -> Harness {
        let client = StoreClient::new(Arc::new(LocalStore::open_in_memory().unwrap()));
        let runtime = Arc::new(ScriptedRuntime::new());
        let agent = Arc::new(
            Agent::start(HOST, client.clone(), runtime.clone(), config())
                .await
                .unwrap(),
        );
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(rx).await }
        });
        Harness {
            client,
            runtime,
            agent,
            shutdown,
            task,
        }
    }

    /// Write (or bump) the desired entry for `job`, optionally storing
    /// the job spec first.
    async fn assign(client: &StoreClient, job: &JobSpec, generation: u64, store_job: bool) {
        let job_id = if store_job {
            client.put_job(job).await.unwrap()
        } else {
            job.id()
        };
        let deployment = Deployment {
            job_id: job_id.clone(),
            job_name: job.name.clone(),
            host: HOST.to_string(),
            group: None,
            generation,
            grace_period_ms: 1_000,
        };
        let path = paths::deployment(HOST, &job_id);
        match client.read::<Deployment>(&path).await.unwrap() {
            Some(current) => {
                client
                    .update_desired(&path, &deployment, current.version)
                    .await
                    .unwrap();
            }
            None => {
                client.create_desired(&path, &deployment).await.unwrap();
            }
        }
    }

    async fn wait_status(
        client: &StoreClient,
        job_id: &JobId,
        pred: impl Fn(&TaskStatus) -> bool,
    ) -> TaskStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(status) = client.read_status(HOST, job_id).await.unwrap() {
                    if pred(&status) {
                        return status;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("status never matched")
    }

    #[tokio::test]
    async fn deploys_new_entries() {
        let h = harness().await;
        let job = job("1");
        assign(&h.client, &job, 1, true).await;

        let status = wait_status(&h.client, &job.id(), |s| s.state == DeploymentState::Running).await;
        assert_eq!(status.generation, 1);
        assert_eq!(
            h.agent.state(&job.id()).await,
            Some(DeploymentState::Running)
        );
        assert_eq!(h.runtime.running_on(HOST), vec![job.id()]);

        h.shutdown.send_replace(true);
        h.task.await.unwrap().unwrap();
        assert!(h.runtime.running_on(HOST).is_empty());
    }

    #[tokio::test]
    async fn picks_up_entries_written_before_start() {
        let client = StoreClient::new(Arc::new(LocalStore::open_in_memory().unwrap()));
        let job = job("1");
        assign(&client, &job, 1, true).await;

        let runtime = Arc::new(ScriptedRuntime::new());
        let agent = Agent::start(HOST, client.clone(), runtime, config())
            .await
            .unwrap();
        let (_tx, rx) = watch::channel(false);
        let agent = Arc::new(agent);
        tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(rx).await }
        });

        wait_status(&client, &job.id(), |s| s.state == DeploymentState::Running).await;
    }

    #[tokio::test]
    async fn newer_generation_replaces_machine() {
        let h = harness().await;
        let job = job("1");
        assign(&h.client, &job, 1, true).await;
        wait_status(&h.client, &job.id(), |s| s.state == DeploymentState::Running).await;

        assign(&h.client, &job, 2, true).await;
        let status = wait_status(&h.client, &job.id(), |s| {
            s.generation == 2 && s.state == DeploymentState::Running
        })
        .await;
        assert_eq!(status.generation, 2);
        assert_eq!(h.runtime.running_on(HOST).len(), 1);
        assert_eq!(h.runtime.attempted_hosts().len(), 2);

        let states = h.agent.states().await;
        assert_eq!(states[&job.id()], (2, DeploymentState::Running));
    }

    #[tokio::test]
    async fn removal_reports_stopped() {
        let h = harness().await;
        let job = job("1");
        assign(&h.client, &job, 1, true).await;
        wait_status(&h.client, &job.id(), |s| s.state == DeploymentState::Running).await;

        h.client
            .delete_desired(&paths::deployment(HOST, &job.id()), None)
            .await
            .unwrap();
        wait_status(&h.client, &job.id(), |s| s.state == DeploymentState::Stopped).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.runtime.running_on(HOST).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unknown_job_reports_failed() {
        let h = harness().await;
        let job = job("missing");
        assign(&h.client, &job, 1, false).await;

        let status = wait_status(&h.client, &job.id(), |s| s.state == DeploymentState::Failed).await;
        assert!(status.message.unwrap().contains("not found"));
        assert!(h.runtime.attempted_hosts().is_empty());
    }

    #[tokio::test]
    async fn shutdown_removes_owned_statuses() {
        let h = harness().await;
        let job = job("1");
        assign(&h.client, &job, 1, true).await;
        wait_status(&h.client, &job.id(), |s| s.state == DeploymentState::Running).await;

        h.shutdown.send_replace(true);
        h.task.await.unwrap().unwrap();
        let agent = Arc::try_unwrap(h.agent).ok().unwrap();
        agent.shutdown().await.unwrap();

        assert!(h.client.read_status(HOST, &job.id()).await.unwrap().is_none());
        // The desired entry is untouched.
        assert!(h.client.read_deployment(HOST, &job.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unhealthy_host_fails_once_per_generation() {
        let h = harness().await;
        h.runtime.script(HOST, HostScript::unhealthy());
        let job = job("1");
        h.client.put_job(&job).await.unwrap();
        let deployment = Deployment {
            job_id: job.id(),
            job_name: job.name.clone(),
            host: HOST.to_string(),
            group: None,
            generation: 1,
            grace_period_ms: 50,
        };
        h.client
            .create_desired(&paths::deployment(HOST, &job.id()), &deployment)
            .await
            .unwrap();

        wait_status(&h.client, &job.id(), |s| s.state == DeploymentState::Failed).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.runtime.attempted_hosts().len(), 1);
    }
}
