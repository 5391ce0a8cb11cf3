//! Deployment state machine for one (job, host) pair.
//!
//! A machine is bound to one generation of a desired [`Deployment`]. It
//! walks the instance through
//!
//! ```text
//! ASSIGNED → STARTING → HEALTHCHECKING → RUNNING
//!                 │             │
//!                 └──► FAILED ◄─┘
//! ```
//!
//! reporting each step as an ephemeral [`TaskStatus`] owned by the agent's
//! session. Every report is guarded on the desired node's version, so once
//! the leader writes a newer generation (or removes the entry) no further
//! status under the old generation can land.
//!
//! After RUNNING the machine stays alive, owning the instance, until the
//! entry is removed (→ STOPPED), superseded, or the agent shuts down.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use convoy_health::{ProbeTarget, Prober};
use convoy_state::{
    ChangeKind, Deployment, DeploymentState, Guard, JobSpec, SessionId, StoreClient, TaskStatus,
    Versioned, Watch, epoch_millis, paths,
};

use crate::error::DeployError;
use crate::runtime::{Instance, InstanceRuntime};

/// Timing knobs shared by all machines of an agent.
#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    /// Upper bound on the runtime reporting an instance as up.
    pub start_timeout: Duration,
    pub prober: Prober,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(60),
            prober: Prober::default(),
        }
    }
}

/// How a machine ended.
#[derive(Debug)]
pub enum MachineOutcome {
    /// FAILED was reported for this generation.
    Failed(DeployError),
    /// The desired entry was removed; STOPPED was reported.
    Stopped,
    /// A newer generation replaced this one. Nothing further was reported.
    Superseded,
    /// The agent is shutting down. Nothing further was reported.
    Cancelled,
}

pub struct DeploymentMachine {
    client: StoreClient,
    session: SessionId,
    runtime: Arc<dyn InstanceRuntime>,
    config: MachineConfig,
    job: JobSpec,
    deployment: Deployment,
    guard: Guard,
    status_path: String,
    state: watch::Sender<DeploymentState>,
}

impl DeploymentMachine {
    pub fn new(
        client: StoreClient,
        session: SessionId,
        runtime: Arc<dyn InstanceRuntime>,
        config: MachineConfig,
        job: JobSpec,
        desired: Versioned<Deployment>,
    ) -> Self {
        let Versioned {
            value: deployment,
            version,
        } = desired;
        let guard = Guard {
            path: paths::deployment(&deployment.host, &deployment.job_id),
            version,
        };
        let status_path = paths::status(&deployment.host, &deployment.job_id);
        Self {
            client,
            session,
            runtime,
            config,
            job,
            deployment,
            guard,
            status_path,
            state: watch::channel(DeploymentState::Assigned).0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.deployment.generation
    }

    /// Last lifecycle state this machine successfully reported.
    pub fn state(&self) -> watch::Receiver<DeploymentState> {
        self.state.subscribe()
    }

    /// Drive the deployment until it fails, is removed, is superseded, or
    /// `shutdown` fires. The instance, if one was started, is stopped
    /// before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> MachineOutcome {
        let mut desired = match self.client.watch(&self.guard.path).await {
            Ok(w) => w,
            Err(e) => return MachineOutcome::Failed(e.into()),
        };
        info!(
            host = %self.deployment.host,
            job = %self.deployment.job_id,
            generation = self.deployment.generation,
            "deployment machine started"
        );

        let mut instance = None;
        let finished = tokio::select! {
            biased;
            _ = shutdown.changed() => Some(MachineOutcome::Cancelled),
            stale = self.await_stale(&mut desired) => Some(stale),
            driven = self.drive(&mut instance) => driven.err(),
        };
        let outcome = match finished {
            Some(outcome) => outcome,
            None => tokio::select! {
                biased;
                _ = shutdown.changed() => MachineOutcome::Cancelled,
                stale = self.await_stale(&mut desired) => stale,
            },
        };

        if let Some(instance) = instance.take() {
            if let Err(e) = self.runtime.stop(&instance).await {
                warn!(instance = %instance.id, error = %e, "failed to stop instance");
            }
        }
        if matches!(outcome, MachineOutcome::Stopped) {
            self.report_stopped().await;
        }

        info!(
            host = %self.deployment.host,
            job = %self.deployment.job_id,
            generation = self.deployment.generation,
            outcome = ?outcome,
            "deployment machine finished"
        );
        outcome
    }

    /// The lifecycle up to RUNNING. `Err` carries the terminal outcome
    /// when RUNNING is not reached.
    async fn drive(&self, instance: &mut Option<Instance>) -> Result<(), MachineOutcome> {
        self.report(DeploymentState::Assigned, None, BTreeMap::new()).await?;
        self.report(DeploymentState::Starting, None, BTreeMap::new()).await?;

        let start = self.runtime.start(&self.deployment.host, &self.job);
        let started = match tokio::time::timeout(self.config.start_timeout, start).await {
            Ok(Ok(started)) => started,
            Ok(Err(e)) => {
                return Err(self.fail(DeployError::Runtime(format!("{e:#}")), BTreeMap::new()).await);
            }
            Err(_) => {
                let err = DeployError::StartTimeout(self.config.start_timeout);
                return Err(self.fail(err, BTreeMap::new()).await);
            }
        };
        debug!(instance = %started.id, host = %self.deployment.host, "instance up");
        let ports = started.ports.clone();
        let started = instance.insert(started);

        let Some(check) = &self.job.health_check else {
            return self.report(DeploymentState::Running, None, ports).await;
        };
        self.report(DeploymentState::HealthChecking, None, ports.clone())
            .await?;

        let mut target = ProbeTarget::new(&started.address, ports.clone());
        if let Some(exec) = &started.exec {
            target = target.with_exec(exec.clone());
        }
        let grace = Duration::from_millis(self.deployment.grace_period_ms);
        match self.config.prober.await_healthy(check, &target, grace).await {
            Ok(report) => {
                debug!(attempts = report.attempts, elapsed = ?report.elapsed, "instance healthy");
                self.report(DeploymentState::Running, None, ports).await
            }
            Err(timeout) => Err(self.fail(timeout.into(), ports).await),
        }
    }

    /// Resolves when the desired entry is removed or replaced.
    async fn await_stale(&self, desired: &mut Watch) -> MachineOutcome {
        while let Some(event) = desired.recv().await {
            if event.path != self.guard.path {
                continue;
            }
            match event.kind {
                ChangeKind::Deleted => return MachineOutcome::Stopped,
                _ if event.version == self.guard.version => {}
                _ => return MachineOutcome::Superseded,
            }
        }
        MachineOutcome::Cancelled
    }

    /// Publish a guarded status report.
    async fn report(
        &self,
        state: DeploymentState,
        message: Option<String>,
        ports: BTreeMap<String, u16>,
    ) -> Result<(), MachineOutcome> {
        let status = self.status(state, message, ports);
        match self
            .client
            .put_actual(self.session, &self.status_path, &status, Some(&self.guard))
            .await
        {
            Ok(()) => {
                self.state.send_replace(state);
                debug!(host = %self.deployment.host, job = %self.deployment.job_id, %state, "status reported");
                Ok(())
            }
            Err(e) if e.path() == Some(self.guard.path.as_str()) => Err(self.classify_stale().await),
            Err(e) => {
                warn!(path = %self.status_path, error = %e, "status report failed");
                Err(MachineOutcome::Failed(e.into()))
            }
        }
    }

    async fn fail(&self, err: DeployError, ports: BTreeMap<String, u16>) -> MachineOutcome {
        warn!(
            host = %self.deployment.host,
            job = %self.deployment.job_id,
            error = %err,
            "deployment failed"
        );
        match self
            .report(DeploymentState::Failed, Some(err.to_string()), ports)
            .await
        {
            Ok(()) => MachineOutcome::Failed(err),
            Err(outcome) => outcome,
        }
    }

    /// The guard no longer holds: tell removal from replacement.
    async fn classify_stale(&self) -> MachineOutcome {
        match self.client.read::<Deployment>(&self.guard.path).await {
            Ok(None) => MachineOutcome::Stopped,
            Ok(Some(_)) => MachineOutcome::Superseded,
            Err(e) => MachineOutcome::Failed(e.into()),
        }
    }

    async fn report_stopped(&self) {
        let status = self.status(DeploymentState::Stopped, None, BTreeMap::new());
        match self
            .client
            .put_actual(self.session, &self.status_path, &status, None)
            .await
        {
            Ok(()) => {
                self.state.send_replace(DeploymentState::Stopped);
            }
            Err(e) => warn!(path = %self.status_path, error = %e, "failed to report STOPPED"),
        }
    }

    fn status(
        &self,
        state: DeploymentState,
        message: Option<String>,
        ports: BTreeMap<String, u16>,
    ) -> TaskStatus {
        TaskStatus {
            job_id: self.deployment.job_id.clone(),
            host: self.deployment.host.clone(),
            generation: self.deployment.generation,
            state,
            message,
            ports,
            updated_at: epoch_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{HostScript, ScriptedRuntime};
    use convoy_state::{HealthCheck, JobId, LocalStore};

    const HOST: &str = "h1";

    struct Harness {
        client: StoreClient,
        runtime: Arc<ScriptedRuntime>,
        session: SessionId,
    }

    async fn harness(script: HostScript) -> Harness {
        let store = LocalStore::open_in_memory().unwrap();
        let client = StoreClient::new(Arc::new(store));
        let session = client.open_session().await.unwrap();
        let runtime = Arc::new(ScriptedRuntime::new().with_default(script));
        Harness {
            client,
            runtime,
            session,
        }
    }

    fn job(check: Option<HealthCheck>) -> JobSpec {
        JobSpec {
            name: "web".to_string(),
            version: "1".to_string(),
            image: "web:1".to_string(),
            command: vec![],
            env: Default::default(),
            ports: Default::default(),
            resources: Default::default(),
            health_check: check,
        }
    }

    fn config() -> MachineConfig {
        MachineConfig {
            start_timeout: Duration::from_millis(200),
            prober: Prober::new(Duration::from_millis(10), Duration::from_millis(50)),
        }
    }

    /// Write generation `generation` of the desired entry.
    async fn assign(
        h: &Harness,
        job: &JobSpec,
        generation: u64,
        grace_ms: u64,
    ) -> Versioned<Deployment> {
        let job_id = h.client.put_job(job).await.unwrap();
        let deployment = Deployment {
            job_id: job_id.clone(),
            job_name: job.name.clone(),
            host: HOST.to_string(),
            group: None,
            generation,
            grace_period_ms: grace_ms,
        };
        let path = paths::deployment(HOST, &job_id);
        let version = match h.client.read::<Deployment>(&path).await.unwrap() {
            Some(current) => h
                .client
                .update_desired(&path, &deployment, current.version)
                .await
                .unwrap(),
            None => h.client.create_desired(&path, &deployment).await.unwrap(),
        };
        Versioned {
            value: deployment,
            version,
        }
    }

    fn machine(h: &Harness, job: &JobSpec, desired: Versioned<Deployment>) -> DeploymentMachine {
        DeploymentMachine::new(
            h.client.clone(),
            h.session,
            h.runtime.clone(),
            config(),
            job.clone(),
            desired,
        )
    }

    async fn status(h: &Harness, job_id: &JobId) -> Option<TaskStatus> {
        h.client.read_status(HOST, job_id).await.unwrap()
    }

    #[tokio::test]
    async fn healthy_instance_runs_until_removed() {
        let h = harness(HostScript::default()).await;
        let job = job(Some(HealthCheck::exec(&["check"])));
        let desired = assign(&h, &job, 1, 1_000).await;
        let m = machine(&h, &job, desired);
        let mut state = m.state();
        let (_tx, rx) = watch::channel(false);
        let task = tokio::spawn(m.run(rx));

        state
            .wait_for(|s| *s == DeploymentState::Running)
            .await
            .unwrap();
        let running = status(&h, &job.id()).await.unwrap();
        assert_eq!(running.state, DeploymentState::Running);
        assert_eq!(running.generation, 1);
        assert_eq!(h.runtime.running_on(HOST), vec![job.id()]);

        h.client
            .delete_desired(&paths::deployment(HOST, &job.id()), None)
            .await
            .unwrap();
        let outcome = task.await.unwrap();
        assert!(matches!(outcome, MachineOutcome::Stopped));
        assert_eq!(status(&h, &job.id()).await.unwrap().state, DeploymentState::Stopped);
        assert!(h.runtime.running_on(HOST).is_empty());
    }

    #[tokio::test]
    async fn no_health_check_goes_straight_to_running() {
        let h = harness(HostScript::default()).await;
        let job = job(None);
        let desired = assign(&h, &job, 1, 1_000).await;
        let m = machine(&h, &job, desired);
        let mut state = m.state();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(m.run(rx));

        state
            .wait_for(|s| *s == DeploymentState::Running)
            .await
            .unwrap();
        tx.send_replace(true);
        assert!(matches!(task.await.unwrap(), MachineOutcome::Cancelled));
        // Cancellation leaves the last report alone.
        assert_eq!(status(&h, &job.id()).await.unwrap().state, DeploymentState::Running);
        assert!(h.runtime.running_on(HOST).is_empty());
    }

    #[tokio::test]
    async fn never_healthy_fails_after_grace() {
        let h = harness(HostScript::unhealthy()).await;
        let job = job(Some(HealthCheck::exec(&["check"])));
        let desired = assign(&h, &job, 1, 100).await;
        let (_tx, rx) = watch::channel(false);

        let outcome = machine(&h, &job, desired).run(rx).await;
        assert!(matches!(outcome, MachineOutcome::Failed(DeployError::ProbeTimeout(_))));
        let failed = status(&h, &job.id()).await.unwrap();
        assert_eq!(failed.state, DeploymentState::Failed);
        assert!(failed.message.unwrap().contains("health check"));
        assert!(h.runtime.running_on(HOST).is_empty());
    }

    #[tokio::test]
    async fn start_errors_and_timeouts_fail() {
        let h = harness(HostScript::failing_start()).await;
        let job = job(None);
        let desired = assign(&h, &job, 1, 100).await;
        let (_tx, rx) = watch::channel(false);
        let outcome = machine(&h, &job, desired).run(rx).await;
        assert!(matches!(outcome, MachineOutcome::Failed(DeployError::Runtime(_))));
        assert_eq!(status(&h, &job.id()).await.unwrap().state, DeploymentState::Failed);

        let h = harness(HostScript::hanging_start()).await;
        let desired = assign(&h, &job, 1, 100).await;
        let (_tx, rx) = watch::channel(false);
        let outcome = machine(&h, &job, desired).run(rx).await;
        assert!(matches!(outcome, MachineOutcome::Failed(DeployError::StartTimeout(_))));
    }

    #[tokio::test]
    async fn superseded_while_health_checking_reports_nothing_more() {
        let h = harness(HostScript::unhealthy()).await;
        let job = job(Some(HealthCheck::exec(&["check"])));
        let desired = assign(&h, &job, 1, 300).await;
        let m = machine(&h, &job, desired);
        let mut state = m.state();
        let (_tx, rx) = watch::channel(false);
        let task = tokio::spawn(m.run(rx));

        state
            .wait_for(|s| *s == DeploymentState::HealthChecking)
            .await
            .unwrap();
        assign(&h, &job, 2, 300).await;

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, MachineOutcome::Superseded));

        // Outlast the old grace period: generation 1 must never turn FAILED.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let last = status(&h, &job.id()).await.unwrap();
        assert_eq!(last.generation, 1);
        assert_eq!(last.state, DeploymentState::HealthChecking);
        assert!(h.runtime.running_on(HOST).is_empty());
    }

    #[tokio::test]
    async fn stale_before_first_report_writes_nothing() {
        let h = harness(HostScript::default()).await;
        let job = job(None);
        let stale = assign(&h, &job, 1, 100).await;
        assign(&h, &job, 2, 100).await;

        let (_tx, rx) = watch::channel(false);
        let outcome = machine(&h, &job, stale).run(rx).await;
        assert!(matches!(outcome, MachineOutcome::Superseded));
        assert!(status(&h, &job.id()).await.is_none());
        assert!(h.runtime.attempted_hosts().is_empty());
    }
}
