//! Rollout coordinator — drives a job across a deployment group.
//!
//! A rollout orders the group's hosts with its picking strategy, splits
//! them into batches of `parallelism`, and for each batch writes the
//! desired entries and waits for every host to reach a terminal state or
//! time out. Batches are strictly sequential. Under
//! [`FailurePolicy::AbortOnFirstFailure`] the rollout turns FAILED at the
//! first failing host and no later batch is scheduled; under
//! [`FailurePolicy::BestEffort`] every host is attempted. A host that ends
//! STOPPED counts against the rollout like a failed one.
//!
//! Hosts that are already RUNNING stay untouched when a rollout aborts.
//! Rollback is a separate rollout of the previous job spec.
//!
//! Generations of a job on a host only ever increase, also across an
//! undeploy, and a host's answer is the status reported for exactly the
//! generation it was assigned.
//!
//! Only the leader writes desired state. Losing leadership, an explicit
//! cancel, or the overall deadline drop the rollout task at its next
//! suspension point. Desired writes are additionally fenced on the
//! leader's session when leadership lives in the store, so a write racing
//! the loss of leadership is rejected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use convoy_state::{
    Deployment, DeploymentGroup, DeploymentState, HostId, JobId, JobSpec, Leadership, Op,
    StoreClient, StoreError, StoreResult, TaskStatus, Versioned, paths,
};

use crate::error::{RolloutError, RolloutResult};
use crate::policy::{FailurePolicy, RolloutPolicy};
use crate::status::{HostOutcome, RolloutPhase, RolloutStatus};

/// Starts rollouts and issues undeploys on behalf of the leader.
#[derive(Clone)]
pub struct RolloutCoordinator {
    client: StoreClient,
    leadership: Arc<dyn Leadership>,
}

impl RolloutCoordinator {
    pub fn new(client: StoreClient, leadership: Arc<dyn Leadership>) -> Self {
        Self { client, leadership }
    }

    /// Validate the request and launch the rollout in the background.
    pub fn start(
        &self,
        job: JobSpec,
        group: DeploymentGroup,
        policy: RolloutPolicy,
    ) -> RolloutResult<RolloutHandle> {
        if !self.leadership.is_leader() {
            return Err(RolloutError::NotLeader);
        }
        job.validate()?;
        policy.validate()?;
        if group.hosts.is_empty() {
            return Err(RolloutError::EmptyGroup(group.name));
        }

        let job_id = job.id();
        let hosts = policy.strategy.build().order(&group.hosts);
        let status = Arc::new(watch::channel(RolloutStatus::new(job_id.clone(), &group.name, &hosts)).0);
        let (cancel, cancel_rx) = watch::channel(false);

        info!(
            job = %job_id,
            group = %group.name,
            hosts = hosts.len(),
            parallelism = policy.parallelism,
            on_failure = ?policy.on_failure,
            "rollout started"
        );

        let rollout = Rollout {
            client: self.client.clone(),
            leadership: self.leadership.clone(),
            job,
            job_id: job_id.clone(),
            group,
            hosts,
            policy,
            status: status.clone(),
        };
        let task = tokio::spawn(rollout.execute(cancel_rx));

        Ok(RolloutHandle {
            job_id,
            status: status.subscribe(),
            stalled: self.client.stalled(),
            cancel,
            task,
        })
    }

    /// Remove the desired entries for `job_id` on `hosts`. Agents then
    /// stop the instances and report STOPPED. Returns the hosts that had
    /// an entry.
    pub async fn undeploy(&self, job_id: &JobId, hosts: &[HostId]) -> RolloutResult<Vec<HostId>> {
        let mut removed = Vec::new();
        for host in hosts {
            if !self.leadership.is_leader() {
                return Err(RolloutError::NotLeader);
            }
            let path = paths::deployment(host, job_id);
            loop {
                let Some(current) = self.client.read::<Deployment>(&path).await? else {
                    break;
                };
                let ops = [Op::Delete {
                    path: path.clone(),
                    version: Some(current.version),
                }];
                match self.client.commit_as_leader(self.leadership.fence(), &ops).await {
                    Ok(_) => {
                        info!(%host, job = %job_id, "undeployed");
                        removed.push(host.clone());
                        break;
                    }
                    Err(e) if e.is_fenced_out(paths::LEADER) => return Err(RolloutError::NotLeader),
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }
}

/// Observe or cancel a running rollout.
pub struct RolloutHandle {
    job_id: JobId,
    status: watch::Receiver<RolloutStatus>,
    stalled: watch::Receiver<bool>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<RolloutStatus>,
}

impl RolloutHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Snapshot of per-host outcomes and the aggregate phase.
    pub fn status(&self) -> RolloutStatus {
        let mut status = self.status.borrow().clone();
        status.stalled = *self.stalled.borrow();
        status
    }

    /// Change feed of the rollout status.
    pub fn subscribe(&self) -> watch::Receiver<RolloutStatus> {
        self.status.clone()
    }

    /// Stop scheduling further work. Hosts already assigned keep going.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait for the rollout to finish.
    pub async fn wait(self) -> RolloutStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                warn!(job = %self.job_id, error = %e, "rollout task ended abnormally");
                let mut status = self.status.borrow().clone();
                status.phase = RolloutPhase::Failed {
                    reason: format!("rollout task ended abnormally: {e}"),
                };
                status
            }
        }
    }
}

struct Rollout {
    client: StoreClient,
    leadership: Arc<dyn Leadership>,
    job: JobSpec,
    job_id: JobId,
    group: DeploymentGroup,
    hosts: Vec<HostId>,
    policy: RolloutPolicy,
    status: Arc<watch::Sender<RolloutStatus>>,
}

impl Rollout {
    async fn execute(self, mut cancel: watch::Receiver<bool>) -> RolloutStatus {
        let mut leadership = self.leadership.subscribe();
        let deadline = self.policy.deadline();

        let phase = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => RolloutPhase::Cancelled,
            _ = leadership.wait_for(|leader| !*leader) => RolloutPhase::LeadershipLost,
            _ = expire(deadline) => RolloutPhase::Failed {
                reason: format!("rollout deadline of {:?} exceeded", deadline.unwrap_or_default()),
            },
            phase = self.drive() => phase,
        };

        // A failure already published mid-batch stands.
        let phase = match &self.status.borrow().phase {
            failed @ RolloutPhase::Failed { .. } => failed.clone(),
            _ => phase,
        };
        match &phase {
            RolloutPhase::Succeeded => info!(job = %self.job_id, group = %self.group.name, "rollout succeeded"),
            phase => warn!(job = %self.job_id, group = %self.group.name, ?phase, "rollout ended"),
        }
        self.status.send_modify(|s| {
            s.phase = phase;
            s.stalled = self.client.is_stalled();
        });
        self.status.borrow().clone()
    }

    async fn drive(&self) -> RolloutPhase {
        if let Err(e) = self.publish().await {
            return RolloutPhase::Failed {
                reason: format!("failed to publish job: {e}"),
            };
        }

        let total = self.policy.batch_count(self.hosts.len());
        let mut failed = 0u32;
        for (index, batch) in self.hosts.chunks(self.policy.batch_size()).enumerate() {
            let current = u32::try_from(index + 1).unwrap_or(u32::MAX);
            self.status.send_modify(|s| {
                s.phase = RolloutPhase::RollingBatch {
                    current,
                    total: u32::try_from(total).unwrap_or(u32::MAX),
                }
            });
            debug!(job = %self.job_id, batch = current, total, hosts = ?batch, "batch started");

            let results = match self.run_batch(batch).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(job = %self.job_id, batch = current, error = %e, "desired write fenced out");
                    return RolloutPhase::LeadershipLost;
                }
            };
            let batch_failures: Vec<&(HostId, HostOutcome)> =
                results.iter().filter(|(_, o)| o.is_failure()).collect();
            failed += u32::try_from(batch_failures.len()).unwrap_or(u32::MAX);

            if let Some((host, outcome)) = batch_failures.first() {
                if self.policy.on_failure == FailurePolicy::AbortOnFirstFailure {
                    warn!(job = %self.job_id, batch = current, %host, "aborting rollout");
                    return RolloutPhase::Failed {
                        reason: failure_reason(host, outcome),
                    };
                }
            }
        }

        if failed == 0 {
            RolloutPhase::Succeeded
        } else {
            RolloutPhase::Degraded { failed }
        }
    }

    /// Store the job spec and group membership.
    async fn publish(&self) -> StoreResult<()> {
        self.client.put_job(&self.job).await?;
        self.client.put_group(&self.group).await
    }

    /// Assign every host of a batch, then wait for all of them. Results
    /// are in resolution order. Fails only when a desired write was
    /// fenced out by a new leader.
    async fn run_batch(&self, batch: &[HostId]) -> StoreResult<Vec<(HostId, HostOutcome)>> {
        let mut results = Vec::with_capacity(batch.len());
        let mut waits = JoinSet::new();

        for host in batch {
            match self.assign(host).await {
                Ok(generation) => {
                    self.record(host, HostOutcome::Pending);
                    waits.spawn(wait_for_host(
                        self.client.clone(),
                        host.clone(),
                        self.job_id.clone(),
                        generation,
                        self.policy.host_timeout(),
                        self.status.clone(),
                    ));
                }
                Err(e) if e.is_fenced_out(paths::LEADER) => return Err(e),
                Err(e) => {
                    warn!(%host, job = %self.job_id, error = %e, "assignment failed");
                    let outcome = HostOutcome::Failed {
                        reason: format!("assignment failed: {e}"),
                    };
                    self.resolve(host.clone(), outcome, &mut results);
                }
            }
        }

        while let Some(joined) = waits.join_next().await {
            match joined {
                Ok((host, outcome)) => self.resolve(host, outcome, &mut results),
                Err(e) => warn!(job = %self.job_id, error = %e, "host wait task failed"),
            }
        }
        Ok(results)
    }

    /// Record a host's final outcome. Under abort-on-first-failure the
    /// first failure turns the rollout FAILED right away, while its
    /// batch-mates keep resolving.
    fn resolve(&self, host: HostId, outcome: HostOutcome, results: &mut Vec<(HostId, HostOutcome)>) {
        let abort = self.policy.on_failure == FailurePolicy::AbortOnFirstFailure
            && outcome.is_failure()
            && !results.iter().any(|(_, o)| o.is_failure());
        if abort {
            warn!(job = %self.job_id, %host, "host failed, rollout marked FAILED");
        }
        self.status.send_modify(|s| {
            s.set_outcome(&host, outcome.clone());
            if abort {
                s.phase = RolloutPhase::Failed {
                    reason: failure_reason(&host, &outcome),
                };
            }
        });
        results.push((host, outcome));
    }

    /// Write the desired entry for `host`, returning the generation the
    /// host must report.
    ///
    /// An entry whose current generation is live (not FAILED or STOPPED)
    /// is reused, so replaying a rollout leaves healthy hosts alone.
    /// Otherwise a fresh generation is issued, and any other version of
    /// the same job on the host is removed in the same commit.
    async fn assign(&self, host: &str) -> StoreResult<u64> {
        let path = paths::deployment(host, &self.job_id);
        let counter_path = paths::generation(host, &self.job_id);
        loop {
            let current = self.client.read::<Deployment>(&path).await?;
            let reported = self.client.read_status(host, &self.job_id).await?;
            if let Some(current) = &current {
                if is_live(current, reported.as_ref()) {
                    debug!(%host, job = %self.job_id, generation = current.value.generation, "reusing live deployment");
                    return Ok(current.value.generation);
                }
            }

            // Above anything issued or reported before, even for a
            // desired entry that has since been deleted.
            let counter = self.client.read::<u64>(&counter_path).await?;
            let generation = [
                current.as_ref().map(|c| c.value.generation),
                counter.as_ref().map(|c| c.value),
                reported.as_ref().map(|r| r.generation),
            ]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(0)
                + 1;
            let deployment = Deployment {
                job_id: self.job_id.clone(),
                job_name: self.job.name.clone(),
                host: host.to_string(),
                group: Some(self.group.name.clone()),
                generation,
                grace_period_ms: self.policy.grace_period_ms,
            };
            let data = serde_json::to_vec(&deployment).map_err(|e| StoreError::Serialize(e.to_string()))?;
            let issued = serde_json::to_vec(&generation).map_err(|e| StoreError::Serialize(e.to_string()))?;

            let mut ops = vec![
                upsert(&path, data, current.as_ref().map(|c| c.version)),
                upsert(&counter_path, issued, counter.as_ref().map(|c| c.version)),
            ];
            for other in self.client.list_deployments(host).await? {
                if other.value.job_name == self.job.name && other.value.job_id != self.job_id {
                    ops.push(Op::Delete {
                        path: paths::deployment(host, &other.value.job_id),
                        version: Some(other.version),
                    });
                }
            }

            match self.client.commit_as_leader(self.leadership.fence(), &ops).await {
                Ok(_) => {
                    info!(%host, job = %self.job_id, generation, replaced = ops.len() - 2, "host assigned");
                    return Ok(generation);
                }
                Err(e) if e.is_fenced_out(paths::LEADER) => return Err(e),
                Err(e) if e.is_conflict() => {
                    debug!(%host, job = %self.job_id, error = %e, "assignment raced, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record(&self, host: &str, outcome: HostOutcome) {
        self.status.send_modify(|s| s.set_outcome(host, outcome));
    }
}

fn is_live(current: &Versioned<Deployment>, reported: Option<&TaskStatus>) -> bool {
    reported.is_some_and(|s| {
        s.generation == current.value.generation
            && !matches!(s.state, DeploymentState::Failed | DeploymentState::Stopped)
    })
}

/// Create `path`, or replace it at `version` when it exists.
fn upsert(path: &str, data: Vec<u8>, version: Option<u64>) -> Op {
    match version {
        Some(version) => Op::Set {
            path: path.to_string(),
            data,
            version: Some(version),
        },
        None => Op::Create {
            path: path.to_string(),
            data,
            ephemeral: false,
        },
    }
}

/// Follow one host's status until it reaches a terminal state for
/// exactly `generation` or `timeout` elapses.
async fn wait_for_host(
    client: StoreClient,
    host: HostId,
    job_id: JobId,
    generation: u64,
    timeout: Duration,
    status: Arc<watch::Sender<RolloutStatus>>,
) -> (HostId, HostOutcome) {
    let mut last = None;
    let follow = async {
        let mut events = match client.watch(&paths::status(&host, &job_id)).await {
            Ok(events) => events,
            Err(e) => {
                return HostOutcome::Failed {
                    reason: format!("cannot watch status: {e}"),
                };
            }
        };
        let mut seen = false;
        loop {
            match client.read_status(&host, &job_id).await {
                Ok(Some(report)) if report.generation == generation => {
                    seen = true;
                    last = Some(report.state);
                    let outcome = HostOutcome::from_state(report.state, report.message);
                    if outcome.is_terminal() {
                        return outcome;
                    }
                    status.send_modify(|s| s.set_outcome(&host, outcome));
                }
                Ok(None) if seen => {
                    warn!(%host, job = %job_id, "status vanished, agent lost");
                    return HostOutcome::Lost;
                }
                Ok(_) => {}
                Err(e) => warn!(%host, job = %job_id, error = %e, "status read failed"),
            }
            if events.recv().await.is_none() {
                return HostOutcome::Failed {
                    reason: "status watch closed".to_string(),
                };
            }
        }
    };

    let outcome = match tokio::time::timeout(timeout, follow).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(%host, job = %job_id, ?timeout, "host timed out");
            HostOutcome::TimedOut { last }
        }
    };
    debug!(%host, job = %job_id, ?outcome, "host resolved");
    (host, outcome)
}

fn failure_reason(host: &str, outcome: &HostOutcome) -> String {
    format!("host {host} failed: {}", describe(outcome))
}

fn describe(outcome: &HostOutcome) -> String {
    match outcome {
        HostOutcome::Failed { reason } => reason.clone(),
        HostOutcome::Stopped => "instance stopped".to_string(),
        HostOutcome::TimedOut { last: Some(state) } => format!("timed out in {state}"),
        HostOutcome::TimedOut { last: None } => "timed out before reporting".to_string(),
        HostOutcome::Lost => "agent lost".to_string(),
        other => format!("{other:?}"),
    }
}

/// Resolves once cancel is requested. A dropped handle never cancels.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn expire(deadline: Option<Duration>) {
    match deadline {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
