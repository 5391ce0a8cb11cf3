//! Rollout status — per-host outcomes and the aggregate phase.
//!
//! A rollout persists nothing of its own. [`RolloutStatus::reconstruct`]
//! rebuilds the per-host picture from the desired and actual trees, so a
//! new leader can report on (or replay) a rollout its predecessor began.

use serde::{Deserialize, Serialize};

use convoy_state::{DeploymentState, HostId, JobId, StoreClient, StoreResult};

/// Where one host stands in a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HostOutcome {
    /// No desired entry was written for this host.
    NotAttempted,
    /// Assigned, but the agent has not reported this generation yet.
    Pending,
    InProgress { state: DeploymentState },
    Running,
    Failed { reason: String },
    Stopped,
    /// No terminal state within the per-host timeout.
    TimedOut { last: Option<DeploymentState> },
    /// The status vanished mid-rollout: the agent's session ended.
    Lost,
}

impl HostOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotAttempted | Self::Pending | Self::InProgress { .. })
    }

    /// Terminal outcomes other than RUNNING: they count against the rollout.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed { .. } | Self::Stopped | Self::TimedOut { .. } | Self::Lost
        )
    }

    /// Outcome for a reported lifecycle state.
    pub(crate) fn from_state(state: DeploymentState, message: Option<String>) -> Self {
        match state {
            DeploymentState::Running => Self::Running,
            DeploymentState::Failed => Self::Failed {
                reason: message.unwrap_or_else(|| "deployment failed".to_string()),
            },
            DeploymentState::Stopped => Self::Stopped,
            state => Self::InProgress { state },
        }
    }
}

/// Aggregate phase of a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Not started yet.
    Pending,
    /// Processing batch `current` of `total`.
    RollingBatch { current: u32, total: u32 },
    /// Every target host is RUNNING.
    Succeeded,
    /// Best-effort rollout finished with `failed` hosts not RUNNING.
    Degraded { failed: u32 },
    Failed { reason: String },
    Cancelled,
    LeadershipLost,
    /// Derived from store state: hosts still in flight or never attempted.
    Incomplete,
}

impl RolloutPhase {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::RollingBatch { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostReport {
    pub host: HostId,
    pub outcome: HostOutcome,
}

/// Outcome tallies over a rollout's hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub running: u32,
    pub failed: u32,
    pub stopped: u32,
    pub in_flight: u32,
    pub not_attempted: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub job_id: JobId,
    pub group: String,
    pub phase: RolloutPhase,
    /// Target hosts in rollout order.
    pub hosts: Vec<HostReport>,
    /// Store operations are waiting out an outage.
    pub stalled: bool,
}

impl RolloutStatus {
    /// A fresh status with every host not yet attempted.
    pub fn new(job_id: JobId, group: &str, hosts: &[HostId]) -> Self {
        Self {
            job_id,
            group: group.to_string(),
            phase: RolloutPhase::Pending,
            hosts: hosts
                .iter()
                .map(|host| HostReport {
                    host: host.clone(),
                    outcome: HostOutcome::NotAttempted,
                })
                .collect(),
            stalled: false,
        }
    }

    pub fn outcome(&self, host: &str) -> Option<&HostOutcome> {
        self.hosts.iter().find(|r| r.host == host).map(|r| &r.outcome)
    }

    pub fn set_outcome(&mut self, host: &str, outcome: HostOutcome) {
        if let Some(report) = self.hosts.iter_mut().find(|r| r.host == host) {
            report.outcome = outcome;
        }
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for report in &self.hosts {
            match &report.outcome {
                HostOutcome::Running => counts.running += 1,
                HostOutcome::Stopped => counts.stopped += 1,
                HostOutcome::NotAttempted => counts.not_attempted += 1,
                HostOutcome::Pending | HostOutcome::InProgress { .. } => counts.in_flight += 1,
                HostOutcome::Failed { .. } | HostOutcome::TimedOut { .. } | HostOutcome::Lost => {
                    counts.failed += 1
                }
            }
        }
        counts
    }

    /// Rebuild a rollout's status from the desired and actual trees.
    ///
    /// A host with no desired entry for `job_id` is not attempted; one
    /// whose agent has not reported the current generation is pending.
    pub async fn reconstruct(
        client: &StoreClient,
        job_id: &JobId,
        group: &str,
        hosts: &[HostId],
    ) -> StoreResult<Self> {
        let mut status = Self::new(job_id.clone(), group, hosts);
        for host in hosts {
            let Some(desired) = client.read_deployment(host, job_id).await? else {
                continue;
            };
            let outcome = match client.read_status(host, job_id).await? {
                Some(s) if s.generation == desired.value.generation => {
                    HostOutcome::from_state(s.state, s.message)
                }
                _ => HostOutcome::Pending,
            };
            status.set_outcome(host, outcome);
        }
        status.phase = derive_phase(&status.counts(), status.hosts.len());
        Ok(status)
    }
}

/// Phase implied by host outcomes alone.
fn derive_phase(counts: &OutcomeCounts, total: usize) -> RolloutPhase {
    if total > 0 && counts.running as usize == total {
        RolloutPhase::Succeeded
    } else if counts.in_flight > 0 || counts.not_attempted > 0 {
        RolloutPhase::Incomplete
    } else if counts.failed > 0 || counts.stopped > 0 {
        RolloutPhase::Failed {
            reason: format!(
                "{} of {total} hosts failed, {} stopped",
                counts.failed, counts.stopped
            ),
        }
    } else {
        RolloutPhase::Incomplete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<HostId> {
        ["h1", "h2", "h3", "h4"].iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn counts_by_outcome() {
        let mut s = RolloutStatus::new(JobId::from("web:1:abc"), "g", &hosts());
        s.set_outcome("h1", HostOutcome::Running);
        s.set_outcome("h2", HostOutcome::Failed { reason: "x".into() });
        s.set_outcome("h3", HostOutcome::InProgress {
            state: DeploymentState::Starting,
        });
        let counts = s.counts();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.in_flight, 1);
        assert_eq!(counts.not_attempted, 1);
    }

    #[test]
    fn unknown_host_is_ignored() {
        let mut s = RolloutStatus::new(JobId::from("web:1:abc"), "g", &hosts());
        s.set_outcome("nope", HostOutcome::Running);
        assert_eq!(s.outcome("nope"), None);
        assert_eq!(s.counts().not_attempted, 4);
    }

    #[test]
    fn derived_phase_never_succeeds_with_non_running_hosts() {
        let all_running = OutcomeCounts {
            running: 4,
            ..Default::default()
        };
        assert_eq!(derive_phase(&all_running, 4), RolloutPhase::Succeeded);

        let one_stopped = OutcomeCounts {
            running: 3,
            stopped: 1,
            ..Default::default()
        };
        assert!(matches!(
            derive_phase(&one_stopped, 4),
            RolloutPhase::Failed { reason } if reason.contains("1 stopped")
        ));

        let one_failed = OutcomeCounts {
            running: 3,
            failed: 1,
            ..Default::default()
        };
        assert!(matches!(derive_phase(&one_failed, 4), RolloutPhase::Failed { .. }));

        let in_flight = OutcomeCounts {
            running: 3,
            in_flight: 1,
            ..Default::default()
        };
        assert_eq!(derive_phase(&in_flight, 4), RolloutPhase::Incomplete);
        assert_eq!(derive_phase(&OutcomeCounts::default(), 0), RolloutPhase::Incomplete);
    }

    #[test]
    fn terminal_and_failure_classes() {
        assert!(HostOutcome::Lost.is_failure());
        assert!(HostOutcome::TimedOut { last: None }.is_terminal());
        assert!(!HostOutcome::Pending.is_terminal());
        assert!(HostOutcome::Stopped.is_failure());
        assert!(!HostOutcome::Running.is_failure());
        assert_eq!(
            HostOutcome::from_state(DeploymentState::HealthChecking, None),
            HostOutcome::InProgress {
                state: DeploymentState::HealthChecking
            }
        );
    }

    #[test]
    fn status_serializes_with_tags() {
        let mut s = RolloutStatus::new(JobId::from("web:1:abc"), "g", &hosts()[..1]);
        s.set_outcome("h1", HostOutcome::Failed { reason: "boom".into() });
        s.phase = RolloutPhase::RollingBatch { current: 1, total: 2 };
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["phase"]["phase"], "rolling_batch");
        assert_eq!(json["hosts"][0]["outcome"]["outcome"], "failed");
        assert_eq!(json["hosts"][0]["outcome"]["reason"], "boom");
    }
}
