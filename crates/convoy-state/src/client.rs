//! StoreClient — typed access to desired and actual state.
//!
//! Wraps a [`CoordinationStore`] with JSON (de)serialization, the path
//! layout from [`crate::paths`], and retry with exponential backoff
//! while the store is unavailable. Every other error is returned to the
//! caller unchanged.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::paths;
use crate::store::{CoordinationStore, Op, SessionId, Stat, Watch};
use crate::types::{Deployment, DeploymentGroup, JobId, JobSpec, TaskStatus};

/// Attempts at an ephemeral create-or-set before giving up on races.
const PUT_ATTEMPTS: usize = 3;

/// Backoff schedule for retrying an unavailable store.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// A decoded node value with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Condition an actual-state write on a desired node's version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub path: String,
    pub version: u64,
}

/// Typed, retrying client over a shared coordination store.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn CoordinationStore>,
    retry: RetryPolicy,
    /// Operations currently waiting out an unavailable store.
    stalled_ops: Arc<AtomicUsize>,
    stalled: Arc<watch::Sender<bool>>,
}

impl StoreClient {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        let (stalled, _) = watch::channel(false);
        Self {
            store,
            retry: RetryPolicy::default(),
            stalled_ops: Arc::new(AtomicUsize::new(0)),
            stalled: Arc::new(stalled),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// `true` while any operation through this client is retrying an
    /// unavailable store.
    pub fn stalled(&self) -> watch::Receiver<bool> {
        self.stalled.subscribe()
    }

    pub fn is_stalled(&self) -> bool {
        *self.stalled.borrow()
    }

    /// Run `op`, retrying indefinitely with backoff while it fails with
    /// [`StoreError::Unavailable`].
    pub async fn retry<T, F>(&self, what: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> StoreResult<T>,
    {
        let mut backoff = self.retry.initial_backoff;
        let mut stalled = false;
        let result = loop {
            match op() {
                Err(StoreError::Unavailable) => {
                    if !stalled {
                        stalled = true;
                        self.stalled_ops.fetch_add(1, Ordering::SeqCst);
                        self.stalled.send_replace(true);
                        warn!(op = what, "coordination store unavailable, retrying");
                    }
                    debug!(op = what, backoff_ms = backoff.as_millis(), "store retry backoff");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                }
                other => break other,
            }
        };
        if stalled && self.stalled_ops.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.stalled.send_replace(false);
            debug!(op = what, "coordination store reachable again");
        }
        result
    }

    // ── Sessions and watches ───────────────────────────────────────

    pub async fn open_session(&self) -> StoreResult<SessionId> {
        self.retry("open_session", || self.store.open_session()).await
    }

    pub async fn close_session(&self, session: SessionId) -> StoreResult<()> {
        self.retry("close_session", || self.store.close_session(session))
            .await
    }

    pub async fn watch(&self, path: &str) -> StoreResult<Watch> {
        self.retry("watch", || self.store.watch(path)).await
    }

    pub async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.retry("children", || self.store.children(path)).await
    }

    pub async fn commit(&self, session: Option<SessionId>, ops: &[Op]) -> StoreResult<Vec<Stat>> {
        self.retry("commit", || self.store.commit(session, ops)).await
    }

    /// Commit desired-state `ops` on behalf of the leader. With a fence
    /// session the commit also requires that session to still own
    /// `/leader`, so a deposed leader cannot land a write.
    pub async fn commit_as_leader(
        &self,
        fence: Option<SessionId>,
        ops: &[Op],
    ) -> StoreResult<Vec<Stat>> {
        let Some(session) = fence else {
            return self.commit(None, ops).await;
        };
        let mut fenced = Vec::with_capacity(ops.len() + 1);
        fenced.push(Op::CheckOwner {
            path: paths::LEADER.to_string(),
        });
        fenced.extend_from_slice(ops);
        self.commit(Some(session), &fenced).await
    }

    // ── Generic typed access ───────────────────────────────────────

    /// Read and decode a node, `None` if it does not exist.
    pub async fn read<T: DeserializeOwned>(&self, path: &str) -> StoreResult<Option<Versioned<T>>> {
        let node = self.retry("read", || self.store.get(path)).await?;
        node.map(|n| {
            let value = serde_json::from_slice(&n.data)
                .map_err(|e| StoreError::Deserialize(format!("{path}: {e}")))?;
            Ok(Versioned {
                value,
                version: n.stat.version,
            })
        })
        .transpose()
    }

    /// Create a persistent desired-state node. Fails with `NodeExists` if
    /// another writer created it first.
    pub async fn create_desired<T: Serialize>(&self, path: &str, value: &T) -> StoreResult<u64> {
        let data = encode(value)?;
        let stat = self
            .retry("create_desired", || self.store.create(None, path, &data, false))
            .await?;
        debug!(%path, "desired state created");
        Ok(stat.version)
    }

    /// Replace a desired-state node if it is still at `expected_version`.
    pub async fn update_desired<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        expected_version: u64,
    ) -> StoreResult<u64> {
        let data = encode(value)?;
        let stat = self
            .retry("update_desired", || {
                self.store.set(None, path, &data, Some(expected_version))
            })
            .await?;
        debug!(%path, version = stat.version, "desired state updated");
        Ok(stat.version)
    }

    pub async fn delete_desired(&self, path: &str, expected_version: Option<u64>) -> StoreResult<()> {
        self.retry("delete_desired", || self.store.delete(None, path, expected_version))
            .await?;
        debug!(%path, "desired state deleted");
        Ok(())
    }

    /// Create or overwrite an ephemeral actual-state node owned by
    /// `session`. With a guard, the write only lands if the guard node is
    /// still at the given version; a failed guard surfaces as an error
    /// whose [`StoreError::path`] is the guard path.
    pub async fn put_actual<T: Serialize>(
        &self,
        session: SessionId,
        path: &str,
        value: &T,
        guard: Option<&Guard>,
    ) -> StoreResult<()> {
        let data = encode(value)?;
        let mut last_err = None;
        for _ in 0..PUT_ATTEMPTS {
            let exists = self.retry("put_actual", || self.store.get(path)).await?.is_some();
            let mut ops = Vec::with_capacity(2);
            if let Some(g) = guard {
                ops.push(Op::Check {
                    path: g.path.clone(),
                    version: g.version,
                });
            }
            ops.push(if exists {
                Op::Set {
                    path: path.to_string(),
                    data: data.clone(),
                    version: None,
                }
            } else {
                Op::Create {
                    path: path.to_string(),
                    data: data.clone(),
                    ephemeral: true,
                }
            });
            match self.commit(Some(session), &ops).await {
                Ok(_) => return Ok(()),
                // Lost a create/delete race on our own node; re-read.
                Err(e) if e.is_conflict() && e.path() == Some(path) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::NotFound(path.to_string())))
    }

    // ── Domain helpers ─────────────────────────────────────────────

    /// Store a job spec under its content id. Storing an identical spec
    /// twice is a no-op.
    pub async fn put_job(&self, job: &JobSpec) -> StoreResult<JobId> {
        let id = job.id();
        match self.create_desired(&paths::job(&id), job).await {
            Ok(_) | Err(StoreError::NodeExists(_)) => Ok(id),
            Err(e) => Err(e),
        }
    }

    pub async fn read_job(&self, job_id: &JobId) -> StoreResult<Option<JobSpec>> {
        Ok(self.read(&paths::job(job_id)).await?.map(|v| v.value))
    }

    /// Create or replace a group's host membership.
    pub async fn put_group(&self, group: &DeploymentGroup) -> StoreResult<()> {
        let path = paths::group_hosts(&group.name);
        loop {
            let result = match self.read::<DeploymentGroup>(&path).await? {
                Some(current) if current.value == *group => return Ok(()),
                Some(current) => self.update_desired(&path, group, current.version).await,
                None => self.create_desired(&path, group).await,
            };
            match result {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn read_group(&self, name: &str) -> StoreResult<Option<DeploymentGroup>> {
        Ok(self.read(&paths::group_hosts(name)).await?.map(|v| v.value))
    }

    pub async fn read_deployment(
        &self,
        host: &str,
        job_id: &JobId,
    ) -> StoreResult<Option<Versioned<Deployment>>> {
        self.read(&paths::deployment(host, job_id)).await
    }

    /// All desired deployments for a host.
    pub async fn list_deployments(&self, host: &str) -> StoreResult<Vec<Versioned<Deployment>>> {
        let mut out = Vec::new();
        for name in self.children(&paths::host_deployments(host)).await? {
            let path = format!("{}/{name}", paths::host_deployments(host));
            if let Some(d) = self.read(&path).await? {
                out.push(d);
            }
        }
        Ok(out)
    }

    pub async fn read_status(&self, host: &str, job_id: &JobId) -> StoreResult<Option<TaskStatus>> {
        Ok(self.read(&paths::status(host, job_id)).await?.map(|v| v.value))
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialize(e.to_string()))
}
