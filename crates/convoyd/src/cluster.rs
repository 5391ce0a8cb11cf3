//! Local cluster — one agent per configured host, plus a leader latch,
//! all sharing one coordination store inside this process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use convoy_agent::{Agent, InstanceRuntime, ScriptedRuntime};
use convoy_rollout::RolloutCoordinator;
use convoy_state::{LeaderLatch, LocalStore, StoreClient, StoreResult};

use crate::config::{ConvoyConfig, RuntimeKind};
use crate::runtime::ProcessRuntime;

const LEADERSHIP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LocalCluster {
    client: StoreClient,
    latch: Arc<LeaderLatch>,
    agents: Vec<(Arc<Agent>, JoinHandle<StoreResult<()>>)>,
    shutdown_tx: watch::Sender<bool>,
}

impl LocalCluster {
    pub async fn start(config: &ConvoyConfig, store: LocalStore) -> anyhow::Result<Self> {
        let client = StoreClient::new(Arc::new(store));
        let runtime: Arc<dyn InstanceRuntime> = match config.runtime {
            RuntimeKind::Process => Arc::new(ProcessRuntime::new()),
            RuntimeKind::DryRun => Arc::new(ScriptedRuntime::new()),
        };
        info!(runtime = ?config.runtime, "instance runtime selected");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut agents = Vec::with_capacity(config.group.hosts.len());
        for host in &config.group.hosts {
            let agent = Arc::new(
                Agent::start(host, client.clone(), runtime.clone(), config.agent.machine_config())
                    .await?,
            );
            let task = tokio::spawn({
                let agent = agent.clone();
                let shutdown = shutdown_rx.clone();
                async move { agent.run(shutdown).await }
            });
            agents.push((agent, task));
        }
        info!(hosts = agents.len(), "agents started");

        let latch = LeaderLatch::start(client.clone(), "convoyd").await?;
        tokio::time::timeout(LEADERSHIP_TIMEOUT, latch.await_leadership())
            .await
            .context("timed out waiting for leadership")?;
        info!("leadership acquired");

        Ok(Self {
            client,
            latch: Arc::new(latch),
            agents,
            shutdown_tx,
        })
    }

    pub fn coordinator(&self) -> RolloutCoordinator {
        RolloutCoordinator::new(self.client.clone(), self.latch.clone())
    }

    /// Stop every agent (and its instances), then give up leadership.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        for (agent, task) in self.agents {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(host = %agent.host(), error = %e, "agent ended with error"),
                Err(e) => warn!(host = %agent.host(), error = %e, "agent task failed"),
            }
            match Arc::try_unwrap(agent) {
                Ok(agent) => agent.shutdown().await?,
                Err(agent) => warn!(host = %agent.host(), "agent still referenced, session left open"),
            }
        }
        match Arc::try_unwrap(self.latch) {
            Ok(latch) => latch.close().await?,
            Err(_) => warn!("leader latch still referenced, session left open"),
        }
        info!("local cluster stopped");
        Ok(())
    }
}
