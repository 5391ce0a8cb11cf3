//! Leader election as an explicit capability.
//!
//! Only the current leader may write desired state. Consumers hold a
//! [`Leadership`] and treat a transition to "not leader" as a
//! cancellation signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::StoreClient;
use crate::error::{StoreError, StoreResult};
use crate::paths;
use crate::store::{ChangeKind, SessionId};

/// Backoff between election attempts after a store error.
const ELECTION_RETRY: Duration = Duration::from_millis(200);

/// "Am I the leader?" plus a change feed.
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Receives `false` as soon as leadership is lost.
    fn subscribe(&self) -> watch::Receiver<bool>;

    /// Session that must own `/leader` for a desired-state commit to land.
    /// `None` when leadership is not held in the store.
    fn fence(&self) -> Option<SessionId> {
        None
    }
}

/// Leadership decided by the embedder (single-process deployments, tests).
pub struct FixedLeadership {
    tx: watch::Sender<bool>,
}

impl FixedLeadership {
    pub fn leader() -> Arc<Self> {
        Arc::new(Self {
            tx: watch::channel(true).0,
        })
    }

    pub fn follower() -> Arc<Self> {
        Arc::new(Self {
            tx: watch::channel(false).0,
        })
    }

    pub fn set(&self, leader: bool) {
        self.tx.send_replace(leader);
    }
}

impl Leadership for FixedLeadership {
    fn is_leader(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Store-backed election: the candidate whose session owns the ephemeral
/// `/leader` node is leader. When that session ends the node vanishes and
/// the remaining candidates race to recreate it.
pub struct LeaderLatch {
    candidate: String,
    session: SessionId,
    client: StoreClient,
    tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LeaderLatch {
    /// Open a session and start contending for leadership.
    pub async fn start(client: StoreClient, candidate: &str) -> StoreResult<Self> {
        let session = client.open_session().await?;
        let (tx, _) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_election(
            client.clone(),
            candidate.to_string(),
            session,
            tx.clone(),
            shutdown_rx,
        ));

        info!(%candidate, session, "leader latch started");
        Ok(Self {
            candidate: candidate.to_string(),
            session,
            client,
            tx,
            shutdown_tx,
            handle,
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Resolve once this candidate holds leadership.
    pub async fn await_leadership(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|leader| *leader).await;
    }

    /// Give up leadership and end the session.
    pub async fn close(self) -> StoreResult<()> {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
        self.tx.send_replace(false);
        match self.client.close_session(self.session).await {
            Ok(()) | Err(StoreError::SessionExpired(_)) => {}
            Err(e) => return Err(e),
        }
        info!(candidate = %self.candidate, "leader latch closed");
        Ok(())
    }
}

impl Leadership for LeaderLatch {
    fn is_leader(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    fn fence(&self) -> Option<SessionId> {
        Some(self.session)
    }
}

async fn run_election(
    client: StoreClient,
    candidate: String,
    session: SessionId,
    tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut events = match client.watch(paths::LEADER).await {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "leader watch failed");
                tokio::time::sleep(ELECTION_RETRY).await;
                continue;
            }
        };

        let attempt = client
            .retry("elect", || {
                client
                    .store()
                    .create(Some(session), paths::LEADER, candidate.as_bytes(), true)
            })
            .await;
        match attempt {
            Ok(_) => {
                tx.send_replace(true);
                info!(%candidate, "acquired leadership");
            }
            Err(StoreError::NodeExists(_)) => {
                tx.send_replace(false);
                debug!(%candidate, "another candidate leads, waiting");
            }
            Err(StoreError::SessionExpired(_)) => {
                tx.send_replace(false);
                warn!(%candidate, "election session expired");
                return;
            }
            Err(e) => {
                warn!(%candidate, error = %e, "election attempt failed");
                tokio::time::sleep(ELECTION_RETRY).await;
                continue;
            }
        }

        // Wait for the current leader node to go away.
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(e) if e.path == paths::LEADER && e.kind == ChangeKind::Deleted => break,
                    Some(_) => {}
                    None => return,
                },
                _ = shutdown.changed() => return,
            }
        }
        if *tx.borrow() {
            warn!(%candidate, "leadership lost");
        }
        tx.send_replace(false);
    }
}
