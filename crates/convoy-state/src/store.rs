//! Coordination store — hierarchical, versioned, watchable nodes.
//!
//! [`CoordinationStore`] is the capability the rest of Convoy consumes.
//! [`LocalStore`] implements it in-process: persistent nodes are written
//! through to redb so they survive restarts, ephemeral nodes live in
//! memory and vanish when their owning session closes.
//!
//! The hierarchy is implicit: a node may exist without its parent, and
//! [`CoordinationStore::children`] lists the next path segment of every
//! node beneath a prefix.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::paths;

/// Persistent nodes keyed by path. Value is the 8-byte big-endian version
/// followed by the node data.
const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Identifier of a client session; ephemeral nodes are tied to one.
pub type SessionId = u64;

/// Version and ownership metadata of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// 0 on create, incremented by every set.
    pub version: u64,
    /// Owning session for ephemeral nodes.
    pub ephemeral_owner: Option<SessionId>,
}

/// A node's data and metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub data: Vec<u8>,
    pub stat: Stat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Notification delivered to watchers of a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
    /// Node version after the change (before it, for deletes).
    pub version: u64,
}

/// Stream of changes under a watched prefix. Dropping it unsubscribes.
pub type Watch = mpsc::UnboundedReceiver<ChangeEvent>;

/// One step of an atomic [`CoordinationStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Require the node to exist at exactly `version`.
    Check { path: String, version: u64 },
    /// Require the node to be an ephemeral node of the committing session.
    CheckOwner { path: String },
    /// Create a node that must not exist yet. Ephemeral nodes belong to
    /// the committing session.
    Create {
        path: String,
        data: Vec<u8>,
        ephemeral: bool,
    },
    /// Replace a node's data, optionally conditioned on its version.
    Set {
        path: String,
        data: Vec<u8>,
        version: Option<u64>,
    },
    /// Remove a node, optionally conditioned on its version.
    Delete { path: String, version: Option<u64> },
}

impl Op {
    pub fn path(&self) -> &str {
        match self {
            Self::Check { path, .. }
            | Self::CheckOwner { path }
            | Self::Create { path, .. }
            | Self::Set { path, .. }
            | Self::Delete { path, .. } => path,
        }
    }
}

/// Strongly consistent, watchable, hierarchical key/value store.
///
/// All mutation goes through [`commit`](Self::commit), which applies a
/// list of operations atomically: either every op succeeds or none is
/// applied. Writes to an ephemeral node are only accepted from its
/// owning session.
pub trait CoordinationStore: Send + Sync {
    /// Start a session that can own ephemeral nodes.
    fn open_session(&self) -> StoreResult<SessionId>;

    /// End a session, deleting every ephemeral node it owns.
    fn close_session(&self, session: SessionId) -> StoreResult<()>;

    fn get(&self, path: &str) -> StoreResult<Option<Node>>;

    /// Names of the immediate children of `path`, sorted.
    fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Apply `ops` atomically on behalf of `session`.
    fn commit(&self, session: Option<SessionId>, ops: &[Op]) -> StoreResult<Vec<Stat>>;

    /// Subscribe to changes at or beneath `prefix`.
    fn watch(&self, prefix: &str) -> StoreResult<Watch>;

    fn create(
        &self,
        session: Option<SessionId>,
        path: &str,
        data: &[u8],
        ephemeral: bool,
    ) -> StoreResult<Stat> {
        let op = Op::Create {
            path: path.to_string(),
            data: data.to_vec(),
            ephemeral,
        };
        single(self.commit(session, &[op])?)
    }

    fn set(
        &self,
        session: Option<SessionId>,
        path: &str,
        data: &[u8],
        version: Option<u64>,
    ) -> StoreResult<Stat> {
        let op = Op::Set {
            path: path.to_string(),
            data: data.to_vec(),
            version,
        };
        single(self.commit(session, &[op])?)
    }

    fn delete(&self, session: Option<SessionId>, path: &str, version: Option<u64>) -> StoreResult<()> {
        let op = Op::Delete {
            path: path.to_string(),
            version,
        };
        self.commit(session, &[op]).map(|_| ())
    }
}

fn single(mut stats: Vec<Stat>) -> StoreResult<Stat> {
    stats
        .pop()
        .ok_or_else(|| StoreError::Persist("commit returned no stat".to_string()))
}

fn persist_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Persist(e.to_string())
}

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    version: u64,
    owner: Option<SessionId>,
}

impl Entry {
    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            ephemeral_owner: self.owner,
        }
    }
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Entry>,
    sessions: HashSet<SessionId>,
    next_session: SessionId,
    watchers: Vec<Watcher>,
}

impl Tree {
    fn notify(&mut self, events: &[ChangeEvent]) {
        self.watchers.retain(|w| !w.tx.is_closed());
        for event in events {
            for watcher in &self.watchers {
                if paths::is_under(&event.path, &watcher.prefix) {
                    let _ = watcher.tx.send(event.clone());
                }
            }
        }
    }
}

struct Inner {
    db: Database,
    tree: Mutex<Tree>,
    available: AtomicBool,
}

/// In-process coordination store backed by redb.
///
/// `LocalStore` is `Clone` + `Send` + `Sync` and can be shared across
/// async tasks; all clones observe the same tree.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

impl LocalStore {
    /// Open (or create) a store whose persistent nodes live at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(persist_err)?;
        let store = Self::from_database(db)?;
        info!(?path, "coordination store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing and embedding).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(persist_err)?;
        let store = Self::from_database(db)?;
        debug!("in-memory coordination store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StoreResult<Self> {
        let txn = db.begin_write().map_err(persist_err)?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(persist_err)?;
        txn.commit().map_err(persist_err)?;

        let mut tree = Tree {
            next_session: 1,
            ..Tree::default()
        };
        let txn = db.begin_read().map_err(persist_err)?;
        let table = txn.open_table(NODES).map_err(persist_err)?;
        for entry in table.iter().map_err(persist_err)? {
            let (key, value) = entry.map_err(persist_err)?;
            let raw = value.value();
            if raw.len() < 8 {
                return Err(StoreError::Deserialize(format!(
                    "truncated node record at {}",
                    key.value()
                )));
            }
            let mut version = [0u8; 8];
            version.copy_from_slice(&raw[..8]);
            tree.nodes.insert(
                key.value().to_string(),
                Entry {
                    data: raw[8..].to_vec(),
                    version: u64::from_be_bytes(version),
                    owner: None,
                },
            );
        }
        debug!(nodes = tree.nodes.len(), "persistent nodes loaded");

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                tree: Mutex::new(tree),
                available: AtomicBool::new(true),
            }),
        })
    }

    /// Simulate losing (or regaining) connectivity to the store. While
    /// unavailable every operation fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        info!(available, "coordination store availability changed");
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tree>> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(self.inner.tree.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Write staged changes of persistent nodes through to redb.
    fn persist(&self, tree: &Tree, staged: &BTreeMap<String, Option<Entry>>) -> StoreResult<()> {
        let touches_disk = staged.iter().any(|(path, entry)| match entry {
            Some(e) => e.owner.is_none(),
            None => tree.nodes.get(path).is_some_and(|e| e.owner.is_none()),
        });
        if !touches_disk {
            return Ok(());
        }

        let txn = self.inner.db.begin_write().map_err(persist_err)?;
        {
            let mut table = txn.open_table(NODES).map_err(persist_err)?;
            for (path, entry) in staged {
                match entry {
                    Some(e) if e.owner.is_none() => {
                        let mut value = e.version.to_be_bytes().to_vec();
                        value.extend_from_slice(&e.data);
                        table
                            .insert(path.as_str(), value.as_slice())
                            .map_err(persist_err)?;
                    }
                    _ => {
                        table.remove(path.as_str()).map_err(persist_err)?;
                    }
                }
            }
        }
        txn.commit().map_err(persist_err)?;
        Ok(())
    }
}

fn check_owner(path: &str, entry: &Entry, session: Option<SessionId>) -> StoreResult<()> {
    match entry.owner {
        Some(owner) if session != Some(owner) => Err(StoreError::NotOwner(path.to_string())),
        _ => Ok(()),
    }
}

fn check_version(path: &str, entry: &Entry, expected: Option<u64>) -> StoreResult<()> {
    match expected {
        Some(expected) if expected != entry.version => Err(StoreError::VersionConflict {
            path: path.to_string(),
            expected,
            actual: entry.version,
        }),
        _ => Ok(()),
    }
}

impl CoordinationStore for LocalStore {
    fn open_session(&self) -> StoreResult<SessionId> {
        let mut tree = self.lock()?;
        let session = tree.next_session;
        tree.next_session += 1;
        tree.sessions.insert(session);
        debug!(session, "session opened");
        Ok(session)
    }

    fn close_session(&self, session: SessionId) -> StoreResult<()> {
        let mut tree = self.lock()?;
        if !tree.sessions.remove(&session) {
            return Err(StoreError::SessionExpired(session));
        }
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, e)| e.owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        let mut events = Vec::with_capacity(owned.len());
        for path in owned {
            if let Some(entry) = tree.nodes.remove(&path) {
                events.push(ChangeEvent {
                    kind: ChangeKind::Deleted,
                    path,
                    version: entry.version,
                });
            }
        }
        debug!(session, removed = events.len(), "session closed");
        tree.notify(&events);
        Ok(())
    }

    fn get(&self, path: &str) -> StoreResult<Option<Node>> {
        let tree = self.lock()?;
        Ok(tree.nodes.get(path).map(|e| Node {
            data: e.data.clone(),
            stat: e.stat(),
        }))
    }

    fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        let tree = self.lock()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let names: BTreeSet<String> = tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| p[prefix.len()..].split('/').next().map(str::to_string))
            .collect();
        Ok(names.into_iter().collect())
    }

    fn commit(&self, session: Option<SessionId>, ops: &[Op]) -> StoreResult<Vec<Stat>> {
        let mut tree = self.lock()?;
        if let Some(s) = session {
            if !tree.sessions.contains(&s) {
                return Err(StoreError::SessionExpired(s));
            }
        }

        let mut staged: BTreeMap<String, Option<Entry>> = BTreeMap::new();
        let mut stats = Vec::with_capacity(ops.len());
        let mut events = Vec::with_capacity(ops.len());

        for op in ops {
            let path = op.path();
            if !paths::is_valid(path) {
                return Err(StoreError::InvalidPath(path.to_string()));
            }
            let current = match staged.get(path) {
                Some(entry) => entry.clone(),
                None => tree.nodes.get(path).cloned(),
            };
            match op {
                Op::Check { version, .. } => {
                    let entry = current.ok_or_else(|| StoreError::NotFound(path.to_string()))?;
                    check_version(path, &entry, Some(*version))?;
                    stats.push(entry.stat());
                }
                Op::CheckOwner { .. } => {
                    let entry = current.ok_or_else(|| StoreError::NotFound(path.to_string()))?;
                    if session.is_none() || entry.owner != session {
                        return Err(StoreError::NotOwner(path.to_string()));
                    }
                    stats.push(entry.stat());
                }
                Op::Create { data, ephemeral, .. } => {
                    if current.is_some() {
                        return Err(StoreError::NodeExists(path.to_string()));
                    }
                    let owner = if *ephemeral {
                        Some(session.ok_or(StoreError::SessionExpired(0))?)
                    } else {
                        None
                    };
                    let entry = Entry {
                        data: data.clone(),
                        version: 0,
                        owner,
                    };
                    stats.push(entry.stat());
                    events.push(ChangeEvent {
                        kind: ChangeKind::Created,
                        path: path.to_string(),
                        version: 0,
                    });
                    staged.insert(path.to_string(), Some(entry));
                }
                Op::Set { data, version, .. } => {
                    let entry = current.ok_or_else(|| StoreError::NotFound(path.to_string()))?;
                    check_version(path, &entry, *version)?;
                    check_owner(path, &entry, session)?;
                    let next = Entry {
                        data: data.clone(),
                        version: entry.version + 1,
                        owner: entry.owner,
                    };
                    stats.push(next.stat());
                    events.push(ChangeEvent {
                        kind: ChangeKind::Updated,
                        path: path.to_string(),
                        version: next.version,
                    });
                    staged.insert(path.to_string(), Some(next));
                }
                Op::Delete { version, .. } => {
                    let entry = current.ok_or_else(|| StoreError::NotFound(path.to_string()))?;
                    check_version(path, &entry, *version)?;
                    check_owner(path, &entry, session)?;
                    stats.push(entry.stat());
                    events.push(ChangeEvent {
                        kind: ChangeKind::Deleted,
                        path: path.to_string(),
                        version: entry.version,
                    });
                    staged.insert(path.to_string(), None);
                }
            }
        }

        self.persist(&tree, &staged)?;
        for (path, entry) in staged {
            match entry {
                Some(e) => {
                    tree.nodes.insert(path, e);
                }
                None => {
                    tree.nodes.remove(&path);
                }
            }
        }
        tree.notify(&events);
        Ok(stats)
    }

    fn watch(&self, prefix: &str) -> StoreResult<Watch> {
        let mut tree = self.lock()?;
        let (tx, rx) = mpsc::unbounded_channel();
        tree.watchers.push(Watcher {
            prefix: prefix.trim_end_matches('/').to_string(),
            tx,
        });
        Ok(rx)
    }
}
