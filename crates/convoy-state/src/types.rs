//! Domain types for Convoy coordination state.
//!
//! These types represent the desired state authored by the leader (jobs,
//! groups, per-host deployments) and the actual state reported by agents
//! (task statuses). All types serialize to JSON for storage in
//! coordination nodes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Identifier of a host in the fleet.
pub type HostId = String;

/// Number of hex characters of the content hash kept in a [`JobId`].
const JOB_HASH_LEN: usize = 16;

// ── Job ───────────────────────────────────────────────────────────

/// Content-derived identity of a [`JobSpec`]: `{name}:{version}:{hash}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `name` component of the id.
    pub fn name(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Immutable descriptor of a containerized job.
///
/// Maps are ordered so that the JSON encoding, and therefore the
/// [`JobId`], is canonical for a given content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub version: String,
    /// Container image reference.
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Symbolic port name → mapping.
    #[serde(default)]
    pub ports: BTreeMap<String, PortMapping>,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

impl JobSpec {
    /// Compute the content-hash identity of this spec.
    pub fn id(&self) -> JobId {
        // Serializing plain data with ordered maps cannot fail.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(&canonical));
        JobId(format!(
            "{}:{}:{}",
            self.name,
            self.version,
            &digest[..JOB_HASH_LEN]
        ))
    }

    /// Check structural invariants of the job spec.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::Empty("job name"));
        }
        if self.name.contains(['/', ':']) {
            return Err(ValidationError::InvalidName(self.name.clone()));
        }
        if self.version.is_empty() {
            return Err(ValidationError::Empty("job version"));
        }
        if self.image.is_empty() {
            return Err(ValidationError::Empty("job image"));
        }
        if let Some(check) = &self.health_check {
            check.validate(&self.ports)?;
        }
        Ok(())
    }
}

/// A port the job's instance listens on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    /// Port inside the instance.
    pub internal_port: u16,
    /// Port published on the host; `None` lets the runtime choose.
    #[serde(default)]
    pub external_port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// Resource requests per instance.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory limit in bytes, 0 for unlimited.
    #[serde(default)]
    pub memory_bytes: u64,
    /// Relative CPU weight, 0 for the runtime default.
    #[serde(default)]
    pub cpu_weight: u32,
}

// ── Health check ──────────────────────────────────────────────────

/// How to verify a running instance is healthy.
///
/// Encoded as internally tagged JSON:
///
/// ```text
/// { "type": "http", "path": "/healthz", "port": "admin" }
/// { "type": "tcp", "port": "admin" }
/// { "type": "exec", "command": ["pg_isready"] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheck {
    /// GET `path` on the named port; 2xx passes.
    Http { path: String, port: String },
    /// Connect to the named port.
    Tcp { port: String },
    /// Run a command inside the instance; exit code 0 passes.
    Exec { command: Vec<String> },
}

impl HealthCheck {
    pub fn http(path: &str, port: &str) -> Self {
        Self::Http {
            path: path.to_string(),
            port: port.to_string(),
        }
    }

    pub fn tcp(port: &str) -> Self {
        Self::Tcp {
            port: port.to_string(),
        }
    }

    pub fn exec<S: AsRef<str>>(command: &[S]) -> Self {
        Self::Exec {
            command: command.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    /// Wire discriminator of this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Tcp { .. } => "tcp",
            Self::Exec { .. } => "exec",
        }
    }

    /// Symbolic port name for port-bearing variants.
    pub fn port(&self) -> Option<&str> {
        match self {
            Self::Http { port, .. } | Self::Tcp { port } => Some(port),
            Self::Exec { .. } => None,
        }
    }

    /// Validate against the job's declared ports.
    pub fn validate(&self, ports: &BTreeMap<String, PortMapping>) -> Result<(), ValidationError> {
        match self {
            Self::Exec { command } => {
                if command.is_empty() || command[0].is_empty() {
                    return Err(ValidationError::EmptyCommand);
                }
            }
            Self::Http { port, .. } | Self::Tcp { port } => {
                if port.is_empty() {
                    return Err(ValidationError::EmptyPort);
                }
                if !ports.contains_key(port) {
                    return Err(ValidationError::UnknownPort(port.clone()));
                }
            }
        }
        Ok(())
    }
}

// ── Deployment group ──────────────────────────────────────────────

/// A named set of candidate hosts a rollout targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentGroup {
    pub name: String,
    pub hosts: Vec<HostId>,
}

impl DeploymentGroup {
    pub fn new<S: AsRef<str>>(name: &str, hosts: &[S]) -> Self {
        Self {
            name: name.to_string(),
            hosts: hosts.iter().map(|h| h.as_ref().to_string()).collect(),
        }
    }
}

// ── Deployment (desired) ──────────────────────────────────────────

/// Desired binding of one job to one host, written by the leader at
/// `/deployments/{host}/{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    pub job_id: JobId,
    pub job_name: String,
    pub host: HostId,
    /// Deployment group that assigned this entry, if any.
    #[serde(default)]
    pub group: Option<String>,
    /// Monotonic per (host, job) assignment counter.
    pub generation: u64,
    /// How long the agent waits for a passing health check.
    pub grace_period_ms: u64,
}

// ── Task status (actual) ──────────────────────────────────────────

/// Lifecycle state of one deployment on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    Assigned,
    Starting,
    #[serde(rename = "HEALTHCHECKING")]
    HealthChecking,
    Running,
    Failed,
    Stopped,
}

impl DeploymentState {
    /// Running, Failed and Stopped end a rollout's interest in a host.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Running | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Assigned => "ASSIGNED",
            Self::Starting => "STARTING",
            Self::HealthChecking => "HEALTHCHECKING",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Agent-reported state, stored ephemerally at `/statuses/{host}/{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStatus {
    pub job_id: JobId,
    pub host: HostId,
    /// Generation of the desired entry this status belongs to.
    pub generation: u64,
    pub state: DeploymentState,
    #[serde(default)]
    pub message: Option<String>,
    /// Resolved port name → host port, once started.
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    /// Unix timestamp (milliseconds) of this report.
    pub updated_at: u64,
}

/// Current unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> JobSpec {
        let mut ports = BTreeMap::new();
        ports.insert(
            "admin".to_string(),
            PortMapping {
                internal_port: 8081,
                external_port: None,
                protocol: Protocol::Tcp,
            },
        );
        JobSpec {
            name: "web".to_string(),
            version: "1".to_string(),
            image: "registry/web:1".to_string(),
            command: vec!["serve".to_string()],
            env: BTreeMap::new(),
            ports,
            resources: ResourceLimits::default(),
            health_check: Some(HealthCheck::http("/healthz", "admin")),
        }
    }

    #[test]
    fn job_id_is_content_hash() {
        let a = test_job();
        let b = test_job();
        assert_eq!(a.id(), b.id());
        assert!(a.id().as_str().starts_with("web:1:"));
        assert_eq!(a.id().name(), "web");

        let mut c = test_job();
        c.env.insert("MODE".to_string(), "prod".to_string());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn health_check_wire_format() {
        let json = serde_json::to_value(HealthCheck::http("/healthz", "admin")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "http", "path": "/healthz", "port": "admin"})
        );

        let tcp: HealthCheck = serde_json::from_str(r#"{"type":"tcp","port":"db"}"#).unwrap();
        assert_eq!(tcp, HealthCheck::tcp("db"));

        let exec: HealthCheck =
            serde_json::from_str(r#"{"type":"exec","command":["true"]}"#).unwrap();
        assert_eq!(exec.kind(), "exec");
        assert_eq!(exec.port(), None);

        assert!(serde_json::from_str::<HealthCheck>(r#"{"type":"grpc","port":"x"}"#).is_err());
    }

    #[test]
    fn validate_rejects_unknown_port() {
        let mut job = test_job();
        assert!(job.validate().is_ok());

        job.health_check = Some(HealthCheck::tcp("missing"));
        assert_eq!(
            job.validate(),
            Err(ValidationError::UnknownPort("missing".to_string()))
        );

        job.health_check = Some(HealthCheck::tcp(""));
        assert_eq!(job.validate(), Err(ValidationError::EmptyPort));
    }

    #[test]
    fn validate_rejects_empty_exec_and_name() {
        let mut job = test_job();
        job.health_check = Some(HealthCheck::Exec { command: vec![] });
        assert_eq!(job.validate(), Err(ValidationError::EmptyCommand));

        let mut job = test_job();
        job.name.clear();
        assert_eq!(job.validate(), Err(ValidationError::Empty("job name")));
    }

    #[test]
    fn terminal_states() {
        assert!(DeploymentState::Running.is_terminal());
        assert!(DeploymentState::Failed.is_terminal());
        assert!(DeploymentState::Stopped.is_terminal());
        assert!(!DeploymentState::HealthChecking.is_terminal());
        assert_eq!(DeploymentState::HealthChecking.to_string(), "HEALTHCHECKING");
    }
}
