//! convoy.toml configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use convoy_agent::MachineConfig;
use convoy_health::Prober;
use convoy_placement::HostPickingStrategy;
use convoy_rollout::{FailurePolicy, RolloutPolicy};
use convoy_state::{DeploymentGroup, HealthCheck, JobSpec, PortMapping, Protocol};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvoyConfig {
    /// Directory holding the coordination store database.
    pub data_dir: PathBuf,
    #[serde(default)]
    pub runtime: RuntimeKind,
    #[serde(default)]
    pub agent: AgentSettings,
    pub group: DeploymentGroup,
    #[serde(default)]
    pub policy: RolloutPolicy,
    pub job: JobSpec,
}

/// Which instance runtime the local agents use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Run the job's command as a local process.
    #[default]
    Process,
    /// Pretend every instance starts and is healthy.
    DryRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub start_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            start_timeout_ms: 60_000,
            probe_interval_ms: 1_000,
            probe_timeout_ms: 2_000,
        }
    }
}

impl AgentSettings {
    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            start_timeout: Duration::from_millis(self.start_timeout_ms),
            prober: Prober::new(
                Duration::from_millis(self.probe_interval_ms),
                Duration::from_millis(self.probe_timeout_ms),
            ),
        }
    }
}

impl ConvoyConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ConvoyConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("convoy.redb")
    }

    /// Scaffold a convoy.toml rolling `image` out to `hosts`.
    pub fn scaffold(name: &str, image: &str, hosts: &[String]) -> Self {
        let mut ports = BTreeMap::new();
        ports.insert(
            "http".to_string(),
            PortMapping {
                internal_port: 8080,
                external_port: Some(8080),
                protocol: Protocol::Tcp,
            },
        );
        ConvoyConfig {
            data_dir: PathBuf::from("/var/lib/convoy"),
            runtime: RuntimeKind::Process,
            agent: AgentSettings::default(),
            group: DeploymentGroup::new(&format!("{name}-group"), hosts),
            policy: RolloutPolicy {
                parallelism: 2,
                on_failure: FailurePolicy::AbortOnFirstFailure,
                strategy: HostPickingStrategy::Deterministic {
                    seed: name.to_string(),
                },
                ..RolloutPolicy::default()
            },
            job: JobSpec {
                name: name.to_string(),
                version: "0.1.0".to_string(),
                image: image.to_string(),
                command: vec![],
                env: BTreeMap::new(),
                ports,
                resources: Default::default(),
                health_check: Some(HealthCheck::http("/healthz", "http")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold() {
        let config = ConvoyConfig::scaffold("web", "web:0.1.0", &["a".into(), "b".into()]);
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("web-group"));
        assert!(toml_str.contains("deterministic"));

        let back: ConvoyConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.job, config.job);
        assert_eq!(back.policy, config.policy);
        assert!(back.job.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
data_dir = "/tmp/convoy"

[group]
name = "canary"
hosts = ["h1", "h2"]

[job]
name = "web"
version = "2"
image = "web:2"

[job.health_check]
type = "exec"
command = ["true"]
"#;
        let config: ConvoyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.runtime, RuntimeKind::Process);
        assert_eq!(config.agent, AgentSettings::default());
        assert_eq!(config.policy, RolloutPolicy::default());
        assert_eq!(config.group.hosts, vec!["h1", "h2"]);
        assert_eq!(config.job.health_check, Some(HealthCheck::exec(&["true"])));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/convoy/convoy.redb"));
    }

    #[test]
    fn test_agent_settings() {
        let settings: AgentSettings = toml::from_str("start_timeout_ms = 500").unwrap();
        let machine = settings.machine_config();
        assert_eq!(machine.start_timeout, Duration::from_millis(500));
        assert_eq!(machine.prober.interval, Duration::from_secs(1));
    }
}
