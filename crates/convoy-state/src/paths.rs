//! Node path layout of the coordination tree.
//!
//! Desired state is persistent and authored by the leader; actual state
//! is ephemeral and owned by each host's agent session.
//!
//! ```text
//! /jobs/{job_id}                 JobSpec          persistent
//! /groups/{group}/hosts          DeploymentGroup  persistent
//! /deployments/{host}/{job_id}   Deployment       persistent, versioned
//! /statuses/{host}/{job_id}      TaskStatus       ephemeral
//! /generations/{host}/{job_id}   last generation  persistent
//! /leader                        candidate id     ephemeral
//! ```

use crate::types::JobId;

pub const JOBS: &str = "/jobs";
pub const GROUPS: &str = "/groups";
pub const DEPLOYMENTS: &str = "/deployments";
pub const STATUSES: &str = "/statuses";
pub const GENERATIONS: &str = "/generations";
pub const LEADER: &str = "/leader";

pub fn job(job_id: &JobId) -> String {
    format!("{JOBS}/{job_id}")
}

pub fn group_hosts(group: &str) -> String {
    format!("{GROUPS}/{group}/hosts")
}

/// Parent of all desired deployments for a host.
pub fn host_deployments(host: &str) -> String {
    format!("{DEPLOYMENTS}/{host}")
}

pub fn deployment(host: &str, job_id: &JobId) -> String {
    format!("{DEPLOYMENTS}/{host}/{job_id}")
}

pub fn host_statuses(host: &str) -> String {
    format!("{STATUSES}/{host}")
}

pub fn status(host: &str, job_id: &JobId) -> String {
    format!("{STATUSES}/{host}/{job_id}")
}

/// Last generation issued for a job on a host. Outlives the desired
/// entry so generations keep increasing across undeploys.
pub fn generation(host: &str, job_id: &JobId) -> String {
    format!("{GENERATIONS}/{host}/{job_id}")
}

/// Whether `path` equals `prefix` or lies beneath it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Last path segment.
pub fn leaf(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Check that a path is absolute, has no empty segments and no trailing slash.
pub fn is_valid(path: &str) -> bool {
    path.starts_with('/') && path.len() > 1 && !path[1..].split('/').any(str::is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let id = JobId::from("web:1:abc");
        assert_eq!(job(&id), "/jobs/web:1:abc");
        assert_eq!(deployment("h1", &id), "/deployments/h1/web:1:abc");
        assert_eq!(status("h1", &id), "/statuses/h1/web:1:abc");
        assert_eq!(group_hosts("canary"), "/groups/canary/hosts");
        assert_eq!(generation("h1", &id), "/generations/h1/web:1:abc");
    }

    #[test]
    fn prefix_matching() {
        assert!(is_under("/deployments/h1/j", "/deployments/h1"));
        assert!(is_under("/deployments/h1", "/deployments/h1"));
        assert!(!is_under("/deployments/h10/j", "/deployments/h1"));
        assert!(is_under("/anything", "/"));
    }

    #[test]
    fn validity_and_leaf() {
        assert!(is_valid("/a/b"));
        assert!(!is_valid("a/b"));
        assert!(!is_valid("/a//b"));
        assert!(!is_valid("/a/"));
        assert!(!is_valid("/"));
        assert_eq!(leaf("/statuses/h1/web:1:abc"), "web:1:abc");
    }
}
