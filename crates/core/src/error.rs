use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors reported by an [`InstanceProvider`](crate::provider::InstanceProvider).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider refused the launch because a capacity or quota limit was hit.
    /// Retrying within the same invocation is futile.
    #[error("capacity exceeded: {0}")]
    QuotaExceeded(String),

    /// The provider no longer knows the instance (usually garbage-collected after termination).
    #[error("instance {0} not found")]
    NotFound(String),

    /// Any other API failure.
    #[error("{0}")]
    Api(String),

    #[error("instance {instance_id} was not reachable after {}", format_waited(.waited))]
    Unreachable { instance_id: String, waited: Duration },

    #[error("instances {} still active after {}", .instance_ids.join(", "), format_waited(.waited))]
    TerminationTimeout {
        instance_ids: Vec<String>,
        waited: Duration,
    },
}

/// Core errors for sparkfleet.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Capacity exhaustion while launching a role-group; aborts that cluster's build.
    #[error("capacity exceeded while launching '{instance}' in cluster '{cluster}': {message}")]
    CapacityExceeded {
        cluster: String,
        instance: String,
        message: String,
    },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("command `{command}` failed on {target} after {attempts} attempt(s) (exit code: {})", format_exit_code(.exit_code))]
    CommandFailed {
        command: String,
        target: String,
        attempts: u32,
        exit_code: Option<i32>,
    },

    #[error("registry {} is corrupt at line {line}: {reason}", .path.display())]
    RegistryCorrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("the key '{key_name}' of instance '{instance}' could not be found in {}", .folder.display())]
    KeyFileMissing {
        key_name: String,
        instance: String,
        folder: PathBuf,
    },

    #[error("cluster '{0}' has not been built (no registry found)")]
    ClusterNotBuilt(String),

    #[error("cluster '{0}' is not defined in the settings file")]
    UnknownCluster(String),

    #[error("no running master instance found in cluster '{0}'")]
    NoRunningMaster(String),

    #[error("invalid settings: {0}")]
    Config(String),

    /// The registry lists instances this provider cannot terminate, so it was kept.
    #[error("registry of cluster '{cluster}' was kept: it lists {count} instance(s) of another provider")]
    ForeignInstances { cluster: String, count: usize },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Some members of a cluster failed a best-effort step; `source` is the first failure.
    #[error("{failed} of {total} instance(s) in cluster '{cluster}' failed, first error: {source}")]
    MembersFailed {
        cluster: String,
        failed: usize,
        total: usize,
        source: Box<FleetError>,
    },

    #[error("task '{0}' panicked")]
    TaskPanicked(String),

    #[error("{phase} failed for {} cluster(s): {}", .failures.len(), ClusterFailure::join(.failures))]
    PhaseFailed {
        phase: &'static str,
        failures: Vec<ClusterFailure>,
    },
}

impl FleetError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        FleetError::Io {
            context: context.into(),
            source,
        }
    }
}

/// One cluster's failure inside a phase that fanned out over several clusters.
#[derive(Debug)]
pub struct ClusterFailure {
    pub cluster: String,
    pub error: FleetError,
}

impl ClusterFailure {
    fn join(failures: &[ClusterFailure]) -> String {
        failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for ClusterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}': {}", self.cluster, self.error)
    }
}

fn format_waited(waited: &Duration) -> String {
    humantime::format_duration(*waited).to_string()
}

fn format_exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

pub type Result<T, E = FleetError> = std::result::Result<T, E>;
