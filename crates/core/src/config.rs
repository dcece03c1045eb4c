//! Typed settings loaded once from the TOML settings file.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{FleetError, Result};
use crate::provider::{MarketType, PollSettings};
use crate::retry::RetryPolicy;

pub const DEFAULT_SETTINGS_PATH: &str = "config/sparkfleet.toml";

/// Function an instance plays in its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Worker => "worker",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "master" => Some(Role::Master),
            "worker" => Some(Role::Worker),
            _ => None,
        }
    }

    /// Role implied by an instance name such as `alpha-master-0`.
    pub fn infer_from_name(name: &str) -> Option<Self> {
        if name.contains("master") {
            Some(Role::Master)
        } else if name.contains("worker") {
            Some(Role::Worker)
        } else {
            None
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub lambda: LambdaSettings,
    #[serde(default)]
    pub configuration: ConfigurationRules,
    #[serde(default)]
    pub clusters: Vec<ClusterSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GeneralSettings {
    #[serde(default = "default_registry_folder")]
    pub registry_folder: PathBuf,
    #[serde(default = "default_key_folder")]
    pub key_folder: PathBuf,
    /// Upper bound on clusters processed at once. Unset means all of them.
    pub cluster_concurrency: Option<usize>,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            registry_folder: default_registry_folder(),
            key_folder: default_key_folder(),
            cluster_concurrency: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LoggingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LambdaSettings {
    /// Falls back to the `LAMBDA_API_KEY` environment variable.
    pub api_key: Option<String>,
    /// Region instances are launched in when a role-group has no placement.
    pub region: Option<String>,
    pub base_url: Option<String>,
    #[serde(default = "default_poll_interval", deserialize_with = "duration")]
    pub poll_interval: Duration,
    #[serde(default = "default_alive_timeout", deserialize_with = "duration")]
    pub alive_timeout: Duration,
    #[serde(default = "default_termination_timeout", deserialize_with = "duration")]
    pub termination_timeout: Duration,
}

impl LambdaSettings {
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self.poll_interval,
            alive_timeout: self.alive_timeout,
            termination_timeout: self.termination_timeout,
            ..PollSettings::default()
        }
    }
}

impl Default for LambdaSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            region: None,
            base_url: None,
            poll_interval: default_poll_interval(),
            alive_timeout: default_alive_timeout(),
            termination_timeout: default_termination_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RoleCommands {
    /// Local paths pushed into the remote script folder before `setup` runs.
    #[serde(default)]
    pub upload: Vec<PathBuf>,
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct JobSettings {
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default = "default_job_folder")]
    pub remote_folder: String,
    pub submit: Option<String>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            artifacts: Vec::new(),
            remote_folder: default_job_folder(),
            submit: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigurationRules {
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_retry_delay", deserialize_with = "duration")]
    pub retry_delay: Duration,
    #[serde(default = "default_true")]
    pub seed_known_hosts: bool,
    #[serde(default = "default_known_hosts_file")]
    pub known_hosts_file: PathBuf,
    #[serde(default = "default_key_types")]
    pub key_types: String,
    #[serde(default = "default_script_folder")]
    pub remote_script_folder: String,
    #[serde(default = "default_master_port")]
    pub master_port: u16,
    #[serde(default)]
    pub master: RoleCommands,
    #[serde(default)]
    pub worker: RoleCommands,
    #[serde(default)]
    pub job: JobSettings,
}

impl ConfigurationRules {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_tries, self.retry_delay)
    }

    pub fn commands(&self, role: Role) -> &RoleCommands {
        match role {
            Role::Master => &self.master,
            Role::Worker => &self.worker,
        }
    }
}

impl Default for ConfigurationRules {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            retry_delay: default_retry_delay(),
            seed_known_hosts: true,
            known_hosts_file: default_known_hosts_file(),
            key_types: default_key_types(),
            remote_script_folder: default_script_folder(),
            master_port: default_master_port(),
            master: RoleCommands::default(),
            worker: RoleCommands::default(),
            job: JobSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSettings {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<RoleGroupSettings>,
}

impl ClusterSettings {
    pub fn requested_instances(&self) -> u32 {
        self.groups.iter().map(|g| g.count).sum()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RoleGroupSettings {
    pub name: String,
    pub role: Role,
    pub count: u32,
    /// Middle part of instance names; defaults to the role.
    pub prefix: Option<String>,
    pub instance_type: String,
    #[serde(default = "default_market_type")]
    pub market_type: MarketType,
    pub placement: Option<String>,
    pub key_name: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

impl RoleGroupSettings {
    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or(self.role.as_str())
    }

    /// `<cluster>-<prefix>-<ordinal>`
    pub fn instance_name(&self, cluster: &str, ordinal: u32) -> String {
        format!("{}-{}-{}", cluster, self.prefix(), ordinal)
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| FleetError::io(format!("Failed to read settings {}", path.display()), e))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut settings: Settings =
            toml::from_str(contents).map_err(|e| FleetError::Config(e.to_string()))?;
        settings.expand_paths();
        settings.validate()?;
        Ok(settings)
    }

    pub fn cluster(&self, name: &str) -> Result<&ClusterSettings> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| FleetError::UnknownCluster(name.to_string()))
    }

    /// The named clusters in the given order, or every configured cluster when `names` is empty.
    pub fn select_clusters(&self, names: &[String]) -> Result<Vec<ClusterSettings>> {
        if names.is_empty() {
            return Ok(self.clusters.clone());
        }
        names.iter().map(|n| self.cluster(n).cloned()).collect()
    }

    fn expand_paths(&mut self) {
        self.general.registry_folder = expand_tilde(&self.general.registry_folder);
        self.general.key_folder = expand_tilde(&self.general.key_folder);
        self.configuration.known_hosts_file = expand_tilde(&self.configuration.known_hosts_file);
        if let Some(file) = &self.logging.file {
            self.logging.file = Some(expand_tilde(file));
        }
        for commands in [&mut self.configuration.master, &mut self.configuration.worker] {
            commands.upload = commands.upload.iter().map(|p| expand_tilde(p)).collect();
        }
        self.configuration.job.artifacts = self
            .configuration
            .job
            .artifacts
            .iter()
            .map(|p| expand_tilde(p))
            .collect();
    }

    fn validate(&self) -> Result<()> {
        if self.configuration.max_tries == 0 {
            return Err(FleetError::Config("max-tries must be at least 1".to_string()));
        }
        if self.general.cluster_concurrency == Some(0) {
            return Err(FleetError::Config(
                "cluster-concurrency must be at least 1".to_string(),
            ));
        }

        let mut cluster_names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty()
                || cluster.name.trim() != cluster.name
                || cluster.name.starts_with('.')
                || cluster.name.contains(['/', '\\', ','])
            {
                return Err(FleetError::Config(format!(
                    "'{}' is not a valid cluster name",
                    cluster.name
                )));
            }
            if !cluster_names.insert(cluster.name.as_str()) {
                return Err(FleetError::Config(format!(
                    "cluster '{}' is defined more than once",
                    cluster.name
                )));
            }

            let mut group_names = HashSet::new();
            for group in &cluster.groups {
                if !group_names.insert(group.name.as_str()) {
                    return Err(FleetError::Config(format!(
                        "role-group '{}' is defined more than once in cluster '{}'",
                        group.name, cluster.name
                    )));
                }
                let recorded = [
                    ("name", Some(group.name.as_str())),
                    ("instance-type", Some(group.instance_type.as_str())),
                    ("key-name", Some(group.key_name.as_str())),
                    ("username", Some(group.username.as_str())),
                    ("prefix", group.prefix.as_deref()),
                ];
                for (key, value) in recorded.into_iter().filter_map(|(k, v)| Some((k, v?))) {
                    // Registry values are read back trimmed, one per line.
                    if value.is_empty() || value.trim() != value || value.contains('\n') {
                        return Err(FleetError::Config(format!(
                            "role-group '{}' in cluster '{}' has an invalid {key} {:?}",
                            group.name, cluster.name, value
                        )));
                    }
                }
                if group.ssh_port == 0 {
                    return Err(FleetError::Config(format!(
                        "role-group '{}' in cluster '{}' has ssh-port 0",
                        group.name, cluster.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

fn duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw)
        .map_err(|e| serde::de::Error::custom(format!("invalid duration '{raw}': {e}")))
}

fn default_true() -> bool {
    true
}

fn default_registry_folder() -> PathBuf {
    PathBuf::from("~/.sparkfleet/clusters")
}

fn default_key_folder() -> PathBuf {
    PathBuf::from("~/.ssh")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_alive_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_termination_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_max_tries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_known_hosts_file() -> PathBuf {
    PathBuf::from("~/.ssh/known_hosts")
}

fn default_key_types() -> String {
    "rsa,ecdsa,ed25519".to_string()
}

fn default_script_folder() -> String {
    "~/sparkfleet".to_string()
}

fn default_job_folder() -> String {
    "~/sparkfleet-job".to_string()
}

fn default_master_port() -> u16 {
    7077
}

fn default_market_type() -> MarketType {
    MarketType::OnDemand
}

fn default_username() -> String {
    "ubuntu".to_string()
}

fn default_ssh_port() -> u16 {
    22
}
