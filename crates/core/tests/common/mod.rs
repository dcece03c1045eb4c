#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sparkfleet_core::{
    CloudAdapter, CommandRunner, InstanceDescription, InstanceProvider, InstanceRecord,
    InstanceRequest, InstanceState, Lifecycle, MarketType, PollSettings, ProviderError, Role,
    Settings, SshTarget, Target,
};

/// What the next `create_instance` call does.
#[derive(Debug, Clone, Copy)]
pub enum Launch {
    Succeed,
    /// Succeed, but stay pending for the given time.
    SlowBoot(Duration),
    Fail,
    Quota,
}

/// In-memory provider whose instances are running on 127.0.0.1 as soon as they exist.
#[derive(Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<Launch>>,
    by_name: Mutex<HashMap<String, Launch>>,
    states: Mutex<HashMap<String, InstanceState>>,
    booting: Mutex<HashMap<String, Instant>>,
    created: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    pub launches: AtomicUsize,
    pub termination_requests: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(script: &[Launch]) -> Self {
        let provider = Self::default();
        provider.script.lock().unwrap().extend(script.iter().copied());
        provider
    }

    /// Script the launch of one instance by name, ahead of the ordered script.
    pub fn with_launch(self, name: &str, launch: Launch) -> Self {
        self.by_name.lock().unwrap().insert(name.to_string(), launch);
        self
    }

    /// Ids handed out by `create_instance`, in creation order.
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn set_state(&self, id: &str, state: InstanceState) {
        self.states.lock().unwrap().insert(id.to_string(), state);
    }

    pub fn state(&self, id: &str) -> Option<InstanceState> {
        self.states.lock().unwrap().get(id).copied()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn termination_requests(&self) -> usize {
        self.termination_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<String, ProviderError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let scripted = self.by_name.lock().unwrap().remove(&request.name);
        let next = scripted
            .or_else(|| self.script.lock().unwrap().pop_front())
            .unwrap_or(Launch::Succeed);
        let boot = match next {
            Launch::Succeed => None,
            Launch::SlowBoot(delay) => Some(delay),
            Launch::Fail => return Err(ProviderError::Api("simulated failure".to_string())),
            Launch::Quota => return Err(ProviderError::QuotaExceeded("simulated quota".to_string())),
        };

        let id = format!("i-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.created.lock().unwrap().push(id.clone());
        match boot {
            Some(delay) => {
                self.booting.lock().unwrap().insert(id.clone(), Instant::now() + delay);
                self.set_state(&id, InstanceState::Pending);
            }
            None => self.set_state(&id, InstanceState::Running),
        }
        Ok(id)
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceDescription, ProviderError> {
        let booted = self
            .booting
            .lock()
            .unwrap()
            .get(instance_id)
            .is_some_and(|ready| Instant::now() >= *ready);
        if booted {
            self.booting.lock().unwrap().remove(instance_id);
            self.set_state(instance_id, InstanceState::Running);
        }
        let state = self
            .state(instance_id)
            .ok_or_else(|| ProviderError::NotFound(instance_id.to_string()))?;
        Ok(InstanceDescription {
            id: instance_id.to_string(),
            state,
            public_ip: Some("127.0.0.1".to_string()),
        })
    }

    async fn request_termination(&self, instance_ids: &[String]) -> Result<(), ProviderError> {
        self.termination_requests.fetch_add(1, Ordering::SeqCst);
        for id in instance_ids {
            self.set_state(id, InstanceState::Terminated);
        }
        Ok(())
    }
}

pub fn fast_poll() -> PollSettings {
    PollSettings {
        interval: Duration::from_millis(5),
        alive_timeout: Duration::from_secs(2),
        termination_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_millis(200),
    }
}

/// Settings with one cluster `alpha`: one master and `workers` workers, all on `ssh_port`.
pub fn settings(root: &Path, ssh_port: u16, workers: u32) -> Settings {
    let contents = format!(
        r#"
[general]
registry-folder = "{registry}"
key-folder = "{keys}"

[configuration]
max-tries = 1
retry-delay = "1ms"
seed-known-hosts = false

[[clusters]]
name = "alpha"

[[clusters.groups]]
name = "masters"
role = "master"
count = 1
instance-type = "gpu_1x_a10"
key-name = "fleet"
ssh-port = {ssh_port}

[[clusters.groups]]
name = "workers"
role = "worker"
count = {workers}
instance-type = "gpu_1x_a10"
key-name = "fleet"
ssh-port = {ssh_port}
"#,
        registry = root.join("registry").display(),
        keys = root.join("keys").display(),
    );
    Settings::from_toml_str(&contents).unwrap()
}

pub fn lifecycle(settings: Settings, provider: Arc<MockProvider>) -> Lifecycle {
    Lifecycle::new(settings, CloudAdapter::new(provider, fast_poll()))
}

pub fn names(clusters: &[&str]) -> Vec<String> {
    clusters.iter().map(|c| c.to_string()).collect()
}

/// One command or copy that reached a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Run { host: String, command: String },
    Push { host: String, sources: Vec<PathBuf>, remote_dir: String },
}

impl Call {
    pub fn host(&self) -> &str {
        match self {
            Call::Run { host, .. } | Call::Push { host, .. } => host,
        }
    }
}

/// Runner that records every call instead of spawning processes. Resource
/// probes answer 8 cores and 16384 kB.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Call>>,
}

impl RecordingRunner {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands run on `host`, in order.
    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Run { host: h, command } if h == host => Some(command),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &str, target: &Target) -> sparkfleet_core::Result<Vec<String>> {
        let host = match target {
            Target::Local => "localhost".to_string(),
            Target::Remote(ssh) => ssh.host.clone(),
        };
        self.calls.lock().unwrap().push(Call::Run {
            host,
            command: command.to_string(),
        });
        let output = if command.contains("/proc/cpuinfo") {
            vec!["8".to_string()]
        } else if command.contains("/proc/meminfo") {
            vec!["16384".to_string()]
        } else {
            Vec::new()
        };
        Ok(output)
    }

    async fn push(
        &self,
        sources: &[PathBuf],
        target: &SshTarget,
        remote_dir: &str,
    ) -> sparkfleet_core::Result<()> {
        self.calls.lock().unwrap().push(Call::Push {
            host: target.host.clone(),
            sources: sources.to_vec(),
            remote_dir: remote_dir.to_string(),
        });
        Ok(())
    }
}

/// Settings for cluster `alpha` with role commands and a job, keys under `root/keys`.
pub fn remote_settings(root: &Path) -> Settings {
    let contents = format!(
        r#"
[general]
registry-folder = "{registry}"
key-folder = "{keys}"

[configuration]
max-tries = 1
retry-delay = "1ms"
seed-known-hosts = false

[configuration.master]
setup = ["setup-master {{instance_name}}"]
start = ["start-master {{host}}:{{master_port}}"]
stop = ["stop-master"]

[configuration.worker]
setup = ["setup-worker {{instance_name}} {{master_host}}"]
start = ["start-worker {{master_host}}:{{master_port}} {{cores}} {{memory_kb}}"]
stop = ["stop-worker"]

[configuration.job]
artifacts = ["job/app.py"]
remote-folder = "~/job"
submit = "submit --master {{master_host}}:{{master_port}}"

[[clusters]]
name = "alpha"

[[clusters.groups]]
name = "masters"
role = "master"
count = 1
instance-type = "gpu_1x_a10"
key-name = "fleet"

[[clusters.groups]]
name = "workers"
role = "worker"
count = 2
instance-type = "gpu_1x_a10"
key-name = "fleet"
"#,
        registry = root.join("registry").display(),
        keys = root.join("keys").display(),
    );
    std::fs::create_dir_all(root.join("keys")).unwrap();
    std::fs::write(root.join("keys").join("fleet"), "key").unwrap();
    Settings::from_toml_str(&contents).unwrap()
}

pub fn record(name: &str, id: &str, role: Role, host: &str) -> InstanceRecord {
    InstanceRecord {
        provider: "mock".to_string(),
        name: name.to_string(),
        id: id.to_string(),
        role,
        instance_type: "gpu_1x_a10".to_string(),
        market_type: MarketType::OnDemand,
        key_name: "fleet".to_string(),
        username: "ubuntu".to_string(),
        public_ipv4_address: host.to_string(),
        ssh_port: 22,
    }
}
