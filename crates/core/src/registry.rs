//! Durable per-cluster instance registry.
//!
//! One file per cluster, named after the cluster, holding `[Instance N]`
//! blocks of `key = value` lines separated by blank lines. Blocks are only
//! ever appended; the file is removed as a whole when a cluster is torn down
//! or rebuilt.
//!
//! Appends and reads for the same cluster are serialized through a
//! per-cluster lock so ordinals stay dense within one process. Nothing
//! protects against two separate invocations writing the same cluster at the
//! same time.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::Role;
use crate::error::{FleetError, Result};
use crate::provider::MarketType;

/// One instance that was created and confirmed alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub provider: String,
    pub name: String,
    pub id: String,
    pub role: Role,
    pub instance_type: String,
    pub market_type: MarketType,
    pub key_name: String,
    pub username: String,
    pub public_ipv4_address: String,
    pub ssh_port: u16,
}

impl InstanceRecord {
    fn write_block(&self, ordinal: usize, out: &mut String) {
        let _ = writeln!(out, "[Instance {ordinal}]");
        let _ = writeln!(out, "provider = {}", self.provider);
        let _ = writeln!(out, "name = {}", self.name);
        let _ = writeln!(out, "id = {}", self.id);
        let _ = writeln!(out, "role = {}", self.role);
        let _ = writeln!(out, "type = {}", self.instance_type);
        let _ = writeln!(out, "market_type = {}", self.market_type);
        let _ = writeln!(out, "key_name = {}", self.key_name);
        let _ = writeln!(out, "username = {}", self.username);
        let _ = writeln!(out, "public_ipv4_address = {}", self.public_ipv4_address);
        let _ = writeln!(out, "ssh_port = {}", self.ssh_port);
        out.push('\n');
    }
}

pub struct Registry {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, cluster: &str) -> PathBuf {
        self.root.join(cluster)
    }

    pub fn exists(&self, cluster: &str) -> bool {
        self.path(cluster).is_file()
    }

    /// Append `record` and return the ordinal it was stored under.
    pub async fn append(&self, cluster: &str, record: &InstanceRecord) -> Result<usize> {
        let lock = self.lock_for(cluster);
        let _guard = lock.lock().await;

        let path = self.path(cluster);
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| FleetError::io(format!("Failed to create {}", self.root.display()), e))?;

        let ordinal = read_records(&path).await?.len() + 1;
        let mut block = String::new();
        record.write_block(ordinal, &mut block);

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| FleetError::io(format!("Failed to open {}", path.display()), e))?;
        file.write_all(block.as_bytes())
            .await
            .map_err(|e| FleetError::io(format!("Failed to append to {}", path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| FleetError::io(format!("Failed to flush {}", path.display()), e))?;

        debug!(cluster = %cluster, instance = %record.name, ordinal, "Appended instance to registry");
        Ok(ordinal)
    }

    /// All records in file order. A missing registry reads as empty.
    pub async fn read_all(&self, cluster: &str) -> Result<Vec<InstanceRecord>> {
        let lock = self.lock_for(cluster);
        let _guard = lock.lock().await;
        read_records(&self.path(cluster)).await
    }

    pub async fn delete(&self, cluster: &str) -> Result<()> {
        let lock = self.lock_for(cluster);
        let _guard = lock.lock().await;

        let path = self.path(cluster);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FleetError::io(format!("Failed to delete {}", path.display()), e)),
        }
    }

    fn lock_for(&self, cluster: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(cluster.to_string()).or_default().clone()
    }
}

async fn read_records(path: &Path) -> Result<Vec<InstanceRecord>> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FleetError::io(format!("Failed to read {}", path.display()), e)),
    };
    parse_records(path, &contents)
}

struct PendingBlock {
    header_line: usize,
    fields: HashMap<String, (usize, String)>,
}

fn parse_records(path: &Path, contents: &str) -> Result<Vec<InstanceRecord>> {
    let corrupt = |line: usize, reason: String| FleetError::RegistryCorrupt {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut records = Vec::new();
    let mut current: Option<PendingBlock> = None;

    for (index, raw) in contents.lines().enumerate() {
        let line_number = index + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if let Some(block) = current.take() {
                records.push(finish_block(block, records.len() + 1, &corrupt)?);
            }
            let ordinal = header
                .strip_prefix("Instance ")
                .and_then(|n| n.trim().parse::<usize>().ok())
                .ok_or_else(|| corrupt(line_number, format!("unexpected block header '{line}'")))?;
            if ordinal != records.len() + 1 {
                return Err(corrupt(
                    line_number,
                    format!("expected [Instance {}], found [Instance {ordinal}]", records.len() + 1),
                ));
            }
            current = Some(PendingBlock {
                header_line: line_number,
                fields: HashMap::new(),
            });
            continue;
        }

        let block = current
            .as_mut()
            .ok_or_else(|| corrupt(line_number, "entry outside of an instance block".to_string()))?;
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| corrupt(line_number, format!("expected 'key = value', found '{line}'")))?;
        let key = key.trim().to_string();
        if block
            .fields
            .insert(key.clone(), (line_number, value.trim().to_string()))
            .is_some()
        {
            return Err(corrupt(line_number, format!("duplicate key '{key}'")));
        }
    }

    if let Some(block) = current.take() {
        records.push(finish_block(block, records.len() + 1, &corrupt)?);
    }
    Ok(records)
}

fn finish_block(
    mut block: PendingBlock,
    ordinal: usize,
    corrupt: &impl Fn(usize, String) -> FleetError,
) -> Result<InstanceRecord> {
    let header_line = block.header_line;
    let mut take = |key: &str| -> Result<(usize, String)> {
        block.fields.remove(key).ok_or_else(|| {
            corrupt(header_line, format!("[Instance {ordinal}] is missing '{key}'"))
        })
    };

    let (_, provider) = take("provider")?;
    let (_, name) = take("name")?;
    let (_, id) = take("id")?;
    let (_, instance_type) = take("type")?;
    let (market_line, market_type) = take("market_type")?;
    let (_, key_name) = take("key_name")?;
    let (_, username) = take("username")?;
    let (_, public_ipv4_address) = take("public_ipv4_address")?;
    let (port_line, ssh_port) = take("ssh_port")?;

    let market_type = MarketType::parse(&market_type)
        .ok_or_else(|| corrupt(market_line, format!("unknown market_type '{market_type}'")))?;
    let ssh_port = ssh_port
        .parse::<u16>()
        .map_err(|_| corrupt(port_line, format!("invalid ssh_port '{ssh_port}'")))?;

    // Blocks written before roles were recorded carry the role in the name only.
    let role = match block.fields.remove("role") {
        Some((role_line, role)) => {
            Role::parse(&role).ok_or_else(|| corrupt(role_line, format!("unknown role '{role}'")))?
        }
        None => Role::infer_from_name(&name).ok_or_else(|| {
            corrupt(header_line, format!("cannot determine the role of '{name}'"))
        })?,
    };

    if let Some((key, (line, _))) = block.fields.into_iter().next() {
        return Err(corrupt(line, format!("unknown key '{key}'")));
    }

    Ok(InstanceRecord {
        provider,
        name,
        id,
        role,
        instance_type,
        market_type,
        key_name,
        username,
        public_ipv4_address,
        ssh_port,
    })
}
