use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{FleetError, Result};

/// Find the private key for `key_name` in `folder`: the file named exactly
/// `key_name`, or else the first file (by name) that starts with it.
pub async fn resolve_key_file(folder: &Path, key_name: &str, instance: &str) -> Result<PathBuf> {
    let missing = || FleetError::KeyFileMissing {
        key_name: key_name.to_string(),
        instance: instance.to_string(),
        folder: folder.to_path_buf(),
    };

    let mut entries = match fs::read_dir(folder).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
        Err(e) => {
            return Err(FleetError::io(format!("Failed to list {}", folder.display()), e));
        }
    };

    let mut candidates = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FleetError::io(format!("Failed to list {}", folder.display()), e))?
    {
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(key_name) && !name.ends_with(".pub") {
                candidates.push(name.to_string());
            }
        }
    }

    if candidates.iter().any(|name| name == key_name) {
        return Ok(folder.join(key_name));
    }
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .map(|name| folder.join(name))
        .ok_or_else(missing)
}
