// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Persistent device registry (`modules.json`).
//!
//! The file is a JSON array of `{"id": <mac>, "type": "tag"|"anchor",
//! "operation": <16-digit bit string>|null}` records. Updates rewrite the
//! whole file through a temporary sibling that is renamed over the original.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use uwb_app::normalize_mac;
use uwb_core::{DeviceRole, OperationMode};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, serde_json::Error),

    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    #[serde(rename = "id")]
    pub address: String,
    #[serde(rename = "type")]
    pub role: DeviceRole,
    #[serde(rename = "operation", default)]
    pub operation_mode: Option<String>,
}

pub struct RegistryStore {
    path: PathBuf,
    records: Mutex<Vec<ModuleRecord>>,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry file. A missing file yields an empty registry;
    /// unreadable or malformed files are errors. Entries with an invalid
    /// address or role are skipped.
    pub async fn load(&self) -> Result<Vec<ModuleRecord>, StoreError> {
        let mut records = self.records.lock().await;
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Registry {} not found, starting empty", self.path.display());
                records.clear();
                return Ok(Vec::new());
            }
            Err(e) => return Err(StoreError::Read(self.path.clone(), e)),
        };

        let entries: Vec<Value> = serde_json::from_str(&content)
            .map_err(|e| StoreError::Parse(self.path.clone(), e))?;

        let mut loaded: Vec<ModuleRecord> = Vec::with_capacity(entries.len());
        for entry in entries {
            let record = match serde_json::from_value::<ModuleRecord>(entry) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping registry entry: {}", e);
                    continue;
                }
            };
            let Some(address) = normalize_mac(&record.address) else {
                warn!("Skipping registry entry with bad address '{}'", record.address);
                continue;
            };
            if loaded.iter().any(|r| r.address == address) {
                warn!("[{}] duplicate registry entry ignored", address);
                continue;
            }
            loaded.push(ModuleRecord { address, ..record });
        }

        debug!("Loaded {} modules from {}", loaded.len(), self.path.display());
        *records = loaded.clone();
        Ok(loaded)
    }

    /// Upsert the record for `address` and persist the whole registry.
    ///
    /// The in-memory copy is updated even when the write fails, so the next
    /// successful update carries every pending change.
    pub async fn update(
        &self,
        address: &str,
        role: DeviceRole,
        operation_mode: Option<OperationMode>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let operation = operation_mode.map(|mode| mode.to_string());
        match records.iter_mut().find(|r| r.address == address) {
            Some(record) => {
                record.role = role;
                if operation.is_some() {
                    record.operation_mode = operation;
                }
            }
            None => records.push(ModuleRecord {
                address: address.to_string(),
                role,
                operation_mode: operation,
            }),
        }

        let json = serde_json::to_string_pretty(&*records)?;
        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Write(tmp.clone(), e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Write(self.path.clone(), e))?;
        debug!("[{}] registry updated: {}", address, role);
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
