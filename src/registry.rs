//! Branch metadata registry
//!
//! One record per branch, stored under `project:{branch}`. Records written by
//! older deployments may lack `project_name`/`server_name` and may carry the
//! port as a string; both are tolerated on read.
//!
//! Server names are indexed under `server:{server_name}` with the owning
//! branch as value, so two branches never route the same host name.

use crate::error::{ProvisionError, Result, StoreError};
use crate::store::KvStore;
use chrono::Local;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Timestamp format of `created_at`
pub const CREATED_AT_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// Provisioned state of one branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Registry key; filled from the key when absent in the document
    #[serde(default)]
    pub branch: String,

    /// IP whose pool owns `port`
    pub ip: String,

    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,

    #[serde(default)]
    pub project_name: Option<String>,

    #[serde(default)]
    pub server_name: Option<String>,

    /// Set once at creation
    pub created_at: String,
}

impl ProjectRecord {
    /// A fresh record stamped with the current local time
    pub fn new(branch: &str, ip: &str, port: u16, project_name: &str, server_name: &str) -> Self {
        Self {
            branch: branch.to_string(),
            ip: ip.to_string(),
            port,
            project_name: Some(project_name.to_string()),
            server_name: Some(server_name.to_string()),
            created_at: Local::now().format(CREATED_AT_FORMAT).to_string(),
        }
    }

    /// Fill in metadata missing from legacy records. Returns true if anything
    /// was filled; present fields are never replaced.
    pub fn backfill(&mut self, project_name: &str, server_name: &str) -> bool {
        let mut changed = false;
        if self.project_name.as_deref().map_or(true, str::is_empty) {
            self.project_name = Some(project_name.to_string());
            changed = true;
        }
        if self.server_name.as_deref().map_or(true, str::is_empty) {
            self.server_name = Some(server_name.to_string());
            changed = true;
        }
        changed
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortRepr {
    Number(u64),
    Text(String),
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = match PortRepr::deserialize(deserializer)? {
        PortRepr::Number(n) => n,
        PortRepr::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| D::Error::custom(format!("invalid port '{}'", s)))?,
    };

    u16::try_from(value)
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| D::Error::custom(format!("port {} out of range", value)))
}

pub(crate) fn project_key(branch: &str) -> String {
    format!("project:{}", branch)
}

pub(crate) fn server_key(server_name: &str) -> String {
    format!("server:{}", server_name)
}

pub struct ProjectRegistry {
    store: Arc<dyn KvStore>,
}

impl ProjectRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn exists(&self, branch: &str) -> Result<bool> {
        Ok(self.store.exists(&project_key(branch))?)
    }

    /// Load a record; `NotFound` if the branch is not provisioned
    pub fn get(&self, branch: &str) -> Result<ProjectRecord> {
        let key = project_key(branch);
        let bytes = self
            .store
            .get(&key)?
            .ok_or_else(|| ProvisionError::NotFound(format!("branch {}", branch)))?;

        let mut record: ProjectRecord =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                key,
                reason: e.to_string(),
            })?;

        if record.branch.is_empty() {
            record.branch = branch.to_string();
        }
        Ok(record)
    }

    /// Store `record` under `branch`, replacing any previous one
    pub fn put(&self, branch: &str, record: &ProjectRecord) -> Result<()> {
        let key = project_key(branch);
        let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, &bytes)?;
        debug!(branch, ip = %record.ip, port = record.port, "Stored project record");
        Ok(())
    }

    /// Remove a record. Absent records are ignored.
    pub fn delete(&self, branch: &str) -> Result<()> {
        self.store.delete(&project_key(branch))?;
        debug!(branch, "Deleted project record");
        Ok(())
    }

    /// Branch that claimed `server_name`, if any
    pub fn server_name_owner(&self, server_name: &str) -> Result<Option<String>> {
        let key = server_key(server_name);
        match self.store.get(&key)? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes).map(Some).map_err(|e| {
                ProvisionError::Store(StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                })
            }),
        }
    }

    pub fn claim_server_name(&self, server_name: &str, branch: &str) -> Result<()> {
        self.store.set(&server_key(server_name), branch.as_bytes())?;
        debug!(branch, server_name, "Claimed server name");
        Ok(())
    }

    /// Drop the claim on `server_name` if `branch` holds it
    pub fn release_server_name(&self, server_name: &str, branch: &str) -> Result<()> {
        if self.server_name_owner(server_name)?.as_deref() == Some(branch) {
            self.store.delete(&server_key(server_name))?;
            debug!(branch, server_name, "Released server name");
        }
        Ok(())
    }
}
