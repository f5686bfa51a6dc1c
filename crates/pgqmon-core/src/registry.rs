//! Resolution of database ids to connection settings.
//!
//! The instance/database registry is owned by the dashboard; this crate only
//! reads it. [`FileRegistry`] loads a JSON export of it:
//!
//! ```json
//! {
//!   "instances": [
//!     { "id": 1, "host": "10.0.0.5", "port": 5432, "user": "monitor",
//!       "password": "...", "role": "writer",
//!       "ssh": { "host": "bastion", "username": "deploy", "private_key": "..." } }
//!   ],
//!   "databases": [
//!     { "id": 10, "instance_id": 1, "name": "app", "archived": false }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::connection::ConnectionConfig;
use crate::error::MonitorError;
use crate::tunnel::SshSettings;

/// Looks up how to connect to a database.
pub trait Registry: Send + Sync {
    /// Fails with `NotFound` for unknown ids and `InvalidRequest` for
    /// archived databases.
    fn resolve(&self, database_id: i64) -> Result<ConnectionConfig, MonitorError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid registry: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid registry: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    #[default]
    Writer,
    Reader,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceEntry {
    pub id: i64,
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub role: InstanceRole,
    #[serde(default)]
    pub ssh: Option<SshSettings>,
}

impl std::fmt::Debug for InstanceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceEntry")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("role", &self.role)
            .field("ssh", &self.ssh)
            .finish()
    }
}

fn default_pg_port() -> u16 {
    5432
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseEntry {
    pub id: i64,
    pub instance_id: i64,
    pub name: String,
    /// Overrides the instance user when set.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

impl std::fmt::Debug for DatabaseEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseEntry")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("archived", &self.archived)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    instances: Vec<InstanceEntry>,
    #[serde(default)]
    databases: Vec<DatabaseEntry>,
}

/// Registry loaded once from a JSON file.
#[derive(Debug, Default)]
pub struct FileRegistry {
    instances: HashMap<i64, InstanceEntry>,
    databases: HashMap<i64, DatabaseEntry>,
}

impl FileRegistry {
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_json(&text)?;
        info!(
            path = %path.display(),
            instances = registry.instances.len(),
            databases = registry.databases.len(),
            "registry loaded"
        );
        Ok(registry)
    }

    pub fn from_json(text: &str) -> Result<Self, RegistryError> {
        let doc: RegistryDocument = serde_json::from_str(text)?;
        Self::from_entries(doc.instances, doc.databases)
    }

    /// Rejects duplicate ids and databases on unknown instances.
    pub fn from_entries(
        instances: Vec<InstanceEntry>,
        databases: Vec<DatabaseEntry>,
    ) -> Result<Self, RegistryError> {
        let mut registry = FileRegistry::default();
        for inst in instances {
            let id = inst.id;
            if registry.instances.insert(id, inst).is_some() {
                return Err(RegistryError::Invalid(format!("duplicate instance id {id}")));
            }
        }
        for db in databases {
            if !registry.instances.contains_key(&db.instance_id) {
                return Err(RegistryError::Invalid(format!(
                    "database {} references unknown instance {}",
                    db.id, db.instance_id
                )));
            }
            let id = db.id;
            if registry.databases.insert(id, db).is_some() {
                return Err(RegistryError::Invalid(format!("duplicate database id {id}")));
            }
        }
        Ok(registry)
    }

    pub fn database(&self, database_id: i64) -> Option<&DatabaseEntry> {
        self.databases.get(&database_id)
    }
}

impl Registry for FileRegistry {
    fn resolve(&self, database_id: i64) -> Result<ConnectionConfig, MonitorError> {
        let db = self
            .databases
            .get(&database_id)
            .ok_or_else(|| MonitorError::NotFound(format!("database {database_id}")))?;
        if db.archived {
            return Err(MonitorError::InvalidRequest(format!(
                "database {database_id} is archived"
            )));
        }
        let inst = self
            .instances
            .get(&db.instance_id)
            .ok_or_else(|| MonitorError::NotFound(format!("instance {}", db.instance_id)))?;

        Ok(ConnectionConfig {
            instance_id: inst.id,
            host: inst.host.clone(),
            port: inst.port,
            user: db.user.clone().unwrap_or_else(|| inst.user.clone()),
            password: db.password.clone().or_else(|| inst.password.clone()),
            database: db.name.clone(),
            ssh: inst.ssh.clone(),
        })
    }
}
