//! Persistent registry of managed hypervisor hosts.
//!
//! Hosts are stored as a single JSON document:
//!
//! ```json
//! { "servers": { "<id>": { ... } }, "default_server": "<id>" }
//! ```
//!
//! Every mutation is written to disk before it becomes visible, so a failed
//! write leaves both the file and the in-memory view unchanged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hostfleet_pool::HostConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default managed image pool path for new hosts.
pub const DEFAULT_IMAGE_POOL_PATH: &str = "/var/lib/hostfleet/images";

/// Default connection retry count for new hosts.
pub const DEFAULT_CONNECTION_RETRY: u32 = 3;

/// Default connection timeout for new hosts, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Host not found: {0}")]
    NotFound(String),

    #[error("Cannot delete the only host")]
    LastHost,

    #[error("No default host configured")]
    NoDefault,

    #[error("Invalid host: {0}")]
    Invalid(String),

    #[error("Registry I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse host registry: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A registered hypervisor host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Hypervisor connection URI, e.g. `qemu+ssh://root@kvm-01/system`
    pub uri: String,
    #[serde(default)]
    pub iso_pool: String,
    #[serde(default)]
    pub template_pool: String,
    #[serde(default)]
    pub image_pool_path: String,
    #[serde(default)]
    pub is_default: bool,
    /// Reachable at the last check
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ssh_key_path: String,
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default)]
    pub connection_retry: u32,
    /// Connection timeout in seconds
    #[serde(default)]
    pub timeout: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HostRecord {
    /// The connection-relevant part of this record.
    pub fn to_host_config(&self) -> HostConfig {
        HostConfig::new(&self.id, &self.name, &self.uri)
            .with_pools(&self.iso_pool, &self.template_pool)
            .with_timeout_secs(self.timeout)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateHostRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub uri: String,
    #[serde(default)]
    pub iso_pool: String,
    #[serde(default)]
    pub template_pool: String,
    #[serde(default)]
    pub image_pool_path: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ssh_key_path: String,
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default)]
    pub connection_retry: u32,
    #[serde(default)]
    pub timeout: u64,
}

/// Partial update; `None` fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateHostRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub uri: Option<String>,
    pub iso_pool: Option<String>,
    pub template_pool: Option<String>,
    pub image_pool_path: Option<String>,
    pub is_default: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub ssh_key_path: Option<String>,
    pub ssh_user: Option<String>,
    pub connection_retry: Option<u32>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    servers: BTreeMap<String, HostRecord>,
    #[serde(default)]
    default_server: String,
}

impl RegistryFile {
    fn make_default(&mut self, id: &str) {
        for (host_id, host) in self.servers.iter_mut() {
            host.is_default = host_id == id;
        }
        self.default_server = id.to_string();
    }

    fn host_mut(&mut self, id: &str) -> Result<&mut HostRecord> {
        self.servers
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }
}

/// JSON-file backed host registry.
pub struct HostRegistry {
    path: PathBuf,
    state: RwLock<RegistryFile>,
}

impl HostRegistry {
    /// Default registry location: `~/.hostfleet/servers.json`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hostfleet")
            .join("servers.json")
    }

    /// Load the registry at `path`. A missing file yields an empty registry.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let state = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => RegistryFile::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No host registry on disk, starting empty");
                RegistryFile::default()
            }
            Err(source) => return Err(RegistryError::Io { path, source }),
        };

        info!(
            path = %path.display(),
            host_count = state.servers.len(),
            "Host registry loaded"
        );

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a new host.
    ///
    /// The first host registered becomes the default regardless of
    /// `is_default`.
    pub async fn add_host(&self, req: CreateHostRequest) -> Result<HostRecord> {
        if req.name.trim().is_empty() {
            return Err(RegistryError::Invalid("name is required".to_string()));
        }
        if req.uri.trim().is_empty() {
            return Err(RegistryError::Invalid("uri is required".to_string()));
        }

        let mut state = self.state.write().await;
        let mut next = state.clone();

        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let record = HostRecord {
            id: id.clone(),
            name: req.name,
            description: req.description,
            uri: req.uri,
            iso_pool: req.iso_pool,
            template_pool: req.template_pool,
            image_pool_path: non_empty_or(req.image_pool_path, DEFAULT_IMAGE_POOL_PATH),
            is_default: false,
            is_active: false,
            last_checked: None,
            last_error: None,
            tags: req.tags,
            ssh_key_path: req.ssh_key_path,
            ssh_user: req.ssh_user,
            connection_retry: if req.connection_retry == 0 {
                DEFAULT_CONNECTION_RETRY
            } else {
                req.connection_retry
            },
            timeout: if req.timeout == 0 { DEFAULT_TIMEOUT_SECS } else { req.timeout },
            created_at: now,
            updated_at: now,
        };

        let first = next.servers.is_empty();
        next.servers.insert(id.clone(), record);
        if req.is_default || first {
            next.make_default(&id);
        }

        self.persist(&next).await?;
        *state = next;

        let record = state.servers[&id].clone();
        info!(host_id = %id, name = %record.name, uri = %record.uri, "Host registered");
        Ok(record)
    }

    pub async fn update_host(&self, id: &str, req: UpdateHostRequest) -> Result<HostRecord> {
        let mut state = self.state.write().await;
        let mut next = state.clone();

        let host = next.host_mut(id)?;
        if let Some(name) = req.name {
            host.name = name;
        }
        if let Some(description) = req.description {
            host.description = description;
        }
        if let Some(uri) = req.uri {
            if uri.trim().is_empty() {
                return Err(RegistryError::Invalid("uri must not be empty".to_string()));
            }
            host.uri = uri;
        }
        if let Some(iso_pool) = req.iso_pool {
            host.iso_pool = iso_pool;
        }
        if let Some(template_pool) = req.template_pool {
            host.template_pool = template_pool;
        }
        if let Some(image_pool_path) = req.image_pool_path {
            host.image_pool_path = image_pool_path;
        }
        if let Some(tags) = req.tags {
            host.tags = tags;
        }
        if let Some(ssh_key_path) = req.ssh_key_path {
            host.ssh_key_path = ssh_key_path;
        }
        if let Some(ssh_user) = req.ssh_user {
            host.ssh_user = ssh_user;
        }
        if let Some(retry) = req.connection_retry {
            host.connection_retry = retry;
        }
        if let Some(timeout) = req.timeout {
            host.timeout = timeout;
        }
        host.updated_at = Utc::now();

        // Clearing the flag alone is ignored; some host is always the default.
        if req.is_default == Some(true) {
            next.make_default(id);
        }

        self.persist(&next).await?;
        *state = next;

        info!(host_id = %id, "Host updated");
        Ok(state.servers[id].clone())
    }

    /// Remove a host. The last remaining host cannot be removed.
    pub async fn delete_host(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();

        if !next.servers.contains_key(id) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        if next.servers.len() == 1 {
            return Err(RegistryError::LastHost);
        }

        let removed = next.servers.remove(id);
        if removed.map(|h| h.is_default).unwrap_or(false) || next.default_server == id {
            let successor = next
                .servers
                .values()
                .min_by_key(|h| h.created_at)
                .map(|h| h.id.clone());
            if let Some(successor) = successor {
                next.make_default(&successor);
                info!(host_id = %successor, "Default host reassigned");
            }
        }

        self.persist(&next).await?;
        *state = next;

        info!(host_id = %id, "Host removed from registry");
        Ok(())
    }

    pub async fn get_host(&self, id: &str) -> Result<HostRecord> {
        self.state
            .read()
            .await
            .servers
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub async fn default_host(&self) -> Result<HostRecord> {
        let state = self.state.read().await;
        if state.default_server.is_empty() {
            return Err(RegistryError::NoDefault);
        }
        state
            .servers
            .get(&state.default_server)
            .cloned()
            .ok_or(RegistryError::NoDefault)
    }

    /// All hosts, oldest first.
    pub async fn list_hosts(&self) -> Vec<HostRecord> {
        let mut hosts: Vec<HostRecord> = self.state.read().await.servers.values().cloned().collect();
        hosts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        hosts
    }

    pub async fn set_default(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();

        next.host_mut(id)?.updated_at = Utc::now();
        next.make_default(id);

        self.persist(&next).await?;
        *state = next;

        info!(host_id = %id, "Default host changed");
        Ok(())
    }

    /// Record the outcome of a connection attempt.
    pub async fn update_host_status(&self, id: &str, active: bool, last_error: Option<String>) -> Result<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();

        let host = next.host_mut(id)?;
        host.is_active = active;
        host.last_error = last_error;
        host.last_checked = Some(Utc::now());

        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    pub async fn host_count(&self) -> usize {
        self.state.read().await.servers.len()
    }

    /// Seed an empty registry with the single host from the daemon config.
    ///
    /// Returns the new record, or `None` when hosts already exist.
    pub async fn migrate_from_config(
        &self,
        uri: &str,
        iso_pool: &str,
        template_pool: &str,
        image_pool_path: &str,
    ) -> Result<Option<HostRecord>> {
        let mut state = self.state.write().await;
        if !state.servers.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let record = HostRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: "Local Server".to_string(),
            description: "Default local hypervisor (migrated from config)".to_string(),
            uri: uri.to_string(),
            iso_pool: iso_pool.to_string(),
            template_pool: template_pool.to_string(),
            image_pool_path: non_empty_or(image_pool_path.to_string(), DEFAULT_IMAGE_POOL_PATH),
            is_default: true,
            is_active: false,
            last_checked: None,
            last_error: None,
            tags: vec!["local".to_string(), "default".to_string()],
            ssh_key_path: String::new(),
            ssh_user: String::new(),
            connection_retry: DEFAULT_CONNECTION_RETRY,
            timeout: DEFAULT_TIMEOUT_SECS,
            created_at: now,
            updated_at: now,
        };

        let mut next = state.clone();
        next.servers.insert(record.id.clone(), record.clone());
        next.default_server = record.id.clone();

        self.persist(&next).await?;
        *state = next;

        info!(host_id = %record.id, uri = %uri, "Migrated configured host into registry");
        Ok(Some(record))
    }

    /// Write `file` atomically: temp file in the same directory, then rename.
    async fn persist(&self, file: &RegistryFile) -> Result<()> {
        let io_err = |source| RegistryError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let data = serde_json::to_vec_pretty(file)?;
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, data).await.map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            fs::set_permissions(&temp, perms).await.map_err(io_err)?;
        }

        fs::rename(&temp, &self.path).await.map_err(io_err)?;
        debug!(path = %self.path.display(), "Host registry saved");
        Ok(())
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(name: &str, uri: &str) -> CreateHostRequest {
        CreateHostRequest {
            name: name.to_string(),
            uri: uri.to_string(),
            ..Default::default()
        }
    }

    async fn open_temp() -> (TempDir, HostRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = HostRegistry::open(dir.path().join("nested").join("servers.json"))
            .await
            .unwrap();
        (dir, registry)
    }

    #[tokio::test]
    async fn test_first_host_becomes_default_with_defaults() {
        let (_dir, registry) = open_temp().await;

        let host = registry.add_host(request("kvm-01", "qemu+ssh://root@kvm-01/system")).await.unwrap();
        assert!(host.is_default);
        assert_eq!(host.image_pool_path, DEFAULT_IMAGE_POOL_PATH);
        assert_eq!(host.connection_retry, DEFAULT_CONNECTION_RETRY);
        assert_eq!(host.timeout, DEFAULT_TIMEOUT_SECS);
        assert!(!host.is_active);

        let second = registry.add_host(request("kvm-02", "qemu+ssh://root@kvm-02/system")).await.unwrap();
        assert!(!second.is_default);
        assert_eq!(registry.default_host().await.unwrap().id, host.id);
    }

    #[tokio::test]
    async fn test_new_default_unsets_previous() {
        let (_dir, registry) = open_temp().await;

        let first = registry.add_host(request("a", "qemu:///a")).await.unwrap();
        let second = registry
            .add_host(CreateHostRequest {
                is_default: true,
                ..request("b", "qemu:///b")
            })
            .await
            .unwrap();

        assert!(!registry.get_host(&first.id).await.unwrap().is_default);
        assert_eq!(registry.default_host().await.unwrap().id, second.id);

        registry.set_default(&first.id).await.unwrap();
        let defaults: Vec<_> = registry.list_hosts().await.into_iter().filter(|h| h.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, first.id);
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let (_dir, registry) = open_temp().await;

        let first = registry.add_host(request("a", "qemu:///a")).await.unwrap();
        assert!(matches!(registry.delete_host(&first.id).await, Err(RegistryError::LastHost)));

        let second = registry.add_host(request("b", "qemu:///b")).await.unwrap();
        registry.delete_host(&first.id).await.unwrap();

        let default = registry.default_host().await.unwrap();
        assert_eq!(default.id, second.id);
        assert!(default.is_default);
        assert!(matches!(registry.delete_host("missing").await, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_patches_only_given_fields() {
        let (_dir, registry) = open_temp().await;
        let host = registry.add_host(request("a", "qemu:///a")).await.unwrap();

        let updated = registry
            .update_host(
                &host.id,
                UpdateHostRequest {
                    uri: Some("qemu+tcp://a/system".to_string()),
                    timeout: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "a");
        assert_eq!(updated.uri, "qemu+tcp://a/system");
        assert_eq!(updated.timeout, 5);
        assert!(updated.updated_at >= host.updated_at);
        assert_eq!(updated.to_host_config().connect_options().timeout.as_secs(), 5);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let (dir, registry) = open_temp().await;
        let host = registry.add_host(request("a", "qemu:///a")).await.unwrap();
        registry
            .update_host_status(&host.id, false, Some("connection refused".to_string()))
            .await
            .unwrap();

        let path = dir.path().join("nested").join("servers.json");
        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["default_server"], host.id.as_str());
        assert_eq!(raw["servers"][&host.id]["name"], "a");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let reopened = HostRegistry::open(&path).await.unwrap();
        let loaded = reopened.get_host(&host.id).await.unwrap();
        assert_eq!(loaded.last_error.as_deref(), Some("connection refused"));
        assert!(loaded.last_checked.is_some());
        assert_eq!(reopened.host_count().await, 1);
    }

    #[tokio::test]
    async fn test_migrate_only_into_empty_registry() {
        let (_dir, registry) = open_temp().await;

        let migrated = registry
            .migrate_from_config("qemu:///system", "isos", "templates", "")
            .await
            .unwrap()
            .expect("empty registry is seeded");
        assert_eq!(migrated.name, "Local Server");
        assert!(migrated.is_default);
        assert_eq!(migrated.tags, vec!["local", "default"]);

        let again = registry
            .migrate_from_config("qemu:///other", "", "", "")
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(registry.host_count().await, 1);
    }

    #[tokio::test]
    async fn test_validation_and_corrupt_file() {
        let (dir, registry) = open_temp().await;
        assert!(matches!(
            registry.add_host(request("", "qemu:///a")).await,
            Err(RegistryError::Invalid(_))
        ));
        assert!(matches!(registry.default_host().await, Err(RegistryError::NoDefault)));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, b"{not json").unwrap();
        assert!(matches!(HostRegistry::open(&bad).await, Err(RegistryError::Parse(_))));
    }
}
