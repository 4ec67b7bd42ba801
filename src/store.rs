//! Persistence of instance configurations

use crate::errors::{MonitorError, Result};
use crate::model::{InstanceConfig, InstanceId, LastKnownValue};
use crate::schema;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Owner of instance configuration. The refresh controller only goes
/// through this trait.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self, id: InstanceId) -> Result<Option<InstanceConfig>>;
    async fn save(&self, id: InstanceId, config: &InstanceConfig) -> Result<()>;
    /// Removes the configuration and the remembered value. Removing an id
    /// that has no configuration is not an error.
    async fn delete(&self, id: InstanceId) -> Result<()>;
    async fn list(&self) -> Result<Vec<InstanceId>>;

    async fn load_last_value(&self, id: InstanceId) -> Result<Option<LastKnownValue>>;
    async fn save_last_value(&self, id: InstanceId, value: &LastKnownValue) -> Result<()>;
}

/// One JSON document per instance, `<dir>/instance-<id>.json`, next to
/// `last-<id>.json` for the remembered value and `refresh-<id>.request`
/// markers left by `request_refresh`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

const FILE_PREFIX: &str = "instance-";
const FILE_SUFFIX: &str = ".json";
const LAST_VALUE_PREFIX: &str = "last-";
const REQUEST_PREFIX: &str = "refresh-";
const REQUEST_SUFFIX: &str = ".request";

impl JsonFileStore {
    /// Open (and create if needed) a store directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: InstanceId) -> PathBuf {
        self.dir.join(format!("{}{}{}", FILE_PREFIX, id, FILE_SUFFIX))
    }

    fn last_value_path(&self, id: InstanceId) -> PathBuf {
        self.dir.join(format!("{}{}{}", LAST_VALUE_PREFIX, id, FILE_SUFFIX))
    }

    fn request_path(&self, id: InstanceId) -> PathBuf {
        self.dir.join(format!("{}{}{}", REQUEST_PREFIX, id, REQUEST_SUFFIX))
    }

    fn parse_name(name: &str, prefix: &str, suffix: &str) -> Option<InstanceId> {
        name.strip_prefix(prefix)?
            .strip_suffix(suffix)?
            .parse::<u32>()
            .ok()
            .map(InstanceId)
    }

    fn parse_file_name(name: &str) -> Option<InstanceId> {
        Self::parse_name(name, FILE_PREFIX, FILE_SUFFIX)
    }

    fn is_auxiliary(name: &str) -> bool {
        name.ends_with(".tmp")
            || Self::parse_name(name, LAST_VALUE_PREFIX, FILE_SUFFIX).is_some()
            || Self::parse_name(name, REQUEST_PREFIX, REQUEST_SUFFIX).is_some()
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        // Readers never observe a partially written document.
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove_if_present(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MonitorError::Io(e)),
        }
    }

    /// Ask a running daemon to refresh `id` outside its schedule. The
    /// daemon picks the marker up on its next store scan.
    pub async fn request_refresh(&self, id: InstanceId) -> Result<()> {
        tokio::fs::write(self.request_path(id), b"").await?;
        debug!("Requested refresh of instance {}", id);
        Ok(())
    }

    /// Drain pending refresh markers, one id per marker.
    pub async fn take_refresh_requests(&self) -> Result<Vec<InstanceId>> {
        let mut ids = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| Self::parse_name(n, REQUEST_PREFIX, REQUEST_SUFFIX))
            else {
                continue;
            };
            Self::remove_if_present(&entry.path()).await?;
            ids.insert(id);
        }

        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    async fn load(&self, id: InstanceId) -> Result<Option<InstanceConfig>> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MonitorError::Io(e)),
        };

        schema::decode(&bytes)
            .map(Some)
            .map_err(|e| MonitorError::Store(format!("{}: {}", path.display(), e)))
    }

    async fn save(&self, id: InstanceId, config: &InstanceConfig) -> Result<()> {
        let bytes = schema::encode(config)?;
        let path = self.path_for(id);
        Self::write_atomic(&path, &bytes).await?;

        debug!("Saved configuration for instance {} to {}", id, path.display());
        Ok(())
    }

    async fn delete(&self, id: InstanceId) -> Result<()> {
        Self::remove_if_present(&self.path_for(id)).await?;
        Self::remove_if_present(&self.last_value_path(id)).await
    }

    async fn list(&self) -> Result<Vec<InstanceId>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            match name.to_str().and_then(Self::parse_file_name) {
                Some(id) => ids.push(id),
                None => {
                    if !Self::is_auxiliary(&name.to_string_lossy()) {
                        warn!("Ignoring unexpected file in store: {:?}", name);
                    }
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn load_last_value(&self, id: InstanceId) -> Result<Option<LastKnownValue>> {
        let bytes = match tokio::fs::read(self.last_value_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MonitorError::Io(e)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save_last_value(&self, id: InstanceId, value: &LastKnownValue) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        Self::write_atomic(&self.last_value_path(id), &bytes).await
    }
}

/// Volatile store, used when nothing needs to survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    configs: RwLock<HashMap<InstanceId, InstanceConfig>>,
    last_values: RwLock<HashMap<InstanceId, LastKnownValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load(&self, id: InstanceId) -> Result<Option<InstanceConfig>> {
        Ok(self.configs.read().await.get(&id).cloned())
    }

    async fn save(&self, id: InstanceId, config: &InstanceConfig) -> Result<()> {
        self.configs.write().await.insert(id, config.clone());
        Ok(())
    }

    async fn delete(&self, id: InstanceId) -> Result<()> {
        self.configs.write().await.remove(&id);
        self.last_values.write().await.remove(&id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InstanceId>> {
        let mut ids: Vec<InstanceId> = self.configs.read().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn load_last_value(&self, id: InstanceId) -> Result<Option<LastKnownValue>> {
        Ok(self.last_values.read().await.get(&id).copied())
    }

    async fn save_last_value(&self, id: InstanceId, value: &LastKnownValue) -> Result<()> {
        self.last_values.write().await.insert(id, *value);
        Ok(())
    }
}
