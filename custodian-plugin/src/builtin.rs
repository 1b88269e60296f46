//! Store plugins that run in-process.

use crate::endpoint::Endpoint;
use crate::errors::PluginError;
use crate::meta::{Features, Field, FieldMode, FieldType, PluginInfo};
use crate::plugin::{ByteSink, ByteSource, Plugin, StoredObject};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn unique_name() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{secs}-{}-{}", std::process::id(), SEQUENCE.fetch_add(1, Ordering::Relaxed))
}

/// Keeps stored objects in memory, namespaced by the `bucket` endpoint field.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|m| m.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().map(|m| m.contains_key(key)).unwrap_or(false)
    }

    fn bucket(endpoint: &Endpoint) -> Result<String, PluginError> {
        Ok(endpoint.string_value("bucket")?)
    }
}

fn poisoned() -> PluginError {
    PluginError::failed("memory store lock poisoned")
}

#[async_trait]
impl Plugin for MemoryStore {
    async fn meta(&self) -> Result<PluginInfo, PluginError> {
        Ok(PluginInfo::new("memory", "custodian", env!("CARGO_PKG_VERSION"), Features::store())
            .with_field(
                Field::store("bucket", FieldType::String, "Bucket")
                    .required()
                    .help("Namespace that stored objects are kept under."),
            ))
    }

    async fn store(&self, endpoint: &Endpoint, input: ByteSource<'_>) -> Result<StoredObject, PluginError> {
        let bucket = Self::bucket(endpoint)?;
        let mut data = Vec::new();
        input.read_to_end(&mut data).await?;
        let key = format!("{bucket}/{}", unique_name());
        let size = data.len() as i64;
        self.objects.lock().map_err(|_| poisoned())?.insert(key.clone(), data);
        Ok(StoredObject { key, size })
    }

    async fn retrieve(&self, _endpoint: &Endpoint, key: &str, out: ByteSink<'_>) -> Result<(), PluginError> {
        let data = self
            .objects
            .lock()
            .map_err(|_| poisoned())?
            .get(key)
            .cloned()
            .ok_or_else(|| PluginError::failed(format!("no stored object under key {key}")))?;
        out.write_all(&data).await?;
        out.flush().await?;
        Ok(())
    }

    async fn purge(&self, _endpoint: &Endpoint, key: &str) -> Result<(), PluginError> {
        self.objects.lock().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }
}

/// Stores objects as files under the absolute `base_dir` endpoint field.
#[derive(Default)]
pub struct FsStore;

impl FsStore {
    fn base_dir(endpoint: &Endpoint) -> Result<PathBuf, PluginError> {
        Ok(PathBuf::from(endpoint.string_value("base_dir")?))
    }

    fn object_path(endpoint: &Endpoint, key: &str) -> Result<PathBuf, PluginError> {
        let rel = PathBuf::from(key);
        if key.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(PluginError::failed(format!("invalid storage key '{key}'")));
        }
        Ok(Self::base_dir(endpoint)?.join(rel))
    }
}

#[async_trait]
impl Plugin for FsStore {
    async fn meta(&self) -> Result<PluginInfo, PluginError> {
        Ok(PluginInfo::new("fs", "custodian", env!("CARGO_PKG_VERSION"), Features::store())
            .with_field(
                Field::store("base_dir", FieldType::AbsPath, "Base directory")
                    .required()
                    .example("/var/backups"),
            ))
    }

    async fn validate(&self, mode: FieldMode, endpoint: &Endpoint) -> Result<(), PluginError> {
        let info = self.meta().await?;
        if !info.supports(mode) {
            return Err(PluginError::Unimplemented(format!("{} mode", mode.as_str())));
        }
        endpoint.validate(&info, mode)?;
        let dir = Self::base_dir(endpoint)?;
        if !tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(PluginError::failed(format!("base_dir {} is not a directory", dir.display())));
        }
        Ok(())
    }

    async fn store(&self, endpoint: &Endpoint, input: ByteSource<'_>) -> Result<StoredObject, PluginError> {
        let key = format!("{}.bin", unique_name());
        let path = Self::object_path(endpoint, &key)?;
        let mut file = tokio::fs::File::create(&path).await?;
        let copied = tokio::io::copy(input, &mut file).await;
        let size = match copied {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e.into());
            }
        };
        file.sync_all().await?;
        Ok(StoredObject { key, size: size as i64 })
    }

    async fn retrieve(&self, endpoint: &Endpoint, key: &str, out: ByteSink<'_>) -> Result<(), PluginError> {
        let path = Self::object_path(endpoint, key)?;
        let mut file = tokio::fs::File::open(&path).await?;
        tokio::io::copy(&mut file, out).await?;
        out.flush().await?;
        Ok(())
    }

    async fn purge(&self, endpoint: &Endpoint, key: &str) -> Result<(), PluginError> {
        let path = Self::object_path(endpoint, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
