//! The six-operation capability interface every backend implements, whether
//! it runs embedded in-process or as an external executable.

use crate::endpoint::Endpoint;
use crate::errors::PluginError;
use crate::meta::{FieldMode, PluginInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Readable half of a data stream handed to a consuming operation.
pub type ByteSource<'a> = &'a mut (dyn AsyncRead + Unpin + Send);
/// Writable half of a data stream handed to a producing operation.
pub type ByteSink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Receives human-readable diagnostic lines (never parsed for control meaning).
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

pub fn discard_log() -> LogSink {
    Arc::new(|_| {})
}

/// Result of a successful `store` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    #[serde(rename = "archive_size", alias = "size", default)]
    pub size: i64,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    async fn meta(&self) -> Result<PluginInfo, PluginError>;

    /// Checks `endpoint` against the declared field schema. Side-effect free.
    async fn validate(&self, mode: FieldMode, endpoint: &Endpoint) -> Result<(), PluginError> {
        let info = self.meta().await?;
        if !info.supports(mode) {
            return Err(PluginError::Unimplemented(format!("{} mode", mode.as_str())));
        }
        endpoint.validate(&info, mode)?;
        Ok(())
    }

    async fn backup(&self, _endpoint: &Endpoint, _out: ByteSink<'_>) -> Result<(), PluginError> {
        Err(PluginError::Unimplemented("backup".into()))
    }

    async fn restore(&self, _endpoint: &Endpoint, _input: ByteSource<'_>) -> Result<(), PluginError> {
        Err(PluginError::Unimplemented("restore".into()))
    }

    async fn store(
        &self,
        _endpoint: &Endpoint,
        _input: ByteSource<'_>,
    ) -> Result<StoredObject, PluginError> {
        Err(PluginError::Unimplemented("store".into()))
    }

    async fn retrieve(
        &self,
        _endpoint: &Endpoint,
        _key: &str,
        _out: ByteSink<'_>,
    ) -> Result<(), PluginError> {
        Err(PluginError::Unimplemented("retrieve".into()))
    }

    /// Deletes a stored object. Purging a key that no longer exists must succeed.
    async fn purge(&self, _endpoint: &Endpoint, _key: &str) -> Result<(), PluginError> {
        Err(PluginError::Unimplemented("purge".into()))
    }
}

/// Looks up plugins by name at dispatch time.
pub trait PluginResolver: Send + Sync {
    fn resolve(&self, name: &str, log: LogSink) -> Result<Arc<dyn Plugin>, PluginError>;
}

/// Embedded plugins keyed by name, optionally backed by another resolver
/// for names that are not registered.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    fallback: Option<Arc<dyn PluginResolver>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: &str, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.insert(name.to_string(), plugin);
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn PluginResolver>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }
}

impl PluginResolver for PluginRegistry {
    fn resolve(&self, name: &str, log: LogSink) -> Result<Arc<dyn Plugin>, PluginError> {
        if let Some(plugin) = self.plugins.get(name) {
            return Ok(plugin.clone());
        }
        match &self.fallback {
            Some(fallback) => fallback.resolve(name, log),
            None => Err(PluginError::failed(format!("plugin '{name}' is not registered"))),
        }
    }
}
