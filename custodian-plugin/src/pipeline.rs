//! Composes two plugins into the data-moving operations: backup streams
//! Target.Backup into Store.Store, restore streams Store.Retrieve into
//! Target.Restore. Both halves run concurrently over a bounded pipe and both
//! endpoints are validated before any bytes move.

use crate::command::{Command, CommandError, Operation};
use crate::endpoint::Endpoint;
use crate::errors::{Half, PipelineError, PluginError};
use crate::meta::FieldMode;
use crate::pipe::pipe;
use crate::plugin::{LogSink, Plugin, PluginResolver, StoredObject};
use async_compression::tokio::write::{ZstdDecoder, ZstdEncoder};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd => "zstd",
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(Compression::None),
            "zstd" => Ok(Compression::Zstd),
            other => Err(format!("unsupported compression '{other}'")),
        }
    }
}

/// One plugin bound to its endpoint for a single run.
#[derive(Clone, Copy)]
pub struct Side<'a> {
    pub name: &'a str,
    pub plugin: &'a dyn Plugin,
    pub endpoint: &'a Endpoint,
}

impl<'a> Side<'a> {
    pub fn new(name: &'a str, plugin: &'a dyn Plugin, endpoint: &'a Endpoint) -> Self {
        Self { name, plugin, endpoint }
    }

    async fn validate(&self, half: Half, mode: FieldMode) -> Result<(), PipelineError> {
        self.plugin
            .validate(mode, self.endpoint)
            .await
            .map_err(|e| PipelineError::new(half, self.name, "validate", e))
    }
}

fn is_broken_pipe(err: &PluginError) -> bool {
    matches!(err, PluginError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
}

/// Picks the half to blame when both sides of a pipe may have failed. A
/// producer that only saw its consumer hang up is not the cause.
fn blame(
    producer: (Half, &str, &'static str, Result<(), PluginError>),
    consumer: (Half, &str, &'static str, Result<(), PluginError>),
) -> Result<(), PipelineError> {
    let (p_half, p_name, p_op, p_res) = producer;
    let (c_half, c_name, c_op, c_res) = consumer;
    match (p_res, c_res) {
        (Err(p), Err(c)) if is_broken_pipe(&p) => Err(PipelineError::new(c_half, c_name, c_op, c)),
        (Err(p), _) => Err(PipelineError::new(p_half, p_name, p_op, p)),
        (Ok(()), Err(c)) => Err(PipelineError::new(c_half, c_name, c_op, c)),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// Streams the target's backup into the store and returns the stored object.
pub async fn backup(
    target: Side<'_>,
    store: Side<'_>,
    compression: Compression,
) -> Result<StoredObject, PipelineError> {
    target.validate(Half::Target, FieldMode::Target).await?;
    store.validate(Half::Store, FieldMode::Store).await?;

    let (writer, mut reader) = pipe(PIPE_CAPACITY);
    let produce = async move {
        let mut writer = writer;
        let result = match compression {
            Compression::None => target.plugin.backup(target.endpoint, &mut writer).await,
            Compression::Zstd => {
                let mut encoder = ZstdEncoder::new(&mut writer);
                match target.plugin.backup(target.endpoint, &mut encoder).await {
                    Ok(()) => encoder.shutdown().await.map_err(PluginError::from),
                    Err(e) => Err(e),
                }
            }
        };
        writer.finish(result.is_ok());
        result
    };
    let consume = async {
        let stored = store.plugin.store(store.endpoint, &mut reader).await;
        drop(reader);
        stored
    };

    let (produced, stored) = tokio::join!(produce, consume);
    let (stored_ok, stored) = match stored {
        Ok(obj) => (Ok(()), Some(obj)),
        Err(e) => (Err(e), None),
    };
    blame(
        (Half::Target, target.name, "backup", produced),
        (Half::Store, store.name, "store", stored_ok),
    )?;
    stored.ok_or_else(|| {
        PipelineError::new(Half::Store, store.name, "store", PluginError::failed("no object was stored"))
    })
}

/// Streams a stored object back into the target.
pub async fn restore(
    store: Side<'_>,
    target: Side<'_>,
    key: &str,
    compression: Compression,
) -> Result<(), PipelineError> {
    if key.is_empty() {
        return Err(PipelineError::new(Half::Store, store.name, "retrieve", PluginError::MissingKey));
    }
    store.validate(Half::Store, FieldMode::Store).await?;
    target.validate(Half::Target, FieldMode::Target).await?;

    let (writer, mut reader) = pipe(PIPE_CAPACITY);
    let produce = async move {
        let mut writer = writer;
        let result = match compression {
            Compression::None => store.plugin.retrieve(store.endpoint, key, &mut writer).await,
            Compression::Zstd => {
                let mut decoder = ZstdDecoder::new(&mut writer);
                match store.plugin.retrieve(store.endpoint, key, &mut decoder).await {
                    Ok(()) => decoder.shutdown().await.map_err(PluginError::from),
                    Err(e) => Err(e),
                }
            }
        };
        writer.finish(result.is_ok());
        result
    };
    let consume = async {
        let restored = target.plugin.restore(target.endpoint, &mut reader).await;
        drop(reader);
        restored
    };

    let (retrieved, restored) = tokio::join!(produce, consume);
    blame(
        (Half::Store, store.name, "retrieve", retrieved),
        (Half::Target, target.name, "restore", restored),
    )
}

/// Deletes a stored object. Purging an already-absent key succeeds.
pub async fn purge(store: Side<'_>, key: &str) -> Result<(), PipelineError> {
    if key.is_empty() {
        return Err(PipelineError::new(Half::Store, store.name, "purge", PluginError::MissingKey));
    }
    store.validate(Half::Store, FieldMode::Store).await?;
    store
        .plugin
        .purge(store.endpoint, key)
        .await
        .map_err(|e| PipelineError::new(Half::Store, store.name, "purge", e))
}

/// Round-trips a probe payload through the store: store, retrieve, compare, purge.
pub async fn test_store(store: Side<'_>) -> Result<StoredObject, PipelineError> {
    store.validate(Half::Store, FieldMode::Store).await?;
    let fail = |op: &'static str, e: PluginError| PipelineError::new(Half::Store, store.name, op, e);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let probe = format!("custodian test-store probe {nanos}\n").into_bytes();

    let mut input: &[u8] = &probe;
    let stored = store
        .plugin
        .store(store.endpoint, &mut input)
        .await
        .map_err(|e| fail("store", e))?;

    let mut echoed = Vec::with_capacity(probe.len());
    let retrieved = store
        .plugin
        .retrieve(store.endpoint, &stored.key, &mut echoed)
        .await
        .map_err(|e| fail("retrieve", e));

    let purged = store
        .plugin
        .purge(store.endpoint, &stored.key)
        .await
        .map_err(|e| fail("purge", e));

    retrieved?;
    if echoed != probe {
        return Err(fail(
            "retrieve",
            PluginError::failed(format!(
                "retrieved {} bytes that do not match the {} bytes stored",
                echoed.len(),
                probe.len()
            )),
        ));
    }
    purged?;
    Ok(stored)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

/// Coarse failure class reported across the agent boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Unimplemented,
    Validation,
    Execution,
}

impl FailureKind {
    pub fn of(err: &PluginError) -> Self {
        match err {
            PluginError::Unimplemented(_) => FailureKind::Unimplemented,
            PluginError::Validation(_) | PluginError::MissingKey => FailureKind::Validation,
            _ => FailureKind::Execution,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl RunError {
    pub fn half(&self) -> Option<Half> {
        match self {
            RunError::Command(_) => None,
            RunError::Pipeline(e) => Some(e.half),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            RunError::Command(_) => FailureKind::Validation,
            RunError::Pipeline(e) => FailureKind::of(&e.source),
        }
    }
}

fn resolve(
    resolver: &dyn PluginResolver,
    half: Half,
    name: &str,
    log: &LogSink,
) -> Result<Arc<dyn Plugin>, PipelineError> {
    resolver
        .resolve(name, log.clone())
        .map_err(|e| PipelineError::new(half, name, "resolve", e))
}

/// Executes an agent command end to end, resolving plugins by name.
pub async fn run_command(
    cmd: &Command,
    resolver: &dyn PluginResolver,
    log: LogSink,
) -> Result<CommandOutput, RunError> {
    cmd.check()?;
    debug!(task_id = %cmd.task_uuid, operation = %cmd.operation, "running command");

    let empty = Endpoint::new();
    let target_name = cmd.target_plugin.as_deref().unwrap_or_default();
    let store_name = cmd.store_plugin.as_deref().unwrap_or_default();
    let target_ep = cmd.target_endpoint.as_ref().unwrap_or(&empty);
    let store_ep = cmd.store_endpoint.as_ref().unwrap_or(&empty);
    let key = cmd.restore_key.as_deref().unwrap_or_default();

    let store_plugin = resolve(resolver, Half::Store, store_name, &log)?;
    let store = Side::new(store_name, store_plugin.as_ref(), store_ep);

    match cmd.operation {
        Operation::Backup => {
            let target_plugin = resolve(resolver, Half::Target, target_name, &log)?;
            let target = Side::new(target_name, target_plugin.as_ref(), target_ep);
            log(&format!(
                "backing up via target plugin '{target_name}' into store plugin '{store_name}' (compression: {})",
                cmd.compression.as_str()
            ));
            let stored = backup(target, store, cmd.compression).await?;
            log(&format!("stored archive key {} ({} bytes)", stored.key, stored.size));
            Ok(CommandOutput {
                key: Some(stored.key),
                size: Some(stored.size),
            })
        }
        Operation::Restore => {
            let target_plugin = resolve(resolver, Half::Target, target_name, &log)?;
            let target = Side::new(target_name, target_plugin.as_ref(), target_ep);
            log(&format!("restoring archive key {key} via target plugin '{target_name}'"));
            restore(store, target, key, cmd.compression).await?;
            log("restore complete");
            Ok(CommandOutput::default())
        }
        Operation::Purge => {
            log(&format!("purging archive key {key} from store plugin '{store_name}'"));
            purge(store, key).await?;
            Ok(CommandOutput::default())
        }
        Operation::TestStore => {
            log(&format!("testing store plugin '{store_name}'"));
            let probe = test_store(store).await?;
            log("store round-trip succeeded");
            Ok(CommandOutput {
                key: None,
                size: Some(probe.size),
            })
        }
    }
}
