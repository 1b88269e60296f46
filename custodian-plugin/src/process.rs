//! Subprocess adapter: drives an external plugin executable through the
//! command-line contract and exposes it as a [`Plugin`].
//!
//! Each operation spawns `<plugin> <op> [--key K] [--mode M]` with the endpoint
//! JSON in `CUSTODIAN_ENDPOINT`, so secrets never appear in the process table.
//! stdin and stdout carry the data stream, stderr is forwarded line by line to
//! the task log. Every child runs in its own process group, and the whole group
//! is killed if the operation is abandoned before the child is reaped.

use crate::endpoint::Endpoint;
use crate::errors::PluginError;
use crate::meta::{FieldMode, PluginInfo};
use crate::plugin::{ByteSink, ByteSource, LogSink, Plugin, PluginResolver, StoredObject};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::debug;

pub const ENDPOINT_ENV: &str = "CUSTODIAN_ENDPOINT";

const STDERR_TAIL_LINES: usize = 20;
const MAX_CONTROL_OUTPUT: u64 = 1024 * 1024;
const CHUNK: usize = 64 * 1024;

pub struct ProcessPlugin {
    name: String,
    path: PathBuf,
    log: LogSink,
}

impl ProcessPlugin {
    pub fn new(name: &str, path: PathBuf, log: LogSink) -> Self {
        Self {
            name: name.to_string(),
            path,
            log,
        }
    }

    fn command(&self, op: &str, endpoint: Option<&Endpoint>) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.arg(op)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        if let Some(ep) = endpoint {
            cmd.env(ENDPOINT_ENV, ep.to_json());
        }
        cmd
    }

    fn spawn(&self, op: &str, mut cmd: Command) -> Result<(Child, GroupGuard, JoinHandle<String>), PluginError> {
        debug!("spawning plugin {} for {}", self.name, op);
        let mut child = cmd.spawn().map_err(|e| {
            PluginError::failed(format!(
                "failed to execute plugin '{}' ({}): {e}",
                self.name,
                self.path.display()
            ))
        })?;
        let guard = GroupGuard::new(child.id());
        let stderr = match child.stderr.take() {
            Some(stderr) => forward_stderr(stderr, self.log.clone()),
            None => tokio::spawn(async { String::new() }),
        };
        Ok((child, guard, stderr))
    }

    async fn reap(
        &self,
        op: &str,
        child: &mut Child,
        guard: &mut GroupGuard,
        stderr: JoinHandle<String>,
    ) -> Result<(ExitStatus, String), PluginError> {
        let status = child.wait().await?;
        guard.disarm();
        let tail = stderr.await.unwrap_or_default();
        debug!("plugin {} {} exited with {}", self.name, op, status);
        Ok((status, tail))
    }

    /// Runs an operation with no data stream and returns its stdout.
    async fn run_plain(&self, op: &str, mut cmd: Command) -> Result<Vec<u8>, PluginError> {
        cmd.stdout(Stdio::piped());
        let (mut child, mut guard, stderr) = self.spawn(op, cmd)?;
        let mut out = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            stdout.take(MAX_CONTROL_OUTPUT).read_to_end(&mut out).await?;
        }
        let (status, tail) = self.reap(op, &mut child, &mut guard, stderr).await?;
        if !status.success() {
            return Err(PluginError::from_exit(op, status.code(), tail));
        }
        Ok(out)
    }

    /// Feeds `input` into the child's stdin. A failing input kills the group
    /// before stdin closes, so the child never sees a clean EOF on truncated data.
    async fn feed(
        child: &mut Child,
        guard: &GroupGuard,
        input: ByteSource<'_>,
    ) -> Result<(), PluginError> {
        let Some(mut stdin) = child.stdin.take() else {
            return Ok(());
        };
        let fed = pump(input, &mut stdin).await;
        match fed {
            Err(PumpError::Read(e)) => {
                guard.kill();
                drop(stdin);
                Err(PluginError::Io(e))
            }
            // The child stopped reading; its exit status tells the rest.
            Err(PumpError::Write(_)) => Ok(()),
            Ok(_) => {
                let _ = stdin.shutdown().await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Plugin for ProcessPlugin {
    async fn meta(&self) -> Result<PluginInfo, PluginError> {
        let out = self.run_plain("info", self.command("info", None)).await?;
        Ok(serde_json::from_slice(&out)?)
    }

    async fn validate(&self, mode: FieldMode, endpoint: &Endpoint) -> Result<(), PluginError> {
        let mut cmd = self.command("validate", Some(endpoint));
        cmd.arg("--mode").arg(mode.as_str());
        match self.run_plain("validate", cmd).await {
            Ok(_) => Ok(()),
            // No custom validation: check against the declared schema instead.
            Err(PluginError::Unimplemented(_)) => {
                let info = self.meta().await?;
                if !info.supports(mode) {
                    return Err(PluginError::Unimplemented(format!("{} mode", mode.as_str())));
                }
                endpoint.validate(&info, mode)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn backup(&self, endpoint: &Endpoint, out: ByteSink<'_>) -> Result<(), PluginError> {
        let mut cmd = self.command("backup", Some(endpoint));
        cmd.stdout(Stdio::piped());
        let (mut child, mut guard, stderr) = self.spawn("backup", cmd)?;
        let copied = match child.stdout.take() {
            Some(mut stdout) => pump(&mut stdout, out).await,
            None => Ok(0),
        };
        let (status, tail) = self.reap("backup", &mut child, &mut guard, stderr).await?;
        match copied {
            // Downstream went away; that failure belongs to the consumer.
            Err(PumpError::Write(e)) => Err(PluginError::Io(e)),
            _ if !status.success() => Err(PluginError::from_exit("backup", status.code(), tail)),
            Err(PumpError::Read(e)) => Err(PluginError::Io(e)),
            Ok(n) => {
                out.flush().await?;
                (self.log)(&format!("backup produced {n} bytes"));
                Ok(())
            }
        }
    }

    async fn restore(&self, endpoint: &Endpoint, input: ByteSource<'_>) -> Result<(), PluginError> {
        let mut cmd = self.command("restore", Some(endpoint));
        cmd.stdin(Stdio::piped());
        let (mut child, mut guard, stderr) = self.spawn("restore", cmd)?;
        let fed = Self::feed(&mut child, &guard, input).await;
        let (status, tail) = self.reap("restore", &mut child, &mut guard, stderr).await?;
        fed?;
        if !status.success() {
            return Err(PluginError::from_exit("restore", status.code(), tail));
        }
        Ok(())
    }

    async fn store(&self, endpoint: &Endpoint, input: ByteSource<'_>) -> Result<StoredObject, PluginError> {
        let mut cmd = self.command("store", Some(endpoint));
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
        let (mut child, mut guard, stderr) = self.spawn("store", cmd)?;
        let stdout = child.stdout.take();
        let collect = async move {
            let mut buf = Vec::new();
            if let Some(stdout) = stdout {
                stdout.take(MAX_CONTROL_OUTPUT).read_to_end(&mut buf).await?;
            }
            Ok::<_, io::Error>(buf)
        };
        let (fed, collected) = tokio::join!(Self::feed(&mut child, &guard, input), collect);
        let (status, tail) = self.reap("store", &mut child, &mut guard, stderr).await?;
        fed?;
        if !status.success() {
            return Err(PluginError::from_exit("store", status.code(), tail));
        }
        let stored = parse_stored_object(&collected?)?;
        (self.log)(&format!("stored {} bytes under key {}", stored.size, stored.key));
        Ok(stored)
    }

    async fn retrieve(&self, endpoint: &Endpoint, key: &str, out: ByteSink<'_>) -> Result<(), PluginError> {
        if key.is_empty() {
            return Err(PluginError::MissingKey);
        }
        let mut cmd = self.command("retrieve", Some(endpoint));
        cmd.arg("--key").arg(key).stdout(Stdio::piped());
        let (mut child, mut guard, stderr) = self.spawn("retrieve", cmd)?;
        let copied = match child.stdout.take() {
            Some(mut stdout) => pump(&mut stdout, out).await,
            None => Ok(0),
        };
        let (status, tail) = self.reap("retrieve", &mut child, &mut guard, stderr).await?;
        match copied {
            Err(PumpError::Write(e)) => Err(PluginError::Io(e)),
            _ if !status.success() => Err(PluginError::from_exit("retrieve", status.code(), tail)),
            Err(PumpError::Read(e)) => Err(PluginError::Io(e)),
            Ok(_) => {
                out.flush().await?;
                Ok(())
            }
        }
    }

    async fn purge(&self, endpoint: &Endpoint, key: &str) -> Result<(), PluginError> {
        if key.is_empty() {
            return Err(PluginError::MissingKey);
        }
        let mut cmd = self.command("purge", Some(endpoint));
        cmd.arg("--key").arg(key);
        self.run_plain("purge", cmd).await.map(|_| ())
    }
}

/// Parses the last non-empty stdout line of a `store` run.
fn parse_stored_object(stdout: &[u8]) -> Result<StoredObject, PluginError> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| PluginError::failed("store produced no output describing the stored object"))?;
    let stored: StoredObject = serde_json::from_str(line)?;
    if stored.key.is_empty() {
        return Err(PluginError::failed("store reported an empty key"));
    }
    Ok(stored)
}

/// Kills the child's process group unless the child was reaped normally.
struct GroupGuard {
    pgid: Option<i32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()),
        }
    }

    fn kill(&self) {
        if let Some(pgid) = self.pgid {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

fn forward_stderr(stderr: ChildStderr, log: LogSink) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log(&line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect::<Vec<_>>().join("\n")
    })
}

enum PumpError {
    Read(io::Error),
    Write(io::Error),
}

/// Copies until EOF, keeping track of which side failed.
async fn pump<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, PumpError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(PumpError::Read)?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await.map_err(PumpError::Write)?;
        total += n as u64;
    }
}

/// Resolves plugin names to executables in a single directory.
#[derive(Debug, Clone)]
pub struct PluginDir {
    dir: PathBuf,
}

impl PluginDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Names of every executable file in the directory.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        names
    }
}

impl PluginResolver for PluginDir {
    fn resolve(&self, name: &str, log: LogSink) -> Result<Arc<dyn Plugin>, PluginError> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(PluginError::failed(format!("invalid plugin name '{name}'")));
        }
        let path = self.dir.join(name);
        if !path.is_file() {
            return Err(PluginError::failed(format!(
                "plugin '{name}' not found in {}",
                self.dir.display()
            )));
        }
        Ok(Arc::new(ProcessPlugin::new(name, path, log)))
    }
}
