mod box_pool;
mod isolate_sandbox;
mod process;
mod simple_sandbox;

pub use box_pool::{BoxLease, BoxPool};
pub use isolate_sandbox::IsolateProvider;
pub use simple_sandbox::SimpleProvider;

use std::collections::BTreeMap;
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::{ResourceLimits, SandboxBackend, SandboxConfig};
use crate::storage::FileCacher;

/// A subprocess to run inside a sandbox
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    /// Files inside the sandbox the process may access
    ///
    /// Every other staged file, apart from the program itself, is removed
    /// before the process starts.
    pub allow_paths: Vec<String>,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    RuntimeError { exit_code: i32 },
    Signaled { signal: i32 },
    TimeLimitExceeded,
    MemoryLimitExceeded,
    /// Terminated from outside, e.g. on job abort
    Cancelled,
    SandboxError(String),
}

/// What came out of one sandboxed execution
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    /// Wall time in microseconds
    pub time: u64,
    /// Peak memory in KB, 0 when the backend cannot measure it
    pub memory: u64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Ok
    }

    /// Execution details suitable for an evaluation's extra map
    pub fn diagnostics(&self) -> BTreeMap<String, serde_json::Value> {
        let status = match &self.status {
            ExecutionStatus::Ok => "ok".to_string(),
            ExecutionStatus::RuntimeError { exit_code } => format!("exit code {exit_code}"),
            ExecutionStatus::Signaled { signal } => format!("killed by signal {signal}"),
            ExecutionStatus::TimeLimitExceeded => "time limit exceeded".to_string(),
            ExecutionStatus::MemoryLimitExceeded => "memory limit exceeded".to_string(),
            ExecutionStatus::Cancelled => "cancelled".to_string(),
            ExecutionStatus::SandboxError(message) => format!("sandbox error: {message}"),
        };

        BTreeMap::from([
            ("execution_status".to_string(), json!(status)),
            ("execution_time_us".to_string(), json!(self.time)),
            ("execution_memory_kb".to_string(), json!(self.memory)),
        ])
    }
}

/// One isolated execution environment
///
/// Instances are never shared between evaluations. Dropping the owning
/// [`SandboxGuard`] releases the instance.
pub trait Sandbox: Send {
    /// Unique identifier of this instance, a directory on disk
    fn path(&self) -> &Path;

    /// Writes `content` into the sandbox as `name`
    fn create_file(&mut self, name: &str, content: &[u8], executable: bool) -> Result<()>;

    /// Stages a file fetched from digest storage
    fn create_file_from_storage(
        &mut self,
        cacher: &dyn FileCacher,
        name: &str,
        digest: &str,
        executable: bool,
    ) -> Result<()> {
        let content = cacher
            .get(digest)
            .with_context(|| format!("Failed to fetch {name} from storage"))?;
        self.create_file(name, &content, executable)
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>>;

    /// Runs a subprocess and waits for it, its limits or cancellation
    ///
    /// An `Err` means the sandbox could not run the process at all.
    fn execute(&mut self, request: &ExecRequest) -> Result<ExecutionReport>;

    /// Destroys the instance
    fn cleanup(&mut self) -> Result<()>;
}

/// Source of fresh sandbox instances
pub trait SandboxProvider: Send + Sync {
    fn acquire(&self) -> Result<SandboxGuard>;

    fn name(&self) -> &'static str;
}

/// Scoped ownership of a sandbox: released when dropped
pub struct SandboxGuard {
    inner: Box<dyn Sandbox>,
}

impl SandboxGuard {
    pub fn new(inner: Box<dyn Sandbox>) -> Self {
        Self { inner }
    }

    pub fn path_string(&self) -> String {
        self.inner.path().display().to_string()
    }
}

impl Deref for SandboxGuard {
    type Target = dyn Sandbox;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for SandboxGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        let path = self.path_string();
        match self.inner.cleanup() {
            Ok(()) => log::debug!("Sandbox {path} released"),
            Err(e) => log::error!("Sandbox {path} failed to clean up: {e:#}"),
        }
    }
}

/// Checks that `name` denotes a file directly inside the sandbox
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        bail!("Invalid sandbox file name {name:?}");
    }
    Ok(())
}

/// Removes the files in `dir` that `request` may not access
pub(crate) fn remove_disallowed_files(dir: &Path, request: &ExecRequest) -> Result<()> {
    let program = request
        .command
        .first()
        .map(|program| program.trim_start_matches("./"));
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let allowed = program == Some(&*name)
            || request.allow_paths.iter().any(|path| *path == *name);
        if !allowed && entry.file_type()?.is_file() {
            log::debug!("Removing {name} before running {:?}", request.command);
            fs::remove_file(entry.path())
                .with_context(|| format!("Failed to remove {name}"))?;
        }
    }
    Ok(())
}

/// Creates the sandbox provider selected by the configuration
///
/// `token` lets the caller terminate every in-flight execution at once.
pub fn create_sandbox_provider(
    config: &SandboxConfig,
    token: CancellationToken,
) -> Result<Arc<dyn SandboxProvider>> {
    let use_isolate = match config.backend {
        SandboxBackend::Isolate => true,
        SandboxBackend::Simple => false,
        SandboxBackend::Auto => isolate_available(),
    };

    if use_isolate {
        log::info!("Creating isolate sandbox provider (full isolation mode)");
        Ok(Arc::new(IsolateProvider::build(config, token)?))
    } else {
        log::info!("Creating simple sandbox provider (no isolation)");
        Ok(Arc::new(SimpleProvider::build(config, token)?))
    }
}

fn isolate_available() -> bool {
    std::process::Command::new("which")
        .arg("isolate")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}
