use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::config::{SandboxConfig, Second};

use super::process::{ProcessEnd, block_on, run_supervised};
use super::{
    ExecRequest, ExecutionReport, ExecutionStatus, Sandbox, SandboxGuard, SandboxProvider,
    remove_disallowed_files, validate_file_name,
};

const STDOUT_FILE: &str = "stdout";
const STDERR_FILE: &str = "stderr";

/// Provides directory sandboxes without security isolation
///
/// Processes only get a wall-clock deadline and an address-space limit; no
/// file system or permission controls are applied. Intended for development
/// and testing environments.
pub struct SimpleProvider {
    base_dir: PathBuf,
    keep_sandboxes: bool,
    token: CancellationToken,
}

impl SimpleProvider {
    pub fn build(config: &SandboxConfig, token: CancellationToken) -> Result<Self> {
        let base_dir = std::env::temp_dir().join("outjudge-simple");
        Self::with_base_dir(base_dir, config.keep_sandboxes, token)
    }

    pub fn with_base_dir(
        base_dir: impl Into<PathBuf>,
        keep_sandboxes: bool,
        token: CancellationToken,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;

        log::warn!(
            "Simple sandboxes provide NO security isolation - use only in trusted environments"
        );

        Ok(Self {
            base_dir,
            keep_sandboxes,
            token,
        })
    }
}

impl SandboxProvider for SimpleProvider {
    fn acquire(&self) -> Result<SandboxGuard> {
        let dir = tempfile::Builder::new()
            .prefix("box-")
            .tempdir_in(&self.base_dir)
            .context("Failed to create sandbox directory")?;
        let root = dir.path().to_path_buf();
        let work_dir = root.join("box");
        fs::create_dir(&work_dir)?;

        log::debug!("Simple sandbox {} created", root.display());
        Ok(SandboxGuard::new(Box::new(SimpleSandbox {
            dir: Some(dir),
            root,
            work_dir,
            keep: self.keep_sandboxes,
            token: self.token.clone(),
        })))
    }

    fn name(&self) -> &'static str {
        "simple"
    }
}

/// A fresh directory in which the process runs as the current user
pub struct SimpleSandbox {
    dir: Option<TempDir>,
    /// Instance directory, holding `box/` and the captured streams
    root: PathBuf,
    work_dir: PathBuf,
    keep: bool,
    token: CancellationToken,
}

impl Sandbox for SimpleSandbox {
    fn path(&self) -> &Path {
        &self.root
    }

    fn create_file(&mut self, name: &str, content: &[u8], executable: bool) -> Result<()> {
        validate_file_name(name)?;
        let path = self.work_dir.join(name);
        fs::write(&path, content).with_context(|| format!("Failed to write {name}"))?;
        let mode = if executable { 0o755 } else { 0o644 };
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        validate_file_name(name)?;
        fs::read(self.work_dir.join(name)).with_context(|| format!("Failed to read {name}"))
    }

    fn execute(&mut self, request: &ExecRequest) -> Result<ExecutionReport> {
        for path in &request.allow_paths {
            validate_file_name(path)?;
        }
        let (program, args) = request
            .command
            .split_first()
            .context("Empty command")?;
        remove_disallowed_files(&self.work_dir, request)?;

        let stdout_path = self.root.join(STDOUT_FILE);
        let stderr_path = self.root.join(STDERR_FILE);

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(fs::File::create(&stdout_path)?))
            .stderr(Stdio::from(fs::File::create(&stderr_path)?));

        let memory_bytes = request.limits.memory_limit.0.saturating_mul(1024);
        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            command.pre_exec(move || {
                let limit = libc::rlimit {
                    rlim_cur: memory_bytes as libc::rlim_t,
                    rlim_max: memory_bytes as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let deadline = Duration::from_secs_f64(Second::from(request.limits.time_limit).0);
        let (end, elapsed) = block_on(run_supervised(command, deadline, &self.token))??;

        let status = match end {
            ProcessEnd::Exited(exit) => match (exit.code(), exit.signal()) {
                (Some(0), _) => ExecutionStatus::Ok,
                (Some(exit_code), _) => ExecutionStatus::RuntimeError { exit_code },
                (None, Some(signal)) => ExecutionStatus::Signaled { signal },
                (None, None) => ExecutionStatus::SandboxError("unknown exit status".to_string()),
            },
            ProcessEnd::TimedOut => ExecutionStatus::TimeLimitExceeded,
            ProcessEnd::Cancelled => ExecutionStatus::Cancelled,
        };

        log::debug!(
            "Simple sandbox {} ran {:?}: {status:?}",
            self.root.display(),
            request.command
        );

        Ok(ExecutionReport {
            status,
            time: elapsed.as_micros() as u64,
            memory: 0,
            stdout: fs::read(&stdout_path).unwrap_or_default(),
            stderr: fs::read(&stderr_path).unwrap_or_default(),
        })
    }

    fn cleanup(&mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        if self.keep {
            let path = dir.keep();
            log::info!("Keeping simple sandbox {}", path.display());
            return Ok(());
        }
        dir.close()
            .with_context(|| format!("Failed to remove {}", self.root.display()))
    }
}
