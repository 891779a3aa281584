use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Local;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::config::{MicroSecond, SandboxConfig, Second};

use super::process::{ProcessEnd, block_on, run_supervised};
use super::{
    BoxLease, BoxPool, ExecRequest, ExecutionReport, ExecutionStatus, Sandbox, SandboxGuard,
    SandboxProvider, remove_disallowed_files, validate_file_name,
};

// Sandbox configuration constants
const RUNTIME_PROCESSES: u32 = 4;
const RUNTIME_OPEN_FILES: u32 = 30;
const RUNTIME_FILE_SIZE: u32 = 16384; // KB
const WALL_TIME_SLACK: f64 = 0.5; // seconds

// Stream captures live inside the box but are not part of the allow-list
const STDOUT_FILE: &str = ".stdout";
const STDERR_FILE: &str = ".stderr";

// Sandbox cache directory permissions
const CACHE_DIR_PERMISSIONS: u32 = 0o700;

/// Provides sandboxes backed by `isolate` boxes with cgroup limits
pub struct IsolateProvider {
    pool: Arc<BoxPool>,
    cache_dir: PathBuf,
    keep_sandboxes: bool,
    token: CancellationToken,
}

impl IsolateProvider {
    pub fn build(config: &SandboxConfig, token: CancellationToken) -> Result<Self> {
        if config.box_count == 0 {
            bail!("At least one isolate box is required");
        }
        let cache_dir = Self::setup_cache_directory()?;

        log::info!(
            "Isolate provider ready with boxes {}..{}",
            config.first_box_id,
            config.first_box_id.saturating_add(config.box_count)
        );
        Ok(Self {
            pool: BoxPool::new(config.first_box_id, config.box_count),
            cache_dir,
            keep_sandboxes: config.keep_sandboxes,
            token,
        })
    }

    /// Sets up the cache directory holding per-instance meta files
    fn setup_cache_directory() -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "outjudge")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;

        let cache_dir = proj_dirs.cache_dir().join("isolate");
        fs::create_dir_all(&cache_dir)?;
        fs::set_permissions(&cache_dir, fs::Permissions::from_mode(CACHE_DIR_PERMISSIONS))?;

        Ok(cache_dir)
    }
}

impl SandboxProvider for IsolateProvider {
    fn acquire(&self) -> Result<SandboxGuard> {
        let lease = self
            .pool
            .lease()
            .ok_or_else(|| anyhow!("All isolate boxes are in use"))?;

        // Box ids get reused, so instances are identified by their own meta dir
        let meta_dir = tempfile::Builder::new()
            .prefix(&format!("{}-box{}-", Local::now().format("%y%m%d-%H-%M-%S"), lease.id()))
            .tempdir_in(&self.cache_dir)
            .context("Failed to create sandbox meta directory")?;
        let instance_dir = meta_dir.path().to_path_buf();

        let box_dir = initialize_isolate_box(lease.id())?;

        log::debug!(
            "Isolate sandbox {} created on box {}",
            instance_dir.display(),
            lease.id()
        );
        Ok(SandboxGuard::new(Box::new(IsolateSandbox {
            lease,
            meta_dir: Some(meta_dir),
            box_dir,
            instance_dir,
            keep: self.keep_sandboxes,
            token: self.token.clone(),
            executions: 0,
        })))
    }

    fn name(&self) -> &'static str {
        "isolate"
    }
}

/// Initializes an isolate box and returns its working directory
fn initialize_isolate_box(id: u32) -> Result<PathBuf> {
    let output = Command::new("isolate")
        .arg("-b")
        .arg(id.to_string())
        .arg("--cg")
        .arg("--init")
        .output()
        .map_err(|e| anyhow!("Failed to spawn isolate --init: {}", e))?;

    if !output.status.success() {
        bail!(
            "isolate --init exited with non-zero status; stderr={}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let root_dir_absolute = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if root_dir_absolute.is_empty() {
        bail!(
            "isolate --init produced empty stdout; stderr={}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(PathBuf::from(root_dir_absolute).join("box"))
}

/// One initialized isolate box
pub struct IsolateSandbox {
    lease: BoxLease,
    meta_dir: Option<TempDir>,
    box_dir: PathBuf,
    /// Per-instance directory with meta files, also the instance identifier
    instance_dir: PathBuf,
    keep: bool,
    token: CancellationToken,
    executions: u32,
}

impl Sandbox for IsolateSandbox {
    fn path(&self) -> &Path {
        &self.instance_dir
    }

    fn create_file(&mut self, name: &str, content: &[u8], executable: bool) -> Result<()> {
        validate_file_name(name)?;
        let path = self.box_dir.join(name);
        fs::write(&path, content).with_context(|| format!("Failed to write {name}"))?;
        let mode = if executable { 0o755 } else { 0o644 };
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        validate_file_name(name)?;
        fs::read(self.box_dir.join(name)).with_context(|| format!("Failed to read {name}"))
    }

    fn execute(&mut self, request: &ExecRequest) -> Result<ExecutionReport> {
        for path in &request.allow_paths {
            validate_file_name(path)?;
        }
        if request.command.is_empty() {
            bail!("Empty command");
        }
        remove_disallowed_files(&self.box_dir, request)?;

        self.executions += 1;
        let meta_path = self
            .instance_dir
            .join(format!("run{}.meta", self.executions));

        let time_limit = Second::from(request.limits.time_limit);
        let memory_limit = request.limits.memory_limit;

        let box_arg = format!("--box-id={}", self.lease.id());
        let time_arg = format!("--time={:.3}", time_limit.0);
        let wall_time_arg = format!("--wall-time={:.3}", time_limit.0 + WALL_TIME_SLACK);
        let memory_arg = format!("--cg-mem={}", memory_limit.0);
        let processes_arg = format!("--processes={RUNTIME_PROCESSES}");
        let open_files_arg = format!("--open-files={RUNTIME_OPEN_FILES}");
        let fsize_arg = format!("--fsize={RUNTIME_FILE_SIZE}");
        let meta_arg = format!("--meta={}", meta_path.display());

        let mut command = tokio::process::Command::new("isolate");
        command
            .args([
                box_arg.as_str(),
                "--cg",
                "--run",
                &time_arg,
                &wall_time_arg,
                &memory_arg,
                &processes_arg,
                &open_files_arg,
                &fsize_arg,
                "-E",
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
                &meta_arg,
                "-o",
                STDOUT_FILE,
                "-r",
                STDERR_FILE,
                "--silent",
                "--",
            ])
            .args(&request.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // isolate enforces the limits itself; this deadline only guards against a stuck keeper
        let deadline = Duration::from_secs_f64(time_limit.0 + WALL_TIME_SLACK + 5.0);
        let (end, elapsed) = block_on(run_supervised(command, deadline, &self.token))??;

        let mut report = ExecutionReport {
            status: ExecutionStatus::Ok,
            time: elapsed.as_micros() as u64,
            memory: 0,
            stdout: fs::read(self.box_dir.join(STDOUT_FILE)).unwrap_or_default(),
            stderr: fs::read(self.box_dir.join(STDERR_FILE)).unwrap_or_default(),
        };

        match end {
            ProcessEnd::Exited(_) => match fs::read_to_string(&meta_path) {
                Ok(meta_content) => process_meta_content(&meta_content, &mut report),
                Err(e) => {
                    report.status =
                        ExecutionStatus::SandboxError(format!("Failed to read meta file: {e}"))
                }
            },
            ProcessEnd::TimedOut => {
                report.status = ExecutionStatus::SandboxError("isolate did not return".into())
            }
            ProcessEnd::Cancelled => report.status = ExecutionStatus::Cancelled,
        }

        log::debug!(
            "Isolate box {} ran {:?}: {:?}",
            self.lease.id(),
            request.command,
            report.status
        );
        Ok(report)
    }

    fn cleanup(&mut self) -> Result<()> {
        let Some(meta_dir) = self.meta_dir.take() else {
            return Ok(());
        };

        if self.keep {
            let kept = meta_dir.keep();
            if let Err(e) = self.preserve_box_contents() {
                log::error!(
                    "Failed to keep box contents of {}: {e:#}",
                    kept.display()
                );
            }
        }

        let output = Command::new("isolate")
            .arg(format!("--box-id={}", self.lease.id()))
            .arg("--cg")
            .arg("--cleanup")
            .output()
            .map_err(|e| anyhow!("Failed to spawn isolate --cleanup: {}", e))?;
        if !output.status.success() {
            bail!("isolate --cleanup exited with non-zero status");
        }
        Ok(())
    }
}

impl IsolateSandbox {
    /// Copies the box files next to the meta files before the box is wiped
    fn preserve_box_contents(&self) -> Result<()> {
        let target = self.instance_dir.join("box");
        fs::create_dir_all(&target)?;
        for entry in fs::read_dir(&self.box_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), target.join(entry.file_name()))?;
            }
        }
        log::info!("Kept isolate sandbox contents in {}", target.display());
        Ok(())
    }
}

/// Processes the meta file content and updates the execution report
fn process_meta_content(meta_content: &str, report: &mut ExecutionReport) {
    let mut exit_code = 0;
    let mut exit_signal = None;
    let mut killed = false;
    let mut oom_killed = false;
    let mut status = None;
    let mut message = String::new();

    for line in meta_content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            match key {
                "killed" => killed = true,
                "cg-oom-killed" => oom_killed = true,
                "exitcode" => exit_code = value.parse().unwrap_or(-1),
                "exitsig" => exit_signal = value.parse().ok(),
                "status" => status = Some(value.to_string()),
                "message" => message = value.to_string(),
                "cg-mem" | "max-rss" => {
                    if let Ok(memory) = value.parse::<u64>() {
                        report.memory = report.memory.max(memory);
                    }
                }
                "time-wall" => {
                    if let Ok(secs) = value.parse::<f64>() {
                        report.time = MicroSecond::from(Second(secs)).0;
                    }
                }
                _ => {}
            }
        }
    }

    report.status = match status.as_deref() {
        None => ExecutionStatus::Ok,
        Some(_) if oom_killed => ExecutionStatus::MemoryLimitExceeded,
        Some("TO") => ExecutionStatus::TimeLimitExceeded,
        Some("SG") => ExecutionStatus::Signaled {
            signal: exit_signal.unwrap_or(9),
        },
        Some("RE") => ExecutionStatus::RuntimeError { exit_code },
        Some("XX") => ExecutionStatus::SandboxError(message),
        Some(_) if killed => ExecutionStatus::TimeLimitExceeded,
        Some(other) => ExecutionStatus::SandboxError(format!("unknown status {other}: {message}")),
    };
}
