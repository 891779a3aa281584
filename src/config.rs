use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "outjudge", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the task configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Directory holding the submitted `output_NNN.txt` files
    #[arg(long = "submission", short = 's')]
    pub submission_dir: PathBuf,

    /// Number of test cases evaluated in parallel
    #[arg(long = "threads", short = 't', default_value_t = 1)]
    pub threads: usize,

    /// Write the JSON report here instead of stdout
    #[arg(long = "output", short = 'o')]
    pub output_path: Option<PathBuf>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    pub storage_dir: Option<PathBuf>,
    pub task: TaskConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SandboxConfig {
    #[serde(default)]
    pub backend: SandboxBackend,
    /// First isolate box id handed out by the box pool
    #[serde(default = "default_first_box_id")]
    pub first_box_id: u32,
    /// Number of isolate boxes available to concurrent evaluations
    #[serde(default = "default_box_count")]
    pub box_count: u32,
    /// Keep sandbox directories on disk after release, for debugging
    #[serde(default)]
    pub keep_sandboxes: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::default(),
            first_box_id: default_first_box_id(),
            box_count: default_box_count(),
            keep_sandboxes: false,
        }
    }
}

fn default_first_box_id() -> u32 {
    0
}

fn default_box_count() -> u32 {
    64
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    /// isolate when the binary is installed, the simple runner otherwise
    #[default]
    Auto,
    Isolate,
    Simple,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TaskConfig {
    pub name: String,
    #[serde(flatten)]
    pub task_type: TaskTypeConfig,
    pub time_limit: MicroSecond,
    pub memory_limit: KiloByte,
    pub testcases: Vec<TestcaseConfig>,
    #[serde(default)]
    pub managers: Vec<ManagerConfig>,
}

/// Task type selection, one variant per supported kind
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskTypeConfig {
    OutputOnly {
        #[serde(default)]
        output_eval: OutputEval,
    },
}

/// Declared way of evaluating outputs
#[derive(Deserialize, serde::Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputEval {
    #[default]
    Diff,
    Comparator,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TestcaseConfig {
    pub input_file: Option<String>,
    pub output_file: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ManagerConfig {
    pub name: String,
    pub file: String,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MicroSecond(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Second(pub f64);

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KiloByte(pub u64);

impl From<MicroSecond> for Second {
    fn from(value: MicroSecond) -> Self {
        Second(value.0 as f64 / 1_000_000.0)
    }
}

impl From<Second> for MicroSecond {
    fn from(value: Second) -> Self {
        MicroSecond((value.0 * 1_000_000.0).round() as u64)
    }
}

/// Limits applied to every sandboxed execution of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub time_limit: MicroSecond,
    pub memory_limit: KiloByte,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            time_limit: MicroSecond(10_000_000),
            memory_limit: KiloByte(512 * 1024),
        }
    }
}

impl TaskConfig {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            time_limit: self.time_limit,
            memory_limit: self.memory_limit,
        }
    }
}
