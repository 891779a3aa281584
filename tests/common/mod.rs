#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, anyhow, bail};
use parking_lot::Mutex;

use outjudge::config::{OutputEval, ResourceLimits};
use outjudge::job::Job;
use outjudge::sandbox::{
    ExecRequest, ExecutionReport, ExecutionStatus, Sandbox, SandboxGuard, SandboxProvider,
    validate_file_name,
};
use outjudge::storage::{FileCacher, MemoryCacher};
use outjudge::task_type::{OutputOnly, TaskType};

/// Decides what a fake execution returns, given the staged files
pub type Script = dyn Fn(&BTreeMap<String, Vec<u8>>, &ExecRequest) -> ExecutionReport + Send + Sync;

/// Sandbox provider keeping files in memory and running scripted "processes"
pub struct FakeProvider {
    script: Arc<Script>,
    next_id: AtomicUsize,
    pub released: Arc<AtomicUsize>,
    pub fail_acquire: AtomicBool,
    pub requests: Arc<Mutex<Vec<ExecRequest>>>,
    pub staged: Arc<Mutex<Vec<(String, bool)>>>,
}

impl FakeProvider {
    pub fn new(
        script: impl Fn(&BTreeMap<String, Vec<u8>>, &ExecRequest) -> ExecutionReport
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(script),
            next_id: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
            fail_acquire: AtomicBool::new(false),
            requests: Arc::new(Mutex::new(Vec::new())),
            staged: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// A provider whose executions must never happen
    pub fn without_processes() -> Arc<Self> {
        Self::new(|_, request| panic!("unexpected execution of {:?}", request.command))
    }

    pub fn acquired(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl SandboxProvider for FakeProvider {
    fn acquire(&self) -> Result<SandboxGuard> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            bail!("no sandbox available");
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(SandboxGuard::new(Box::new(FakeSandbox {
            path: PathBuf::from(format!("/fake/box-{id}")),
            files: BTreeMap::new(),
            script: Arc::clone(&self.script),
            released: Arc::clone(&self.released),
            requests: Arc::clone(&self.requests),
            staged: Arc::clone(&self.staged),
        })))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

struct FakeSandbox {
    path: PathBuf,
    files: BTreeMap<String, Vec<u8>>,
    script: Arc<Script>,
    released: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<ExecRequest>>>,
    staged: Arc<Mutex<Vec<(String, bool)>>>,
}

impl Sandbox for FakeSandbox {
    fn path(&self) -> &Path {
        &self.path
    }

    fn create_file(&mut self, name: &str, content: &[u8], executable: bool) -> Result<()> {
        validate_file_name(name)?;
        self.staged.lock().push((name.to_string(), executable));
        self.files.insert(name.to_string(), content.to_vec());
        Ok(())
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("{name} not in sandbox"))
    }

    fn execute(&mut self, request: &ExecRequest) -> Result<ExecutionReport> {
        self.requests.lock().push(request.clone());
        Ok((self.script)(&self.files, request))
    }

    fn cleanup(&mut self) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn report(status: ExecutionStatus, stdout: &str) -> ExecutionReport {
    ExecutionReport {
        status,
        time: 1000,
        memory: 512,
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

/// A job with one testcase per `(index, reference)` pair
pub fn job_with_testcases(cacher: &MemoryCacher, testcases: &[(u32, &str)]) -> Job {
    let mut job = Job::new("lamps", OutputEval::Diff, ResourceLimits::default());
    for (index, reference) in testcases {
        let digest = cacher.put(reference.as_bytes()).unwrap();
        job.add_testcase(*index, None, digest);
    }
    job
}

pub fn submit(job: &mut Job, cacher: &MemoryCacher, index: u32, content: &str) {
    let digest = cacher.put(content.as_bytes()).unwrap();
    job.submit_file(format!("output_{index:03}.txt"), digest);
}

pub fn add_comparator(job: &mut Job, cacher: &MemoryCacher) {
    let digest = cacher.put(b"#!/bin/sh\n").unwrap();
    job.add_manager("check", digest);
    job.output_eval = OutputEval::Comparator;
}

pub fn output_only(provider: Arc<FakeProvider>, cacher: Arc<MemoryCacher>) -> TaskType {
    TaskType::OutputOnly(OutputOnly::new(provider, cacher))
}
