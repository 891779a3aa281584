//! The judging job: what was submitted, what it is compared against, and the
//! results written while it is evaluated.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::{OutputEval, ResourceLimits};

/// Name under which the output for test `index` is submitted
pub fn submission_file_name(index: u32) -> String {
    format!("output_{index:03}.txt")
}

/// Parses a submitted file name back into its test index
pub fn parse_submission_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("output_")?.strip_suffix(".txt")?;
    if digits.len() < 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index: u32 = digits.parse().ok()?;
    (submission_file_name(index) == name).then_some(index)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmittedFile {
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Testcase {
    /// Not used by output-only tasks, kept for task types that run programs
    pub input: Option<String>,
    pub output: String,
}

/// A task-supplied executable, for output-only tasks the comparator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manager {
    pub name: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    /// Whether the grading machinery completed, not whether the output is right
    pub success: bool,
    pub outcome: Option<f64>,
    pub text: Option<String>,
    pub sandbox_paths: Vec<String>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl EvaluationResult {
    /// Result slot written before any work happens
    pub fn skeleton(sandbox_paths: Vec<String>) -> Self {
        Self {
            success: false,
            outcome: None,
            text: None,
            sandbox_paths,
            extra: BTreeMap::new(),
        }
    }
}

/// Slot state of one test index
#[derive(Debug, Clone)]
enum Slot {
    InProgress(EvaluationResult),
    Done(EvaluationResult),
}

impl Slot {
    fn result(&self) -> &EvaluationResult {
        match self {
            Slot::InProgress(result) | Slot::Done(result) => result,
        }
    }
}

pub struct Job {
    pub task_name: String,
    pub files: BTreeMap<String, SubmittedFile>,
    pub testcases: BTreeMap<u32, Testcase>,
    pub managers: BTreeMap<String, Manager>,
    pub output_eval: OutputEval,
    pub limits: ResourceLimits,

    pub compilation_success: Option<bool>,
    pub success: Option<bool>,
    pub text: Option<String>,

    evaluations: Mutex<BTreeMap<u32, Slot>>,
    sandbox_paths: Mutex<Vec<String>>,
}

impl Job {
    pub fn new(task_name: impl Into<String>, output_eval: OutputEval, limits: ResourceLimits) -> Self {
        Self {
            task_name: task_name.into(),
            files: BTreeMap::new(),
            testcases: BTreeMap::new(),
            managers: BTreeMap::new(),
            output_eval,
            limits,
            compilation_success: None,
            success: None,
            text: None,
            evaluations: Mutex::new(BTreeMap::new()),
            sandbox_paths: Mutex::new(Vec::new()),
        }
    }

    pub fn add_testcase(&mut self, index: u32, input: Option<String>, output: impl Into<String>) {
        self.testcases.insert(
            index,
            Testcase {
                input,
                output: output.into(),
            },
        );
    }

    pub fn add_manager(&mut self, name: impl Into<String>, digest: impl Into<String>) {
        let name = name.into();
        self.managers.insert(
            name.clone(),
            Manager {
                name,
                digest: digest.into(),
            },
        );
    }

    pub fn submit_file(&mut self, name: impl Into<String>, digest: impl Into<String>) {
        self.files.insert(
            name.into(),
            SubmittedFile {
                digest: digest.into(),
            },
        );
    }

    /// Digest of the output submitted for test `index`, if any
    pub fn submitted_digest(&self, index: u32) -> Option<&str> {
        self.files
            .get(&submission_file_name(index))
            .map(|file| file.digest.as_str())
    }

    /// The comparator, when the task has one
    pub fn comparator(&self) -> Option<&Manager> {
        self.managers.values().next()
    }

    /// Appends a sandbox identifier to the job's audit list
    pub fn record_sandbox(&self, path: impl Into<String>) {
        self.sandbox_paths.lock().push(path.into());
    }

    pub fn sandbox_paths(&self) -> Vec<String> {
        self.sandbox_paths.lock().clone()
    }

    /// Reserves the slot of test `index` with its skeleton result
    ///
    /// Returns `false`, leaving the table untouched, if the index already has
    /// a slot.
    pub fn start_evaluation(&self, index: u32, skeleton: EvaluationResult) -> bool {
        let mut evaluations = self.evaluations.lock();
        if evaluations.contains_key(&index) {
            return false;
        }
        evaluations.insert(index, Slot::InProgress(skeleton));
        true
    }

    /// Applies `update` to an in-progress slot and seals it
    ///
    /// Sealed slots are never modified again; finishing one is a no-op that
    /// returns `false`.
    pub fn finish_evaluation(&self, index: u32, update: impl FnOnce(&mut EvaluationResult)) -> bool {
        let mut evaluations = self.evaluations.lock();
        match evaluations.remove(&index) {
            Some(Slot::InProgress(mut result)) => {
                update(&mut result);
                evaluations.insert(index, Slot::Done(result));
                true
            }
            Some(done) => {
                evaluations.insert(index, done);
                false
            }
            None => false,
        }
    }

    pub fn evaluation(&self, index: u32) -> Option<EvaluationResult> {
        self.evaluations
            .lock()
            .get(&index)
            .map(|slot| slot.result().clone())
    }

    pub fn evaluations(&self) -> BTreeMap<u32, EvaluationResult> {
        self.evaluations
            .lock()
            .iter()
            .map(|(index, slot)| (*index, slot.result().clone()))
            .collect()
    }
}
