use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::json;

use crate::config::OutputEval;
use crate::grading::{extract_outcome_and_text, white_diff_step};
use crate::job::{EvaluationResult, Job, Manager, submission_file_name};
use crate::sandbox::{ExecRequest, SandboxGuard, SandboxProvider};
use crate::storage::FileCacher;

pub const REFERENCE_FILE: &str = "res.txt";
pub const OUTPUT_FILE: &str = "output.txt";
/// Passed to comparators for compatibility, never staged
pub const INPUT_FILE: &str = "input.txt";

pub const NOT_SUBMITTED_TEXT: &str = "File not submitted.";
pub const NO_COMPILATION_TEXT: &str = "No compilation needed.";

/// Task type for output-only tasks
///
/// A submission is one text file per testcase, judged with a white diff
/// against the reference output or, when the task ships a manager, by that
/// manager acting as comparator.
pub struct OutputOnly {
    sandboxes: Arc<dyn SandboxProvider>,
    cacher: Arc<dyn FileCacher>,
}

/// What a single evaluation produced before it is written into the job
struct Judgement {
    success: bool,
    verdict: Option<(f64, String)>,
    extra: BTreeMap<String, serde_json::Value>,
}

impl Judgement {
    fn judged(outcome: f64, text: String) -> Self {
        Self {
            success: true,
            verdict: Some((outcome, text)),
            extra: BTreeMap::new(),
        }
    }

    fn failed(extra: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            success: false,
            verdict: None,
            extra,
        }
    }
}

impl OutputOnly {
    pub const NAME: &'static str = "Output only";
    pub const ALLOW_PARTIAL_SUBMISSION: bool = true;

    pub fn new(sandboxes: Arc<dyn SandboxProvider>, cacher: Arc<dyn FileCacher>) -> Self {
        Self { sandboxes, cacher }
    }

    pub fn submission_format(&self, job: &Job) -> Vec<String> {
        job.testcases
            .keys()
            .map(|&index| submission_file_name(index))
            .collect()
    }

    pub fn compile(&self, job: &mut Job) {
        job.success = Some(true);
        job.compilation_success = Some(true);
        job.text = Some(NO_COMPILATION_TEXT.to_string());
    }

    pub fn evaluate_testcase(&self, job: &Job, index: u32) -> bool {
        if job.evaluation(index).is_some() {
            log::error!("Test {index} of {} was already evaluated", job.task_name);
            return false;
        }

        let mut sandbox = match self.sandboxes.acquire() {
            Ok(sandbox) => sandbox,
            Err(e) => {
                log::error!("Failed to create sandbox for test {index}: {e:#}");
                if job.start_evaluation(index, EvaluationResult::skeleton(Vec::new())) {
                    job.finish_evaluation(index, |result| {
                        result.extra.insert("error".to_string(), json!(format!("{e:#}")));
                    });
                }
                return false;
            }
        };

        // Recorded before anything else so a failing evaluation stays auditable
        let sandbox_path = sandbox.path_string();
        job.record_sandbox(sandbox_path.clone());
        if !job.start_evaluation(index, EvaluationResult::skeleton(vec![sandbox_path.clone()])) {
            log::error!("Test {index} of {} is being evaluated twice", job.task_name);
            return false;
        }

        // Partial submissions are allowed: a missing file scores 0
        let Some(output_digest) = job.submitted_digest(index) else {
            log::info!("Test {index}: {} not submitted", submission_file_name(index));
            job.finish_evaluation(index, |result| {
                result.success = true;
                result.outcome = Some(0.0);
                result.text = Some(NOT_SUBMITTED_TEXT.to_string());
            });
            return true;
        };

        let judgement = self
            .judge_output(job, index, output_digest, &mut sandbox)
            .unwrap_or_else(|e| {
                log::error!("Test {index} could not be judged in {sandbox_path}: {e:#}");
                Judgement::failed(BTreeMap::from([(
                    "error".to_string(),
                    json!(format!("{e:#}")),
                )]))
            });

        let success = judgement.success;
        job.finish_evaluation(index, |result| {
            result.success = judgement.success;
            if let Some((outcome, text)) = judgement.verdict {
                result.outcome = Some(outcome);
                result.text = Some(text);
            }
            result.extra.extend(judgement.extra);
        });

        log::debug!("Test {index} evaluated, success={success}");
        success
    }

    fn judge_output(
        &self,
        job: &Job,
        index: u32,
        output_digest: &str,
        sandbox: &mut SandboxGuard,
    ) -> Result<Judgement> {
        let testcase = job
            .testcases
            .get(&index)
            .ok_or_else(|| anyhow!("Task has no testcase {index}"))?;

        sandbox.create_file_from_storage(
            self.cacher.as_ref(),
            REFERENCE_FILE,
            &testcase.output,
            false,
        )?;
        sandbox.create_file_from_storage(self.cacher.as_ref(), OUTPUT_FILE, output_digest, false)?;

        warn_on_strategy_mismatch(job);

        // The strategy follows the managers, not `output_eval`
        match job.comparator() {
            None => {
                let (outcome, text) = white_diff_step(&**sandbox, OUTPUT_FILE, REFERENCE_FILE)?;
                Ok(Judgement::judged(outcome, text))
            }
            Some(manager) => self.run_comparator(job, index, manager, sandbox),
        }
    }

    /// Runs `./<manager> input.txt res.txt output.txt` and reads its verdict
    fn run_comparator(
        &self,
        job: &Job,
        index: u32,
        manager: &Manager,
        sandbox: &mut SandboxGuard,
    ) -> Result<Judgement> {
        sandbox.create_file_from_storage(
            self.cacher.as_ref(),
            &manager.name,
            &manager.digest,
            true,
        )?;

        let request = ExecRequest {
            command: vec![
                format!("./{}", manager.name),
                INPUT_FILE.to_string(),
                REFERENCE_FILE.to_string(),
                OUTPUT_FILE.to_string(),
            ],
            allow_paths: vec![
                INPUT_FILE.to_string(),
                OUTPUT_FILE.to_string(),
                REFERENCE_FILE.to_string(),
            ],
            limits: job.limits,
        };
        let report = sandbox.execute(&request)?;
        let extra = report.diagnostics();

        if !report.success() {
            log::warn!(
                "Comparator {} failed on test {index}: {:?}",
                manager.name,
                report.status
            );
            return Ok(Judgement::failed(extra));
        }

        match extract_outcome_and_text(&report.stdout, &report.stderr) {
            Some((outcome, text)) => Ok(Judgement {
                success: true,
                verdict: Some((outcome, text)),
                extra,
            }),
            None => {
                log::warn!(
                    "Comparator {} printed no valid outcome on test {index}: {:?}",
                    manager.name,
                    String::from_utf8_lossy(&report.stdout)
                );
                Ok(Judgement::failed(extra))
            }
        }
    }
}

fn warn_on_strategy_mismatch(job: &Job) {
    let has_comparator = job.comparator().is_some();
    match (job.output_eval, has_comparator) {
        (OutputEval::Diff, true) => log::warn!(
            "Task {} declares white diff but has a manager; using the comparator",
            job.task_name
        ),
        (OutputEval::Comparator, false) => log::warn!(
            "Task {} declares a comparator but has no manager; using white diff",
            job.task_name
        ),
        _ => {}
    }
}
