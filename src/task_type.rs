mod output_only;

pub use output_only::{
    INPUT_FILE, NOT_SUBMITTED_TEXT, NO_COMPILATION_TEXT, OUTPUT_FILE, OutputOnly, REFERENCE_FILE,
};

use std::sync::Arc;

use crate::config::TaskTypeConfig;
use crate::job::Job;
use crate::sandbox::SandboxProvider;
use crate::storage::FileCacher;

/// Every kind of task this judge knows how to grade
pub enum TaskType {
    OutputOnly(OutputOnly),
}

impl TaskType {
    pub fn from_config(
        config: &TaskTypeConfig,
        sandboxes: Arc<dyn SandboxProvider>,
        cacher: Arc<dyn FileCacher>,
    ) -> Self {
        match config {
            TaskTypeConfig::OutputOnly { .. } => Self::OutputOnly(OutputOnly::new(sandboxes, cacher)),
        }
    }

    /// Human readable name of the task type
    pub fn name(&self) -> &'static str {
        match self {
            Self::OutputOnly(_) => OutputOnly::NAME,
        }
    }

    /// Whether a submission may leave some of its files out
    pub fn allow_partial_submission(&self) -> bool {
        match self {
            Self::OutputOnly(_) => OutputOnly::ALLOW_PARTIAL_SUBMISSION,
        }
    }

    /// Commands that would compile a submission, `None` if there is no such step
    pub fn compilation_commands(&self) -> Option<Vec<Vec<String>>> {
        match self {
            Self::OutputOnly(_) => None,
        }
    }

    /// File names a complete submission consists of
    pub fn submission_format(&self, job: &Job) -> Vec<String> {
        match self {
            Self::OutputOnly(task) => task.submission_format(job),
        }
    }

    pub fn compile(&self, job: &mut Job) {
        match self {
            Self::OutputOnly(task) => task.compile(job),
        }
    }

    /// Evaluates test `index`, writing its result into the job
    ///
    /// The return value says whether the grading machinery completed, not
    /// whether the submission is correct.
    pub fn evaluate_testcase(&self, job: &Job, index: u32) -> bool {
        match self {
            Self::OutputOnly(task) => task.evaluate_testcase(job, index),
        }
    }
}
