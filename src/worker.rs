use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::create_timestamp;
use crate::job::{EvaluationResult, Job};
use crate::task_type::TaskType;

#[derive(Serialize, Debug)]
pub struct JobReport {
    pub task: String,
    pub task_type: &'static str,
    pub started_time: String,
    pub finished_time: String,
    pub compilation_success: bool,
    pub compilation_text: Option<String>,
    pub evaluations: BTreeMap<u32, EvaluationResult>,
    pub sandbox_paths: Vec<String>,
    /// Sum of the outcomes of all judged tests
    pub total_outcome: f64,
    /// Tests without a successful evaluation, to be retried or reported
    pub not_judged: Vec<u32>,
}

impl JobReport {
    pub fn all_judged(&self) -> bool {
        self.compilation_success && self.not_judged.is_empty()
    }
}

/// Compiles the job and evaluates all of its testcases
///
/// At most `parallelism` testcases are evaluated at once, each on a blocking
/// thread with its own sandbox. Cancelling `token` stops scheduling new
/// testcases; running ones are left to the sandboxes, which kill their
/// processes on the same token.
pub async fn judge_job(
    mut job: Job,
    task_type: Arc<TaskType>,
    parallelism: usize,
    token: CancellationToken,
) -> anyhow::Result<JobReport> {
    let started_time = create_timestamp();
    log::info!(
        "Judging task {} ({}) with {} testcases",
        job.task_name,
        task_type.name(),
        job.testcases.len()
    );

    task_type.compile(&mut job);
    let compilation_success = job.compilation_success == Some(true);
    let job = Arc::new(job);

    if compilation_success {
        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut evaluations = JoinSet::new();

        for index in job.testcases.keys().copied() {
            let permit = tokio::select! {
                _ = token.cancelled() => {
                    log::info!("Job {} cancelled, remaining testcases not scheduled", job.task_name);
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => permit?,
            };

            let job = Arc::clone(&job);
            let task_type = Arc::clone(&task_type);
            evaluations.spawn_blocking(move || {
                let _permit = permit;
                (index, task_type.evaluate_testcase(&job, index))
            });
        }

        while let Some(res) = evaluations.join_next().await {
            match res {
                Ok((index, true)) => log::debug!("Test {index} finished"),
                Ok((index, false)) => log::warn!("Test {index} could not be judged"),
                Err(e) => log::error!("Evaluation task failed: {e:?}"),
            }
        }
    } else {
        log::warn!("Compilation of {} failed, nothing evaluated", job.task_name);
    }

    let evaluations = job.evaluations();
    let total_outcome: f64 = evaluations
        .values()
        .filter(|result| result.success)
        .filter_map(|result| result.outcome)
        .sum();
    let not_judged: Vec<u32> = job
        .testcases
        .keys()
        .copied()
        .filter(|index| !evaluations.get(index).is_some_and(|result| result.success))
        .collect();

    let report = JobReport {
        task: job.task_name.clone(),
        task_type: task_type.name(),
        started_time,
        finished_time: create_timestamp(),
        compilation_success,
        compilation_text: job.text.clone(),
        evaluations,
        sandbox_paths: job.sandbox_paths(),
        total_outcome,
        not_judged,
    };

    log::info!(
        "Task {} judged: total outcome {:.3}, {} testcases not judged",
        report.task,
        report.total_outcome,
        report.not_judged.len()
    );
    Ok(report)
}
