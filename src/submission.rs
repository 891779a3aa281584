use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::config::{TaskConfig, TaskTypeConfig};
use crate::job::{Job, parse_submission_file_name};
use crate::storage::FileCacher;

/// Builds a job from the task configuration and a submission directory
///
/// Testcase outputs, managers and every `output_NNN.txt` found in
/// `submission_dir` are put into `cacher`. Files that do not match any
/// testcase are ignored with a warning.
pub fn load_job(task: &TaskConfig, submission_dir: &Path, cacher: &dyn FileCacher) -> Result<Job> {
    let TaskTypeConfig::OutputOnly { output_eval } = &task.task_type;
    let mut job = Job::new(task.name.clone(), *output_eval, task.limits());

    for (index, testcase) in task.testcases.iter().enumerate() {
        let output = cacher.put_file(Path::new(&testcase.output_file))?;
        let input = testcase
            .input_file
            .as_ref()
            .map(|path| cacher.put_file(Path::new(path)))
            .transpose()?;
        job.add_testcase(index as u32, input, output);
    }

    if task.managers.len() > 1 {
        bail!("At most one manager is supported, found {}", task.managers.len());
    }
    for manager in &task.managers {
        let digest = cacher.put_file(Path::new(&manager.file))?;
        job.add_manager(manager.name.clone(), digest);
    }

    let entries = fs::read_dir(submission_dir)
        .with_context(|| format!("Failed to read {}", submission_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        match parse_submission_file_name(&name) {
            Some(index) if job.testcases.contains_key(&index) => {
                let digest = cacher.put_file(&entry.path())?;
                log::debug!("Submitted {name} stored as {digest}");
                job.submit_file(name, digest);
            }
            _ => log::warn!("Ignoring unexpected submitted file {name}"),
        }
    }

    log::info!(
        "Loaded task {}: {} testcases, {} of them submitted",
        job.task_name,
        job.testcases.len(),
        job.files.len()
    );
    Ok(job)
}
