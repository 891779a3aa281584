use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use outjudge::config::{KiloByte, MicroSecond, OutputEval, ResourceLimits};
use outjudge::job::Job;
use outjudge::sandbox::SimpleProvider;
use outjudge::storage::{FileCacher, MemoryCacher};
use outjudge::task_type::{OutputOnly, TaskType};
use outjudge::worker::judge_job;

const CHECKER: &str = r#"#!/bin/sh
if [ -e "$1" ]; then
    echo 0
    echo "input file should not be staged"
    exit 0
fi
if [ "$(cat "$2")" = "$(cat "$3")" ]; then
    echo 1.0
    echo identical
else
    echo 0.0
    echo different
fi
"#;

const SLOW_CHECKER: &str = "#!/bin/sh\nsleep 30\necho 1\n";

fn build_job(cacher: &MemoryCacher, checker: Option<&str>) -> Job {
    let mut job = Job::new(
        "pairs",
        OutputEval::Comparator,
        ResourceLimits {
            time_limit: MicroSecond(20_000_000),
            memory_limit: KiloByte(512 * 1024),
        },
    );
    for (index, reference) in ["1 2\n", "3 4\n", "5 6\n"].iter().enumerate() {
        let digest = cacher.put(reference.as_bytes()).unwrap();
        job.add_testcase(index as u32, None, digest);
    }
    job.submit_file("output_000.txt", cacher.put(b"1 2\n").unwrap());
    job.submit_file("output_001.txt", cacher.put(b"3 5\n").unwrap());
    if let Some(checker) = checker {
        job.add_manager("check", cacher.put(checker.as_bytes()).unwrap());
    }
    job
}

fn task_type(
    base_dir: &std::path::Path,
    cacher: Arc<MemoryCacher>,
    token: CancellationToken,
) -> Arc<TaskType> {
    let provider = SimpleProvider::with_base_dir(base_dir, false, token).unwrap();
    Arc::new(TaskType::OutputOnly(OutputOnly::new(Arc::new(provider), cacher)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_white_diff_job_end_to_end() {
    let base_dir = tempfile::tempdir().unwrap();
    let cacher = Arc::new(MemoryCacher::new());
    let token = CancellationToken::new();
    let job = build_job(&cacher, None);

    let report = judge_job(job, task_type(base_dir.path(), cacher, token.clone()), 2, token)
        .await
        .unwrap();

    assert!(report.compilation_success);
    assert_eq!(report.evaluations[&0].outcome, Some(1.0));
    assert_eq!(report.evaluations[&1].outcome, Some(0.0));
    assert_eq!(report.evaluations[&2].text.as_deref(), Some("File not submitted."));
    assert_eq!(report.total_outcome, 1.0);
    assert!(report.all_judged());
    assert_eq!(report.sandbox_paths.len(), 3);

    // Every sandbox directory was removed on release
    assert_eq!(std::fs::read_dir(base_dir.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_comparator_job_end_to_end() {
    let base_dir = tempfile::tempdir().unwrap();
    let cacher = Arc::new(MemoryCacher::new());
    let token = CancellationToken::new();
    let job = build_job(&cacher, Some(CHECKER));

    let report = judge_job(
        job,
        task_type(base_dir.path(), cacher.clone(), token.clone()),
        1,
        token,
    )
    .await
    .unwrap();

    let first = &report.evaluations[&0];
    assert_eq!(
        (first.success, first.outcome, first.text.as_deref()),
        (true, Some(1.0), Some("identical"))
    );
    let second = &report.evaluations[&1];
    assert_eq!(
        (second.success, second.outcome, second.text.as_deref()),
        (true, Some(0.0), Some("different"))
    );
    assert_eq!(report.evaluations[&2].outcome, Some(0.0));
    assert!(report.all_judged());

    // A comparator stuck past cancellation is reported as not judged
    let token = CancellationToken::new();
    let job = build_job(&cacher, Some(SLOW_CHECKER));
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(15),
        judge_job(job, task_type(base_dir.path(), cacher, token.clone()), 1, token),
    )
    .await
    .expect("cancellation should end the job quickly")
    .unwrap();

    let first = &report.evaluations[&0];
    assert_eq!((first.success, first.outcome, first.text.as_deref()), (false, None, None));
    assert!(!report.all_judged());
    assert!(report.not_judged.contains(&0));
}

fn evaluate_inline(base_dir: &std::path::Path) -> Job {
    let cacher = Arc::new(MemoryCacher::new());
    let job = build_job(&cacher, Some(CHECKER));
    let task = task_type(base_dir, cacher, CancellationToken::new());
    assert!(task.evaluate_testcase(&job, 0));
    assert!(task.evaluate_testcase(&job, 1));
    job
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_evaluate_from_multi_thread_runtime_task() {
    let base_dir = tempfile::tempdir().unwrap();
    let job = evaluate_inline(base_dir.path());

    let first = job.evaluation(0).unwrap();
    assert_eq!((first.outcome, first.text.as_deref()), (Some(1.0), Some("identical")));
    let second = job.evaluation(1).unwrap();
    assert_eq!((second.outcome, second.text.as_deref()), (Some(0.0), Some("different")));
}

#[tokio::test]
async fn test_evaluate_from_current_thread_runtime_task() {
    let base_dir = tempfile::tempdir().unwrap();
    let job = evaluate_inline(base_dir.path());

    let first = job.evaluation(0).unwrap();
    assert_eq!((first.success, first.outcome), (true, Some(1.0)));
    let second = job.evaluation(1).unwrap();
    assert_eq!((second.success, second.outcome), (true, Some(0.0)));
    assert_eq!(std::fs::read_dir(base_dir.path()).unwrap().count(), 0);
}
