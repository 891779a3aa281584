use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use outjudge::config::{CliArgs, Config, SandboxBackend};
use outjudge::sandbox::create_sandbox_provider;
use outjudge::storage::{DirCacher, FileCacher};
use outjudge::submission::load_job;
use outjudge::task_type::TaskType;
use outjudge::worker::judge_job;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    if cli.threads == 0 {
        panic!("The number of evaluation threads must not be 0");
    }

    let Config {
        sandbox: sandbox_config,
        storage_dir,
        task: task_config,
    } = cli.to_config().expect("Failed to load configuration");

    // SAFETY: geteuid has no preconditions
    if sandbox_config.backend == SandboxBackend::Isolate && unsafe { libc::geteuid() } != 0 {
        log::warn!("isolate usually needs root privileges to set up its boxes");
    }

    let cacher: Arc<dyn FileCacher> = Arc::new(match storage_dir {
        Some(dir) => DirCacher::open(dir)?,
        None => DirCacher::open_default()?,
    });

    let job = load_job(&task_config, &cli.submission_dir, cacher.as_ref())
        .expect("Failed to load submission");

    let shutdown_token = CancellationToken::new();
    let sandboxes = create_sandbox_provider(&sandbox_config, shutdown_token.clone())?;
    log::info!("Evaluating with {} sandboxes on {} threads", sandboxes.name(), cli.threads);
    let task_type = Arc::new(TaskType::from_config(
        &task_config.task_type,
        sandboxes,
        cacher,
    ));

    // ======= PREPARATION END, EXECUTION START =======

    let mut judging = tokio::spawn(judge_job(
        job,
        task_type,
        cli.threads,
        shutdown_token.clone(),
    ));

    let report = tokio::select! {
        res = &mut judging => res??,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, terminating running evaluations...");
            shutdown_token.cancel();
            judging.await??
        }
    };

    let rendered = serde_json::to_string_pretty(&report)?;
    match &cli.output_path {
        Some(path) => std::fs::write(path, rendered)?,
        None => println!("{rendered}"),
    }

    if !report.all_judged() {
        log::error!("Some testcases could not be judged: {:?}", report.not_judged);
        std::process::exit(1);
    }
    Ok(())
}
