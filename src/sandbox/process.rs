use std::future::Future;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;

/// How a supervised process ended
#[derive(Debug)]
pub(super) enum ProcessEnd {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Spawns `command` and waits until it exits, `deadline` passes or `token`
/// is cancelled; in the last two cases the process is killed.
pub(super) async fn run_supervised(
    mut command: Command,
    deadline: Duration,
    token: &CancellationToken,
) -> Result<(ProcessEnd, Duration)> {
    let start_time = Instant::now();
    let mut child = command
        .kill_on_drop(true)
        .spawn()
        .context("Failed to spawn process")?;

    let end = tokio::select! {
        status = child.wait() => ProcessEnd::Exited(status?),
        _ = tokio::time::sleep(deadline) => ProcessEnd::TimedOut,
        _ = token.cancelled() => ProcessEnd::Cancelled,
    };

    if !matches!(end, ProcessEnd::Exited(_)) {
        if let Err(e) = child.kill().await {
            log::warn!("Failed to kill process after {end:?}: {e}");
        }
    }

    Ok((end, start_time.elapsed()))
}

/// Drives `future` to completion from synchronous evaluation code
///
/// On a multi-thread runtime the current handle is reused through
/// `block_in_place`. A current-thread runtime cannot be blocked from its own
/// thread, so the future then runs on a scoped thread with a throwaway
/// runtime, as it does when no runtime is present at all.
pub(super) fn block_on<F>(future: F) -> Result<F::Output>
where
    F: Future + Send,
    F::Output: Send,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(tokio::task::block_in_place(|| handle.block_on(future)))
        }
        Ok(_) => std::thread::scope(|scope| {
            scope
                .spawn(move || block_on_new_runtime(future))
                .join()
                .map_err(|_| anyhow!("Runtime thread panicked"))?
        }),
        Err(_) => block_on_new_runtime(future),
    }
}

fn block_on_new_runtime<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    Ok(runtime.block_on(future))
}
