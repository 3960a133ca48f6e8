//! Worker pool (§4.E): exactly `max_parallel` workers share one dequeue loop
//! against the run's pass queue, each owning its own patched CLI host.
//! Generalizes the teacher's `ReviewExecutor` fan-out (`review.rs`) from "one
//! task per item, wait for all" to "N long-lived tasks pulling from a shared
//! queue until told to stop" — the task count is fixed by the parallelism
//! policy, not by the item count.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::invoker::InvokerFactory;
use crate::model::{PassResult, PassStatus};
use crate::run_state::RunState;

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `max_parallel` workers and block until every one of them has
    /// drained the queue and observed the stop signal. Each completed
    /// `PassResult` is both recorded on `run_state` and forwarded on
    /// `result_tx` for the callback pipeline (§4.F) to batch and ship.
    pub async fn run(
        run_state: Arc<RunState>,
        factory: InvokerFactory,
        max_parallel: usize,
        result_tx: mpsc::Sender<PassResult>,
    ) {
        let mut set = JoinSet::new();
        for worker_id in 0..max_parallel.max(1) {
            let run_state = Arc::clone(&run_state);
            let factory = factory.clone();
            let result_tx = result_tx.clone();
            set.spawn(async move { worker_loop(worker_id, run_state, factory, result_tx).await });
        }

        while let Some(join_result) = set.join_next().await {
            if let Err(join_err) = join_result {
                if join_err.is_panic() {
                    tracing::error!("worker task panicked: {join_err}");
                }
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    run_state: Arc<RunState>,
    factory: InvokerFactory,
    result_tx: mpsc::Sender<PassResult>,
) {
    let invoker = match factory.build(format!("w{worker_id}")).await {
        Ok(invoker) => invoker,
        Err(e) => {
            // A host-startup failure aborts the whole run: every other
            // worker would fail to start its own host the same way, so
            // there is no point letting the rest limp along.
            tracing::error!(worker_id, "failed to start patched CLI host: {e}");
            run_state.mark_stopping();
            drain_remaining(&run_state).await;
            return;
        }
    };

    // Negative keys are reserved for per-slot host PIDs (§4.D), distinct
    // from the positive `pass_id`-keyed entries one-shot children use.
    let host_proc_key = -(worker_id as i64 + 1);
    if let Some(pid) = invoker.host_pid().await {
        run_state.active_procs.register(host_proc_key, pid).await;
    }

    loop {
        let job = match run_state.queue.try_dequeue().await {
            Some(job) => job,
            None => {
                if run_state.is_stopping() && run_state.queue.is_empty().await {
                    break;
                }
                continue;
            }
        };

        run_state.in_flight.fetch_add(1, Ordering::AcqRel);
        let started_at_utc = Utc::now();
        let timeout = Duration::from_secs(run_state.config.timeout_seconds);

        let outcome = invoker
            .run_pass(&run_state.config, &run_state.paths, &job, timeout, &run_state.active_procs)
            .await;

        let finished_at_utc = Utc::now();
        let elapsed_seconds_total =
            (finished_at_utc - started_at_utc).num_milliseconds().max(0) as f64 / 1000.0;

        let result = match outcome {
            Ok(pass_outcome) => PassResult {
                run_id: run_state.run_id.clone(),
                pass_id: job.pass_id,
                status: pass_outcome.status,
                started_at_utc,
                finished_at_utc,
                elapsed_seconds_total,
                metrics: pass_outcome.metrics,
                artifacts_zip_b64: None,
                error: pass_outcome.error,
            },
            Err(e) => {
                tracing::warn!(worker_id, pass_id = job.pass_id, "pass invocation error: {e}");
                PassResult {
                    run_id: run_state.run_id.clone(),
                    pass_id: job.pass_id,
                    status: PassStatus::Failed,
                    started_at_utc,
                    finished_at_utc,
                    elapsed_seconds_total,
                    metrics: None,
                    artifacts_zip_b64: None,
                    error: Some(e.user_message()),
                }
            }
        };

        run_state.in_flight.fetch_sub(1, Ordering::AcqRel);
        run_state.record_result(result.clone()).await;
        if result_tx.send(result).await.is_err() {
            // Callback pipeline has shut down; nothing more to forward, but
            // the result is already durably recorded on run_state.
            tracing::debug!(worker_id, "result channel closed, stopping worker");
            break;
        }
    }

    run_state.active_procs.deregister(host_proc_key).await;
    invoker.shutdown().await;
}

/// Drop every queued job without running it, used when a worker aborts the
/// run before doing any work (host startup failure).
async fn drain_remaining(run_state: &Arc<RunState>) {
    while run_state.queue.try_dequeue().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::InvokerFactory;
    use crate::model::{DataMode, PassJob, RunConfig, RunPaths};
    use std::path::PathBuf;

    fn sample_config() -> RunConfig {
        RunConfig {
            bot_id: "bot".to_string(),
            symbol: "EURUSD".to_string(),
            period: "m1".to_string(),
            start: Utc::now(),
            end: Utc::now(),
            data_mode: DataMode::M1,
            ctid: "ctid".to_string(),
            account: "acct".to_string(),
            password: vec![],
            algo_bytes: vec![],
            callback_url: None,
            timeout_seconds: 5,
            include_artifacts: false,
            balance: None,
        }
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let run_state = Arc::new(RunState::new(
            "run-1".to_string(),
            sample_config(),
            RunPaths::new(dir.path().to_path_buf()),
        ));
        run_state.admit(3);
        for pass_id in 1..=3u64 {
            run_state
                .queue
                .push(PassJob { pass_id, parameters: Default::default() })
                .await;
        }

        let factory = InvokerFactory::OneShot { cli_executable: PathBuf::from("true") };
        let (tx, mut rx) = mpsc::channel(16);

        let run_state_for_pool = Arc::clone(&run_state);
        let pool_handle = tokio::spawn(async move {
            WorkerPool::run(run_state_for_pool, factory, 2, tx).await;
        });

        let mut seen = 0;
        while let Some(_result) = rx.recv().await {
            seen += 1;
            if seen == 3 {
                run_state.mark_stopping();
                break;
            }
        }

        tokio::time::timeout(Duration::from_secs(5), pool_handle)
            .await
            .expect("pool should stop once queue drains and stopping is set")
            .unwrap();

        assert_eq!(run_state.results_snapshot().await.len(), 3);
        assert!(run_state.check_invariant().await);
    }

    #[tokio::test]
    async fn host_start_failure_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let run_state = Arc::new(RunState::new(
            "run-1".to_string(),
            sample_config(),
            RunPaths::new(dir.path().to_path_buf()),
        ));
        run_state.admit(1);
        run_state
            .queue
            .push(PassJob { pass_id: 1, parameters: Default::default() })
            .await;

        // A dotnet executable that cannot possibly exist forces spawn() to fail.
        let factory = InvokerFactory::PersistentHost {
            dotnet_path: PathBuf::from("/nonexistent/dotnet-binary-xyz"),
            host_dll_path: PathBuf::from("host.dll"),
            cli_dir: PathBuf::from("."),
        };
        let (tx, _rx) = mpsc::channel(16);

        tokio::time::timeout(
            Duration::from_secs(5),
            WorkerPool::run(Arc::clone(&run_state), factory, 1, tx),
        )
        .await
        .expect("pool should exit promptly on host start failure");

        assert!(run_state.is_stopping());
        assert_eq!(run_state.queue.len().await, 0);
    }
}
