//! Run Lifecycle Controller (§4.G): the only place that turns a `RunConfig`
//! into a running worker pool, or a running pool back into an idle slot.
//! Generalizes the teacher's single-shot "validate, do the thing, log it"
//! handler shape (`server.rs`) into the five operations a backtest run
//! actually needs: start, assign, results, stop, and the settings patch that
//! only takes effect on the next run.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::callback::CallbackPipeline;
use crate::config::Config;
use crate::error::WorkerError;
use crate::invoker::InvokerFactory;
use crate::model::{PassJob, PassResult, RunConfig, RunPaths};
use crate::policy::ParallelismPolicy;
use crate::run_state::{RunRegistry, RunState};
use crate::worker::WorkerPool;
use crate::zipper::zip_dir_to_base64;

/// Returned by `start`: everything a caller needs to begin assigning passes.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub run_id: String,
    pub max_parallel: usize,
    pub workdir: PathBuf,
}

/// Returned by `assign`.
#[derive(Debug, Clone, Copy)]
pub struct AssignOutcome {
    pub accepted: u64,
    pub enqueued_total: u64,
}

/// Returned by `stop` / `unlock` / `unlock_current` (§4.G, §3 `StopResponse`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOutcome {
    pub dropped_queued: u64,
    pub killed_processes: usize,
    pub released: bool,
}

/// Snapshot backing `GET /status`.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub run_id: Option<String>,
    pub in_flight: u64,
    pub queue_size: u64,
    pub enqueued_total: u64,
    pub results_count: u64,
    pub max_parallel: usize,
    pub cpu_cores: usize,
    pub cpu_target_percent: u32,
    pub parallel_per_core: usize,
    pub explicit_parallel: Option<usize>,
}

/// Patch accepted by `PUT /settings/parallel`; `None` fields leave the
/// current policy input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelSettingsPatch {
    pub explicit_parallel: Option<Option<usize>>,
    pub cpu_target_percent: Option<u32>,
    pub parallel_per_core: Option<usize>,
}

pub struct LifecycleController {
    registry: Arc<RunRegistry>,
    config: Config,
    policy: Mutex<ParallelismPolicy>,
}

impl LifecycleController {
    pub fn new(config: Config) -> Self {
        let policy = Mutex::new(config.initial_policy);
        Self { registry: Arc::new(RunRegistry::new()), config, policy }
    }

    /// Reconfigure the parallelism policy. Takes effect on the next `start`
    /// — a run already in flight keeps the slot count it was given (§4.A).
    pub async fn set_parallel_settings(&self, patch: ParallelSettingsPatch) {
        let mut policy = self.policy.lock().await;
        if let Some(explicit) = patch.explicit_parallel {
            policy.explicit_parallel = explicit;
        }
        if let Some(pct) = patch.cpu_target_percent {
            policy.cpu_target_percent = pct.clamp(65, 95);
        }
        if let Some(per_core) = patch.parallel_per_core {
            policy.parallel_per_core = per_core.max(1);
        }
    }

    pub async fn status(&self) -> StatusSnapshot {
        let policy = *self.policy.lock().await;
        let max_parallel = policy.resolve_max_parallel();

        match self.registry.current().await {
            Some(state) => StatusSnapshot {
                run_id: Some(state.run_id.clone()),
                in_flight: state.in_flight.load(std::sync::atomic::Ordering::Acquire),
                queue_size: state.queue.len().await as u64,
                enqueued_total: state.enqueued_total.load(std::sync::atomic::Ordering::Acquire),
                results_count: state.results_snapshot().await.len() as u64,
                max_parallel,
                cpu_cores: policy.cpu_cores,
                cpu_target_percent: policy.cpu_target_percent,
                parallel_per_core: policy.parallel_per_core,
                explicit_parallel: policy.explicit_parallel,
            },
            None => StatusSnapshot {
                run_id: None,
                in_flight: 0,
                queue_size: 0,
                enqueued_total: 0,
                results_count: 0,
                max_parallel,
                cpu_cores: policy.cpu_cores,
                cpu_target_percent: policy.cpu_target_percent,
                parallel_per_core: policy.parallel_per_core,
                explicit_parallel: policy.explicit_parallel,
            },
        }
    }

    /// Admit a new run: validate required fields, reserve the slot, write
    /// the run's on-disk inputs, and launch its worker pool. Any failure
    /// after admission releases the slot before returning the error, so a
    /// failed start never leaves the worker stuck "busy".
    pub async fn start(&self, run_config: RunConfig) -> Result<StartOutcome, WorkerError> {
        if run_config.password.is_empty() {
            return Err(WorkerError::MissingField("password"));
        }
        if run_config.algo_bytes.is_empty() {
            return Err(WorkerError::MissingField("algo_bytes"));
        }

        let run_id = Uuid::new_v4().to_string();
        let workdir = self.config.root.join(&run_id);
        let paths = RunPaths::new(workdir.clone());
        let max_parallel = self.policy.lock().await.resolve_max_parallel();

        let run_state = Arc::new(RunState::new(run_id.clone(), run_config.clone(), paths.clone()));
        self.registry.start(Arc::clone(&run_state)).await?;

        if let Err(e) = self.materialize_run_inputs(&paths, &run_config).await {
            self.registry.release(&run_id).await;
            return Err(e);
        }

        let (result_tx, result_rx) = mpsc::channel::<PassResult>(256);
        self.spawn_callback_pipeline(&run_id, &paths, &run_config, result_rx);

        let factory = self.build_invoker_factory(&workdir);
        let registry = Arc::clone(&self.registry);
        let run_state_for_pool = Arc::clone(&run_state);
        let run_id_for_release = run_id.clone();
        tokio::spawn(async move {
            WorkerPool::run(run_state_for_pool, factory, max_parallel, result_tx).await;
            registry.release(&run_id_for_release).await;
        });

        tracing::info!(run_id, max_parallel, workdir = %workdir.display(), "run started");
        Ok(StartOutcome { run_id, max_parallel, workdir })
    }

    async fn materialize_run_inputs(&self, paths: &RunPaths, run_config: &RunConfig) -> Result<(), WorkerError> {
        tokio::fs::create_dir_all(&paths.workdir).await?;
        tokio::fs::write(&paths.algo_file, &run_config.algo_bytes).await?;
        write_pwd_file(&paths.pwd_file, &run_config.password).await?;

        let dump = serde_json::to_vec_pretty(run_config).map_err(|e| WorkerError::Other(e.to_string()))?;
        tokio::fs::write(&paths.run_json, dump).await?;
        Ok(())
    }

    fn spawn_callback_pipeline(
        &self,
        run_id: &str,
        paths: &RunPaths,
        run_config: &RunConfig,
        result_rx: mpsc::Receiver<PassResult>,
    ) {
        if let Some(callback_url) = run_config.callback_url.clone() {
            let pipeline = CallbackPipeline::new(
                Some(callback_url),
                run_id.to_string(),
                paths.clone(),
                run_config.include_artifacts,
                self.config.callback_batch_size,
                self.config.callback_batch_flush_interval,
                self.config.callback_timeout,
            );
            tokio::spawn(pipeline.run(result_rx));
        } else {
            // No controller to call back: drain so workers never see a full
            // channel and block, but nothing is posted anywhere.
            tokio::spawn(async move {
                let mut result_rx = result_rx;
                while result_rx.recv().await.is_some() {}
            });
        }
    }

    fn build_invoker_factory(&self, workdir: &std::path::Path) -> InvokerFactory {
        if self.config.custom_cli_patched {
            InvokerFactory::PersistentHost {
                dotnet_path: self.config.dotnet_path.clone(),
                host_dll_path: self.config.cli_patched_host_path.clone().unwrap_or_default(),
                cli_dir: workdir.to_path_buf(),
            }
        } else {
            InvokerFactory::OneShot {
                cli_executable: self
                    .config
                    .ctrade_cli_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("backtest")),
            }
        }
    }

    pub async fn assign(&self, run_id: &str, passes: Vec<PassJob>) -> Result<AssignOutcome, WorkerError> {
        let state = self.registry.get(run_id).await?;
        if state.is_stopping() {
            return Err(WorkerError::Stopping(run_id.to_string()));
        }

        let accepted = passes.len() as u64;
        state.admit(accepted);
        state.queue.push_many(passes).await;

        Ok(AssignOutcome {
            accepted,
            enqueued_total: state.enqueued_total.load(std::sync::atomic::Ordering::Acquire),
        })
    }

    /// Snapshot the last `limit` results (all of them if `limit` is `None`),
    /// lazily zipping each pass directory that hasn't already been
    /// artifact-encoded when `include_artifacts` is requested.
    pub async fn results(
        &self,
        run_id: &str,
        limit: Option<usize>,
        include_artifacts: bool,
    ) -> Result<Vec<PassResult>, WorkerError> {
        let state = self.registry.get(run_id).await?;
        let mut snapshot = state.results_snapshot().await;

        if let Some(limit) = limit {
            if snapshot.len() > limit {
                snapshot = snapshot.split_off(snapshot.len() - limit);
            }
        }

        if include_artifacts {
            for result in &mut snapshot {
                if result.artifacts_zip_b64.is_none() {
                    let pass_dir = state.paths.pass_dir(result.pass_id);
                    match zip_dir_to_base64(&pass_dir) {
                        Ok(encoded) => result.artifacts_zip_b64 = Some(encoded),
                        Err(e) => tracing::warn!(pass_id = result.pass_id, "failed to zip pass artifacts: {e}"),
                    }
                }
            }
        }

        Ok(snapshot)
    }

    /// Stop the named run: §4.G's `stop(run_id)`.
    pub async fn stop(&self, run_id: &str) -> Result<StopOutcome, WorkerError> {
        let state = self.registry.get(run_id).await?;
        Ok(self.drain_and_release(&state).await)
    }

    /// Alias of `stop`, addressed the same way (§6 `/run/{id}/unlock`).
    pub async fn unlock(&self, run_id: &str) -> Result<StopOutcome, WorkerError> {
        self.stop(run_id).await
    }

    /// Stop whichever run is current, if any (§6 `/unlock`). Never 404s —
    /// an idle worker has nothing to stop, and that's success, not an error.
    pub async fn unlock_current(&self) -> StopOutcome {
        match self.registry.current().await {
            Some(state) => self.drain_and_release(&state).await,
            None => StopOutcome::default(),
        }
    }

    /// Idempotent: calling this twice on an already-stopping run just counts
    /// zero additional drops and kills on the second call.
    async fn drain_and_release(&self, state: &Arc<RunState>) -> StopOutcome {
        state.mark_stopping();

        let mut dropped_queued = 0u64;
        while state.queue.try_dequeue().await.is_some() {
            dropped_queued += 1;
        }

        let killed_processes = state.active_procs.terminate_all().await;

        // Workers notice `stopping` within one 500ms poll tick and exit once
        // the queue (already drained above) and their current pass settle;
        // `released` reflects whether the slot is free by the time we check,
        // not a guarantee the pool has fully unwound yet.
        let released = self.registry.current().await.map(|s| s.run_id != state.run_id).unwrap_or(true);

        StopOutcome { dropped_queued, killed_processes, released }
    }
}

async fn write_pwd_file(path: &std::path::Path, bytes: &[u8]) -> Result<(), WorkerError> {
    tokio::fs::write(path, bytes).await?;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}
