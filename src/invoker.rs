//! Backtest invoker (§4.C): runs one pass to completion, either against the
//! persistent patched CLI host (Mode 1) or as a one-shot child process
//! (Mode 2). Both modes expose the same contract: write the per-pass input
//! files, invoke the backtest engine, and decide the outcome from
//! `reports_ready`, not the process's exit code.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::WorkerError;
use crate::host::PatchedHostClient;
use crate::model::{build_cbotset, Metrics, PassJob, PassStatus, RunConfig, RunPaths};
use crate::procutil::{configure_child, signal_group};
use crate::report::{parse_report, reports_ready};
use crate::run_state::ActiveProcs;

/// Cap on captured stdout/stderr from a one-shot child, matching the
/// teacher's `MAX_OUTPUT_BYTES` overflow-protection pattern.
const MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024;

/// Extra time the patched host gets beyond the pass's own timeout before an
/// `execute` call is treated as hung (§5: "host allowed extra time to report").
const HOST_EXTRA_GRACE: Duration = Duration::from_secs(30);

/// How a pass is actually executed. Chosen once per run at start time and
/// fixed for the run's lifetime (§4.C).
pub enum InvocationMode {
    PersistentHost(Arc<PatchedHostClient>),
    OneShot { cli_executable: PathBuf },
}

/// Outcome of running one pass, ready to fold into a `PassResult`.
pub struct PassOutcome {
    pub status: PassStatus,
    pub metrics: Option<Metrics>,
    pub error: Option<String>,
}

pub struct BacktestInvoker {
    mode: InvocationMode,
}

/// How the worker pool builds one invoker per slot (§4.E point 1: each
/// worker owns its own patched CLI host — hosts are never shared across
/// slots).
#[derive(Clone)]
pub enum InvokerFactory {
    PersistentHost {
        dotnet_path: PathBuf,
        host_dll_path: PathBuf,
        cli_dir: PathBuf,
    },
    OneShot {
        cli_executable: PathBuf,
    },
}

impl InvokerFactory {
    pub async fn build(&self, slot_id: String) -> Result<BacktestInvoker, WorkerError> {
        match self {
            Self::PersistentHost { dotnet_path, host_dll_path, cli_dir } => {
                let host = PatchedHostClient::start(
                    slot_id,
                    dotnet_path.clone(),
                    host_dll_path.clone(),
                    cli_dir.clone(),
                )
                .await?;
                Ok(BacktestInvoker::new(InvocationMode::PersistentHost(host)))
            }
            Self::OneShot { cli_executable } => Ok(BacktestInvoker::new(InvocationMode::OneShot {
                cli_executable: cli_executable.clone(),
            })),
        }
    }
}

impl BacktestInvoker {
    pub fn new(mode: InvocationMode) -> Self {
        Self { mode }
    }

    /// Close the owned patched host, if this invoker runs in persistent-host
    /// mode (§4.E point 3: "On exit, close the patched CLI host"). A no-op
    /// in one-shot mode, which owns no long-lived child.
    pub async fn shutdown(&self) {
        if let InvocationMode::PersistentHost(host) = &self.mode {
            host.close().await;
        }
    }

    /// PID of the owned patched host's current child, if this invoker runs
    /// in persistent-host mode — used by the worker pool to register the
    /// host in the run's active-child table (§4.D). `None` in one-shot mode,
    /// which has no long-lived child of its own to track here.
    pub async fn host_pid(&self) -> Option<u32> {
        match &self.mode {
            InvocationMode::PersistentHost(host) => host.current_pid().await,
            InvocationMode::OneShot { .. } => None,
        }
    }

    /// Run one pass to completion: write its `.cbotset`, invoke the engine,
    /// and classify the outcome from the files it left behind. A `log.txt`
    /// is written unconditionally, on every path, once the invocation settles
    /// (§4.C).
    pub async fn run_pass(
        &self,
        run_config: &RunConfig,
        paths: &RunPaths,
        pass: &PassJob,
        timeout: Duration,
        active_procs: &ActiveProcs,
    ) -> Result<PassOutcome, WorkerError> {
        let pass_dir = paths.pass_dir(pass.pass_id);
        tokio::fs::create_dir_all(&pass_dir).await?;

        let cbotset = build_cbotset(&run_config.symbol, &run_config.period, &pass.parameters);
        let cbotset_json = serde_json::to_vec_pretty(&cbotset).map_err(|e| WorkerError::Other(e.to_string()))?;
        tokio::fs::write(paths.cbotset_path(pass.pass_id), &cbotset_json).await?;
        tokio::fs::write(paths.events_path(pass.pass_id), b"").await?;

        let args = build_cli_args(run_config, paths, pass.pass_id);
        let command_line = match &self.mode {
            InvocationMode::OneShot { cli_executable } => {
                format!("{} {}", cli_executable.display(), args.join(" "))
            }
            InvocationMode::PersistentHost(_) => args.join(" "),
        };

        let started_at_utc = Utc::now();
        let invocation = match &self.mode {
            InvocationMode::PersistentHost(host) => self.run_via_host(host, args, timeout).await,
            InvocationMode::OneShot { cli_executable } => {
                self.run_via_one_shot(cli_executable, args, timeout, active_procs, pass.pass_id)
                    .await
            }
        };
        let finished_at_utc = Utc::now();
        let elapsed_seconds =
            (finished_at_utc - started_at_utc).num_milliseconds().max(0) as f64 / 1000.0;

        let report_html = paths.report_html_path(pass.pass_id);
        let report_json = paths.report_json_path(pass.pass_id);
        let ready = reports_ready(&report_html, &report_json);
        let outcome_token = classify_outcome_token(&invocation, ready);
        write_log(
            &pass_dir,
            &command_line,
            started_at_utc,
            finished_at_utc,
            elapsed_seconds,
            &outcome_token,
        )
        .await;

        let (exit_code, stderr_tail) = invocation?;
        self.classify_outcome(paths, pass.pass_id, exit_code, stderr_tail).await
    }

    /// Host execute is given `timeout + HOST_EXTRA_GRACE` (§5: "host allowed
    /// extra time to report") on top of the pass's own timeout. On a timeout
    /// the host is reset — its stuck child is killed and a fresh one spawned
    /// — so the next pass on this slot starts against a clean host rather
    /// than one still wedged on the previous request.
    async fn run_via_host(
        &self,
        host: &Arc<PatchedHostClient>,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<(i32, String), WorkerError> {
        let host_timeout = timeout + HOST_EXTRA_GRACE;
        let result = host.execute(args, host_timeout).await;
        if matches!(result, Err(WorkerError::Timeout(_))) {
            if let Err(e) = host.reset_process().await {
                tracing::error!("failed to reset patched host after timeout: {e}");
            }
        }
        let result = result?;
        Ok((result.exit_code, result.stderr))
    }

    async fn run_via_one_shot(
        &self,
        cli_executable: &Path,
        args: Vec<String>,
        timeout: Duration,
        active_procs: &ActiveProcs,
        pass_id: u64,
    ) -> Result<(i32, String), WorkerError> {
        let start = Instant::now();
        let mut cmd = Command::new(cli_executable);
        cmd.args(&args);
        configure_child(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::Other(format!("failed to spawn backtest CLI: {e}")))?;
        // The one-shot CLI needs no stdin; close it immediately so it never
        // blocks waiting on input it will never get.
        drop(child.stdin.take());

        let child_pid = child.id();
        let proc_key = pass_id as i64;
        if let Some(pid) = child_pid {
            active_procs.register(proc_key, pid).await;
        }
        let stdout_pipe = child.stdout.take().expect("stdout piped");
        let stderr_pipe = child.stderr.take().expect("stderr piped");

        let read_future = async {
            let read_limit = (MAX_OUTPUT_BYTES + 1) as u64;
            let stdout_handle = tokio::spawn(async move {
                let mut buf = Vec::with_capacity(MAX_OUTPUT_BYTES.min(64 * 1024));
                let mut capped = stdout_pipe.take(read_limit);
                let _ = capped.read_to_end(&mut buf).await;
                buf
            });
            let stderr_handle = tokio::spawn(async move {
                let mut buf = Vec::with_capacity(MAX_OUTPUT_BYTES.min(64 * 1024));
                let mut capped = stderr_pipe.take(read_limit);
                let _ = capped.read_to_end(&mut buf).await;
                buf
            });

            let kill_on_cap = |buf: &[u8]| {
                if buf.len() > MAX_OUTPUT_BYTES {
                    if let Some(pid) = child_pid {
                        signal_group(pid, libc::SIGKILL);
                    }
                }
            };

            let stdout_buf = stdout_handle.await.unwrap_or_default();
            kill_on_cap(&stdout_buf);
            let stderr_buf = stderr_handle.await.unwrap_or_default();
            kill_on_cap(&stderr_buf);

            let status = child.wait().await?;
            Ok::<_, std::io::Error>((stdout_buf, stderr_buf, status))
        };

        let outcome = match tokio::time::timeout(timeout, read_future).await {
            Ok(Ok((_stdout, stderr, status))) => {
                let stderr_text = String::from_utf8_lossy(&stderr).to_string();
                Ok((status.code().unwrap_or(-1), stderr_text))
            }
            Ok(Err(e)) => Err(WorkerError::Other(format!("failed reading CLI output: {e}"))),
            Err(_) => {
                if let Some(pid) = child_pid {
                    signal_group(pid, libc::SIGKILL);
                }
                let elapsed_ms = start.elapsed().as_millis() as u64;
                Err(WorkerError::Timeout(elapsed_ms))
            }
        };

        active_procs.deregister(proc_key).await;
        outcome
    }

    async fn classify_outcome(
        &self,
        paths: &RunPaths,
        pass_id: u64,
        exit_code: i32,
        stderr_tail: String,
    ) -> Result<PassOutcome, WorkerError> {
        let report_html = paths.report_html_path(pass_id);
        let report_json = paths.report_json_path(pass_id);

        if !reports_ready(&report_html, &report_json) {
            return Ok(PassOutcome {
                status: PassStatus::Failed,
                metrics: None,
                error: Some(format!(
                    "reports not produced (exit code {exit_code}): {stderr_tail}"
                )),
            });
        }

        let bytes = tokio::fs::read(&report_json).await?;
        match parse_report(&bytes) {
            Ok(metrics) => Ok(PassOutcome {
                status: PassStatus::Completed,
                metrics: Some(metrics),
                error: None,
            }),
            Err(e) => Ok(PassOutcome {
                status: PassStatus::Failed,
                metrics: None,
                error: Some(e),
            }),
        }
    }
}

/// Assemble the documented external CLI invocation (§4.C, §6):
/// `backtest <algo> <cbotset> --start=<iso> --end=<iso> --data-mode=<m>
/// --ctid=<id> --pwd-file=<path> --account=<acct> --symbol=<sym>
/// --period=<p> --report=<html> --report-json=<json> [--balance=<f>]`.
/// `backtest` is the leading positional token, run either as the first argv
/// element passed to the configured executable (Mode 2) or as the first
/// element of `args` sent to the patched host (Mode 1).
fn build_cli_args(run_config: &RunConfig, paths: &RunPaths, pass_id: u64) -> Vec<String> {
    let mut args = vec![
        "backtest".to_string(),
        paths.algo_file.display().to_string(),
        paths.cbotset_path(pass_id).display().to_string(),
        format!("--start={}", run_config.start.to_rfc3339()),
        format!("--end={}", run_config.end.to_rfc3339()),
        format!("--data-mode={}", run_config.data_mode.as_cli_arg()),
        format!("--ctid={}", run_config.ctid),
        format!("--pwd-file={}", paths.pwd_file.display()),
        format!("--account={}", run_config.account),
        format!("--symbol={}", run_config.symbol),
        format!("--period={}", run_config.period),
        format!("--report={}", paths.report_html_path(pass_id).display()),
        format!("--report-json={}", paths.report_json_path(pass_id).display()),
    ];
    if let Some(balance) = run_config.balance {
        args.push(format!("--balance={balance}"));
    }
    args
}

/// Outcome token recorded in each pass's `log.txt` (§4.C). Patched-host
/// errors (only possible in Mode 1) are tagged `patched_host_error_<class>`;
/// a settled process is tagged by whether it left `reports_ready` behind,
/// falling back to its exit code; any other error (Mode 2 spawn/IO failure)
/// falls back to a generic process-error token.
fn classify_outcome_token(invocation: &Result<(i32, String), WorkerError>, ready: bool) -> String {
    match invocation {
        Err(WorkerError::Timeout(_)) => "timeout".to_string(),
        Err(WorkerError::HostRestarted) => "patched_host_error_restarted".to_string(),
        Err(WorkerError::HostExited { .. }) => "patched_host_error_exited".to_string(),
        Err(WorkerError::HostClosed) => "patched_host_error_closed".to_string(),
        Err(WorkerError::HostStartFailed(_)) => "patched_host_error_start_failed".to_string(),
        Err(_) => "process_error_other".to_string(),
        Ok(_) if ready => "reports_ready".to_string(),
        Ok((exit_code, _)) => format!("process_exited_rc_{exit_code}"),
    }
}

/// Write the per-pass log unconditionally, regardless of mode or outcome
/// (§4.C): started-at, the command actually invoked, the outcome token,
/// finished-at, elapsed seconds.
async fn write_log(
    pass_dir: &Path,
    command_line: &str,
    started_at_utc: DateTime<Utc>,
    finished_at_utc: DateTime<Utc>,
    elapsed_seconds: f64,
    outcome: &str,
) {
    let log_path = pass_dir.join("log.txt");
    let contents = format!(
        "started_at={}\ncommand={command_line}\noutcome={outcome}\nfinished_at={}\nelapsed_seconds={elapsed_seconds:.3}\n",
        started_at_utc.to_rfc3339(),
        finished_at_utc.to_rfc3339(),
    );
    if let Err(e) = tokio::fs::write(&log_path, contents).await {
        tracing::warn!("failed to write pass log {}: {e}", log_path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_run_config() -> RunConfig {
        RunConfig {
            bot_id: "bot-1".to_string(),
            symbol: "EURUSD".to_string(),
            period: "m1".to_string(),
            start: chrono::Utc::now(),
            end: chrono::Utc::now(),
            data_mode: crate::model::DataMode::M1,
            ctid: "ctid".to_string(),
            account: "acct".to_string(),
            password: vec![],
            algo_bytes: vec![],
            callback_url: None,
            timeout_seconds: 60,
            include_artifacts: false,
            balance: None,
        }
    }

    #[tokio::test]
    async fn one_shot_invocation_without_reports_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path().to_path_buf());
        let invoker = BacktestInvoker::new(InvocationMode::OneShot {
            cli_executable: PathBuf::from("true"),
        });
        let pass = PassJob { pass_id: 1, parameters: BTreeMap::new() };
        let active_procs = ActiveProcs::new();
        let outcome = invoker
            .run_pass(&sample_run_config(), &paths, &pass, Duration::from_secs(5), &active_procs)
            .await
            .unwrap();
        assert_eq!(outcome.status, PassStatus::Failed);
        assert!(outcome.metrics.is_none());
        assert_eq!(active_procs.len().await, 0, "pid must be deregistered after the pass finishes");
    }

    #[tokio::test]
    async fn one_shot_invocation_times_out_on_a_long_runner() {
        // Exercise `run_via_one_shot` directly with a real sleep, since
        // `run_pass`'s documented argv isn't meaningful to feed to `sleep`.
        let invoker = BacktestInvoker::new(InvocationMode::OneShot {
            cli_executable: PathBuf::from("sleep"),
        });
        let active_procs = ActiveProcs::new();
        let result = invoker
            .run_via_one_shot(
                Path::new("sleep"),
                vec!["10".to_string()],
                Duration::from_millis(200),
                &active_procs,
                1,
            )
            .await;
        assert!(matches!(result, Err(WorkerError::Timeout(_))));
        assert_eq!(active_procs.len().await, 0);
    }

    #[tokio::test]
    async fn classify_outcome_parses_metrics_when_reports_present() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path().to_path_buf());
        let pass_dir = paths.pass_dir(3);
        tokio::fs::create_dir_all(&pass_dir).await.unwrap();
        tokio::fs::write(paths.report_html_path(3), b"<html></html>").await.unwrap();
        tokio::fs::write(
            paths.report_json_path(3),
            serde_json::json!({"main": {"netProfit": 42.0}}).to_string(),
        )
        .await
        .unwrap();

        let invoker = BacktestInvoker::new(InvocationMode::OneShot {
            cli_executable: PathBuf::from("true"),
        });
        let outcome = invoker.classify_outcome(&paths, 3, 0, String::new()).await.unwrap();
        assert_eq!(outcome.status, PassStatus::Completed);
        assert_eq!(outcome.metrics.unwrap().net_profit, Some(42.0));
    }

    #[test]
    fn cli_args_match_the_documented_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path().to_path_buf());
        let mut run_config = sample_run_config();
        run_config.balance = Some(10_000.0);

        let args = build_cli_args(&run_config, &paths, 5);
        assert_eq!(args[0], "backtest");
        assert_eq!(args[1], paths.algo_file.display().to_string());
        assert_eq!(args[2], paths.cbotset_path(5).display().to_string());
        assert!(args.iter().any(|a| a.starts_with("--start=")));
        assert!(args.iter().any(|a| a.starts_with("--end=")));
        assert!(args.contains(&"--data-mode=m1".to_string()));
        assert!(args.contains(&"--ctid=ctid".to_string()));
        assert!(args.contains(&format!("--pwd-file={}", paths.pwd_file.display())));
        assert!(args.contains(&"--account=acct".to_string()));
        assert!(args.contains(&"--symbol=EURUSD".to_string()));
        assert!(args.contains(&"--period=m1".to_string()));
        assert!(args.contains(&format!("--report={}", paths.report_html_path(5).display())));
        assert!(args.contains(&format!("--report-json={}", paths.report_json_path(5).display())));
        assert!(args.contains(&"--balance=10000".to_string()));
    }

    #[test]
    fn balance_flag_omitted_when_not_set() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path().to_path_buf());
        let args = build_cli_args(&sample_run_config(), &paths, 1);
        assert!(!args.iter().any(|a| a.starts_with("--balance=")));
    }

    #[tokio::test]
    async fn run_pass_writes_a_structured_log_and_empty_events_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path().to_path_buf());
        let invoker = BacktestInvoker::new(InvocationMode::OneShot {
            cli_executable: PathBuf::from("true"),
        });
        let pass = PassJob { pass_id: 9, parameters: BTreeMap::new() };
        let active_procs = ActiveProcs::new();
        invoker
            .run_pass(&sample_run_config(), &paths, &pass, Duration::from_secs(5), &active_procs)
            .await
            .unwrap();

        let log = tokio::fs::read_to_string(paths.log_path(9)).await.unwrap();
        assert!(log.contains("started_at="));
        assert!(log.contains("command=true backtest "));
        assert!(log.contains("outcome=process_exited_rc_0"));
        assert!(log.contains("finished_at="));
        assert!(log.contains("elapsed_seconds="));

        let events = tokio::fs::read_to_string(paths.events_path(9)).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn timed_out_pass_still_writes_a_log() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path().to_path_buf());

        // A script that ignores whatever argv it's handed and just sleeps,
        // since `build_cli_args`'s flags aren't meaningful to feed `sleep`
        // directly (it would choke parsing `--start=...` as a duration).
        let script_path = dir.path().join("slow_cli.sh");
        tokio::fs::write(&script_path, "#!/bin/sh\nsleep 5\n").await.unwrap();
        let mut perms = tokio::fs::metadata(&script_path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&script_path, perms).await.unwrap();

        let invoker = BacktestInvoker::new(InvocationMode::OneShot { cli_executable: script_path });
        let pass = PassJob { pass_id: 2, parameters: BTreeMap::new() };
        let active_procs = ActiveProcs::new();
        let result = invoker
            .run_pass(&sample_run_config(), &paths, &pass, Duration::from_millis(200), &active_procs)
            .await;
        assert!(matches!(result, Err(WorkerError::Timeout(_))));

        let log = tokio::fs::read_to_string(paths.log_path(2)).await.unwrap();
        assert!(log.contains("outcome=timeout"));
    }
}
