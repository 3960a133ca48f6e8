//! Patched CLI host client (§4.B): a long-lived child process fronting the
//! backtest engine, driven by newline-delimited JSON requests over its
//! stdin/stdout instead of one spawn per pass. Generalizes the teacher's
//! `dispatch/cli.rs` one-shot spawn-write-read-kill sequence into a
//! multiplexed client: many concurrent `execute()` calls share one child,
//! keyed by a request id, with a generation counter that invalidates every
//! in-flight waiter the instant the process is reset.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, watch, Mutex};

use crate::error::WorkerError;
use crate::procutil::{configure_child, terminate_then_kill};

const TERM_GRACE: Duration = Duration::from_secs(3);
const KILL_GRACE: Duration = Duration::from_secs(1);
const STDERR_TAIL_LINES: usize = 200;

/// Result of one multiplexed request to the host process.
#[derive(Debug, Clone)]
pub struct HostExecuteResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

struct ChildHandle {
    child: Child,
    stdin: ChildStdin,
}

/// One persistent slot's host client. One instance per worker pool slot
/// (§4.E) that runs in Mode 1; the slot owns it for the lifetime of the run.
pub struct PatchedHostClient {
    slot_id: String,
    dotnet_path: PathBuf,
    host_dll_path: PathBuf,
    cli_dir: PathBuf,
    handle: Mutex<Option<ChildHandle>>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>>,
    stderr_tail: Arc<Mutex<std::collections::VecDeque<String>>>,
    generation_tx: watch::Sender<u64>,
    generation_rx: watch::Receiver<u64>,
    exited_tx: watch::Sender<bool>,
    exited_rx: watch::Receiver<bool>,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl PatchedHostClient {
    /// Spawn the host process and start its reader tasks.
    pub async fn start(
        slot_id: String,
        dotnet_path: PathBuf,
        host_dll_path: PathBuf,
        cli_dir: PathBuf,
    ) -> Result<Arc<Self>, WorkerError> {
        let (generation_tx, generation_rx) = watch::channel(0u64);
        let (exited_tx, exited_rx) = watch::channel(false);

        let this = Arc::new(Self {
            slot_id,
            dotnet_path,
            host_dll_path,
            cli_dir,
            handle: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            stderr_tail: Arc::new(Mutex::new(std::collections::VecDeque::with_capacity(
                STDERR_TAIL_LINES,
            ))),
            generation_tx,
            generation_rx,
            exited_tx,
            exited_rx,
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        this.spawn_child().await?;
        Ok(this)
    }

    async fn spawn_child(&self) -> Result<(), WorkerError> {
        let mut cmd = Command::new(&self.dotnet_path);
        if !self.host_dll_path.as_os_str().is_empty() {
            cmd.arg(&self.host_dll_path);
            cmd.arg("--cli-dir").arg(&self.cli_dir);
        }
        cmd.current_dir(&self.cli_dir);
        configure_child(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::HostStartFailed(e.to_string()))?;
        let stdin = child.stdin.take().ok_or_else(|| {
            WorkerError::HostStartFailed("child has no stdin handle".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            WorkerError::HostStartFailed("child has no stdout handle".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            WorkerError::HostStartFailed("child has no stderr handle".to_string())
        })?;

        spawn_stdout_reader(stdout, Arc::clone(&self.pending), self.exited_tx.clone());
        spawn_stderr_reader(stderr, Arc::clone(&self.stderr_tail));

        *self.handle.lock().await = Some(ChildHandle { child, stdin });
        self.exited_tx.send(false).ok();
        Ok(())
    }

    /// Send one request, wait for its matching response, the process to be
    /// reset, the process to exit, or `timeout` — whichever comes first.
    pub async fn execute(
        &self,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<HostExecuteResult, WorkerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WorkerError::HostClosed);
        }
        if *self.exited_rx.borrow() {
            return Err(WorkerError::HostExited {
                stderr_tail: self.stderr_tail_snapshot().await,
            });
        }

        let generation_at_call = *self.generation_rx.borrow();
        let id = format!("{}-{}", self.slot_id, self.seq.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.write_request(&id, &args).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let mut generation_watch = self.generation_rx.clone();
        let mut exited_watch = self.exited_rx.clone();

        let outcome = tokio::select! {
            biased;
            result = rx => result
                .map_err(|_| WorkerError::HostClosed)
                .and_then(|value| parse_execute_response(&value)),
            _ = wait_for_generation_change(&mut generation_watch, generation_at_call) => {
                Err(WorkerError::HostRestarted)
            }
            _ = wait_for_exit(&mut exited_watch) => {
                Err(WorkerError::HostExited { stderr_tail: self.stderr_tail_snapshot().await })
            }
            _ = tokio::time::sleep(timeout) => Err(WorkerError::Timeout(timeout.as_millis() as u64)),
        };

        if outcome.is_err() {
            self.pending.lock().await.remove(&id);
        }
        outcome
    }

    async fn write_request(&self, id: &str, args: &[String]) -> Result<(), WorkerError> {
        let request = serde_json::json!({ "id": id, "args": args });
        let mut line = serde_json::to_string(&request).map_err(|e| WorkerError::Other(e.to_string()))?;
        line.push('\n');

        let mut handle = self.handle.lock().await;
        let Some(ChildHandle { stdin, .. }) = handle.as_mut() else {
            return Err(WorkerError::HostClosed);
        };
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(WorkerError::Io)?;
        stdin.flush().await.map_err(WorkerError::Io)
    }

    /// Kill the current process (politely, then forcibly), clear all pending
    /// waiters with `HostRestarted`, bump the generation, and spawn a fresh
    /// child. Called after `MAX_POLL_FAILURES`-equivalent consecutive
    /// failures, matching the teacher's `async_poll` cutoff philosophy.
    pub async fn reset_process(&self) -> Result<(), WorkerError> {
        self.kill_current().await;
        self.pending.lock().await.clear();
        self.generation_tx.send_modify(|g| *g += 1);
        self.stderr_tail.lock().await.clear();
        self.spawn_child().await
    }

    /// Tear the host down for good (§4.G run teardown). Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.kill_current().await;
        self.exited_tx.send(true).ok();
        for (_, tx) in self.pending.lock().await.drain() {
            drop(tx);
        }
    }

    async fn kill_current(&self) {
        let mut handle = self.handle.lock().await;
        if let Some(ChildHandle { mut child, .. }) = handle.take() {
            terminate_then_kill(&mut child, TERM_GRACE, KILL_GRACE).await;
        }
    }

    /// Current child's PID, if one is alive. Used by the worker pool to
    /// register the host in the run's active-child table (§4.D); changes
    /// across a `reset_process()` call, so callers should re-read it rather
    /// than caching it across a reset.
    pub async fn current_pid(&self) -> Option<u32> {
        self.handle.lock().await.as_ref().and_then(|h| h.child.id())
    }

    async fn stderr_tail_snapshot(&self) -> String {
        self.stderr_tail
            .lock()
            .await
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

async fn wait_for_generation_change(watch: &mut watch::Receiver<u64>, baseline: u64) {
    loop {
        if *watch.borrow() != baseline {
            return;
        }
        if watch.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_for_exit(watch: &mut watch::Receiver<bool>) {
    loop {
        if *watch.borrow() {
            return;
        }
        if watch.changed().await.is_err() {
            return;
        }
    }
}

fn parse_execute_response(value: &serde_json::Value) -> Result<HostExecuteResult, WorkerError> {
    // `exit_code` is canonical; `exitCode` is accepted as a camelCase alias.
    let exit_code = value
        .get("exit_code")
        .or_else(|| value.get("exitCode"))
        .and_then(|v| v.as_i64())
        .unwrap_or(-1) as i32;
    let stdout = value
        .get("stdout")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let stderr = value
        .get("stderr")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Ok(HostExecuteResult { exit_code, stdout, stderr })
}

/// Read response lines from the host's stdout; each line is a JSON object
/// carrying the echoed `id`. Matching responses are routed to their waiter
/// via the pending table; the task ends (and flips `exited`) on EOF or a
/// read error, which is how a crashed host unblocks every in-flight waiter
/// without a dedicated watchdog.
fn spawn_stdout_reader(
    stdout: tokio::process::ChildStdout,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>>,
    exited_tx: watch::Sender<bool>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                        continue;
                    };
                    let Some(id) = value.get("id").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    if let Some(tx) = pending.lock().await.remove(id) {
                        let _ = tx.send(value);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        exited_tx.send(true).ok();
    });
}

/// Keep only the last `STDERR_TAIL_LINES` lines of stderr, surfaced in
/// `WorkerError::HostExited` for diagnosis without unbounded memory growth.
fn spawn_stderr_reader(
    stderr: tokio::process::ChildStderr,
    stderr_tail: Arc<Mutex<std::collections::VecDeque<String>>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut tail = stderr_tail.lock().await;
            if tail.len() >= STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });
}
