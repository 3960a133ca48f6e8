//! Run state and admission gate (§4.D): exactly one run is active at a time.
//! `RunRegistry` is the single-slot admission gate; `RunState` carries the
//! counters the lifecycle controller and `/status` endpoint both read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;
use crate::model::{PassResult, RunConfig, RunPaths};
use crate::procutil::signal_group;
use crate::queue::PassQueue;

/// Grace periods for the teardown path's best-effort kill of every tracked
/// child (§4.G), matching `procutil::terminate_then_kill`'s own grace
/// periods even though this path doesn't own a `Child` to `wait()` on.
const TEARDOWN_TERM_GRACE: Duration = Duration::from_secs(3);
const TEARDOWN_KILL_GRACE: Duration = Duration::from_secs(1);

/// Active-child tracking (§4.D): every one-shot backtest child (4.C Mode 2)
/// and every patched CLI host (4.B) registers its PID here on start and
/// deregisters on end. Keyed by an opaque `i64` so pass-keyed entries
/// (`pass_id as i64`) and per-slot host entries (negative) never collide.
#[derive(Default)]
pub struct ActiveProcs(Mutex<HashMap<i64, u32>>);

impl ActiveProcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, key: i64, pid: u32) {
        self.0.lock().await.insert(key, pid);
    }

    pub async fn deregister(&self, key: i64) {
        self.0.lock().await.remove(&key);
    }

    pub async fn contains_pid(&self, pid: u32) -> bool {
        self.0.lock().await.values().any(|p| *p == pid)
    }

    pub async fn len(&self) -> usize {
        self.0.lock().await.len()
    }

    /// Terminate every still-tracked child: polite SIGTERM to each process
    /// group, wait, then SIGKILL survivors, wait again. Fire-and-forget —
    /// this path holds no `Child` handle to `wait()` on, only bare PIDs, so
    /// a reaped-and-reused PID could in principle receive a stray signal;
    /// the same small race the teacher accepts in `ProcessGroupGuard`.
    /// Returns the number of PIDs this pass attempted to kill.
    pub async fn terminate_all(&self) -> usize {
        self.terminate_all_with_graces(TEARDOWN_TERM_GRACE, TEARDOWN_KILL_GRACE).await
    }

    async fn terminate_all_with_graces(&self, term_grace: Duration, kill_grace: Duration) -> usize {
        let entries: Vec<u32> = self.0.lock().await.values().copied().collect();
        for pid in &entries {
            signal_group(*pid, libc::SIGTERM);
        }
        tokio::time::sleep(term_grace).await;
        for pid in &entries {
            signal_group(*pid, libc::SIGKILL);
        }
        tokio::time::sleep(kill_grace).await;
        self.0.lock().await.clear();
        entries.len()
    }
}

/// Mutable, shared state for one active run.
pub struct RunState {
    pub run_id: String,
    pub config: RunConfig,
    pub paths: RunPaths,
    pub queue: PassQueue,
    pub results: Mutex<Vec<PassResult>>,
    pub enqueued_total: AtomicU64,
    pub in_flight: AtomicU64,
    pub stopping: AtomicBool,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub active_procs: ActiveProcs,
}

impl RunState {
    pub fn new(run_id: String, config: RunConfig, paths: RunPaths) -> Self {
        Self {
            run_id,
            config,
            paths,
            queue: PassQueue::new(),
            results: Mutex::new(Vec::new()),
            enqueued_total: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            active_procs: ActiveProcs::new(),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Admit `count` new passes into `enqueued_total` before they are pushed
    /// onto the queue, so `/status` can never observe a window where the
    /// queue has grown but the total hasn't caught up yet.
    pub fn admit(&self, count: u64) {
        self.enqueued_total.fetch_add(count, Ordering::AcqRel);
    }

    pub async fn record_result(&self, result: PassResult) {
        self.results.lock().await.push(result);
    }

    pub async fn results_snapshot(&self) -> Vec<PassResult> {
        self.results.lock().await.clone()
    }

    /// Invariant (§8): `in_flight + queue.size + len(results) == enqueued_total`.
    pub async fn check_invariant(&self) -> bool {
        let in_flight = self.in_flight.load(Ordering::Acquire);
        let queued = self.queue.len().await as u64;
        let done = self.results.lock().await.len() as u64;
        let total = self.enqueued_total.load(Ordering::Acquire);
        in_flight + queued + done == total
    }
}

/// Single-slot admission gate: only one run may be active at a time (§4.D).
#[derive(Default)]
pub struct RunRegistry {
    current: Mutex<Option<Arc<RunState>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new run. Fails with `Busy` if one is already active.
    pub async fn start(&self, state: Arc<RunState>) -> Result<(), WorkerError> {
        let mut guard = self.current.lock().await;
        if guard.is_some() {
            return Err(WorkerError::Busy);
        }
        *guard = Some(state);
        Ok(())
    }

    pub async fn current(&self) -> Option<Arc<RunState>> {
        self.current.lock().await.clone()
    }

    /// Fetch the active run, validating that `run_id` matches it.
    pub async fn get(&self, run_id: &str) -> Result<Arc<RunState>, WorkerError> {
        let guard = self.current.lock().await;
        match guard.as_ref() {
            Some(state) if state.run_id == run_id => Ok(Arc::clone(state)),
            _ => Err(WorkerError::NotFound(run_id.to_string())),
        }
    }

    /// Release the slot, but only if `run_id` still owns it (guards against
    /// a stale unlock racing a new run that has since taken the slot).
    pub async fn release(&self, run_id: &str) {
        let mut guard = self.current.lock().await;
        if guard.as_ref().map(|s| s.run_id.as_str()) == Some(run_id) {
            *guard = None;
        }
    }
}
