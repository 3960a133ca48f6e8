//! FIFO pass queue (§4.D/§4.E): workers dequeue with a short timeout so they
//! can re-check the run's stop flag instead of blocking forever on an empty
//! queue that will never receive more work once a run is stopped.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::model::PassJob;

const DEQUEUE_POLL: Duration = Duration::from_millis(500);

/// Thread-safe FIFO of pending passes with size visible for the admission
/// invariant `in_flight + queue.size + len(results) == enqueued_total`.
pub struct PassQueue {
    inner: Mutex<VecDeque<PassJob>>,
    notify: Notify,
}

impl Default for PassQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PassQueue {
    pub fn new() -> Self {
        Self { inner: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }

    pub async fn push(&self, job: PassJob) {
        self.inner.lock().await.push_back(job);
        self.notify.notify_one();
    }

    pub async fn push_many(&self, jobs: impl IntoIterator<Item = PassJob>) {
        let mut guard = self.inner.lock().await;
        for job in jobs {
            guard.push_back(job);
        }
        drop(guard);
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Wait up to `DEQUEUE_POLL` for a job. Returns `None` on timeout so the
    /// caller (a worker loop) can re-check whether the run has been stopped.
    pub async fn try_dequeue(&self) -> Option<PassJob> {
        if let Some(job) = self.inner.lock().await.pop_front() {
            return Some(job);
        }
        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => self.inner.lock().await.pop_front(),
            _ = tokio::time::sleep(DEQUEUE_POLL) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn job(pass_id: u64) -> PassJob {
        PassJob { pass_id, parameters: BTreeMap::new() }
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let q = PassQueue::new();
        q.push(job(1)).await;
        q.push(job(2)).await;
        q.push(job(3)).await;
        assert_eq!(q.try_dequeue().await.unwrap().pass_id, 1);
        assert_eq!(q.try_dequeue().await.unwrap().pass_id, 2);
        assert_eq!(q.try_dequeue().await.unwrap().pass_id, 3);
    }

    #[tokio::test]
    async fn dequeue_on_empty_queue_times_out_to_none() {
        let q = PassQueue::new();
        let result = q.try_dequeue().await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn push_while_waiting_wakes_the_dequeue() {
        let q = std::sync::Arc::new(PassQueue::new());
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.try_dequeue().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(job(42)).await;
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dequeue should not time out")
            .unwrap();
        assert_eq!(result.unwrap().pass_id, 42);
    }

    #[tokio::test]
    async fn len_reflects_pushes_and_pops() {
        let q = PassQueue::new();
        assert_eq!(q.len().await, 0);
        q.push_many([job(1), job(2)]).await;
        assert_eq!(q.len().await, 2);
        q.try_dequeue().await;
        assert_eq!(q.len().await, 1);
    }
}
