//! Callback pipeline (§4.F): batches completed passes and best-effort POSTs
//! them to the run's `callback_url`. A failed or slow controller must never
//! block or stall the worker pool — this consumer owns its own `reqwest`
//! client and channel, and a send failure is logged and dropped, never
//! retried, mirroring the teacher's async-poll philosophy of a hard failure
//! cutoff rather than unbounded retry.

use std::time::Duration;

use reqwest::Client;
use tokio::sync::mpsc;

use crate::model::{PassResult, RunPaths};
use crate::zipper::zip_pass_dirs_to_base64;

pub struct CallbackPipeline {
    client: Client,
    callback_url: Option<String>,
    run_id: String,
    paths: RunPaths,
    include_artifacts: bool,
    batch_size: usize,
    flush_interval: Duration,
}

impl CallbackPipeline {
    /// `batch_size` of 1 degenerates to "POST each result individually" —
    /// the same consumer loop, just flushing every iteration (§4.F).
    pub fn new(
        callback_url: Option<String>,
        run_id: String,
        paths: RunPaths,
        include_artifacts: bool,
        batch_size: usize,
        flush_interval: Duration,
        callback_timeout: Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(callback_timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            callback_url,
            run_id,
            paths,
            include_artifacts,
            batch_size: batch_size.max(1),
            flush_interval,
        }
    }

    /// Drain `rx` until every worker's sender side has dropped, batching
    /// results and flushing on size or interval, whichever comes first.
    ///
    /// Per-pass `artifacts_zip_b64` is never set here — batch items are
    /// posted without it (§4.F); when `include_artifacts` is set, `flush`
    /// attaches one batch-wide zip instead.
    pub async fn run(mut self, mut rx: mpsc::Receiver<PassResult>) {
        let mut batch: Vec<PassResult> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                maybe_result = rx.recv() => {
                    match maybe_result {
                        Some(result) => {
                            batch.push(result);
                            if batch.len() >= self.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        None => {
                            self.flush(&mut batch).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush(&mut batch).await;
                }
            }
        }
    }

    /// Build one zip spanning every pass in the batch, each rooted at
    /// `<pass_id>/...`. `None` if the batch left behind no files at all.
    fn build_batch_artifact(&self, batch: &[PassResult]) -> Option<String> {
        let dirs: Vec<_> = batch
            .iter()
            .map(|r| (r.pass_id, self.paths.pass_dir(r.pass_id)))
            .collect();
        match zip_pass_dirs_to_base64(&dirs) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(count = batch.len(), "failed to build batch artifact zip: {e}");
                None
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<PassResult>) {
        if batch.is_empty() {
            return;
        }
        let Some(url) = self.callback_url.as_deref() else {
            // No controller configured to call back — results stay available
            // through /run/{id}/results only.
            batch.clear();
            return;
        };

        let mut payload = serde_json::json!({
            "run_id": self.run_id,
            "items": &*batch,
        });
        if self.include_artifacts {
            if let Some(zip_b64) = self.build_batch_artifact(batch) {
                payload["artifacts_batch_zip_b64"] = serde_json::Value::String(zip_b64);
            }
        }

        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(count = batch.len(), "callback batch delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    status = response.status().as_u16(),
                    count = batch.len(),
                    "callback batch rejected by controller"
                );
            }
            Err(e) => {
                tracing::warn!(count = batch.len(), "callback batch delivery failed: {e}");
            }
        }
        batch.clear();
    }
}
