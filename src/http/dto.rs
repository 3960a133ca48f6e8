//! Wire shapes for the HTTP façade (§3 ambient data-model additions, §6).
//! These are pure serialization types — the lifecycle controller and run
//! state never see them directly, only the `RunConfig`/`PassJob`/`PassResult`
//! types they map onto.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::lifecycle::{AssignOutcome, StartOutcome, StatusSnapshot, StopOutcome};
use crate::model::{DataMode, PassJob, RunConfig};

#[derive(Debug, Deserialize)]
pub struct RunStartRequest {
    pub bot_id: String,
    pub symbol: String,
    pub period: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "default_data_mode")]
    pub data_mode: DataMode,
    pub ctid: String,
    pub account: String,
    /// Raw credential bytes. Accepted as a UTF-8 string over the wire and
    /// written to `pwd.txt` verbatim — never echoed back in any response.
    pub password: String,
    /// Base64-encoded compiled algorithm artifact.
    pub algo_base64: String,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub include_artifacts: bool,
    #[serde(default)]
    pub balance: Option<f64>,
}

fn default_data_mode() -> DataMode {
    DataMode::M1
}

fn default_timeout_seconds() -> u64 {
    300
}

impl RunStartRequest {
    pub fn into_run_config(self) -> Result<RunConfig, String> {
        use base64::Engine;
        let algo_bytes = base64::engine::general_purpose::STANDARD
            .decode(self.algo_base64)
            .map_err(|e| format!("algo_base64 is not valid base64: {e}"))?;

        Ok(RunConfig {
            bot_id: self.bot_id,
            symbol: self.symbol,
            period: self.period,
            start: self.start,
            end: self.end,
            data_mode: self.data_mode,
            ctid: self.ctid,
            account: self.account,
            password: self.password.into_bytes(),
            algo_bytes,
            callback_url: self.callback_url,
            timeout_seconds: self.timeout_seconds,
            include_artifacts: self.include_artifacts,
            balance: self.balance,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RunStartResponse {
    pub run_id: String,
    pub max_parallel: usize,
    pub workdir: String,
}

impl From<StartOutcome> for RunStartResponse {
    fn from(outcome: StartOutcome) -> Self {
        Self {
            run_id: outcome.run_id,
            max_parallel: outcome.max_parallel,
            workdir: outcome.workdir.display().to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PassJobDto {
    pub pass_id: u64,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl From<PassJobDto> for PassJob {
    fn from(dto: PassJobDto) -> Self {
        Self { pass_id: dto.pass_id, parameters: dto.parameters }
    }
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub passes: Vec<PassJobDto>,
}

#[derive(Debug, Serialize)]
pub struct AssignResponse {
    pub accepted: u64,
    pub enqueued_total: u64,
}

impl From<AssignOutcome> for AssignResponse {
    fn from(outcome: AssignOutcome) -> Self {
        Self { accepted: outcome.accepted, enqueued_total: outcome.enqueued_total }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ResultsQuery {
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_artifacts: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub current_run: Option<String>,
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

impl From<StatusSnapshot> for StatusResponse {
    fn from(s: StatusSnapshot) -> Self {
        Self {
            current_run: s.run_id,
            in_flight: s.in_flight,
            queue_size: s.queue_size,
            enqueued_total: s.enqueued_total,
            results_count: s.results_count,
            max_parallel: s.max_parallel,
            cpu_cores: s.cpu_cores,
            cpu_target_percent: s.cpu_target_percent,
            parallel_per_core: s.parallel_per_core,
            explicit_parallel: s.explicit_parallel,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub dropped_queued: u64,
    pub killed_processes: usize,
    pub released: bool,
}

impl From<StopOutcome> for StopResponse {
    fn from(outcome: StopOutcome) -> Self {
        Self {
            dropped_queued: outcome.dropped_queued,
            killed_processes: outcome.killed_processes,
            released: outcome.released,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ParallelSettingsRequest {
    /// `Some(None)` clears the override back to "auto"; `None` (the field
    /// missing) leaves the current override untouched.
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub explicit_parallel: Option<Option<usize>>,
    pub cpu_target_percent: Option<u32>,
    pub parallel_per_core: Option<usize>,
}

/// Distinguishes "field absent" from "field present and null" for
/// `explicit_parallel`, so `{"explicit_parallel": null}` clears the override
/// while an absent field leaves it as-is.
fn deserialize_double_option<'de, D>(deserializer: D) -> Result<Option<Option<usize>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
