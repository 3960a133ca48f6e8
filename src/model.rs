//! Core data model (§3): the shapes that flow between the lifecycle
//! controller, the run state, the worker pool, and the callback pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Market window data granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
    Ticks,
    M1,
}

impl DataMode {
    pub fn as_cli_arg(&self) -> &'static str {
        match self {
            Self::Ticks => "ticks",
            Self::M1 => "m1",
        }
    }
}

/// Immutable-after-start configuration for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub bot_id: String,
    pub symbol: String,
    pub period: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub data_mode: DataMode,
    pub ctid: String,
    pub account: String,
    /// Raw password bytes, written to a 0600 file and never logged or echoed
    /// back on the wire.
    #[serde(skip_serializing)]
    pub password: Vec<u8>,
    /// Raw algorithm artifact bytes (the compiled/patched bot), written to
    /// `algo.algo` under the run workdir.
    #[serde(skip_serializing)]
    pub algo_bytes: Vec<u8>,
    pub callback_url: Option<String>,
    pub timeout_seconds: u64,
    pub include_artifacts: bool,
    pub balance: Option<f64>,
}

/// One parameterised pass submitted via `/run/{id}/assign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassJob {
    pub pass_id: u64,
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Outcome status of a completed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassStatus {
    Completed,
    Failed,
    Skipped,
}

/// Parsed subset of `report.json` (§4.C report parser).
///
/// Every field is optional: absence of a source field yields `None`, and a
/// parse failure of the whole document yields a `Metrics::default()` (all
/// `None`) paired with `PassStatus::Failed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub net_profit: Option<f64>,
    pub ending_equity: Option<f64>,
    pub ending_balance: Option<f64>,
    pub profit_factor: Option<f64>,
    pub total_trades: Option<f64>,
    pub winning_trades: Option<f64>,
    pub losing_trades: Option<f64>,
    pub average_trade: Option<f64>,
    pub max_equity_drawdown_percent: Option<f64>,
    pub max_balance_drawdown_percent: Option<f64>,
    pub max_equity_drawdown_absolute: Option<f64>,
    pub max_balance_drawdown_absolute: Option<f64>,
    /// Raw `main` section, unprojected, for callers that want more than the
    /// fixed metric list.
    pub main: Option<serde_json::Value>,
    pub trade_statistics: Option<serde_json::Value>,
    pub equity: Option<serde_json::Value>,
}

/// Result of one pass, appended to `RunState.results` in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassResult {
    pub run_id: String,
    pub pass_id: u64,
    pub status: PassStatus,
    pub started_at_utc: DateTime<Utc>,
    pub finished_at_utc: DateTime<Utc>,
    pub elapsed_seconds_total: f64,
    pub metrics: Option<Metrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts_zip_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Absolute filesystem paths derived from a run's workdir, computed once at
/// `start` and threaded through the invoker and callback pipeline.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub workdir: PathBuf,
    pub run_json: PathBuf,
    pub pwd_file: PathBuf,
    pub algo_file: PathBuf,
}

impl RunPaths {
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            run_json: workdir.join("run.json"),
            pwd_file: workdir.join("pwd.txt"),
            algo_file: workdir.join("algo.algo"),
            workdir,
        }
    }

    pub fn pass_dir(&self, pass_id: u64) -> PathBuf {
        self.workdir.join(pass_id.to_string())
    }

    pub fn cbotset_path(&self, pass_id: u64) -> PathBuf {
        self.pass_dir(pass_id).join("parameters.cbotset")
    }

    pub fn events_path(&self, pass_id: u64) -> PathBuf {
        self.pass_dir(pass_id).join("events.json")
    }

    pub fn report_html_path(&self, pass_id: u64) -> PathBuf {
        self.pass_dir(pass_id).join("report.html")
    }

    pub fn report_json_path(&self, pass_id: u64) -> PathBuf {
        self.pass_dir(pass_id).join("report.json")
    }

    pub fn log_path(&self, pass_id: u64) -> PathBuf {
        self.pass_dir(pass_id).join("log.txt")
    }
}

/// Build the `.cbotset` JSON payload for one pass (§6 cbotset file).
pub fn build_cbotset(
    symbol: &str,
    period: &str,
    parameters: &BTreeMap<String, serde_json::Value>,
) -> serde_json::Value {
    serde_json::json!({
        "Chart": { "Symbol": symbol, "Period": period },
        "Parameters": parameters,
    })
}
