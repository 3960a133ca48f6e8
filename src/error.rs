use thiserror::Error;

/// Errors surfaced by the worker's internal operations.
///
/// Every fallible path in the run lifecycle, worker pool, and patched-host
/// client returns one of these. `status_code` maps a variant onto the HTTP
/// contract in the external interface; `user_message` is what a caller gets
/// back — it never leaks workdir paths, credentials, or raw stderr.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("another run is already active")]
    Busy,

    #[error("no such run: {0}")]
    NotFound(String),

    #[error("run {0} is stopping")]
    Stopping(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("patched host was reset mid-request")]
    HostRestarted,

    #[error("patched host exited: {stderr_tail}")]
    HostExited { stderr_tail: String },

    #[error("patched host client is closed")]
    HostClosed,

    #[error("failed to start patched host: {0}")]
    HostStartFailed(String),

    #[error("process exited with code {code}")]
    ProcessExit { code: i32 },

    #[error("failed to parse report.json: {0}")]
    ReportParse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl WorkerError {
    /// HTTP status code this error maps onto when surfaced through the façade.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Busy => 409,
            Self::Stopping(_) => 409,
            Self::NotFound(_) => 404,
            Self::MissingField(_) => 400,
            _ => 500,
        }
    }

    /// Sanitized message safe to return to an external controller.
    /// Filesystem paths, stderr tails, and raw I/O error text stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Busy => "another run is already active".to_string(),
            Self::NotFound(run_id) => format!("no such run: {run_id}"),
            Self::Stopping(run_id) => format!("run {run_id} is stopping"),
            Self::MissingField(field) => format!("missing required field: {field}"),
            Self::Timeout(ms) => format!("operation timed out after {ms}ms"),
            Self::HostRestarted => "patched host restarted mid-request".to_string(),
            Self::HostExited { .. } => "patched host exited unexpectedly".to_string(),
            Self::HostClosed => "patched host client is closed".to_string(),
            Self::HostStartFailed(_) => "failed to start patched host".to_string(),
            Self::ProcessExit { code } => format!("process exited with code {code}"),
            Self::ReportParse(_) => "failed to parse backtest report".to_string(),
            Self::Io(_) => "an I/O error occurred".to_string(),
            Self::Request(_) => "request to controller failed".to_string(),
            Self::Other(_) => "an error occurred".to_string(),
        }
    }
}
