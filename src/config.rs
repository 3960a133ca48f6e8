//! Environment-driven configuration (§6, ambient component I), in the shape
//! of the teacher's `Config::from_env`: read once at startup, warn (not
//! fail) on a missing-but-optional variable, and keep sensible defaults for
//! everything else.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::policy::{detect_cpu_cores, ParallelismPolicy};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8089";
const DEFAULT_CALLBACK_BATCH_SIZE: usize = 10;
const DEFAULT_CALLBACK_BATCH_FLUSH_SECONDS: f64 = 1.0;
const DEFAULT_CALLBACK_TIMEOUT_SECONDS: u64 = 10;
const MIN_CALLBACK_TIMEOUT_SECONDS: u64 = 3;

/// Process-wide, immutable-after-startup configuration.
pub struct Config {
    pub root: PathBuf,
    pub bind_addr: String,
    pub dotnet_path: PathBuf,
    pub custom_cli_patched: bool,
    pub cli_patched_host_path: Option<PathBuf>,
    pub ctrade_cli_path: Option<PathBuf>,
    pub callback_batch_size: usize,
    pub callback_batch_flush_interval: Duration,
    pub callback_timeout: Duration,
    pub initial_policy: ParallelismPolicy,
}

impl Config {
    pub fn from_env() -> Self {
        let root = env::var("OPTIMO_WORKER_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./runs"));

        let bind_addr =
            env::var("OPTIMO_WORKER_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());

        let dotnet_path = env::var("OPTIMO_WORKER_DOTNET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("dotnet"));

        let custom_cli_patched = env::var("OPTIMO_CUSTOM_CLI_PATCHED")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let cli_patched_host_path = env::var("OPTIMO_CLI_PATCHED_HOST_PATH").ok().map(PathBuf::from);
        if custom_cli_patched && cli_patched_host_path.is_none() {
            tracing::warn!(
                "OPTIMO_CUSTOM_CLI_PATCHED is set but OPTIMO_CLI_PATCHED_HOST_PATH is not — \
                 persistent-host mode will fail to start"
            );
        }

        let ctrade_cli_path = env::var("CTRADE_CLI_PATH").ok().map(PathBuf::from);
        if !custom_cli_patched && ctrade_cli_path.is_none() {
            tracing::warn!("CTRADE_CLI_PATH not set — one-shot backtest invocation will fail to spawn");
        }

        let callback_batch_size = env::var("OPTIMO_WORKER_CALLBACK_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CALLBACK_BATCH_SIZE);

        let callback_batch_flush_seconds = env::var("OPTIMO_WORKER_CALLBACK_BATCH_FLUSH_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CALLBACK_BATCH_FLUSH_SECONDS);

        let callback_timeout_seconds = env::var("OPTIMO_WORKER_CALLBACK_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CALLBACK_TIMEOUT_SECONDS)
            .max(MIN_CALLBACK_TIMEOUT_SECONDS);

        let cpu_cores = detect_cpu_cores();
        let mut initial_policy = ParallelismPolicy::new(cpu_cores);

        if let Ok(pct) = env::var("OPTIMO_WORKER_CPU_TARGET_PERCENT") {
            match pct.parse::<u32>() {
                Ok(v) => initial_policy.cpu_target_percent = v.clamp(65, 95),
                Err(_) => tracing::warn!("OPTIMO_WORKER_CPU_TARGET_PERCENT={pct} is not a valid integer, ignoring"),
            }
        }
        if let Ok(per_core) = env::var("OPTIMO_WORKER_PARALLEL_PER_CORE") {
            match per_core.parse::<usize>() {
                Ok(v) => initial_policy.parallel_per_core = v.max(1),
                Err(_) => tracing::warn!("OPTIMO_WORKER_PARALLEL_PER_CORE={per_core} is not a valid integer, ignoring"),
            }
        }
        if let Ok(explicit) = env::var("OPTIMO_WORKER_PARALLEL") {
            if explicit.eq_ignore_ascii_case("auto") {
                initial_policy.explicit_parallel = None;
            } else {
                match explicit.parse::<usize>() {
                    Ok(v) => initial_policy.explicit_parallel = Some(v),
                    Err(_) => tracing::warn!("OPTIMO_WORKER_PARALLEL={explicit} is not \"auto\" or an integer, ignoring"),
                }
            }
        }

        Self {
            root,
            bind_addr,
            dotnet_path,
            custom_cli_patched,
            cli_patched_host_path,
            ctrade_cli_path,
            callback_batch_size,
            callback_batch_flush_interval: Duration::from_secs_f64(callback_batch_flush_seconds.max(0.01)),
            callback_timeout: Duration::from_secs(callback_timeout_seconds),
            initial_policy,
        }
    }
}
