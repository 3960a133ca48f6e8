//! axum handlers for the HTTP façade (§6). Thin: each handler decodes its
//! DTO, calls straight into the `LifecycleController`, and maps the result
//! (or `WorkerError`) back onto the wire shape. No business logic lives here.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};

use crate::error::WorkerError;
use crate::lifecycle::{LifecycleController, ParallelSettingsPatch};

use super::dto::{
    AssignRequest, AssignResponse, ErrorResponse, ParallelSettingsRequest, ResultsQuery,
    RunStartRequest, RunStartResponse, StatusResponse, StopResponse,
};

pub type AppState = Arc<LifecycleController>;

/// Wraps `WorkerError` so it can be returned directly from a handler and
/// mapped onto `{status_code(), user_message()}` — the same sanitized split
/// the error type already defines for any other caller.
pub struct AppError(WorkerError);

impl From<WorkerError> for AppError {
    fn from(e: WorkerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        tracing::warn!(status = status.as_u16(), "request failed: {}", self.0);
        (status, Json(ErrorResponse { error: self.0.user_message() })).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/run/start", post(start_run))
        .route("/run/:run_id/assign", post(assign))
        .route("/run/:run_id/results", get(results))
        .route("/run/:run_id/stop", post(stop))
        .route("/run/:run_id/unlock", post(stop))
        .route("/unlock", post(unlock_current))
        .route("/status", get(status))
        .route("/settings/parallel", put(settings_parallel))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn start_run(
    State(controller): State<AppState>,
    Json(request): Json<RunStartRequest>,
) -> Result<Json<RunStartResponse>, AppError> {
    let run_config = request
        .into_run_config()
        .map_err(|e| AppError(WorkerError::Other(e)))?;
    let outcome = controller.start(run_config).await?;
    Ok(Json(outcome.into()))
}

async fn assign(
    State(controller): State<AppState>,
    Path(run_id): Path<String>,
    Json(request): Json<AssignRequest>,
) -> Result<Json<AssignResponse>, AppError> {
    let passes = request.passes.into_iter().map(Into::into).collect();
    let outcome = controller.assign(&run_id, passes).await?;
    Ok(Json(outcome.into()))
}

async fn results(
    State(controller): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<Vec<crate::model::PassResult>>, AppError> {
    let snapshot = controller.results(&run_id, query.limit, query.include_artifacts).await?;
    Ok(Json(snapshot))
}

async fn stop(
    State(controller): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<StopResponse>, AppError> {
    let outcome = controller.stop(&run_id).await?;
    Ok(Json(outcome.into()))
}

async fn unlock_current(State(controller): State<AppState>) -> Json<StopResponse> {
    Json(controller.unlock_current().await.into())
}

async fn status(State(controller): State<AppState>) -> Json<StatusResponse> {
    Json(controller.status().await.into())
}

async fn settings_parallel(
    State(controller): State<AppState>,
    Json(request): Json<ParallelSettingsRequest>,
) -> Json<StatusResponse> {
    controller
        .set_parallel_settings(ParallelSettingsPatch {
            explicit_parallel: request.explicit_parallel,
            cpu_target_percent: request.cpu_target_percent,
            parallel_per_core: request.parallel_per_core,
        })
        .await;
    Json(controller.status().await.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::policy::ParallelismPolicy;
    use axum::body::Body;
    use axum::http::Request;
    use base64::Engine;
    use std::path::PathBuf;
    use tower::ServiceExt;

    fn test_config(root: PathBuf) -> Config {
        Config {
            root,
            bind_addr: "127.0.0.1:0".to_string(),
            dotnet_path: PathBuf::from("dotnet"),
            custom_cli_patched: false,
            cli_patched_host_path: None,
            ctrade_cli_path: Some(PathBuf::from("true")),
            callback_batch_size: 10,
            callback_batch_flush_interval: std::time::Duration::from_millis(100),
            callback_timeout: std::time::Duration::from_secs(3),
            initial_policy: ParallelismPolicy::new(1),
        }
    }

    fn router_with_fresh_state() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(LifecycleController::new(test_config(dir.path().to_path_buf())));
        (build_router(controller), dir)
    }

    #[tokio::test]
    async fn status_with_no_run_reports_null_current_run() {
        let (router, _dir) = router_with_fresh_state();
        let response = router
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let status: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert!(status.current_run.is_none());
    }

    #[tokio::test]
    async fn start_then_assign_then_results_round_trips() {
        let (router, _dir) = router_with_fresh_state();
        let algo_b64 = base64::engine::general_purpose::STANDARD.encode(b"algo-bytes");
        let start_body = serde_json::json!({
            "bot_id": "bot-1",
            "symbol": "EURUSD",
            "period": "m1",
            "start": "2024-01-01T00:00:00Z",
            "end": "2024-01-02T00:00:00Z",
            "ctid": "ctid",
            "account": "acct",
            "password": "secret",
            "algo_base64": algo_b64,
        });

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run/start")
                    .header("content-type", "application/json")
                    .body(Body::from(start_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let start: RunStartResponse = serde_json::from_slice(&body).unwrap();

        let assign_body = serde_json::json!({ "passes": [{"pass_id": 1, "parameters": {}}] });
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/run/{}/assign", start.run_id))
                    .header("content-type", "application/json")
                    .body(Body::from(assign_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/run/{}/stop", start.run_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn assign_to_unknown_run_is_404() {
        let (router, _dir) = router_with_fresh_state();
        let assign_body = serde_json::json!({ "passes": [] });
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run/does-not-exist/assign")
                    .header("content-type", "application/json")
                    .body(Body::from(assign_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn settings_parallel_updates_reported_max_parallel() {
        let (router, _dir) = router_with_fresh_state();
        let patch_body = serde_json::json!({ "explicit_parallel": 9 });
        let response = router
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/settings/parallel")
                    .header("content-type", "application/json")
                    .body(Body::from(patch_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let status: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.max_parallel, 9);
    }
}
