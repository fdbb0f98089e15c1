//! Workflow management endpoints.
//!
//! CRUD over workflow documents plus the execute endpoint, which creates a
//! `pending` execution row and hands the document to the runner on a
//! detached task. The response returns immediately with the execution id;
//! clients follow progress over the SSE stream.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{internal, AppState};
use crate::store::WorkflowDraft;
use crate::workflow::Workflow;

/// Request body for the execute endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub trigger_data: Option<Value>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/execute", post(execute_workflow))
}

/// POST /api/workflows
async fn create_workflow(
    State(state): State<AppState>,
    Json(draft): Json<WorkflowDraft>,
) -> Result<Json<Workflow>, StatusCode> {
    if draft.name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let workflow = state.store.create_workflow(draft).await.map_err(internal)?;
    tracing::info!("created workflow {} ({})", workflow.id, workflow.name);
    Ok(Json(workflow))
}

/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let workflows = state.store.list_workflows().await.map_err(internal)?;
    Ok(Json(json!({ "workflows": workflows })))
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Workflow>, StatusCode> {
    state
        .store
        .get_workflow(id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// PUT /api/workflows/{id}
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(draft): Json<WorkflowDraft>,
) -> Result<Json<Workflow>, StatusCode> {
    if draft.name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    state
        .store
        .update_workflow(id, draft)
        .await
        .map_err(internal)?
        .map(|workflow| {
            tracing::info!("updated workflow {id}");
            Json(workflow)
        })
        .ok_or(StatusCode::NOT_FOUND)
}

/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    if state.store.delete_workflow(id).await.map_err(internal)? {
        tracing::info!("deleted workflow {id} and its executions");
        Ok(Json(json!({ "deleted": true })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

/// POST /api/workflows/{id}/execute
///
/// Body: `{"triggerData": ...}`, optional. The body is parsed by hand so an
/// empty POST also starts an execution.
async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: String,
) -> Result<Json<Value>, StatusCode> {
    let workflow = state
        .store
        .get_workflow(id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    if !workflow.is_active {
        tracing::warn!("workflow {id} is inactive; refusing execution");
        return Err(StatusCode::BAD_REQUEST);
    }

    let trigger_data = if body.trim().is_empty() {
        None
    } else {
        match serde_json::from_str::<ExecuteRequest>(&body) {
            Ok(request) => request.trigger_data,
            Err(e) => {
                tracing::warn!("invalid execute body for workflow {id}: {e}");
                return Err(StatusCode::BAD_REQUEST);
            }
        }
    };
    let execution = state
        .store
        .create_execution(workflow.id)
        .await
        .map_err(internal)?;

    tracing::info!("spawning execution {} of workflow {id}", execution.id);
    let runner = Arc::clone(&state.runner);
    let execution_id = execution.id;
    tokio::spawn(async move {
        runner.run(workflow, execution_id, trigger_data).await;
    });

    Ok(Json(json!({ "executionId": execution_id })))
}
