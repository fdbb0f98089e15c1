//! Execution inspection endpoints and the live progress stream.
//!
//! `GET /api/executions/{id}/stream` is server-sent events: one `data:`
//! frame per progress snapshot, closing after the terminal frame. The
//! subscription deregisters itself when the client disconnects and the
//! stream is dropped. An execution that already finished gets a single
//! reconstructed snapshot so late clients still see the outcome.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio_stream::Stream;
use serde_json::{json, Value};

use crate::api::{internal, AppState};
use crate::workflow::{Execution, ExecutionProgress, NodeProgress, NodeStatus};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    #[serde(default)]
    workflow_id: Option<i64>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/stream", get(stream_execution))
}

/// GET /api/executions?workflowId=N
async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, StatusCode> {
    let executions = state
        .store
        .list_executions(query.workflow_id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "executions": executions })))
}

/// GET /api/executions/{id}
async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Execution>, StatusCode> {
    state
        .store
        .get_execution(id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/executions/{id}/stream
async fn stream_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    // Subscribe before the terminal check so an execution finishing in
    // between still delivers its final snapshot.
    let mut subscription = state.bus.clone().subscribe(id);
    let execution = state
        .store
        .get_execution(id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let replay = execution
        .status
        .is_terminal()
        .then(|| terminal_snapshot(&execution));

    let stream = async_stream::stream! {
        if let Some(snapshot) = replay {
            if let Ok(payload) = serde_json::to_string(&snapshot) {
                yield Ok::<_, Infallible>(Event::default().data(payload));
            }
            return;
        }

        while let Some(progress) = subscription.recv().await {
            let terminal = progress.status.is_terminal();
            if let Ok(payload) = serde_json::to_string(&progress) {
                yield Ok::<_, Infallible>(Event::default().data(payload));
            }
            if terminal {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Rebuild a snapshot for an execution that terminated before the client
/// connected. Per-node statuses are inferred from the persisted context:
/// nodes with an output are successes; on failed executions the rest is
/// unknowable after the fact and reported as pending.
fn terminal_snapshot(execution: &Execution) -> ExecutionProgress {
    let nodes = execution
        .data
        .as_ref()
        .and_then(Value::as_object)
        .map(|data| {
            data.iter()
                .map(|(node_id, output)| NodeProgress {
                    node_id: node_id.clone(),
                    status: NodeStatus::Success,
                    output: Some(output.clone()),
                    error: None,
                    started_at: None,
                    finished_at: None,
                })
                .collect()
        })
        .unwrap_or_default();

    ExecutionProgress {
        execution_id: execution.id,
        workflow_id: execution.workflow_id,
        status: execution.status,
        nodes,
        error: execution.error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ExecutionStatus;
    use chrono::Utc;

    #[test]
    fn terminal_snapshot_reconstructs_successes_from_context() {
        let execution = Execution {
            id: 9,
            workflow_id: 2,
            status: ExecutionStatus::Completed,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            data: Some(json!({"A": {"x": 1}, "B": {"y": 2}})),
            error: None,
        };

        let snapshot = terminal_snapshot(&execution);
        assert_eq!(snapshot.execution_id, 9);
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(snapshot.nodes.len(), 2);
        assert!(snapshot.nodes.iter().all(|n| n.status == NodeStatus::Success));
    }

    #[test]
    fn terminal_snapshot_keeps_the_error_of_failed_executions() {
        let execution = Execution {
            id: 9,
            workflow_id: 2,
            status: ExecutionStatus::Failed,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            data: None,
            error: Some("Node 'B' failed: boom".to_string()),
        };

        let snapshot = terminal_snapshot(&execution);
        assert_eq!(snapshot.status, ExecutionStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("Node 'B' failed: boom"));
        assert!(snapshot.nodes.is_empty());
    }
}
