//! SQLite persistence facade.
//!
//! The only boundary the scheduler and API talk to for workflows, executions
//! and credentials. Workflow graphs are stored as a JSON `definition` column
//! next to indexed metadata columns; executions and credentials are flat
//! rows. Timestamps are RFC 3339 strings so rows round-trip through serde
//! without driver-specific date handling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;

use crate::workflow::{Credential, Edge, Execution, ExecutionStatus, Node, Workflow};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// New or replacement workflow content, as accepted by the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

fn default_active() -> bool {
    true
}

/// Listing row for workflows; the graph itself stays in the definition column.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied to an execution row. Unset fields keep their
/// current value, which makes identical payloads idempotent.
#[derive(Debug, Default, Clone)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub finished_at: Option<DateTime<Utc>>,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ExecutionUpdate {
    pub fn running() -> Self {
        Self {
            status: Some(ExecutionStatus::Running),
            ..Self::default()
        }
    }

    pub fn completed(data: Value) -> Self {
        Self {
            status: Some(ExecutionStatus::Completed),
            finished_at: Some(Utc::now()),
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn failed(error: String, data: Option<Value>) -> Self {
        Self {
            status: Some(ExecutionStatus::Failed),
            finished_at: Some(Utc::now()),
            data,
            error: Some(error),
        }
    }
}

/// The JSON payload of the `definition` column.
#[derive(Debug, Serialize, Deserialize)]
struct WorkflowDefinition {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

/// SQLite-backed store, cheap to clone (shares the connection pool).
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database file and prepare the schema.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same ephemeral database.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                is_active INTEGER NOT NULL DEFAULT 1,
                definition JSON NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id INTEGER NOT NULL REFERENCES workflows(id),
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                data JSON,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ----- workflows -----

    pub async fn create_workflow(&self, draft: WorkflowDraft) -> Result<Workflow, StoreError> {
        let now = Utc::now();
        let definition = serde_json::to_string(&WorkflowDefinition {
            nodes: draft.nodes,
            edges: draft.edges,
        })
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflows (name, description, is_active, definition, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(draft.is_active)
        .bind(&definition)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_workflow(id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("workflow {id} vanished after insert")))
    }

    pub async fn get_workflow(&self, id: i64) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, description, is_active, definition, created_at, updated_at \
             FROM workflows WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(workflow_from_row).transpose()
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, description, is_active, created_at, updated_at \
             FROM workflows ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(WorkflowSummary {
                    id: row.get("id"),
                    name: row.get("name"),
                    description: row.get("description"),
                    is_active: row.get::<i64, _>("is_active") != 0,
                    created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
                    updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
                })
            })
            .collect()
    }

    /// Replace a workflow's content; returns `None` when the id is unknown.
    pub async fn update_workflow(
        &self,
        id: i64,
        draft: WorkflowDraft,
    ) -> Result<Option<Workflow>, StoreError> {
        let definition = serde_json::to_string(&WorkflowDefinition {
            nodes: draft.nodes,
            edges: draft.edges,
        })
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET name = ?, description = ?, is_active = ?, definition = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(draft.is_active)
        .bind(&definition)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_workflow(id).await
    }

    /// Delete a workflow and its executions (children first).
    pub async fn delete_workflow(&self, id: i64) -> Result<bool, StoreError> {
        sqlx::query("DELETE FROM executions WHERE workflow_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ----- executions -----

    /// Insert a fresh `pending` execution row.
    pub async fn create_execution(&self, workflow_id: i64) -> Result<Execution, StoreError> {
        let started_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO executions (workflow_id, status, started_at) VALUES (?, ?, ?)",
        )
        .bind(workflow_id)
        .bind(ExecutionStatus::Pending.as_str())
        .bind(started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Execution {
            id: result.last_insert_rowid(),
            workflow_id,
            status: ExecutionStatus::Pending,
            started_at,
            finished_at: None,
            data: None,
            error: None,
        })
    }

    pub async fn update_execution(
        &self,
        id: i64,
        update: ExecutionUpdate,
    ) -> Result<(), StoreError> {
        let data = update
            .data
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE executions
            SET status = COALESCE(?, status),
                finished_at = COALESCE(?, finished_at),
                data = COALESCE(?, data),
                error = COALESCE(?, error)
            WHERE id = ?
            "#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.finished_at.map(|t| t.to_rfc3339()))
        .bind(data)
        .bind(update.error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_execution(&self, id: i64) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query(
            "SELECT id, workflow_id, status, started_at, finished_at, data, error \
             FROM executions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(execution_from_row).transpose()
    }

    pub async fn list_executions(
        &self,
        workflow_id: Option<i64>,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = match workflow_id {
            Some(wf) => {
                sqlx::query(
                    "SELECT id, workflow_id, status, started_at, finished_at, data, error \
                     FROM executions WHERE workflow_id = ? ORDER BY id DESC",
                )
                .bind(wf)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, workflow_id, status, started_at, finished_at, data, error \
                     FROM executions ORDER BY id DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(execution_from_row).collect()
    }

    // ----- credentials -----

    /// Store a credential; `ciphertext` must already be encrypted.
    pub async fn create_credential(
        &self,
        name: &str,
        kind: &str,
        ciphertext: &str,
    ) -> Result<Credential, StoreError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO credentials (name, type, data, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(kind)
        .bind(ciphertext)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Credential {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            kind: kind.to_string(),
            data: ciphertext.to_string(),
            created_at,
        })
    }

    pub async fn get_credential(&self, id: i64) -> Result<Option<Credential>, StoreError> {
        let row = sqlx::query("SELECT id, name, type, data, created_at FROM credentials WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(credential_from_row).transpose()
    }

    pub async fn get_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        let rows = sqlx::query("SELECT id, name, type, data, created_at FROM credentials ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(credential_from_row).collect()
    }

    /// Replace a credential's ciphertext (e.g. after a token refresh).
    pub async fn update_credential(&self, id: i64, ciphertext: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE credentials SET data = ? WHERE id = ?")
            .bind(ciphertext)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_credential(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM credentials WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn workflow_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Workflow, StoreError> {
    let definition: WorkflowDefinition =
        serde_json::from_str(&row.get::<String, _>("definition"))
            .map_err(|e| StoreError::Corrupt(format!("workflow definition: {e}")))?;

    Ok(Workflow {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        is_active: row.get::<i64, _>("is_active") != 0,
        nodes: definition.nodes,
        edges: definition.edges,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}

fn execution_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Execution, StoreError> {
    let status_raw: String = row.get("status");
    let status = ExecutionStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown execution status '{status_raw}'")))?;

    let data = row
        .get::<Option<String>, _>("data")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("execution data: {e}")))?;

    Ok(Execution {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        status,
        started_at: parse_timestamp(&row.get::<String, _>("started_at"))?,
        finished_at: row
            .get::<Option<String>, _>("finished_at")
            .map(|s| parse_timestamp(&s))
            .transpose()?,
        data,
        error: row.get("error"),
    })
}

fn credential_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Credential, StoreError> {
    Ok(Credential {
        id: row.get("id"),
        name: row.get("name"),
        kind: row.get("type"),
        data: row.get("data"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::NodeKind;
    use serde_json::json;

    fn draft(name: &str) -> WorkflowDraft {
        WorkflowDraft {
            name: name.to_string(),
            description: "test workflow".into(),
            is_active: true,
            nodes: vec![Node {
                id: "start".into(),
                kind: NodeKind::Webhook,
                position: json!({"x": 0, "y": 0}),
                data: serde_json::Map::new(),
            }],
            edges: vec![],
        }
    }

    #[tokio::test]
    async fn workflow_crud_round_trip() {
        let store = Store::connect_in_memory().await.unwrap();

        let created = store.create_workflow(draft("first")).await.unwrap();
        assert_eq!(created.name, "first");
        assert_eq!(created.nodes.len(), 1);
        assert_eq!(created.nodes[0].kind, NodeKind::Webhook);

        let loaded = store.get_workflow(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.nodes[0].id, "start");

        let mut replacement = draft("renamed");
        replacement.is_active = false;
        let updated = store
            .update_workflow(created.id, replacement)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert!(!updated.is_active);

        let all = store.list_workflows().await.unwrap();
        assert_eq!(all.len(), 1);

        assert!(store.delete_workflow(created.id).await.unwrap());
        assert!(store.get_workflow(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_missing_workflow_returns_none() {
        let store = Store::connect_in_memory().await.unwrap();
        assert!(store.update_workflow(99, draft("x")).await.unwrap().is_none());
        assert!(!store.delete_workflow(99).await.unwrap());
    }

    #[tokio::test]
    async fn execution_lifecycle_and_idempotent_update() {
        let store = Store::connect_in_memory().await.unwrap();
        let workflow = store.create_workflow(draft("wf")).await.unwrap();

        let execution = store.create_execution(workflow.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);

        store
            .update_execution(execution.id, ExecutionUpdate::running())
            .await
            .unwrap();

        let update = ExecutionUpdate::completed(json!({"start": {"ok": true}}));
        store.update_execution(execution.id, update.clone()).await.unwrap();
        // Identical payload applied twice leaves the row unchanged.
        store.update_execution(execution.id, update).await.unwrap();

        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert!(row.finished_at.is_some());
        assert_eq!(row.data, Some(json!({"start": {"ok": true}})));
        assert_eq!(row.error, None);
    }

    #[tokio::test]
    async fn deleting_a_workflow_cascades_to_executions() {
        let store = Store::connect_in_memory().await.unwrap();
        let workflow = store.create_workflow(draft("wf")).await.unwrap();
        let execution = store.create_execution(workflow.id).await.unwrap();

        store.delete_workflow(workflow.id).await.unwrap();
        assert!(store.get_execution(execution.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn credential_round_trip() {
        let store = Store::connect_in_memory().await.unwrap();

        let created = store
            .create_credential("Gmail (me@example.test)", "gmail-oauth", "opaque-token")
            .await
            .unwrap();

        let loaded = store.get_credential(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.kind, "gmail-oauth");
        assert_eq!(loaded.data, "opaque-token");

        store.update_credential(created.id, "rotated").await.unwrap();
        let rotated = store.get_credential(created.id).await.unwrap().unwrap();
        assert_eq!(rotated.data, "rotated");

        assert_eq!(store.get_credentials().await.unwrap().len(), 1);
        assert!(store.delete_credential(created.id).await.unwrap());
        assert!(store.get_credential(created.id).await.unwrap().is_none());
    }
}
