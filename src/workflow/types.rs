//! Core workflow type definitions.
//!
//! Defines the structures the visual editor persists (workflows, nodes, edges)
//! and the runtime records built on top of them (executions, progress
//! snapshots). All JSON field names follow the editor's camelCase convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-execution context: node id mapped to the output that node produced.
///
/// Downstream nodes read their ancestors' outputs from here; each node writes
/// only its own id. A `serde_json::Map` keeps iteration deterministic and
/// serializes directly into the execution row's `data` column.
pub type ExecutionData = Map<String, Value>;

/// A complete workflow definition containing nodes and their connections.
///
/// Workflows are stored as JSON in SQLite and compiled into a dependency
/// graph at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Stable numeric identifier assigned by the store
    pub id: i64,
    /// Human-readable workflow name
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Inactive workflows are kept but not offered for execution
    pub is_active: bool,
    /// Nodes in this workflow; ids are unique within the workflow
    pub nodes: Vec<Node>,
    /// Directed edges; `target` runs only after `source` succeeded
    pub edges: Vec<Edge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the workflow (e.g. "node-1")
    pub id: String,
    /// Node kind, which determines execution behavior
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Opaque editor layout metadata, passed through untouched
    #[serde(default)]
    pub position: Value,
    /// Kind-specific configuration (url, code, query, ...)
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// The closed set of node kinds the engine dispatches on.
///
/// Unknown kind strings deserialize into `Other` so workflows persisted by a
/// newer editor still load; the executor handles that arm with a permissive
/// echo instead of failing the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    /// Entry point; returns pre-seeded trigger data or a synthetic stub
    Webhook,
    /// Outbound HTTP call returning `{statusCode, headers, body, ok}`
    HttpRequest,
    /// User script run in the ECMAScript sandbox
    Code,
    /// Chat-completions call against the configured LLM provider
    AiChat,
    /// SQL query over a per-invocation PostgreSQL connection
    Database,
    /// Mail delivery via Gmail OAuth or SMTP fallback
    Email,
    /// Forward-compatible fallback for kinds this engine doesn't know
    Other(String),
}

impl From<String> for NodeKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "webhook" => NodeKind::Webhook,
            "http-request" => NodeKind::HttpRequest,
            "code" => NodeKind::Code,
            "ai-chat" => NodeKind::AiChat,
            "database" => NodeKind::Database,
            "email" => NodeKind::Email,
            _ => NodeKind::Other(s),
        }
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl NodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Webhook => "webhook",
            NodeKind::HttpRequest => "http-request",
            NodeKind::Code => "code",
            NodeKind::AiChat => "ai-chat",
            NodeKind::Database => "database",
            NodeKind::Email => "email",
            NodeKind::Other(s) => s,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed connection between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    /// Source node id
    pub source: String,
    /// Target node id; may execute only after `source` has succeeded
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

/// Lifecycle state of an execution row.
///
/// `Completed` and `Failed` are terminal; a terminal execution is never
/// mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// A persisted run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: i64,
    pub workflow_id: i64,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Final context on terminal executions: node id mapped to output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A stored credential. `data` only ever holds ciphertext produced by the
/// credential cipher; plaintext never reaches the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
    pub created_at: DateTime<Utc>,
}

/// Per-node state within an in-flight execution.
///
/// Statuses advance `pending -> running -> {success|error}`; `skipped` is
/// applied to pending descendants of a failed node and never overwrites a
/// terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Error,
    Skipped,
}

/// Progress entry for a single node, part of every progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProgress {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeProgress {
    pub fn pending(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: NodeStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Full snapshot of an execution's state, broadcast on every scheduler
/// transition and discarded once the execution terminates. Contains exactly
/// one entry per workflow node from the first emit onwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProgress {
    pub execution_id: i64,
    pub workflow_id: i64,
    pub status: ExecutionStatus,
    pub nodes: Vec<NodeProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
