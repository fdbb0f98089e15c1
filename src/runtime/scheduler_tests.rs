//! End-to-end scheduler tests.
//!
//! These run whole workflows through the real runner with an in-memory
//! store. Node kinds are limited to webhook, code, and unknown-kind
//! fallbacks so no network access is required; handler-specific behavior
//! against live services is covered by the handlers' own unit tests.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use crate::config::Config;
use crate::crypto::CredentialCipher;
use crate::oauth::GmailOAuth;
use crate::progress::{ProgressBus, ProgressSubscription};
use crate::runtime::{NodeExecutor, WorkflowRunner};
use crate::store::Store;
use crate::workflow::{
    Edge, ExecutionProgress, ExecutionStatus, Node, NodeKind, NodeStatus, Workflow,
};

fn node(id: &str, kind: &str, data: Value) -> Node {
    Node {
        id: id.to_string(),
        kind: NodeKind::from(kind.to_string()),
        position: Value::Null,
        data: data.as_object().cloned().unwrap_or_default(),
    }
}

fn edge(source: &str, target: &str) -> Edge {
    Edge {
        id: format!("{source}-{target}"),
        source: source.to_string(),
        target: target.to_string(),
        source_handle: None,
        target_handle: None,
    }
}

fn workflow(nodes: Vec<Node>, edges: Vec<Edge>) -> Workflow {
    let now = Utc::now();
    Workflow {
        id: 1,
        name: "test".to_string(),
        description: String::new(),
        is_active: true,
        nodes,
        edges,
        created_at: now,
        updated_at: now,
    }
}

async fn harness(strict: bool) -> (WorkflowRunner, Store, Arc<ProgressBus>) {
    let store = Store::connect_in_memory().await.unwrap();
    let cipher = Arc::new(CredentialCipher::from_passphrase("scheduler-tests").unwrap());
    let oauth = Arc::new(GmailOAuth::new());
    let config = Config::default();
    let executor = Arc::new(NodeExecutor::new(&config, store.clone(), cipher, oauth));
    let bus = Arc::new(ProgressBus::new());
    let runner = WorkflowRunner::new(store.clone(), executor, Arc::clone(&bus), strict);
    (runner, store, bus)
}

fn drain(subscription: &mut ProgressSubscription) -> Vec<ExecutionProgress> {
    let mut snapshots = Vec::new();
    while let Some(snapshot) = subscription.try_recv() {
        snapshots.push(snapshot);
    }
    snapshots
}

fn status_of(snapshot: &ExecutionProgress, node_id: &str) -> NodeStatus {
    snapshot
        .nodes
        .iter()
        .find(|n| n.node_id == node_id)
        .unwrap_or_else(|| panic!("no progress entry for {node_id}"))
        .status
}

#[tokio::test]
async fn linear_workflow_runs_to_completion_with_trigger_data() {
    let (runner, store, _bus) = harness(false).await;
    let wf = workflow(
        vec![
            node("A", "webhook", json!({})),
            node(
                "B",
                "code",
                json!({"code": "return {doubled: items.find(i => i.nodeId === 'A').json.n * 2}"}),
            ),
        ],
        vec![edge("A", "B")],
    );
    let execution = store.create_execution(wf.id).await.unwrap();

    runner.run(wf, execution.id, Some(json!({"n": 3}))).await;

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
    assert!(row.finished_at.is_some());
    assert_eq!(row.error, None);

    let data = row.data.unwrap();
    assert_eq!(data["A"], json!({"n": 3}));
    assert_eq!(data["B"], json!({"doubled": 6}));
}

#[tokio::test]
async fn webhook_without_trigger_returns_synthetic_stub() {
    let (runner, store, _bus) = harness(false).await;
    let wf = workflow(vec![node("A", "webhook", json!({}))], vec![]);
    let execution = store.create_execution(wf.id).await.unwrap();

    runner.run(wf, execution.id, None).await;

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
    let data = row.data.unwrap();
    assert_eq!(data["A"]["received"], json!(true));
    assert!(data["A"]["timestamp"].is_string());
}

#[tokio::test]
async fn diamond_waits_for_both_parents_and_resolves_templates() {
    let (runner, store, bus) = harness(false).await;
    let wf = workflow(
        vec![
            node("A", "webhook", json!({})),
            node(
                "B",
                "code",
                json!({"code": "return {v: items.find(i => i.nodeId === 'A').json.n * 2}"}),
            ),
            node(
                "C",
                "code",
                json!({"code": "return {v: items.find(i => i.nodeId === 'A').json.n + 1}"}),
            ),
            // Unknown kind: the fallback echoes resolved data, which lets the
            // test observe template resolution without network access.
            node("D", "annotate", json!({"url": "https://example.test/{{B.v}}/{{C.v}}"})),
        ],
        vec![edge("A", "B"), edge("A", "C"), edge("B", "D"), edge("C", "D")],
    );
    let execution = store.create_execution(wf.id).await.unwrap();
    let mut subscription = bus.clone().subscribe(execution.id);

    runner.run(wf, execution.id, Some(json!({"n": 3}))).await;

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);

    let data = row.data.unwrap();
    assert_eq!(data["B"], json!({"v": 6}));
    assert_eq!(data["C"], json!({"v": 4}));
    assert_eq!(data["D"]["url"], json!("https://example.test/6/4"));
    assert_eq!(data["D"]["executed"], json!(true));
    assert_eq!(data["D"]["nodeType"], json!("annotate"));

    // D ran exactly once, and only after both B and C had finished.
    let snapshots = drain(&mut subscription);
    let d_running = snapshots
        .iter()
        .filter(|s| status_of(s, "D") == NodeStatus::Running)
        .count();
    assert_eq!(d_running, 1);
    let first_d_running = snapshots
        .iter()
        .position(|s| status_of(s, "D") == NodeStatus::Running)
        .unwrap();
    assert_eq!(status_of(&snapshots[first_d_running], "B"), NodeStatus::Success);
    assert_eq!(status_of(&snapshots[first_d_running], "C"), NodeStatus::Success);
}

#[tokio::test]
async fn mid_graph_failure_skips_all_downstream_nodes() {
    let (runner, store, bus) = harness(false).await;
    let wf = workflow(
        vec![
            node("A", "webhook", json!({})),
            node("B", "code", json!({"code": "throw new Error('boom')"})),
            node("C", "code", json!({"code": "return {ok: true}"})),
            node("D", "code", json!({"code": "return {ok: true}"})),
        ],
        vec![edge("A", "B"), edge("B", "C"), edge("C", "D")],
    );
    let execution = store.create_execution(wf.id).await.unwrap();
    let mut subscription = bus.clone().subscribe(execution.id);

    runner.run(wf, execution.id, Some(json!({"x": 1}))).await;

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    let error = row.error.unwrap();
    assert!(error.contains("'B'"), "error should name the node: {error}");
    assert!(error.contains("boom"), "error should carry the cause: {error}");

    let snapshots = drain(&mut subscription);
    let last = snapshots.last().unwrap();
    assert_eq!(last.status, ExecutionStatus::Failed);
    assert_eq!(status_of(last, "A"), NodeStatus::Success);
    assert_eq!(status_of(last, "B"), NodeStatus::Error);
    assert_eq!(status_of(last, "C"), NodeStatus::Skipped);
    assert_eq!(status_of(last, "D"), NodeStatus::Skipped);

    // The partial context (A's output) is still persisted.
    let data = row.data.unwrap();
    assert_eq!(data["A"], json!({"x": 1}));
    assert!(data.get("B").is_none());

    // C was skipped without ever running.
    assert!(snapshots
        .iter()
        .all(|s| status_of(s, "C") != NodeStatus::Running));
}

#[tokio::test]
async fn validation_failure_rejects_before_any_handler_runs() {
    let (runner, store, bus) = harness(false).await;
    let wf = workflow(
        vec![
            node("A", "webhook", json!({})),
            node("db-1", "database", json!({"connectionString": "postgres://localhost/x"})),
        ],
        vec![edge("A", "db-1")],
    );
    let execution = store.create_execution(wf.id).await.unwrap();
    let mut subscription = bus.clone().subscribe(execution.id);

    runner.run(wf, execution.id, None).await;

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    assert_eq!(
        row.error.unwrap(),
        "Validation error: [db-1] Missing required field: query"
    );
    assert!(row.data.is_none());

    // A single failed snapshot with every node still pending.
    let snapshots = drain(&mut subscription);
    assert_eq!(snapshots.len(), 1);
    let only = &snapshots[0];
    assert_eq!(only.status, ExecutionStatus::Failed);
    assert!(only
        .nodes
        .iter()
        .all(|n| n.status == NodeStatus::Pending));
}

#[tokio::test]
async fn progress_stream_is_ordered_and_monotonic() {
    let (runner, store, bus) = harness(false).await;
    let wf = workflow(
        vec![
            node("A", "webhook", json!({})),
            node("B", "code", json!({"code": "return {done: true}"})),
        ],
        vec![edge("A", "B")],
    );
    let execution = store.create_execution(wf.id).await.unwrap();
    let mut subscription = bus.clone().subscribe(execution.id);

    runner.run(wf, execution.id, Some(json!({"x": 1}))).await;

    let snapshots = drain(&mut subscription);
    assert!(snapshots.len() >= 6);

    // Initial running snapshot: everything still pending.
    assert_eq!(snapshots[0].status, ExecutionStatus::Running);
    assert_eq!(status_of(&snapshots[0], "A"), NodeStatus::Pending);
    assert_eq!(status_of(&snapshots[0], "B"), NodeStatus::Pending);

    // Terminal snapshot: everything succeeded.
    let last = snapshots.last().unwrap();
    assert_eq!(last.status, ExecutionStatus::Completed);
    assert_eq!(status_of(last, "A"), NodeStatus::Success);
    assert_eq!(status_of(last, "B"), NodeStatus::Success);

    // Per-node status sequences are prefixes of pending->running->success.
    for node_id in ["A", "B"] {
        let mut rank = 0;
        for snapshot in &snapshots {
            let status = status_of(snapshot, node_id);
            let next = match status {
                NodeStatus::Pending => 0,
                NodeStatus::Running => 1,
                NodeStatus::Success => 2,
                other => panic!("unexpected status {other:?} for {node_id}"),
            };
            assert!(next >= rank, "status went backwards for {node_id}");
            rank = next;
        }
        assert_eq!(rank, 2);
    }

    // Every snapshot carries exactly one entry per workflow node.
    assert!(snapshots.iter().all(|s| s.nodes.len() == 2));
}

#[tokio::test]
async fn trigger_data_only_seeds_webhook_start_nodes() {
    let (runner, store, _bus) = harness(false).await;
    let wf = workflow(
        vec![
            node("hook", "webhook", json!({})),
            node("calc", "code", json!({"code": "return {items: items.length}"})),
        ],
        vec![],
    );
    let execution = store.create_execution(wf.id).await.unwrap();

    runner.run(wf, execution.id, Some(json!({"n": 1}))).await;

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    let data = row.data.unwrap();
    assert_eq!(data["hook"], json!({"n": 1}));
    // The code start node saw only the seeded webhook entry in its context.
    assert_eq!(data["calc"], json!({"items": 1}));
}

#[tokio::test]
async fn unknown_edge_references_are_ignored_by_default() {
    let (runner, store, _bus) = harness(false).await;
    let wf = workflow(
        vec![node("A", "webhook", json!({}))],
        vec![edge("A", "ghost"), edge("phantom", "A")],
    );
    let execution = store.create_execution(wf.id).await.unwrap();

    runner.run(wf, execution.id, None).await;

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn strict_mode_rejects_unknown_edge_references() {
    let (runner, store, _bus) = harness(true).await;
    let wf = workflow(vec![node("A", "webhook", json!({}))], vec![edge("A", "ghost")]);
    let execution = store.create_execution(wf.id).await.unwrap();

    runner.run(wf, execution.id, None).await;

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    assert!(row.error.unwrap().contains("unknown node"));
}

#[tokio::test]
async fn cyclic_workflows_are_rejected() {
    let (runner, store, _bus) = harness(false).await;
    let wf = workflow(
        vec![
            node("A", "code", json!({"code": "return 1"})),
            node("B", "code", json!({"code": "return 2"})),
        ],
        vec![edge("A", "B"), edge("B", "A")],
    );
    let execution = store.create_execution(wf.id).await.unwrap();

    runner.run(wf, execution.id, None).await;

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    assert!(row.error.unwrap().contains("cycle"));
}

#[tokio::test]
async fn duplicate_node_ids_are_rejected() {
    let (runner, store, _bus) = harness(false).await;
    let wf = workflow(
        vec![node("A", "webhook", json!({})), node("A", "webhook", json!({}))],
        vec![],
    );
    let execution = store.create_execution(wf.id).await.unwrap();

    runner.run(wf, execution.id, None).await;

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    assert!(row.error.unwrap().contains("Duplicate node id"));
}

#[tokio::test]
async fn completed_context_contains_exactly_the_workflow_node_ids() {
    let (runner, store, _bus) = harness(false).await;
    let wf = workflow(
        vec![
            node("A", "webhook", json!({})),
            node("B", "code", json!({"code": "return {b: 1}"})),
            node("C", "code", json!({"code": "return {c: 2}"})),
        ],
        vec![edge("A", "B"), edge("A", "C")],
    );
    let execution = store.create_execution(wf.id).await.unwrap();

    runner.run(wf, execution.id, Some(json!({}))).await;

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
    let data = row.data.unwrap();
    let mut keys: Vec<&str> = data.as_object().unwrap().keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["A", "B", "C"]);
}
