//! Workflow scheduler: validation, graph traversal, progress emission.
//!
//! Given a workflow document, an execution id, and optional trigger data, the
//! runner validates node configuration, builds the dependency graph, then
//! walks it breadth-first with parent-completion gating: a node is enqueued
//! only once every parent has succeeded, so multi-parent nodes run exactly
//! once, after all of their inputs exist. Nodes run sequentially within one
//! execution; a single failure marks every still-pending descendant skipped
//! and terminates the run. Every state change is pushed to the progress bus
//! and status transitions are persisted through the store facade.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde_json::Value;

use crate::error::ValidationError;
use crate::progress::ProgressBus;
use crate::runtime::executor::NodeExecutor;
use crate::store::{ExecutionUpdate, Store};
use crate::workflow::{
    ExecutionData, ExecutionProgress, ExecutionStatus, Node, NodeKind, NodeProgress, NodeStatus,
    Workflow,
};

/// Drives one execution of a workflow from `pending` to a terminal status.
pub struct WorkflowRunner {
    store: Store,
    executor: Arc<NodeExecutor>,
    bus: Arc<ProgressBus>,
    /// Reject workflows whose edges reference unknown node ids instead of
    /// ignoring those edges.
    strict_graph: bool,
}

/// Adjacency view of the workflow used during traversal.
struct FlowGraph {
    adj: HashMap<String, Vec<String>>,
    parents: HashMap<String, Vec<String>>,
    in_degree: HashMap<String, usize>,
}

impl WorkflowRunner {
    pub fn new(
        store: Store,
        executor: Arc<NodeExecutor>,
        bus: Arc<ProgressBus>,
        strict_graph: bool,
    ) -> Self {
        Self {
            store,
            executor,
            bus,
            strict_graph,
        }
    }

    /// Run the workflow to completion. Never panics or returns an error:
    /// anything that escapes the normal failure paths is recorded on the
    /// execution row with an `Unexpected error:` prefix.
    pub async fn run(&self, workflow: Workflow, execution_id: i64, trigger_data: Option<Value>) {
        if let Err(e) = self.drive(&workflow, execution_id, trigger_data).await {
            let message = format!("Unexpected error: {e}");
            tracing::error!("execution {execution_id}: {message}");

            if let Err(store_err) = self
                .store
                .update_execution(execution_id, ExecutionUpdate::failed(message.clone(), None))
                .await
            {
                tracing::error!(
                    "failed to record failure of execution {execution_id}: {store_err}"
                );
            }

            let nodes = workflow
                .nodes
                .iter()
                .map(|n| NodeProgress::pending(&n.id))
                .collect();
            self.bus.emit(&ExecutionProgress {
                execution_id,
                workflow_id: workflow.id,
                status: ExecutionStatus::Failed,
                nodes,
                error: Some(message),
            });
        }
    }

    async fn drive(
        &self,
        workflow: &Workflow,
        execution_id: i64,
        trigger_data: Option<Value>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            "starting execution {execution_id} of workflow {} ({} nodes, {} edges)",
            workflow.id,
            workflow.nodes.len(),
            workflow.edges.len()
        );

        let mut progress: Vec<NodeProgress> = workflow
            .nodes
            .iter()
            .map(|n| NodeProgress::pending(&n.id))
            .collect();
        let index_of: HashMap<&str, usize> = workflow
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        // Phase 1: static validation, before any handler runs.
        let graph = match validate_workflow(workflow).and_then(|_| build_graph(workflow, self.strict_graph)) {
            Ok(graph) => graph,
            Err(validation) => {
                let message = validation.to_string();
                tracing::warn!("execution {execution_id} rejected: {message}");
                self.store
                    .update_execution(
                        execution_id,
                        ExecutionUpdate::failed(message.clone(), None),
                    )
                    .await?;
                self.emit(execution_id, workflow.id, ExecutionStatus::Failed, &progress, Some(message));
                return Ok(());
            }
        };

        // Phase 3: seed trigger data under webhook start nodes and go live.
        let mut context = ExecutionData::new();
        let start_ids: Vec<String> = workflow
            .nodes
            .iter()
            .filter(|n| graph.in_degree.get(n.id.as_str()).copied() == Some(0))
            .map(|n| n.id.clone())
            .collect();

        if let Some(trigger) = &trigger_data {
            for node in &workflow.nodes {
                if node.kind == NodeKind::Webhook && start_ids.contains(&node.id) {
                    context.insert(node.id.clone(), trigger.clone());
                }
            }
        }

        self.store
            .update_execution(execution_id, ExecutionUpdate::running())
            .await?;
        self.emit(execution_id, workflow.id, ExecutionStatus::Running, &progress, None);

        // Phase 4: breadth-first traversal with parent-completion gating.
        let mut queue: VecDeque<String> = start_ids.into();
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(current_id) = queue.pop_front() {
            if visited.contains(&current_id) {
                continue;
            }
            let Some(&index) = index_of.get(current_id.as_str()) else {
                continue;
            };
            let node = &workflow.nodes[index];

            progress[index].status = NodeStatus::Running;
            progress[index].started_at = Some(Utc::now());
            self.emit(execution_id, workflow.id, ExecutionStatus::Running, &progress, None);

            match self.executor.execute(node, &context).await {
                Ok(output) => {
                    context.insert(node.id.clone(), output.clone());
                    progress[index].status = NodeStatus::Success;
                    progress[index].output = Some(output);
                    progress[index].finished_at = Some(Utc::now());
                    visited.insert(current_id.clone());
                    self.emit(execution_id, workflow.id, ExecutionStatus::Running, &progress, None);

                    if let Some(children) = graph.adj.get(&current_id) {
                        for child in children {
                            let ready = graph
                                .parents
                                .get(child)
                                .is_some_and(|ps| ps.iter().all(|p| visited.contains(p)));
                            if ready && !visited.contains(child) {
                                queue.push_back(child.clone());
                            }
                        }
                    }
                }
                Err(handler_error) => {
                    let node_error = handler_error.to_string();
                    progress[index].status = NodeStatus::Error;
                    progress[index].error = Some(node_error.clone());
                    progress[index].finished_at = Some(Utc::now());

                    mark_downstream_skipped(&graph, &current_id, &index_of, &mut progress);

                    let message = format!("Node '{}' failed: {node_error}", node.id);
                    tracing::warn!("execution {execution_id} failed: {message}");

                    // Best effort: a store refusal must not mask the node error.
                    if let Err(store_err) = self
                        .store
                        .update_execution(
                            execution_id,
                            ExecutionUpdate::failed(
                                message.clone(),
                                Some(Value::Object(context.clone())),
                            ),
                        )
                        .await
                    {
                        tracing::error!(
                            "failed to persist failure of execution {execution_id}: {store_err}"
                        );
                    }

                    self.emit(execution_id, workflow.id, ExecutionStatus::Failed, &progress, Some(message));
                    return Ok(());
                }
            }
        }

        // Phase 5: every reachable node ran; finalize.
        self.store
            .update_execution(
                execution_id,
                ExecutionUpdate::completed(Value::Object(context.clone())),
            )
            .await?;
        self.emit(execution_id, workflow.id, ExecutionStatus::Completed, &progress, None);

        tracing::info!("execution {execution_id} completed");
        Ok(())
    }

    fn emit(
        &self,
        execution_id: i64,
        workflow_id: i64,
        status: ExecutionStatus,
        nodes: &[NodeProgress],
        error: Option<String>,
    ) {
        self.bus.emit(&ExecutionProgress {
            execution_id,
            workflow_id,
            status,
            nodes: nodes.to_vec(),
            error,
        });
    }
}

/// Kind-specific required fields, checked before any node executes.
fn validate_workflow(workflow: &Workflow) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for node in &workflow.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(ValidationError {
                node_id: node.id.clone(),
                message: "Duplicate node id".to_string(),
            });
        }

        let required: &[&str] = match &node.kind {
            NodeKind::HttpRequest => &["url"],
            NodeKind::Code => &["code"],
            NodeKind::Database => &["connectionString", "query"],
            NodeKind::Email => &["to", "subject", "body"],
            NodeKind::AiChat => {
                if !has_field(node, "prompt") && !has_field(node, "systemPrompt") {
                    return Err(ValidationError::missing_field(&node.id, "prompt or systemPrompt"));
                }
                &[]
            }
            NodeKind::Webhook | NodeKind::Other(_) => &[],
        };

        for field in required {
            if !has_field(node, field) {
                return Err(ValidationError::missing_field(&node.id, field));
            }
        }
    }
    Ok(())
}

fn has_field(node: &Node, field: &str) -> bool {
    match node.data.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Build adjacency, parent lists and in-degrees, and reject cyclic graphs.
///
/// Edges referencing unknown node ids are ignored with a warning, unless
/// strict mode turns them into validation failures.
fn build_graph(workflow: &Workflow, strict: bool) -> Result<FlowGraph, ValidationError> {
    let ids: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();

    let mut adj: HashMap<String, Vec<String>> = HashMap::new();
    let mut parents: HashMap<String, Vec<String>> = HashMap::new();
    let mut in_degree: HashMap<String, usize> = HashMap::new();
    for node in &workflow.nodes {
        adj.insert(node.id.clone(), Vec::new());
        parents.insert(node.id.clone(), Vec::new());
        in_degree.insert(node.id.clone(), 0);
    }

    for edge in &workflow.edges {
        let unknown = [&edge.source, &edge.target]
            .into_iter()
            .find(|id| !ids.contains(id.as_str()));
        if let Some(id) = unknown {
            if strict {
                return Err(ValidationError {
                    node_id: id.clone(),
                    message: format!("Edge '{}' references unknown node", edge.id),
                });
            }
            tracing::warn!(
                "edge '{}' references unknown node '{id}'; ignoring",
                edge.id
            );
            continue;
        }

        adj.entry(edge.source.clone())
            .or_default()
            .push(edge.target.clone());
        parents
            .entry(edge.target.clone())
            .or_default()
            .push(edge.source.clone());
        *in_degree.entry(edge.target.clone()).or_insert(0) += 1;
    }

    // Cycle rejection via topological sort over the known edges.
    let mut pg = DiGraph::<&str, ()>::new();
    let mut pg_index = HashMap::new();
    for node in &workflow.nodes {
        pg_index.insert(node.id.as_str(), pg.add_node(node.id.as_str()));
    }
    for (source, targets) in &adj {
        for target in targets {
            pg.add_edge(pg_index[source.as_str()], pg_index[target.as_str()], ());
        }
    }
    if let Err(cycle) = toposort(&pg, None) {
        return Err(ValidationError {
            node_id: pg[cycle.node_id()].to_string(),
            message: "Workflow graph contains a cycle".to_string(),
        });
    }

    Ok(FlowGraph {
        adj,
        parents,
        in_degree,
    })
}

/// Mark every node reachable from `failed_id` as skipped, but only while it
/// is still pending: a status that already ran is never rewritten.
fn mark_downstream_skipped(
    graph: &FlowGraph,
    failed_id: &str,
    index_of: &HashMap<&str, usize>,
    progress: &mut [NodeProgress],
) {
    let mut stack: Vec<&str> = graph
        .adj
        .get(failed_id)
        .map(|children| children.iter().map(String::as_str).collect())
        .unwrap_or_default();
    let mut seen: HashSet<&str> = HashSet::new();

    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(&index) = index_of.get(current) {
            if progress[index].status == NodeStatus::Pending {
                progress[index].status = NodeStatus::Skipped;
            }
        }
        if let Some(children) = graph.adj.get(current) {
            stack.extend(children.iter().map(String::as_str));
        }
    }
}
