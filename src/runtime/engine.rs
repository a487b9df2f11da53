/// Petgraph-based DAG execution engine
///
/// Walks a compiled workflow in topological order. A node runs when it is a
/// root or when an edge into it was activated by a predecessor; control-flow
/// nodes decide which of their outgoing edges activate. Control-flow nodes are
/// delegated to the actions module, which calls back into the running graph
/// for the nodes it owns.

use crate::actions::{
    ActionInput, ActionOutput, CatchAction, ConditionalAction, LoopAction, NodeRuntime, ParallelAction, Route,
    SubWorkflowAction, TryCatchAction, WorkflowInvoker,
};
use crate::config::EngineConfig;
use crate::expression::Evaluator;
use crate::runtime::executor::NodeExecutor;
use crate::workflow::{
    CompiledNode, CompiledWorkflow, ErrorHandlingMetadata, ExecutionContext, ExecutionEnv, ExecutionError, NodeKind,
    WorkflowRegistry,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

/// Terminal state of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Result of running a workflow to completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    /// Output of the last node executed
    pub output: Value,
    pub steps: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorHandlingMetadata>,
    pub duration_ms: u64,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

/// DAG execution engine
///
/// Cheap to clone; all shared state is behind `Arc`.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    registry: Arc<WorkflowRegistry>,
    executor: Arc<NodeExecutor>,
    evaluator: Arc<Evaluator>,
    config: EngineConfig,
}

/// Where a traversal stopped and why
struct NodeFailure {
    node_id: String,
    node_type: &'static str,
    error: ExecutionError,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        executor: Arc<NodeExecutor>,
        evaluator: Arc<Evaluator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            evaluator,
            config,
        }
    }

    /// Build an engine with its own HTTP client from `config`
    pub fn from_config(
        registry: Arc<WorkflowRegistry>,
        evaluator: Arc<Evaluator>,
        config: EngineConfig,
    ) -> anyhow::Result<Self> {
        let executor = Arc::new(NodeExecutor::new(config.http_timeout)?);
        Ok(Self::new(registry, executor, evaluator, config))
    }

    /// Execute a registered workflow.
    ///
    /// Fails up front if the workflow is unknown or owned by another tenant;
    /// failures during the run are reported in the returned outcome.
    pub async fn execute(
        &self,
        workflow_id: &str,
        trigger: Value,
        env: ExecutionEnv,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let workflow = self.resolve(workflow_id, &env.tenant_id)?;
        let context = ExecutionContext::new(trigger, env).with_cancellation(cancel);
        Ok(self.run_compiled(workflow, context).await)
    }

    /// Run an already-resolved workflow with a prepared context.
    pub async fn run_compiled(&self, workflow: Arc<CompiledWorkflow>, mut context: ExecutionContext) -> ExecutionOutcome {
        let started = std::time::Instant::now();
        let execution_id = context.env.execution_id.clone();
        let workflow_id = workflow.id.clone();

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %workflow_id,
            tenant_id = %context.env.tenant_id,
            "🚀 Starting workflow execution ({} nodes)",
            workflow.node_count()
        );

        let run = GraphRun::new(self.clone(), workflow);
        let result = run.traverse(&mut context).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, output, error) = match result {
            Ok(output) => {
                tracing::info!(execution_id = %execution_id, "🎉 Workflow '{}' completed in {}ms", workflow_id, duration_ms);
                (ExecutionStatus::Succeeded, output, None)
            }
            Err(failure) => {
                let status = if matches!(failure.error, ExecutionError::Cancelled) {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Failed
                };
                tracing::error!(
                    execution_id = %execution_id,
                    node_id = %failure.node_id,
                    "❌ Workflow '{}' {:?} at node '{}': {}",
                    workflow_id, status, failure.node_id, failure.error
                );
                let metadata = ErrorHandlingMetadata::from_error(&failure.error, &failure.node_id, failure.node_type);
                (status, Value::Null, Some(metadata))
            }
        };

        ExecutionOutcome {
            execution_id,
            workflow_id,
            status,
            output,
            steps: context.steps,
            error,
            duration_ms,
        }
    }

    /// Look up a workflow visible to `tenant_id`.
    fn resolve(&self, workflow_id: &str, tenant_id: &str) -> Result<Arc<CompiledWorkflow>, ExecutionError> {
        let workflow = self
            .registry
            .get_workflow(workflow_id)
            .ok_or_else(|| ExecutionError::WorkflowNotFound(workflow_id.to_string()))?;
        match &workflow.tenant_id {
            Some(owner) if owner != tenant_id => {
                tracing::warn!("🚫 Tenant '{}' may not run workflow '{}'", tenant_id, workflow_id);
                Err(ExecutionError::WorkflowNotFound(workflow_id.to_string()))
            }
            _ => Ok(workflow),
        }
    }
}

/// One traversal of one workflow; the node runtime handed to actions
struct GraphRun {
    engine: ExecutionEngine,
    workflow: Arc<CompiledWorkflow>,
    this: Weak<GraphRun>,
}

impl GraphRun {
    fn new(engine: ExecutionEngine, workflow: Arc<CompiledWorkflow>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            engine,
            workflow,
            this: this.clone(),
        })
    }

    fn handle(&self) -> Result<Arc<GraphRun>, ExecutionError> {
        // Only fails once the run itself has been dropped.
        self.this.upgrade().ok_or(ExecutionError::Cancelled)
    }

    async fn traverse(&self, ctx: &mut ExecutionContext) -> Result<Value, NodeFailure> {
        let workflow = Arc::clone(&self.workflow);
        let mut activated: HashSet<usize> = HashSet::new();
        let mut last_output = Value::Null;

        for (step_num, node_id) in workflow.execution_order().iter().enumerate() {
            let node_type = workflow.node(node_id).map(|n| n.type_name()).unwrap_or("unknown");
            let failure = |error| NodeFailure {
                node_id: node_id.clone(),
                node_type,
                error,
            };

            if ctx.cancel.is_cancelled() {
                return Err(failure(ExecutionError::Cancelled));
            }

            let reached = workflow.is_root(node_id)
                || workflow.incoming_edges(node_id).iter().any(|edge| activated.contains(edge));
            if !reached {
                tracing::debug!("⏭️ Skipping node '{}': no active incoming edge", node_id);
                continue;
            }

            tracing::debug!("📍 Step {}/{}: node '{}' ({})",
                step_num + 1, workflow.execution_order().len(), node_id, node_type);

            let ActionOutput { output, route } = self.run_node(ctx, node_id).await.map_err(failure)?;
            ctx.record_step(node_id, output.clone());

            for &edge_index in workflow.outgoing_edges(node_id) {
                let follow = match &route {
                    Route::Continue => true,
                    Route::Branch(label) => workflow.edge(edge_index).label.as_deref() == Some(label.as_str()),
                    Route::Stop => false,
                };
                if follow {
                    activated.insert(edge_index);
                }
            }
            last_output = output;
        }

        Ok(last_output)
    }

    async fn run_node(&self, ctx: &mut ExecutionContext, node_id: &str) -> Result<ActionOutput, ExecutionError> {
        let node = self.get_node(node_id)?;
        let engine = &self.engine;

        match &node.kind {
            NodeKind::Conditional(config) => {
                ConditionalAction::new(Arc::clone(&engine.evaluator))
                    .execute(ActionInput { node_id, config, context: ctx })
                    .await
            }
            NodeKind::Try(config) => {
                TryCatchAction::new(self.handle()?)
                    .execute(ActionInput { node_id, config, context: ctx })
                    .await
            }
            NodeKind::Catch(filter) => {
                CatchAction::new(self.handle()?)
                    .execute(ActionInput { node_id, config: filter, context: ctx })
                    .await
            }
            NodeKind::Loop(config) => {
                LoopAction::new(self.handle()?, Arc::clone(&engine.evaluator), engine.config.max_loop_iterations)
                    .execute(ActionInput { node_id, config, context: ctx })
                    .await
            }
            NodeKind::Parallel(config) => {
                ParallelAction::new(self.handle()?, engine.config.max_parallel_branches)
                    .execute(ActionInput { node_id, config, context: ctx })
                    .await
            }
            NodeKind::SubWorkflow(config) => {
                SubWorkflowAction::new(self.handle()?, engine.config.max_subworkflow_depth)
                    .execute(ActionInput { node_id, config, context: ctx })
                    .await
            }
            NodeKind::Trigger(_) | NodeKind::Http(_) | NodeKind::Transform(_) | NodeKind::RaiseError(_) => {
                engine.executor.execute(&node, ctx).await.map(ActionOutput::next)
            }
        }
    }
}

#[async_trait]
impl NodeRuntime for GraphRun {
    async fn execute_node(&self, ctx: &mut ExecutionContext, node_id: &str) -> Result<Value, ExecutionError> {
        if ctx.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        // Owned nodes are never conditionals, so the route carries nothing here.
        let ActionOutput { output, .. } = self.run_node(ctx, node_id).await?;
        ctx.record_step(node_id, output.clone());
        Ok(output)
    }

    fn get_node(&self, node_id: &str) -> Result<Arc<CompiledNode>, ExecutionError> {
        self.workflow
            .node(node_id)
            .cloned()
            .ok_or_else(|| ExecutionError::NodeNotFound(node_id.to_string()))
    }
}

#[async_trait]
impl WorkflowInvoker for GraphRun {
    async fn invoke(&self, workflow_id: &str, mut ctx: ExecutionContext) -> Result<Value, ExecutionError> {
        let workflow = self.engine.resolve(workflow_id, &ctx.env.tenant_id)?;
        let child = GraphRun::new(self.engine.clone(), workflow);
        child.traverse(&mut ctx).await.map_err(|failure| match failure.error {
            ExecutionError::Cancelled => ExecutionError::Cancelled,
            error => ExecutionError::NodeFailed(ErrorHandlingMetadata::from_error(
                &error,
                &failure.node_id,
                failure.node_type,
            )),
        })
    }
}
