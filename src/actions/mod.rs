/// Control-flow actions
///
/// Each action implements one `control:*` node kind. Actions never walk the
/// graph themselves: they run the nodes they own through a [`NodeRuntime`]
/// supplied at construction, which keeps them testable against fakes.

pub mod catch;
pub mod conditional;
pub mod loops;
pub mod parallel;
pub mod subworkflow;
pub mod try_catch;

use crate::workflow::{CompiledNode, ExecutionContext, ExecutionError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

pub use catch::CatchAction;
pub use conditional::ConditionalAction;
pub use loops::LoopAction;
pub use parallel::ParallelAction;
pub use subworkflow::SubWorkflowAction;
pub use try_catch::TryCatchAction;

/// Node execution and lookup, provided by the graph interpreter.
#[async_trait]
pub trait NodeRuntime: Send + Sync {
    /// Execute one node and record its output in `ctx` under the node's ID.
    async fn execute_node(
        &self,
        ctx: &mut ExecutionContext,
        node_id: &str,
    ) -> Result<Value, ExecutionError>;

    /// Resolve a node of the current workflow by ID.
    fn get_node(&self, node_id: &str) -> Result<Arc<CompiledNode>, ExecutionError>;
}

/// Runs a nested workflow to completion and returns its terminal output.
#[async_trait]
pub trait WorkflowInvoker: Send + Sync {
    async fn invoke(
        &self,
        workflow_id: &str,
        ctx: ExecutionContext,
    ) -> Result<Value, ExecutionError>;
}

/// What an action receives: its node, typed config and the live context.
pub struct ActionInput<'a, C> {
    pub node_id: &'a str,
    pub config: &'a C,
    pub context: &'a mut ExecutionContext,
}

/// Which outgoing edges the interpreter follows after a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Follow every outgoing edge
    Continue,
    /// Follow only edges with this label
    Branch(String),
    /// Follow nothing; downstream nodes are skipped unless reached another way
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutput {
    pub output: Value,
    pub route: Route,
}

impl ActionOutput {
    pub fn next(output: Value) -> Self {
        Self {
            output,
            route: Route::Continue,
        }
    }
}

/// Execute `node_ids` in order, stopping at the first failure.
///
/// Returns each node's output keyed by node ID.
pub(crate) async fn run_nodes(
    runtime: &dyn NodeRuntime,
    ctx: &mut ExecutionContext,
    node_ids: &[String],
) -> Result<Map<String, Value>, ExecutionError> {
    let mut outputs = Map::new();
    for node_id in node_ids {
        if ctx.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        let output = runtime.execute_node(ctx, node_id).await?;
        outputs.insert(node_id.clone(), output);
    }
    Ok(outputs)
}

/// Output of the last node in a sequence, `null` if it produced none.
pub(crate) fn last_output(outputs: &Map<String, Value>, node_ids: &[String]) -> Value {
    node_ids
        .last()
        .and_then(|id| outputs.get(id))
        .cloned()
        .unwrap_or(Value::Null)
}

/// In-memory fakes shared by the action tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::workflow::types::TransformConfig;
    use crate::workflow::{ErrorClassification, ExecutionEnv, NodeKind};
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub fn context() -> ExecutionContext {
        ExecutionContext::new(
            json!({"user": "sam"}),
            ExecutionEnv {
                tenant_id: "tenant-1".to_string(),
                execution_id: "exec-1".to_string(),
                workflow_id: "wf-test".to_string(),
                parent_workflow_id: None,
                trigger_type: "manual".to_string(),
            },
        )
    }

    pub fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    /// Scripted runtime: nodes return `{"node": id}` unless listed as failing.
    #[derive(Default)]
    pub struct FakeRuntime {
        pub failing: HashSet<String>,
        pub outputs: HashMap<String, Value>,
        pub calls: Mutex<Vec<String>>,
        pub count: AtomicUsize,
        /// Steps visible to each node when it ran, last call wins
        pub seen_steps: Mutex<HashMap<String, Map<String, Value>>>,
    }

    impl FakeRuntime {
        pub fn failing(nodes: &[&str]) -> Self {
            Self {
                failing: nodes.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn with_output(mut self, node_id: &str, output: Value) -> Self {
            self.outputs.insert(node_id.to_string(), output);
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }

        pub fn steps_seen_by(&self, node_id: &str) -> Map<String, Value> {
            self.seen_steps.lock().unwrap().get(node_id).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl NodeRuntime for FakeRuntime {
        async fn execute_node(
            &self,
            ctx: &mut ExecutionContext,
            node_id: &str,
        ) -> Result<Value, ExecutionError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(node_id.to_string());
            self.seen_steps
                .lock()
                .unwrap()
                .insert(node_id.to_string(), ctx.steps.clone());
            if self.failing.contains(node_id) {
                return Err(ExecutionError::node_failure(
                    node_id,
                    "action:http",
                    "HttpError",
                    format!("{} exploded", node_id),
                    ErrorClassification::Transient,
                ));
            }
            let output = self
                .outputs
                .get(node_id)
                .cloned()
                .unwrap_or_else(|| json!({"node": node_id}));
            ctx.record_step(node_id, output.clone());
            Ok(output)
        }

        fn get_node(&self, node_id: &str) -> Result<Arc<CompiledNode>, ExecutionError> {
            Ok(Arc::new(CompiledNode {
                id: node_id.to_string(),
                kind: NodeKind::Transform(TransformConfig {
                    template: Value::Null,
                    select: None,
                }),
            }))
        }
    }
}
