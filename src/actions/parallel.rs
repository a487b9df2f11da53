/// `control:parallel`: run branches concurrently and join on all of them
///
/// Branches are supervised tokio tasks in a `JoinSet`, bounded by a semaphore.
/// Each works on its own clone of the context; successful branches' step
/// outputs are merged back in branch order once every branch has finished.

use crate::actions::{last_output, run_nodes, ActionInput, ActionOutput, NodeRuntime};
use crate::workflow::types::ParallelConfig;
use crate::workflow::{ErrorClassification, ErrorHandlingMetadata, ExecutionError};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

type BranchResult = Result<(Value, Map<String, Value>), ExecutionError>;

pub struct ParallelAction {
    runtime: Arc<dyn NodeRuntime>,
    /// Concurrency used when the node does not set `max_concurrency`
    default_concurrency: usize,
}

impl ParallelAction {
    pub fn new(runtime: Arc<dyn NodeRuntime>, default_concurrency: usize) -> Self {
        Self {
            runtime,
            default_concurrency,
        }
    }

    pub async fn execute(&self, input: ActionInput<'_, ParallelConfig>) -> Result<ActionOutput, ExecutionError> {
        let ActionInput { node_id, config, context } = input;
        let limit = config.max_concurrency.unwrap_or(self.default_concurrency).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let cancel = context.cancel.child_token();

        tracing::debug!("🔀 Parallel '{}': {} branches, concurrency {}", node_id, config.branches.len(), limit);

        let mut set = JoinSet::new();
        for (index, nodes) in config.branches.iter().enumerate() {
            let runtime = Arc::clone(&self.runtime);
            let semaphore = Arc::clone(&semaphore);
            let mut branch_ctx = context.branch(cancel.clone());
            let nodes = nodes.clone();

            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, Err(ExecutionError::Cancelled));
                };
                let token = branch_ctx.cancel.clone();
                let result = tokio::select! {
                    _ = token.cancelled() => Err(ExecutionError::Cancelled),
                    outputs = run_nodes(runtime.as_ref(), &mut branch_ctx, &nodes) => outputs,
                };
                let result: BranchResult = result.map(|outputs| (last_output(&outputs, &nodes), branch_ctx.steps));
                (index, result)
            });
        }

        let mut slots: Vec<Option<BranchResult>> = (0..config.branches.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(join_error) => {
                    tracing::error!("💥 Parallel '{}': branch task failed: {}", node_id, join_error);
                }
            }
        }

        if context.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let mut branches = Vec::with_capacity(slots.len());
        let mut first_failure = None;
        let mut succeeded = 0;
        for (index, slot) in slots.into_iter().enumerate() {
            // An empty slot means the branch task panicked.
            let result = slot.unwrap_or_else(|| {
                Err(ExecutionError::node_failure(
                    node_id,
                    "control:parallel",
                    "BranchPanicked",
                    format!("branch {} panicked", index),
                    ErrorClassification::Unknown,
                ))
            });
            match result {
                Ok((output, steps)) => {
                    context.merge_steps(steps);
                    succeeded += 1;
                    branches.push(json!({ "index": index, "success": true, "output": output }));
                }
                Err(error) => {
                    let metadata = ErrorHandlingMetadata::from_error(&error, node_id, "control:parallel");
                    tracing::warn!("⚠️ Parallel '{}': branch {} failed: {}", node_id, index, error);
                    branches.push(json!({ "index": index, "success": false, "error": metadata.as_json() }));
                    if first_failure.is_none() {
                        first_failure = Some((index, error));
                    }
                }
            }
        }
        let failed = branches.len() - succeeded;

        if config.fail_on_branch_error {
            if let Some((index, error)) = first_failure {
                return Err(ExecutionError::BranchFailed {
                    index,
                    source: Box::new(error),
                });
            }
        }

        Ok(ActionOutput::next(json!({
            "branches": branches,
            "succeeded": succeeded,
            "failed": failed,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{context, ids, FakeRuntime};
    use crate::workflow::{CompiledNode, ExecutionContext};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(branches: &[&[&str]], fail_on_branch_error: bool) -> ParallelConfig {
        ParallelConfig {
            branches: branches.iter().map(|b| ids(b)).collect(),
            max_concurrency: None,
            fail_on_branch_error,
        }
    }

    #[tokio::test]
    async fn test_results_indexed_by_branch_and_merged() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut ctx = context();
        let cfg = config(&[&["a1", "a2"], &["b1"], &["c1"]], false);

        let out = ParallelAction::new(runtime.clone(), 8)
            .execute(ActionInput { node_id: "fan", config: &cfg, context: &mut ctx })
            .await
            .unwrap();

        assert_eq!(out.output["succeeded"], 3);
        assert_eq!(out.output["failed"], 0);
        assert_eq!(out.output["branches"][0]["output"], json!({"node": "a2"}));
        assert_eq!(out.output["branches"][2]["index"], 2);
        for node in ["a1", "a2", "b1", "c1"] {
            assert!(ctx.step(node).is_some(), "{} not merged", node);
        }
    }

    #[tokio::test]
    async fn test_failed_branch_does_not_stop_siblings() {
        let runtime = Arc::new(FakeRuntime::failing(&["b1"]));
        let mut ctx = context();
        let cfg = config(&[&["a1"], &["b1", "b2"], &["c1"]], false);

        let out = ParallelAction::new(runtime.clone(), 8)
            .execute(ActionInput { node_id: "fan", config: &cfg, context: &mut ctx })
            .await
            .unwrap();

        assert_eq!(out.output["succeeded"], 2);
        assert_eq!(out.output["failed"], 1);
        assert_eq!(out.output["branches"][1]["success"], false);
        assert_eq!(out.output["branches"][1]["error"]["node_id"], "b1");
        assert!(!runtime.calls().contains(&"b2".to_string()));
        assert!(ctx.step("c1").is_some());
    }

    #[tokio::test]
    async fn test_fail_on_branch_error_after_join() {
        let runtime = Arc::new(FakeRuntime::failing(&["b1"]));
        let mut ctx = context();
        let cfg = config(&[&["a1"], &["b1"], &["c1"]], true);

        let err = ParallelAction::new(runtime.clone(), 8)
            .execute(ActionInput { node_id: "fan", config: &cfg, context: &mut ctx })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::BranchFailed { index: 1, .. }));
        let mut calls = runtime.calls();
        calls.sort();
        assert_eq!(calls, vec!["a1", "b1", "c1"]);
    }

    /// Tracks the peak number of nodes running at once.
    #[derive(Default)]
    struct SlowRuntime {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl NodeRuntime for SlowRuntime {
        async fn execute_node(&self, ctx: &mut ExecutionContext, node_id: &str) -> Result<Value, ExecutionError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            ctx.record_step(node_id, json!(true));
            Ok(json!(true))
        }

        fn get_node(&self, node_id: &str) -> Result<Arc<CompiledNode>, ExecutionError> {
            Err(ExecutionError::NodeNotFound(node_id.to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let runtime = Arc::new(SlowRuntime::default());
        let mut ctx = context();
        let mut cfg = config(&[&["a"], &["b"], &["c"], &["d"], &["e"]], false);
        cfg.max_concurrency = Some(2);

        let out = ParallelAction::new(runtime.clone(), 8)
            .execute(ActionInput { node_id: "fan", config: &cfg, context: &mut ctx })
            .await
            .unwrap();
        assert_eq!(out.output["succeeded"], 5);
        assert_eq!(runtime.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_branches() {
        let runtime = Arc::new(SlowRuntime::default());
        let mut ctx = context();
        let cancel = ctx.cancel.clone();
        let cfg = config(&[&["a", "b", "c"], &["d", "e", "f"]], false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let err = ParallelAction::new(runtime, 8)
            .execute(ActionInput { node_id: "fan", config: &cfg, context: &mut ctx })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
    }
}
