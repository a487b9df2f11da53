/// `control:loop`: run a body sequence once per item of a collection

use crate::actions::{last_output, run_nodes, ActionInput, ActionOutput, NodeRuntime};
use crate::expression::{Evaluator, ValueType};
use crate::workflow::types::{LoopConfig, LoopItems};
use crate::workflow::{ErrorHandlingMetadata, ExecutionContext, ExecutionError};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct LoopAction {
    runtime: Arc<dyn NodeRuntime>,
    evaluator: Arc<Evaluator>,
    /// Ceiling used when the node does not set `max_iterations`
    default_max_iterations: usize,
}

/// Accumulated state of one loop run
#[derive(Default)]
struct Progress {
    results: Vec<Value>,
    failed: usize,
    broke_early: bool,
}

impl LoopAction {
    pub fn new(runtime: Arc<dyn NodeRuntime>, evaluator: Arc<Evaluator>, default_max_iterations: usize) -> Self {
        Self {
            runtime,
            evaluator,
            default_max_iterations,
        }
    }

    pub async fn execute(&self, input: ActionInput<'_, LoopConfig>) -> Result<ActionOutput, ExecutionError> {
        let ActionInput { node_id, config, context } = input;
        let items = self.resolve_items(node_id, config, context)?;
        let max = config.max_iterations.unwrap_or(self.default_max_iterations);

        tracing::debug!("🔁 Loop '{}' over {} items (max {})", node_id, items.len(), max);

        let shadowed_item = context.step(&config.item_variable).cloned();
        let shadowed_index = context.step(&config.index_variable).cloned();

        let mut progress = Progress::default();
        let run = self.iterate(node_id, config, context, items, max, &mut progress).await;

        context.restore(&config.item_variable, shadowed_item);
        context.restore(&config.index_variable, shadowed_index);
        run?;

        Ok(ActionOutput::next(json!({
            "iterations": progress.results.len(),
            "results": progress.results,
            "failed": progress.failed,
            "broke_early": progress.broke_early,
        })))
    }

    fn resolve_items(
        &self,
        node_id: &str,
        config: &LoopConfig,
        context: &ExecutionContext,
    ) -> Result<Vec<Value>, ExecutionError> {
        match &config.items {
            LoopItems::Literal(items) => Ok(items.clone()),
            LoopItems::Expression(source) => {
                let value = self
                    .evaluator
                    .evaluate(source, &context.to_expression_context())
                    .map_err(|e| ExecutionError::expression(node_id, e))?;
                match value {
                    Value::Array(items) => Ok(items),
                    Value::Null => Ok(Vec::new()),
                    other => Err(ExecutionError::invalid_config(
                        node_id,
                        format!("items must evaluate to an array, got {}", ValueType::of(&other)),
                    )),
                }
            }
        }
    }

    async fn iterate(
        &self,
        node_id: &str,
        config: &LoopConfig,
        context: &mut ExecutionContext,
        items: Vec<Value>,
        max: usize,
        progress: &mut Progress,
    ) -> Result<(), ExecutionError> {
        for (index, item) in items.into_iter().enumerate() {
            if index >= max {
                return Err(ExecutionError::MaxIterationsExceeded {
                    node_id: node_id.to_string(),
                    max,
                });
            }
            if context.cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            context.bind(&config.item_variable, item);
            context.bind(&config.index_variable, json!(index));

            match run_nodes(self.runtime.as_ref(), context, &config.body_nodes).await {
                Ok(outputs) => progress.results.push(last_output(&outputs, &config.body_nodes)),
                Err(error) if config.continue_on_error && !matches!(error, ExecutionError::Cancelled) => {
                    tracing::warn!("⚠️ Loop '{}' iteration {} failed, continuing: {}", node_id, index, error);
                    let metadata = ErrorHandlingMetadata::from_error(&error, node_id, "control:loop");
                    progress.results.push(json!({ "error": metadata.as_json() }));
                    progress.failed += 1;
                }
                Err(error) => return Err(error),
            }

            if let Some(condition) = &config.break_condition {
                let stop = self
                    .evaluator
                    .evaluate_condition(condition, &context.to_expression_context())
                    .map_err(|e| ExecutionError::expression(node_id, e))?;
                if stop {
                    tracing::debug!("⏹️ Loop '{}' break condition met at iteration {}", node_id, index);
                    progress.broke_early = true;
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{context, ids, FakeRuntime};

    fn config(items: LoopItems, body: &[&str]) -> LoopConfig {
        LoopConfig {
            items,
            body_nodes: ids(body),
            item_variable: "item".to_string(),
            index_variable: "index".to_string(),
            break_condition: None,
            max_iterations: None,
            continue_on_error: false,
        }
    }

    fn action(runtime: Arc<FakeRuntime>) -> LoopAction {
        LoopAction::new(runtime, Arc::new(Evaluator::new()), 1000)
    }

    #[tokio::test]
    async fn test_iterates_expression_items_in_order() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut ctx = context();
        ctx.record_step("fetch", json!({"data": [{"name": "a"}, {"name": "b"}, {"name": "c"}]}));
        let cfg = config(LoopItems::Expression("steps.fetch.data".to_string()), &["body"]);

        let out = action(runtime.clone())
            .execute(ActionInput { node_id: "each", config: &cfg, context: &mut ctx })
            .await
            .unwrap();

        assert_eq!(out.output["iterations"], 3);
        assert_eq!(out.output["broke_early"], false);
        assert_eq!(runtime.call_count(), 3);
        let seen = runtime.steps_seen_by("body");
        assert_eq!(seen["item"], json!({"name": "c"}));
        assert_eq!(seen["index"], json!(2));
        assert!(ctx.step("item").is_none());
        assert!(ctx.step("index").is_none());
    }

    #[tokio::test]
    async fn test_break_condition_stops_at_first_match() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut ctx = context();
        let mut cfg = config(LoopItems::Literal(vec![json!(1), json!(5), json!(9), json!(12)]), &["body"]);
        cfg.break_condition = Some("steps.item > 4".to_string());

        let out = action(runtime.clone())
            .execute(ActionInput { node_id: "each", config: &cfg, context: &mut ctx })
            .await
            .unwrap();
        assert_eq!(out.output["iterations"], 2);
        assert_eq!(out.output["broke_early"], true);
    }

    #[tokio::test]
    async fn test_max_iterations_exceeded() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut ctx = context();
        let mut cfg = config(LoopItems::Literal(vec![json!(1), json!(2), json!(3)]), &["body"]);
        cfg.max_iterations = Some(2);

        let err = action(runtime.clone())
            .execute(ActionInput { node_id: "each", config: &cfg, context: &mut ctx })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::MaxIterationsExceeded { max: 2, .. }));
        assert_eq!(runtime.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_aborts_unless_continue_on_error() {
        let runtime = Arc::new(FakeRuntime::failing(&["body"]));
        let mut ctx = context();
        let mut cfg = config(LoopItems::Literal(vec![json!("a"), json!("b")]), &["body"]);
        assert!(action(runtime.clone())
            .execute(ActionInput { node_id: "each", config: &cfg, context: &mut ctx })
            .await
            .is_err());
        assert_eq!(runtime.call_count(), 1);

        cfg.continue_on_error = true;
        let out = action(runtime.clone())
            .execute(ActionInput { node_id: "each", config: &cfg, context: &mut ctx })
            .await
            .unwrap();
        assert_eq!(out.output["iterations"], 2);
        assert_eq!(out.output["failed"], 2);
        assert_eq!(out.output["results"][0]["error"]["node_id"], "body");
    }

    #[tokio::test]
    async fn test_bindings_are_restored() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut ctx = context();
        ctx.bind("item", json!("outer"));
        let cfg = config(LoopItems::Literal(vec![json!(1)]), &["body"]);
        action(runtime)
            .execute(ActionInput { node_id: "each", config: &cfg, context: &mut ctx })
            .await
            .unwrap();
        assert_eq!(ctx.step("item"), Some(&json!("outer")));
    }

    #[tokio::test]
    async fn test_non_array_items_rejected() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut ctx = context();
        let cfg = config(LoopItems::Expression("trigger.user".to_string()), &["body"]);
        let err = action(runtime)
            .execute(ActionInput { node_id: "each", config: &cfg, context: &mut ctx })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidConfig { .. }));
    }
}
