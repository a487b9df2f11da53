/// `control:if`: evaluate a condition and pick the "true" or "false" edges

use crate::actions::{ActionInput, ActionOutput, Route};
use crate::expression::Evaluator;
use crate::workflow::{types::ConditionalActionConfig, ExecutionError};
use serde_json::json;
use std::sync::Arc;

pub struct ConditionalAction {
    evaluator: Arc<Evaluator>,
}

impl ConditionalAction {
    pub fn new(evaluator: Arc<Evaluator>) -> Self {
        Self { evaluator }
    }

    pub async fn execute(
        &self,
        input: ActionInput<'_, ConditionalActionConfig>,
    ) -> Result<ActionOutput, ExecutionError> {
        let ActionInput { node_id, config, context } = input;

        let result = self
            .evaluator
            .evaluate_condition(&config.condition, &context.to_expression_context())
            .map_err(|e| ExecutionError::expression(node_id, e))?;

        let branch = if result { "true" } else { "false" };
        let stop = (result && config.stop_on_true) || (!result && config.stop_on_false);
        tracing::debug!("🔀 Condition '{}' in node '{}' -> {}{}",
            config.condition, node_id, branch, if stop { " (stop)" } else { "" });

        Ok(ActionOutput {
            output: json!({ "result": result, "branch": branch }),
            route: if stop { Route::Stop } else { Route::Branch(branch.to_string()) },
        })
    }
}
