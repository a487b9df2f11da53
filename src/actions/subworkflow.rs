/// `control:subworkflow`: run another workflow as a single node

use crate::actions::{ActionInput, ActionOutput, WorkflowInvoker};
use crate::expression::resolve_templates;
use crate::workflow::types::SubWorkflowConfig;
use crate::workflow::ExecutionError;
use serde_json::json;
use std::sync::Arc;

pub struct SubWorkflowAction {
    invoker: Arc<dyn WorkflowInvoker>,
    max_depth: u32,
}

impl SubWorkflowAction {
    pub fn new(invoker: Arc<dyn WorkflowInvoker>, max_depth: u32) -> Self {
        Self { invoker, max_depth }
    }

    pub async fn execute(&self, input: ActionInput<'_, SubWorkflowConfig>) -> Result<ActionOutput, ExecutionError> {
        let ActionInput { node_id, config, context } = input;

        let depth = context.depth + 1;
        if depth > self.max_depth {
            tracing::warn!("🛑 Sub-workflow '{}' from node '{}' rejected at depth {} (max {})",
                config.workflow_id, node_id, depth, self.max_depth);
            return Err(ExecutionError::MaxDepthExceeded {
                depth,
                max_depth: self.max_depth,
            });
        }

        let trigger = match &config.input {
            Some(input) => resolve_templates(input, &context.to_expression_context()),
            None if config.inherit_trigger => context.trigger.clone(),
            None => json!({}),
        };

        tracing::debug!("📦 Node '{}' invoking sub-workflow '{}' at depth {}", node_id, config.workflow_id, depth);
        let child = context.child(&config.workflow_id, trigger);
        let output = self.invoker.invoke(&config.workflow_id, child).await?;
        Ok(ActionOutput::next(output))
    }
}
