/// `control:try`: structured error handling over node lists
///
/// Validating -> RunningTry -> {Success | RunningCatch | Propagating}
/// -> RunningFinally (if configured) -> Terminal.
///
/// Finally nodes run on every exit path. A failure that no catch block
/// handles (no catch nodes, or a catch filter rejected it) propagates unchanged.

use crate::actions::{run_nodes, ActionInput, ActionOutput, NodeRuntime};
use crate::workflow::types::TryConfig;
use crate::workflow::{ErrorHandlingMetadata, ExecutionContext, ExecutionError};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub struct TryCatchAction {
    runtime: Arc<dyn NodeRuntime>,
}

impl TryCatchAction {
    pub fn new(runtime: Arc<dyn NodeRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn execute(&self, input: ActionInput<'_, TryConfig>) -> Result<ActionOutput, ExecutionError> {
        let ActionInput { node_id, config, context } = input;

        if config.try_nodes.is_empty() {
            return Err(ExecutionError::EmptyTryBlock);
        }

        tracing::debug!("🛡️ Try '{}': running {} try nodes", node_id, config.try_nodes.len());
        let mut try_output = Map::new();
        let mut failure = None;
        for try_node in &config.try_nodes {
            match self.runtime.execute_node(context, try_node).await {
                Ok(output) => {
                    try_output.insert(try_node.clone(), output);
                }
                Err(error) => {
                    failure = Some((try_node.clone(), error));
                    break;
                }
            }
        }

        let Some((failed_node, try_error)) = failure else {
            let mut result = json!({
                "success": true,
                "error_handled": false,
                "try_output": try_output,
            });
            self.finish(node_id, config, context, &mut result).await?;
            return Ok(ActionOutput::next(result));
        };

        let node_type = self
            .runtime
            .get_node(&failed_node)
            .map(|node| node.type_name())
            .unwrap_or("unknown");
        let metadata = ErrorHandlingMetadata::from_error(&try_error, &failed_node, node_type);
        tracing::debug!("⚠️ Try '{}': node '{}' failed with {}: {}",
            node_id, failed_node, metadata.error_type, metadata.error_message);

        if config.catch_nodes.is_empty() {
            self.finish_uncaught(node_id, config, context).await;
            return Err(try_error);
        }

        let metadata_value = metadata.as_json();
        let shadowed = context.bind(&config.error_binding, metadata_value.clone());
        let caught = run_nodes(self.runtime.as_ref(), context, &config.catch_nodes).await;
        context.restore(&config.error_binding, shadowed);

        match caught {
            Ok(catch_output) => {
                tracing::info!("🩹 Try '{}': error from '{}' handled", node_id, failed_node);
                let mut result = json!({
                    "success": true,
                    "error_handled": true,
                    "try_output": try_output,
                    "catch_output": catch_output,
                    "try_error": metadata_value,
                });
                self.finish(node_id, config, context, &mut result).await?;
                Ok(ActionOutput::next(result))
            }
            Err(ExecutionError::ErrorNotCaught { error_type, .. }) => {
                tracing::debug!("↪️ Try '{}': catch filter declined {}, propagating", node_id, error_type);
                self.finish_uncaught(node_id, config, context).await;
                Err(try_error)
            }
            Err(catch_error) => {
                self.finish_uncaught(node_id, config, context).await;
                Err(ExecutionError::CatchBlockFailed {
                    source: Box::new(catch_error),
                    try_error: Box::new(try_error),
                })
            }
        }
    }

    async fn run_finally(
        &self,
        config: &TryConfig,
        context: &mut ExecutionContext,
    ) -> Result<Option<Map<String, Value>>, ExecutionError> {
        if config.finally_nodes.is_empty() {
            return Ok(None);
        }
        run_nodes(self.runtime.as_ref(), context, &config.finally_nodes)
            .await
            .map(Some)
    }

    /// Finally on a successful exit; its failure becomes the action's error.
    async fn finish(
        &self,
        node_id: &str,
        config: &TryConfig,
        context: &mut ExecutionContext,
        result: &mut Value,
    ) -> Result<(), ExecutionError> {
        match self.run_finally(config, context).await {
            Ok(Some(finally_output)) => {
                result["finally_output"] = Value::Object(finally_output);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => {
                tracing::error!("❌ Try '{}': finally block failed: {}", node_id, error);
                Err(ExecutionError::FinallyBlockFailed { source: Box::new(error) })
            }
        }
    }

    /// Finally on a failing exit; the error already in flight takes precedence.
    async fn finish_uncaught(&self, node_id: &str, config: &TryConfig, context: &mut ExecutionContext) {
        if let Err(error) = self.run_finally(config, context).await {
            tracing::warn!("⚠️ Try '{}': finally block failed while propagating: {}", node_id, error);
        }
    }
}
