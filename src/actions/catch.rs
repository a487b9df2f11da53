/// `control:catch`: decide whether an error bound in context is handled here

use crate::actions::{run_nodes, ActionInput, ActionOutput, NodeRuntime};
use crate::workflow::types::CatchFilter;
use crate::workflow::{ErrorHandlingMetadata, ExecutionError};
use serde_json::json;
use std::sync::Arc;

impl CatchFilter {
    /// Type allow-list and message patterns must both pass; no filters catches everything.
    pub fn accepts(&self, metadata: &ErrorHandlingMetadata) -> bool {
        let config = &self.config;
        if !config.error_types.is_empty() && !config.error_types.iter().any(|t| *t == metadata.error_type) {
            return false;
        }
        if !self.patterns.is_empty() && !self.patterns.iter().any(|p| p.is_match(&metadata.error_message)) {
            return false;
        }
        true
    }
}

pub struct CatchAction {
    runtime: Arc<dyn NodeRuntime>,
}

impl CatchAction {
    pub fn new(runtime: Arc<dyn NodeRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn execute(&self, input: ActionInput<'_, CatchFilter>) -> Result<ActionOutput, ExecutionError> {
        let ActionInput { node_id, config: filter, context } = input;
        let binding = &filter.config.error_binding;

        let metadata: ErrorHandlingMetadata = context
            .step(binding)
            .and_then(|raw| serde_json::from_value(raw.clone()).ok())
            .ok_or_else(|| ExecutionError::NoErrorDataFound { binding: binding.clone() })?;

        if !filter.accepts(&metadata) {
            tracing::debug!("🚫 Catch '{}' declined {} from '{}'", node_id, metadata.error_type, metadata.node_id);
            return Err(ExecutionError::ErrorNotCaught {
                error_type: metadata.error_type,
                error_message: metadata.error_message,
            });
        }

        let handler_output = run_nodes(self.runtime.as_ref(), context, &filter.config.handler_nodes).await?;
        tracing::debug!("🎣 Catch '{}' handled {} from '{}'", node_id, metadata.error_type, metadata.node_id);

        Ok(ActionOutput::next(json!({
            "error_handled": true,
            "caught_error": metadata.as_json(),
            "handler_output": handler_output,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{context, ids, FakeRuntime};
    use crate::workflow::types::CatchConfig;
    use crate::workflow::{ErrorClassification, ExecutionContext};
    use chrono::Utc;

    fn metadata(error_type: &str, message: &str) -> ErrorHandlingMetadata {
        ErrorHandlingMetadata {
            error_type: error_type.to_string(),
            error_message: message.to_string(),
            classification: ErrorClassification::Permanent,
            node_id: "n1".to_string(),
            node_type: "action:http".to_string(),
            occurred_at: Utc::now(),
        }
    }

    fn filter(types: &[&str], patterns: &[&str]) -> CatchFilter {
        CatchFilter::new(CatchConfig {
            error_types: ids(types),
            error_patterns: ids(patterns),
            handler_nodes: ids(&["h1"]),
            error_binding: "error".to_string(),
        })
        .unwrap()
    }

    fn bound(meta: &ErrorHandlingMetadata) -> ExecutionContext {
        let mut ctx = context();
        ctx.bind("error", serde_json::to_value(meta).unwrap());
        ctx
    }

    #[test]
    fn test_type_allow_list_rejects_everything_else() {
        let only_x = filter(&["X"], &[]);
        for error_type in ["Y", "x", "X ", "", "HttpError"] {
            assert!(!only_x.accepts(&metadata(error_type, "anything")));
        }
        assert!(only_x.accepts(&metadata("X", "anything")));
    }

    #[test]
    fn test_patterns_and_catch_all() {
        let timeouts = filter(&[], &["timed? ?out", "^deadline"]);
        assert!(timeouts.accepts(&metadata("HttpError", "request timed out")));
        assert!(timeouts.accepts(&metadata("HttpError", "deadline exceeded")));
        assert!(!timeouts.accepts(&metadata("HttpError", "connection refused")));

        assert!(filter(&[], &[]).accepts(&metadata("Anything", "at all")));

        let both = filter(&["HttpError"], &["refused"]);
        assert!(!both.accepts(&metadata("DbError", "refused")));
        assert!(both.accepts(&metadata("HttpError", "connection refused")));
    }

    #[tokio::test]
    async fn test_missing_error_data() {
        let runtime = Arc::new(FakeRuntime::default());
        let cfg = filter(&[], &[]);
        let mut ctx = context();
        let err = CatchAction::new(runtime.clone())
            .execute(ActionInput { node_id: "catch", config: &cfg, context: &mut ctx })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NoErrorDataFound { .. }));
        assert_eq!(runtime.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_error_is_not_caught() {
        let runtime = Arc::new(FakeRuntime::default());
        let cfg = filter(&["X"], &[]);
        let mut ctx = bound(&metadata("Y", "nope"));
        let err = CatchAction::new(runtime.clone())
            .execute(ActionInput { node_id: "catch", config: &cfg, context: &mut ctx })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ErrorNotCaught { ref error_type, .. } if error_type == "Y"));
        assert_eq!(runtime.call_count(), 0);
    }

    #[tokio::test]
    async fn test_handled_error_runs_handlers() {
        let runtime = Arc::new(FakeRuntime::default());
        let cfg = filter(&["X"], &[]);
        let mut ctx = bound(&metadata("X", "boom"));
        let out = CatchAction::new(runtime.clone())
            .execute(ActionInput { node_id: "catch", config: &cfg, context: &mut ctx })
            .await
            .unwrap();
        assert_eq!(out.output["error_handled"], true);
        assert_eq!(out.output["caught_error"]["error_type"], "X");
        assert_eq!(out.output["handler_output"]["h1"], json!({"node": "h1"}));
        assert_eq!(runtime.calls(), vec!["h1"]);
    }
}
