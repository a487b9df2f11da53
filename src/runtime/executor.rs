/// Leaf node execution handlers
///
/// This module contains the execution logic for nodes that do work rather
/// than steer traversal:
/// - Trigger nodes: entry points that surface the trigger payload
/// - HTTP client: outbound requests with templated URL, headers and body
/// - Transform: reshape data with templates and an optional JSONPath selection
/// - Raise error: fail with a configured, classified error
///
/// Control-flow nodes are dispatched by the engine to the actions module.

use crate::expression::{interpolate, resolve_templates};
use crate::workflow::types::{HttpConfig, RaiseErrorConfig, TransformConfig};
use crate::workflow::{CompiledNode, ErrorClassification, ExecutionContext, ExecutionError, NodeKind};
use anyhow::Result;
use serde_json::{json, Value};
use std::{collections::HashMap, time::Duration};

/// Node executor for leaf node kinds
///
/// Holds one pooled HTTP client shared by every execution.
#[derive(Debug, Clone)]
pub struct NodeExecutor {
    client: reqwest::Client,
}

impl NodeExecutor {
    /// Create a node executor whose HTTP client times out after `http_timeout`
    pub fn new(http_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client })
    }

    /// Execute a leaf node against the current context and return its output.
    pub async fn execute(&self, node: &CompiledNode, context: &ExecutionContext) -> Result<Value, ExecutionError> {
        let started = std::time::Instant::now();
        tracing::debug!("🚀 Executing node: {} (type: {})", node.id, node.type_name());

        let output = match &node.kind {
            NodeKind::Trigger(_) => Ok(context.trigger.clone()),
            NodeKind::Http(config) => self.execute_http_node(&node.id, config, context).await,
            NodeKind::Transform(config) => execute_transform_node(&node.id, config, context),
            NodeKind::RaiseError(config) => Err(raise_error(&node.id, config)),
            _ => Err(ExecutionError::invalid_config(
                &node.id,
                format!("{} is a control-flow node and cannot run as a leaf", node.type_name()),
            )),
        }?;

        tracing::debug!("✅ Node '{}' completed in {:?}", node.id, started.elapsed());
        Ok(output)
    }

    /// Execute an HTTP client node
    ///
    /// Supports GET, POST, PUT, DELETE and PATCH. The body is sent only for
    /// methods that carry one; objects and arrays go out as JSON, strings as text.
    async fn execute_http_node(
        &self,
        node_id: &str,
        config: &HttpConfig,
        context: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let data = context.to_expression_context();
        let url = interpolate(&config.url, &data);
        let method = config.method.as_str();

        tracing::debug!("🌍 HTTP Request: {} {}", method, url);

        let mut request_builder = match method {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            "PATCH" => self.client.patch(&url),
            other => {
                return Err(ExecutionError::invalid_config(
                    node_id,
                    format!("unsupported HTTP method: {}", other),
                ))
            }
        };

        for (key, value) in &config.headers {
            request_builder = request_builder.header(key.as_str(), interpolate(value, &data));
        }

        if let Some(body) = &config.body {
            if matches!(method, "POST" | "PUT" | "PATCH") {
                let body_data = resolve_templates(body, &data);
                tracing::debug!("📦 Request body: {}", body_data);
                request_builder = match body_data {
                    Value::String(text) => request_builder
                        .header("Content-Type", "text/plain")
                        .body(text),
                    other => request_builder.json(&other),
                };
            }
        }

        if let Some(secs) = config.timeout_secs {
            request_builder = request_builder.timeout(Duration::from_secs(secs));
        }

        let response = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => return Err(ExecutionError::Cancelled),
            sent = request_builder.send() => sent.map_err(|e| request_failure(node_id, &e))?,
        };

        let status = response.status();
        let headers_map: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        tracing::debug!("📡 Response status: {}", status);

        let response_text = response
            .text()
            .await
            .map_err(|e| request_failure(node_id, &e))?;

        // JSON if it parses, raw text otherwise
        let response_data =
            serde_json::from_str::<Value>(&response_text).unwrap_or(Value::String(response_text));

        if !status.is_success() && !config.allow_error_status {
            let classification = if status.is_server_error() || status.as_u16() == 429 {
                ErrorClassification::Transient
            } else {
                ErrorClassification::Permanent
            };
            tracing::warn!("⚠️ HTTP {} {} returned {}", method, url, status);
            return Err(ExecutionError::node_failure(
                node_id,
                "action:http",
                "HttpStatusError",
                format!("HTTP {} from {} {}", status.as_u16(), method, url),
                classification,
            ));
        }

        tracing::info!("✅ HTTP request completed: {} {} (status: {})", method, url, status);

        Ok(json!({
            "status": status.as_u16(),
            "headers": headers_map,
            "data": response_data,
            "success": status.is_success(),
        }))
    }
}

fn request_failure(node_id: &str, error: &reqwest::Error) -> ExecutionError {
    let (error_type, classification) = if error.is_timeout() {
        ("HttpTimeout", ErrorClassification::Timeout)
    } else if error.is_builder() {
        ("HttpRequestInvalid", ErrorClassification::Validation)
    } else {
        ("HttpError", ErrorClassification::Transient)
    };
    ExecutionError::node_failure(
        node_id,
        "action:http",
        error_type,
        format!("HTTP request failed: {}", error),
        classification,
    )
}

/// Resolve the template against the context, then apply the JSONPath selection if any
fn execute_transform_node(
    node_id: &str,
    config: &TransformConfig,
    context: &ExecutionContext,
) -> Result<Value, ExecutionError> {
    let resolved = resolve_templates(&config.template, &context.to_expression_context());
    let Some(path) = &config.select else {
        return Ok(resolved);
    };

    let selected = jsonpath_lib::select(&resolved, path).map_err(|e| {
        ExecutionError::node_failure(
            node_id,
            "action:transform",
            "TransformError",
            format!("JSONPath '{}' failed: {:?}", path, e),
            ErrorClassification::Validation,
        )
    })?;
    tracing::debug!("🔍 Transform '{}' selected {} values with {}", node_id, selected.len(), path);
    Ok(Value::Array(selected.into_iter().cloned().collect()))
}

fn raise_error(node_id: &str, config: &RaiseErrorConfig) -> ExecutionError {
    ExecutionError::node_failure(
        node_id,
        "action:error",
        config.error_type.clone(),
        config.message.clone(),
        config.classification,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ExecutionEnv;

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            json!({"order": {"id": 42, "items": [{"sku": "a", "qty": 2}, {"sku": "b", "qty": 5}]}}),
            ExecutionEnv {
                tenant_id: "t1".to_string(),
                execution_id: "exec-1".to_string(),
                workflow_id: "wf".to_string(),
                parent_workflow_id: None,
                trigger_type: "webhook".to_string(),
            },
        );
        ctx.record_step("lookup", json!({"customer": "sam"}));
        ctx
    }

    fn node(id: &str, kind: NodeKind) -> CompiledNode {
        CompiledNode { id: id.to_string(), kind }
    }

    fn executor() -> NodeExecutor {
        NodeExecutor::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_trigger_surfaces_payload() {
        let ctx = context();
        let out = executor()
            .execute(&node("start", NodeKind::Trigger(crate::workflow::types::TriggerKind::Webhook)), &ctx)
            .await
            .unwrap();
        assert_eq!(out["order"]["id"], 42);
    }

    #[tokio::test]
    async fn test_transform_template_and_select() {
        let ctx = context();
        let shaped = executor()
            .execute(
                &node(
                    "shape",
                    NodeKind::Transform(TransformConfig {
                        template: json!({"who": "{{ steps.lookup.customer }}", "items": "{{ trigger.order.items }}"}),
                        select: None,
                    }),
                ),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(shaped["who"], "sam");
        assert_eq!(shaped["items"][1]["qty"], 5);

        let skus = executor()
            .execute(
                &node(
                    "skus",
                    NodeKind::Transform(TransformConfig {
                        template: json!("{{ trigger.order }}"),
                        select: Some("$.items[*].sku".to_string()),
                    }),
                ),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(skus, json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_raise_error_is_classified() {
        let ctx = context();
        let err = executor()
            .execute(
                &node(
                    "fail",
                    NodeKind::RaiseError(RaiseErrorConfig {
                        error_type: "OutOfStock".to_string(),
                        message: "sku b unavailable".to_string(),
                        classification: ErrorClassification::Permanent,
                    }),
                ),
                &ctx,
            )
            .await
            .unwrap_err();
        let metadata = err.node_metadata().unwrap();
        assert_eq!(metadata.error_type, "OutOfStock");
        assert_eq!(metadata.node_type, "action:error");
        assert_eq!(metadata.classification, ErrorClassification::Permanent);
    }

    #[tokio::test]
    async fn test_http_connection_failure_is_transient() {
        let ctx = context();
        let config = HttpConfig {
            url: "http://127.0.0.1:1/orders/{{ trigger.order.id }}".to_string(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            timeout_secs: Some(2),
            allow_error_status: false,
        };
        let err = executor().execute(&node("call", NodeKind::Http(config)), &ctx).await.unwrap_err();
        let metadata = err.node_metadata().unwrap();
        assert_eq!(metadata.node_id, "call");
        assert!(matches!(
            metadata.classification,
            ErrorClassification::Transient | ErrorClassification::Timeout
        ));
    }

    #[tokio::test]
    async fn test_http_honours_cancellation() {
        let ctx = context();
        ctx.cancel.cancel();
        let config = HttpConfig {
            url: "http://10.255.255.1/slow".to_string(),
            method: "POST".to_string(),
            headers: HashMap::from([("x-tenant".to_string(), "{{ env.tenant_id }}".to_string())]),
            body: Some(json!({"id": "{{ trigger.order.id }}"})),
            timeout_secs: Some(30),
            allow_error_status: false,
        };
        let err = executor().execute(&node("call", NodeKind::Http(config)), &ctx).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
    }
}
