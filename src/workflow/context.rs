/// Per-execution state shared by the nodes of one workflow run

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

/// Tenant and execution metadata, visible to expressions as `env`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnv {
    pub tenant_id: String,
    pub execution_id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_workflow_id: Option<String>,
    pub trigger_type: String,
}

/// Mutable bag of trigger, step outputs and env for a single run.
///
/// Only the node currently executing writes to it. Parallel branches each
/// work on their own clone which is merged back at the join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub trigger: Value,
    pub steps: Map<String, Value>,
    pub env: ExecutionEnv,
    /// Sub-workflow nesting level, 0 for a top-level run
    pub depth: u32,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(trigger: Value, env: ExecutionEnv) -> Self {
        Self {
            trigger,
            steps: Map::new(),
            env,
            depth: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Record a completed node's output under its ID.
    pub fn record_step(&mut self, node_id: &str, output: Value) {
        self.steps.insert(node_id.to_string(), output);
    }

    pub fn step(&self, node_id: &str) -> Option<&Value> {
        self.steps.get(node_id)
    }

    /// Expose `value` to expressions as `steps.<name>`, returning what it shadowed.
    pub fn bind(&mut self, name: &str, value: Value) -> Option<Value> {
        self.steps.insert(name.to_string(), value)
    }

    /// Undo a [`bind`](Self::bind), putting back the shadowed value if there was one.
    pub fn restore(&mut self, name: &str, previous: Option<Value>) {
        match previous {
            Some(value) => {
                self.steps.insert(name.to_string(), value);
            }
            None => {
                self.steps.remove(name);
            }
        }
    }

    /// The `{trigger, steps, env}` object the evaluator reads.
    pub fn to_expression_context(&self) -> Value {
        json!({
            "trigger": self.trigger,
            "steps": self.steps,
            "env": self.env,
        })
    }

    /// Fresh context for a nested workflow run, one level deeper.
    ///
    /// Tenant and execution id are inherited; the cancellation token is a child
    /// of the parent's so cancelling the parent stops the child.
    pub fn child(&self, workflow_id: &str, trigger: Value) -> Self {
        Self {
            trigger,
            steps: Map::new(),
            env: ExecutionEnv {
                tenant_id: self.env.tenant_id.clone(),
                execution_id: self.env.execution_id.clone(),
                workflow_id: workflow_id.to_string(),
                parent_workflow_id: Some(self.env.workflow_id.clone()),
                trigger_type: self.env.trigger_type.clone(),
            },
            depth: self.depth + 1,
            cancel: self.cancel.child_token(),
        }
    }

    /// Copy of this context for a concurrent branch, cancelled through `cancel`.
    pub fn branch(&self, cancel: CancellationToken) -> Self {
        let mut branch = self.clone();
        branch.cancel = cancel;
        branch
    }

    /// Fold step outputs written by a branch back into this context.
    pub fn merge_steps(&mut self, branch: Map<String, Value>) {
        for (node_id, output) in branch {
            self.steps.insert(node_id, output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> ExecutionEnv {
        ExecutionEnv {
            tenant_id: "t1".to_string(),
            execution_id: "exec-1".to_string(),
            workflow_id: "wf".to_string(),
            parent_workflow_id: None,
            trigger_type: "manual".to_string(),
        }
    }

    #[test]
    fn test_expression_context_has_three_roots() {
        let mut ctx = ExecutionContext::new(json!({"user": "a"}), env());
        ctx.record_step("fetch", json!({"status": 200}));
        let expr_ctx = ctx.to_expression_context();
        let keys: Vec<&String> = expr_ctx.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(expr_ctx["steps"]["fetch"]["status"], 200);
        assert_eq!(expr_ctx["env"]["tenant_id"], "t1");
        assert!(expr_ctx["env"].get("parent_workflow_id").is_none());
    }

    #[test]
    fn test_bind_and_restore() {
        let mut ctx = ExecutionContext::new(Value::Null, env());
        let previous = ctx.bind("item", json!(1));
        assert!(previous.is_none());
        let shadowed = ctx.bind("item", json!(2));
        assert_eq!(shadowed, Some(json!(1)));
        ctx.restore("item", shadowed);
        assert_eq!(ctx.step("item"), Some(&json!(1)));
        ctx.restore("item", None);
        assert!(ctx.step("item").is_none());
    }

    #[test]
    fn test_child_context() {
        let mut ctx = ExecutionContext::new(json!({"a": 1}), env());
        ctx.record_step("x", json!(true));
        let child = ctx.child("wf-child", json!({"b": 2}));
        assert_eq!(child.depth, 1);
        assert!(child.steps.is_empty());
        assert_eq!(child.env.parent_workflow_id.as_deref(), Some("wf"));
        assert_eq!(child.env.execution_id, "exec-1");

        ctx.cancel.cancel();
        assert!(child.cancel.is_cancelled());
    }
}
