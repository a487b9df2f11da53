/// Core workflow type definitions
///
/// Raw definitions (`WorkflowDefinition`, `Node`, `Edge`) are what tenants author as JSON.
/// At load time each node's `type` string selects a `NodeKind` variant carrying its
/// strongly-typed config, so config is decoded and validated once rather than per execution.

use crate::expression::Evaluator;
use crate::workflow::error::{ErrorClassification, WorkflowError};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A complete workflow definition containing nodes and their connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow identifier (e.g., "wf-orders")
    pub id: String,
    /// Human-readable workflow name
    #[serde(default)]
    pub name: String,
    /// Owning tenant; when set, only executions for this tenant may run it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A single node as authored: type string plus an untyped config blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "fetch", "check-status")
    pub id: String,
    /// Node type string, e.g. "action:http" or "control:try"
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: Value,
}

/// Directed connection between two nodes
///
/// Edges leaving a `control:if` node carry the label "true" or "false".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Entry point flavour of a trigger node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Webhook,
    Schedule,
    Manual,
}

/// `control:if`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalActionConfig {
    pub condition: String,
    #[serde(default)]
    pub true_branch: Option<String>,
    #[serde(default)]
    pub false_branch: Option<String>,
    #[serde(default)]
    pub stop_on_true: bool,
    #[serde(default)]
    pub stop_on_false: bool,
}

fn default_error_binding() -> String {
    "error".to_string()
}

/// `control:try`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryConfig {
    pub try_nodes: Vec<String>,
    #[serde(default)]
    pub catch_nodes: Vec<String>,
    #[serde(default)]
    pub finally_nodes: Vec<String>,
    /// Key under `steps` where the caught error is exposed to catch nodes
    #[serde(default = "default_error_binding")]
    pub error_binding: String,
}

/// `control:catch`; no filters means catch-all
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatchConfig {
    #[serde(default)]
    pub error_types: Vec<String>,
    #[serde(default)]
    pub error_patterns: Vec<String>,
    #[serde(default)]
    pub handler_nodes: Vec<String>,
    #[serde(default = "default_error_binding")]
    pub error_binding: String,
}

/// Catch config with its patterns compiled
#[derive(Debug, Clone)]
pub struct CatchFilter {
    pub config: CatchConfig,
    pub patterns: Vec<Regex>,
}

impl CatchFilter {
    pub fn new(config: CatchConfig) -> Result<Self, regex::Error> {
        let patterns = config
            .error_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { config, patterns })
    }
}

/// Collection a loop iterates: an expression yielding an array, or a literal array
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopItems {
    Literal(Vec<Value>),
    Expression(String),
}

fn default_item_variable() -> String {
    "item".to_string()
}

fn default_index_variable() -> String {
    "index".to_string()
}

/// `control:loop`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub items: LoopItems,
    pub body_nodes: Vec<String>,
    #[serde(default = "default_item_variable")]
    pub item_variable: String,
    #[serde(default = "default_index_variable")]
    pub index_variable: String,
    /// Checked after each iteration; true stops the loop
    #[serde(default)]
    pub break_condition: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
    #[serde(default)]
    pub continue_on_error: bool,
}

/// `control:parallel`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Each branch is an ordered list of node IDs run sequentially
    pub branches: Vec<Vec<String>>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub fail_on_branch_error: bool,
}

fn default_true() -> bool {
    true
}

/// `control:subworkflow`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflowConfig {
    pub workflow_id: String,
    /// Trigger payload for the child; templates resolve against the parent context
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default = "default_true")]
    pub inherit_trigger: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

/// `action:http`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub allow_error_status: bool,
}

/// `action:transform`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    pub template: Value,
    /// JSONPath applied to the resolved template
    #[serde(default)]
    pub select: Option<String>,
}

fn default_raised_type() -> String {
    "WorkflowError".to_string()
}

/// `action:error`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaiseErrorConfig {
    #[serde(default = "default_raised_type")]
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub classification: ErrorClassification,
}

/// Closed set of node behaviours, selected by the node's type string
#[derive(Debug, Clone)]
pub enum NodeKind {
    Trigger(TriggerKind),
    Http(HttpConfig),
    Transform(TransformConfig),
    RaiseError(RaiseErrorConfig),
    Conditional(ConditionalActionConfig),
    Try(TryConfig),
    Catch(CatchFilter),
    Loop(LoopConfig),
    Parallel(ParallelConfig),
    SubWorkflow(SubWorkflowConfig),
}

const HTTP_METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];

fn decode<T: DeserializeOwned>(node: &Node) -> Result<T, WorkflowError> {
    let config = match &node.config {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(config).map_err(|e| invalid(&node.id, format!("bad config: {}", e)))
}

fn invalid(node_id: &str, reason: impl Into<String>) -> WorkflowError {
    WorkflowError::InvalidNode {
        node_id: node_id.to_string(),
        reason: reason.into(),
    }
}

impl NodeKind {
    /// Decode and validate a node's config for its declared type.
    pub fn compile(node: &Node, evaluator: &Evaluator) -> Result<Self, WorkflowError> {
        let kind = match node.node_type.as_str() {
            "trigger:webhook" => NodeKind::Trigger(TriggerKind::Webhook),
            "trigger:schedule" => NodeKind::Trigger(TriggerKind::Schedule),
            "trigger:manual" => NodeKind::Trigger(TriggerKind::Manual),
            "action:http" => {
                let mut config: HttpConfig = decode(node)?;
                config.method = config.method.to_uppercase();
                if config.url.trim().is_empty() {
                    return Err(invalid(&node.id, "url is required"));
                }
                if !HTTP_METHODS.contains(&config.method.as_str()) {
                    return Err(invalid(&node.id, format!("unsupported HTTP method '{}'", config.method)));
                }
                NodeKind::Http(config)
            }
            "action:transform" => {
                let config: TransformConfig = decode(node)?;
                if matches!(&config.select, Some(path) if path.trim().is_empty()) {
                    return Err(invalid(&node.id, "select must not be empty"));
                }
                NodeKind::Transform(config)
            }
            "action:error" => NodeKind::RaiseError(decode(node)?),
            "control:if" => {
                let config: ConditionalActionConfig = decode(node)?;
                evaluator
                    .validate_condition(&config.condition)
                    .map_err(|e| invalid(&node.id, format!("condition: {}", e)))?;
                NodeKind::Conditional(config)
            }
            "control:try" => {
                let config: TryConfig = decode(node)?;
                if config.try_nodes.is_empty() {
                    return Err(invalid(&node.id, "try block must contain at least one node"));
                }
                NodeKind::Try(config)
            }
            "control:catch" => {
                let config: CatchConfig = decode(node)?;
                let filter = CatchFilter::new(config)
                    .map_err(|e| invalid(&node.id, format!("error pattern: {}", e)))?;
                NodeKind::Catch(filter)
            }
            "control:loop" => {
                let config: LoopConfig = decode(node)?;
                if config.body_nodes.is_empty() {
                    return Err(invalid(&node.id, "loop body must contain at least one node"));
                }
                if let Some(condition) = &config.break_condition {
                    evaluator
                        .validate_condition(condition)
                        .map_err(|e| invalid(&node.id, format!("break_condition: {}", e)))?;
                }
                if config.max_iterations == Some(0) {
                    return Err(invalid(&node.id, "max_iterations must be at least 1"));
                }
                NodeKind::Loop(config)
            }
            "control:parallel" => {
                let config: ParallelConfig = decode(node)?;
                if config.branches.is_empty() || config.branches.iter().any(|b| b.is_empty()) {
                    return Err(invalid(&node.id, "every parallel branch needs at least one node"));
                }
                if config.max_concurrency == Some(0) {
                    return Err(invalid(&node.id, "max_concurrency must be at least 1"));
                }
                NodeKind::Parallel(config)
            }
            "control:subworkflow" => {
                let config: SubWorkflowConfig = decode(node)?;
                if config.workflow_id.trim().is_empty() {
                    return Err(invalid(&node.id, "workflow_id is required"));
                }
                NodeKind::SubWorkflow(config)
            }
            other => {
                return Err(WorkflowError::UnknownNodeType {
                    node_id: node.id.clone(),
                    node_type: other.to_string(),
                })
            }
        };
        Ok(kind)
    }

    /// Canonical type string, as written in definitions.
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Trigger(TriggerKind::Webhook) => "trigger:webhook",
            NodeKind::Trigger(TriggerKind::Schedule) => "trigger:schedule",
            NodeKind::Trigger(TriggerKind::Manual) => "trigger:manual",
            NodeKind::Http(_) => "action:http",
            NodeKind::Transform(_) => "action:transform",
            NodeKind::RaiseError(_) => "action:error",
            NodeKind::Conditional(_) => "control:if",
            NodeKind::Try(_) => "control:try",
            NodeKind::Catch(_) => "control:catch",
            NodeKind::Loop(_) => "control:loop",
            NodeKind::Parallel(_) => "control:parallel",
            NodeKind::SubWorkflow(_) => "control:subworkflow",
        }
    }

    /// Node IDs this node executes itself; they are skipped by the top-level traversal.
    pub fn owned_nodes(&self) -> Vec<&str> {
        let ids: Vec<&String> = match self {
            NodeKind::Try(c) => c
                .try_nodes
                .iter()
                .chain(&c.catch_nodes)
                .chain(&c.finally_nodes)
                .collect(),
            NodeKind::Catch(f) => f.config.handler_nodes.iter().collect(),
            NodeKind::Loop(c) => c.body_nodes.iter().collect(),
            NodeKind::Parallel(c) => c.branches.iter().flatten().collect(),
            _ => Vec::new(),
        };
        ids.into_iter().map(String::as_str).collect()
    }
}

/// A node after load-time compilation
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub id: String,
    pub kind: NodeKind,
}

impl CompiledNode {
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}
