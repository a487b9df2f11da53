/// Error types for workflow definitions and executions
///
/// `ExecutionError` is what node execution and control-flow actions return;
/// `ErrorHandlingMetadata` is the serializable view of a failure that catch
/// filters inspect and catch blocks see under their error binding.

use crate::expression::ExpressionError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// Coarse category attached to node failures, used by catch filters and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClassification {
    /// Worth retrying: network failures, 5xx, throttling
    Transient,
    /// Retrying will not help: 4xx, business rule failures
    #[default]
    Permanent,
    /// The workflow definition or node configuration is wrong
    Validation,
    /// The operation ran out of time
    Timeout,
    Unknown,
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::Permanent => "permanent",
            ErrorClassification::Validation => "validation",
            ErrorClassification::Timeout => "timeout",
            ErrorClassification::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Diagnostic record of a failed node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlingMetadata {
    pub error_type: String,
    pub error_message: String,
    pub classification: ErrorClassification,
    pub node_id: String,
    pub node_type: String,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl ErrorHandlingMetadata {
    /// Describe `error` as raised by `node_id`.
    ///
    /// A leaf node failure keeps its original metadata so the failing node is
    /// reported even when the error surfaces through enclosing control nodes.
    pub fn from_error(error: &ExecutionError, node_id: &str, node_type: &str) -> Self {
        if let Some(metadata) = error.node_metadata() {
            return metadata.clone();
        }
        Self {
            error_type: error.error_type().to_string(),
            error_message: error.to_string(),
            classification: error.classification(),
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            occurred_at: Utc::now(),
        }
    }

    /// JSON form bound into catch blocks and written into node outputs.
    pub fn as_json(&self) -> Value {
        json!({
            "error_type": self.error_type,
            "error_message": self.error_message,
            "classification": self.classification.to_string(),
            "node_id": self.node_id,
            "node_type": self.node_type,
            "occurred_at": self.occurred_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        })
    }
}

/// Errors raised while compiling a workflow definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("edge {source_id} -> {target_id} references unknown node '{missing}'")]
    DanglingEdge {
        source_id: String,
        target_id: String,
        missing: String,
    },

    #[error("unknown node type '{node_type}' for node '{node_id}'")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("invalid node '{node_id}': {reason}")]
    InvalidNode { node_id: String, reason: String },

    #[error("workflow '{0}' contains a cycle")]
    Cycle(String),

    #[error("workflow '{workflow_id}' has an ownership cycle through node '{node_id}'")]
    OwnershipCycle { workflow_id: String, node_id: String },

    #[error("workflow has no nodes")]
    Empty,
}

/// Errors raised while executing nodes and control-flow actions.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("node '{}' ({}) failed: {}", .0.node_id, .0.node_type, .0.error_message)]
    NodeFailed(ErrorHandlingMetadata),

    #[error("try block must contain at least one node")]
    EmptyTryBlock,

    #[error("catch block failed: {source}")]
    CatchBlockFailed {
        source: Box<ExecutionError>,
        try_error: Box<ExecutionError>,
    },

    #[error("finally block failed: {source}")]
    FinallyBlockFailed { source: Box<ExecutionError> },

    #[error("no error data found in context under '{binding}'")]
    NoErrorDataFound { binding: String },

    #[error("error not caught: {error_type}: {error_message}")]
    ErrorNotCaught {
        error_type: String,
        error_message: String,
    },

    #[error("maximum sub-workflow depth exceeded ({depth} > {max_depth})")]
    MaxDepthExceeded { depth: u32, max_depth: u32 },

    #[error("loop in node '{node_id}' exceeded {max} iterations")]
    MaxIterationsExceeded { node_id: String, max: usize },

    #[error("invalid configuration for node '{node_id}': {reason}")]
    InvalidConfig { node_id: String, reason: String },

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("expression error in node '{node_id}' ({phase}): {source}", phase = .source.phase())]
    Expression {
        node_id: String,
        source: ExpressionError,
    },

    #[error("parallel branch {index} failed: {source}")]
    BranchFailed {
        index: usize,
        source: Box<ExecutionError>,
    },

    #[error("execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl ExecutionError {
    /// Failure of a leaf node with an explicit type and classification.
    pub fn node_failure(
        node_id: &str,
        node_type: &str,
        error_type: impl Into<String>,
        message: impl Into<String>,
        classification: ErrorClassification,
    ) -> Self {
        ExecutionError::NodeFailed(ErrorHandlingMetadata {
            error_type: error_type.into(),
            error_message: message.into(),
            classification,
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            occurred_at: Utc::now(),
        })
    }

    pub fn expression(node_id: &str, source: ExpressionError) -> Self {
        ExecutionError::Expression {
            node_id: node_id.to_string(),
            source,
        }
    }

    pub fn invalid_config(node_id: &str, reason: impl Into<String>) -> Self {
        ExecutionError::InvalidConfig {
            node_id: node_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Metadata of the leaf failure at the root of this error, if any.
    pub fn node_metadata(&self) -> Option<&ErrorHandlingMetadata> {
        match self {
            ExecutionError::NodeFailed(metadata) => Some(metadata),
            ExecutionError::BranchFailed { source, .. } => source.node_metadata(),
            _ => None,
        }
    }

    /// Stable name used as `error_type` in metadata and catch filters.
    pub fn error_type(&self) -> &str {
        match self {
            ExecutionError::NodeFailed(metadata) => &metadata.error_type,
            ExecutionError::EmptyTryBlock => "EmptyTryBlock",
            ExecutionError::CatchBlockFailed { .. } => "CatchBlockFailed",
            ExecutionError::FinallyBlockFailed { .. } => "FinallyBlockFailed",
            ExecutionError::NoErrorDataFound { .. } => "NoErrorDataFound",
            ExecutionError::ErrorNotCaught { .. } => "ErrorNotCaught",
            ExecutionError::MaxDepthExceeded { .. } => "MaxDepthExceeded",
            ExecutionError::MaxIterationsExceeded { .. } => "MaxIterationsExceeded",
            ExecutionError::InvalidConfig { .. } => "InvalidConfig",
            ExecutionError::NodeNotFound(_) => "NodeNotFound",
            ExecutionError::WorkflowNotFound(_) => "WorkflowNotFound",
            ExecutionError::Expression { .. } => "ExpressionError",
            ExecutionError::BranchFailed { source, .. } => source.error_type(),
            ExecutionError::Cancelled => "Cancelled",
            ExecutionError::Workflow(_) => "InvalidWorkflow",
        }
    }

    pub fn classification(&self) -> ErrorClassification {
        match self {
            ExecutionError::NodeFailed(metadata) => metadata.classification,
            ExecutionError::CatchBlockFailed { source, .. }
            | ExecutionError::FinallyBlockFailed { source }
            | ExecutionError::BranchFailed { source, .. } => source.classification(),
            ExecutionError::EmptyTryBlock
            | ExecutionError::InvalidConfig { .. }
            | ExecutionError::NodeNotFound(_)
            | ExecutionError::Expression { .. }
            | ExecutionError::Workflow(_) => ErrorClassification::Validation,
            ExecutionError::Cancelled => ErrorClassification::Timeout,
            ExecutionError::NoErrorDataFound { .. }
            | ExecutionError::ErrorNotCaught { .. }
            | ExecutionError::MaxDepthExceeded { .. }
            | ExecutionError::MaxIterationsExceeded { .. }
            | ExecutionError::WorkflowNotFound(_) => ErrorClassification::Permanent,
        }
    }
}
