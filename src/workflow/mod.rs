/// Workflow Model Layer
///
/// This module handles workflow definitions and their per-run state:
/// - Type definitions (WorkflowDefinition, Node, Edge, typed node configs)
/// - Load-time compilation into petgraph-validated graphs
/// - Per-execution context and error metadata
/// - Lock-free hot-reload registry using ArcSwap

// Authored definitions and the closed set of node kinds
pub mod types;

// DAG validation and topological ordering
pub mod graph;

// Per-execution mutable state
pub mod context;

// Error taxonomy and failure metadata
pub mod error;

// Hot-reload registry using ArcSwap for zero-downtime updates
pub mod registry;

// Re-export commonly used types
pub use context::{ExecutionContext, ExecutionEnv};
pub use error::{ErrorClassification, ErrorHandlingMetadata, ExecutionError, WorkflowError};
pub use graph::CompiledWorkflow;
pub use registry::WorkflowRegistry;
pub use types::{CompiledNode, Edge, Node, NodeKind, WorkflowDefinition};
