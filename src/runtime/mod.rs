/// Runtime Execution Engine
///
/// This module provides the petgraph-based DAG execution engine for workflows.
/// It handles:
/// - Topological traversal with edge activation for branching
/// - Leaf node execution (HTTP, transform, raised errors, triggers)
/// - Dispatch of queued executions and their ledger

// Core execution engine walking compiled workflow graphs
pub mod engine;

// Individual node execution handlers
pub mod executor;

// Queue message handler turning messages into executions
pub mod dispatch;

// Re-export main types
pub use dispatch::{ExecutionDispatcher, ExecutionLedger, ExecutionRecord, RecordStatus};
pub use engine::{ExecutionEngine, ExecutionOutcome, ExecutionStatus};
pub use executor::NodeExecutor;
