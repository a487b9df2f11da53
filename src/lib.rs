/// Flowline: multi-tenant workflow execution runtime
///
/// This library provides the workflow runtime core: a sandboxed expression
/// evaluator, a petgraph-based graph interpreter with structured control flow
/// (branching, try/catch/finally, loops, parallel branches, sub-workflows), and a
/// queue-driven dispatch pipeline with at-least-once delivery.

// Core configuration and setup
pub mod config;

// Condition language and template path resolution
pub mod expression;

// Workflow definitions, compiled graphs, execution context and registry
pub mod workflow;

// Control-flow actions driven by the graph interpreter
pub mod actions;

// Graph interpreter, leaf node executor and queue message dispatcher
pub mod runtime;

// Publisher, consumer and transport abstraction
pub mod queue;

// Worker wiring: registry, engine, queue and shutdown
pub mod worker;

// Re-export commonly used types for external consumers
pub use config::Config;
pub use expression::Evaluator;
pub use runtime::{ExecutionEngine, ExecutionOutcome};
pub use workflow::{ExecutionContext, WorkflowDefinition, WorkflowRegistry};
