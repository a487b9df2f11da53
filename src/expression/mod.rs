/// Expression Evaluation
///
/// A small, side-effect-free condition language for control-flow nodes:
/// - Dotted variable paths rooted at `steps`, `trigger` or `env`
/// - Comparison, logical and string-predicate operators (symbolic or named)
/// - Compile-once / run-many programs with static type checks
/// - A separate path utility for `{{ }}` template interpolation

pub mod compiler;
pub mod error;
pub mod evaluator;
pub mod lexer;
pub mod parser;
pub mod path;

pub use compiler::{CompiledExpression, ValueType};
pub use error::ExpressionError;
pub use evaluator::Evaluator;
pub use path::{get_value_by_path, interpolate, resolve_templates, PathError};
