/// Expression error taxonomy
///
/// Every failure carries the phase it came from so workflow authors can tell
/// a typo in their template from a type mismatch at runtime.

use thiserror::Error;

/// Errors produced while parsing, compiling or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    /// The expression (after stripping `{{ }}`) is empty.
    #[error("expression is empty")]
    EmptyExpression,

    /// Malformed template wrapping, unbalanced brackets or unterminated strings.
    #[error("parse error at offset {position}: {message}")]
    Parse { message: String, position: usize },

    /// Structurally invalid expression or a statically detectable type error.
    #[error("compile error: {message}")]
    Compile { message: String },

    /// Type error discovered while evaluating against real data.
    #[error("evaluation error: {message}")]
    Eval { message: String },

    /// A condition evaluated to something other than a boolean.
    #[error("expression did not evaluate to a boolean: got {result_type}")]
    NonBooleanResult { result_type: String },

    /// The evaluation context is not an object with `trigger`/`steps`/`env`.
    #[error("invalid expression context: {0}")]
    InvalidContext(String),
}

impl ExpressionError {
    pub(crate) fn parse(message: impl Into<String>, position: usize) -> Self {
        Self::Parse {
            message: message.into(),
            position,
        }
    }

    pub(crate) fn compile(message: impl Into<String>) -> Self {
        Self::Compile {
            message: message.into(),
        }
    }

    pub(crate) fn eval(message: impl Into<String>) -> Self {
        Self::Eval {
            message: message.into(),
        }
    }

    /// Name of the phase that produced this error.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::EmptyExpression | Self::Parse { .. } => "parse",
            Self::Compile { .. } => "compile",
            Self::Eval { .. } | Self::NonBooleanResult { .. } | Self::InvalidContext(_) => "eval",
        }
    }
}
