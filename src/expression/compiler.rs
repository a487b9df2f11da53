/// Static type checking and compiled programs
///
/// A program is compiled against the *shape* of a context: every path that
/// resolves in the sample context contributes its JSON type, unresolved paths
/// are typed `Any` and checked again at runtime.

use crate::expression::error::ExpressionError;
use crate::expression::lexer::BinaryOp;
use crate::expression::parser::{Expr, PathExpr, Segment};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Static type of an expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Number,
    String,
    Null,
    Array,
    Object,
    Any,
}

impl ValueType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Bool(_) => ValueType::Bool,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Null => ValueType::Null,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
        }
    }

    fn accepts(&self, wanted: ValueType) -> bool {
        *self == ValueType::Any || *self == wanted
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "bool",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Null => "null",
            ValueType::Array => "array",
            ValueType::Object => "object",
            ValueType::Any => "any",
        };
        f.write_str(name)
    }
}

/// A parsed and type-checked expression, reusable across contexts.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    source: Arc<str>,
    program: Arc<Expr>,
    result_type: ValueType,
}

impl CompiledExpression {
    pub(crate) fn new(source: &str, program: Arc<Expr>, result_type: ValueType) -> Self {
        Self {
            source: Arc::from(source),
            program,
            result_type,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn result_type(&self) -> ValueType {
        self.result_type
    }

    pub(crate) fn program(&self) -> &Expr {
        &self.program
    }

    /// Variable paths referenced by the program, e.g. `steps.fetch.status`.
    pub fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.program.collect_paths(&mut paths);
        let mut rendered: Vec<String> = paths.into_iter().map(|p| p.to_string()).collect();
        rendered.dedup();
        rendered
    }
}

/// Resolve a path against a context, `None` when any segment is missing.
pub(crate) fn lookup<'a>(path: &PathExpr, context: &'a Value) -> Option<&'a Value> {
    let mut current = context.get(path.root.as_str())?;
    for segment in &path.segments {
        current = match segment {
            Segment::Field(name) => match current {
                Value::Array(items) => items.get(name.parse::<usize>().ok()?)?,
                _ => current.as_object()?.get(name)?,
            },
            Segment::Index(index) => current.as_array()?.get(*index)?,
        };
    }
    Some(current)
}

/// Infer the static type of `expr` against the shape of `context`.
pub fn type_check(expr: &Expr, context: &Value) -> Result<ValueType, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(ValueType::of(value)),
        Expr::Path(path) => Ok(lookup(path, context)
            .map(ValueType::of)
            .unwrap_or(ValueType::Any)),
        Expr::Not(inner) => {
            let inner_type = type_check(inner, context)?;
            if !inner_type.accepts(ValueType::Bool) {
                return Err(ExpressionError::compile(format!(
                    "operand of '!' must be bool, found {}",
                    inner_type
                )));
            }
            Ok(ValueType::Bool)
        }
        Expr::Binary { op, lhs, rhs } => {
            let left = type_check(lhs, context)?;
            let right = type_check(rhs, context)?;
            check_binary(*op, left, right)?;
            Ok(ValueType::Bool)
        }
    }
}

fn check_binary(op: BinaryOp, left: ValueType, right: ValueType) -> Result<(), ExpressionError> {
    use ValueType::*;

    match op {
        BinaryOp::Eq | BinaryOp::Ne => Ok(()),
        BinaryOp::And | BinaryOp::Or => {
            for side in [left, right] {
                if !side.accepts(Bool) {
                    return Err(ExpressionError::compile(format!(
                        "operands of '{}' must be bool, found {}",
                        op.symbol(),
                        side
                    )));
                }
            }
            Ok(())
        }
        op if op.is_ordering() => match (left, right) {
            (Any, Any) => Ok(()),
            (Any, Number | String) | (Number | String, Any) => Ok(()),
            (Number, Number) | (String, String) => Ok(()),
            _ => Err(ExpressionError::compile(format!(
                "cannot order {} {} {}",
                left,
                op.symbol(),
                right
            ))),
        },
        BinaryOp::Contains => match (left, right) {
            (Array, _) => Ok(()),
            (String | Any, String | Any) => Ok(()),
            _ => Err(ExpressionError::compile(format!(
                "'contains' needs a string or array on the left and a string on the right, found {} and {}",
                left, right
            ))),
        },
        _ => {
            if left.accepts(String) && right.accepts(String) {
                Ok(())
            } else {
                Err(ExpressionError::compile(format!(
                    "'{}' needs string operands, found {} and {}",
                    op.symbol(),
                    left,
                    right
                )))
            }
        }
    }
}
